//! plugin-host: serves plugin capabilities to the main process over stdin/stdout.
//!
//! stdout carries length-delimited RPC batches, so all logging goes to stderr.

mod host;

use std::process;
use std::time::Duration;

use anyhow::Context;
use plugin_rpc::{Channel, RpcConfig, RpcProtocol};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::host::PluginHost;

/// Time given to the last replies (such as `$stop`'s) to reach stdout.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

const LOG_ENV: &str = "PLUGIN_HOST_LOG";

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    log_level: Option<String>,
    call_timeout_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: plugin-host [--log-level <level>] [--call-timeout-ms <ms>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --log-level <level>      error, warn, info or debug [default: $PLUGIN_HOST_LOG or info]");
            eprintln!("  --call-timeout-ms <ms>   Reject unanswered calls after <ms>; 0 waits forever");
            eprintln!("                           [default: $PLUGIN_RPC_CALL_TIMEOUT_MS or 0]");
            process::exit(2);
        }
    };

    init_tracing(options.log_level.as_deref());

    if let Err(e) = run(options).await {
        tracing::error!(error = %e, "Plugin host failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--log-level" => {
                i += 1;
                let level = args.get(i).ok_or("--log-level requires a value")?;
                options.log_level = Some(level.clone());
            }
            "--call-timeout-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--call-timeout-ms requires a value")?;
                let ms = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --call-timeout-ms value: {raw}"))?;
                options.call_timeout_ms = Some(ms);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn base_level(level: Option<&str>) -> &'static str {
    match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = if log_level.is_none() && std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let from_env = std::env::var(LOG_ENV).ok();
        let level = base_level(log_level.or(from_env.as_deref()));
        EnvFilter::new(format!("plugin_host={level},plugin_rpc={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn rpc_config(options: &Options) -> RpcConfig {
    let config = RpcConfig::from_env();
    match options.call_timeout_ms {
        Some(0) => config.without_call_timeout(),
        Some(ms) => config.with_call_timeout(Duration::from_millis(ms)),
        None => config,
    }
}

async fn run(options: Options) -> anyhow::Result<()> {
    let config = rpc_config(&options);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        call_timeout = ?config.call_timeout,
        cancel_on_close = config.cancel_on_close,
        "Plugin host starting"
    );

    let rpc = RpcProtocol::with_config(Channel::stdio(), config);
    let host = PluginHost::serve(&rpc);

    tokio::select! {
        _ = host.stopped() => {
            tracing::info!("Plugins stopped, shutting down");
        }
        _ = rpc.closed() => {
            tracing::warn!("Connection to main process closed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("Interrupted, shutting down");
        }
    }

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    rpc.dispose();
    tracing::debug!(state = %host.state(), "Plugin host exited");
    Ok(())
}
