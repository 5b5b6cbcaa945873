//! RPC core configuration.

use std::time::Duration;

pub const CALL_TIMEOUT_ENV: &str = "PLUGIN_RPC_CALL_TIMEOUT_MS";
pub const CANCEL_ON_CLOSE_ENV: &str = "PLUGIN_RPC_CANCEL_ON_CLOSE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Reject calls that have not settled after this long. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Tear the core down (rejecting pending calls) when the inbound side of
    /// the channel closes.
    pub cancel_on_close: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            cancel_on_close: true,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PLUGIN_RPC_CALL_TIMEOUT_MS` and
    /// `PLUGIN_RPC_CANCEL_ON_CLOSE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(CALL_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(0) => config.call_timeout = None,
                Ok(ms) => config.call_timeout = Some(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!(var = CALL_TIMEOUT_ENV, value = %raw, "Ignoring invalid call timeout");
                }
            }
        }

        if let Some(raw) = lookup(CANCEL_ON_CLOSE_ENV) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.cancel_on_close = true,
                "0" | "false" | "no" => config.cancel_on_close = false,
                _ => {
                    tracing::warn!(var = CANCEL_ON_CLOSE_ENV, value = %raw, "Ignoring invalid flag");
                }
            }
        }

        config
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn without_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }

    pub fn with_cancel_on_close(mut self, cancel_on_close: bool) -> Self {
        self.cancel_on_close = cancel_on_close;
        self
    }
}
