//! Host-side plugin manager actor.
//!
//! Lifecycle: `Created` → `$init` → `Initialized` → `$start` → `Running` →
//! `$stop` → `Stopped`. Stopping is allowed from `Initialized` as well and is
//! idempotent once stopped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plugin_rpc::capabilities::{
    COMMAND_REGISTRY_EXT, COMMAND_REGISTRY_MAIN, CommandRegistry, PLUGIN_MANAGER_EXT,
    PluginInitData,
};
use plugin_rpc::{ActorError, MethodTable, RpcProtocol};
use serde_json::Value;
use tokio::sync::watch;

/// Command the host contributes once plugins are running.
pub const LIST_PLUGINS_COMMAND: &str = "pluginHost.listPlugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Created => "created",
            HostState::Initialized => "initialized",
            HostState::Running => "running",
            HostState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: HostState },
}

pub struct PluginHost {
    state: watch::Sender<HostState>,
    init: Mutex<Option<PluginInitData>>,
    commands: Arc<CommandRegistry>,
}

impl PluginHost {
    /// Register the host's actors on `rpc` and return the manager.
    pub fn serve(rpc: &RpcProtocol) -> Arc<Self> {
        let commands = CommandRegistry::new(rpc.get_proxy(&COMMAND_REGISTRY_MAIN));
        rpc.register_local(&COMMAND_REGISTRY_EXT, commands.method_table());

        let host = Arc::new(Self {
            state: watch::Sender::new(HostState::Created),
            init: Mutex::new(None),
            commands,
        });
        rpc.register_local(&PLUGIN_MANAGER_EXT, host.method_table());
        host
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Resolves once `$stop` has completed.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == HostState::Stopped).await;
    }

    pub fn init(&self, data: PluginInitData) -> Result<(), HostError> {
        self.transition("init", &[HostState::Created], HostState::Initialized)?;
        tracing::info!(plugins = data.plugins.len(), "Plugin host initialized");
        *self.lock_init() = Some(data);
        Ok(())
    }

    pub async fn start(&self) -> Result<Vec<String>, HostError> {
        self.transition("start", &[HostState::Initialized], HostState::Running)?;

        let ids = self.plugin_ids();
        for id in &ids {
            tracing::info!(plugin = %id, "Starting plugin");
        }

        let listed = ids.clone();
        let registered = self
            .commands
            .register_command(LIST_PLUGINS_COMMAND, move |_args: Vec<Value>| {
                let listed = listed.clone();
                async move { Ok::<_, ActorError>(Value::from(listed)) }
            })
            .await;
        if let Err(e) = registered {
            tracing::warn!(command = LIST_PLUGINS_COMMAND, error = %e, "Failed to register command");
        }

        Ok(ids)
    }

    pub async fn stop(&self) -> Result<(), HostError> {
        if self.state() == HostState::Stopped {
            return Ok(());
        }
        let was_running = self.state() == HostState::Running;
        if was_running && let Err(e) = self.commands.unregister_command(LIST_PLUGINS_COMMAND).await {
            tracing::warn!(command = LIST_PLUGINS_COMMAND, error = %e, "Failed to unregister command");
        }

        self.transition(
            "stop",
            &[HostState::Initialized, HostState::Running, HostState::Stopped],
            HostState::Stopped,
        )?;
        tracing::info!("Plugin host stopped");
        Ok(())
    }

    fn method_table(self: &Arc<Self>) -> MethodTable {
        let init = Arc::clone(self);
        let start = Arc::clone(self);
        let stop = Arc::clone(self);

        MethodTable::builder()
            .typed("$init", move |(data,): (PluginInitData,)| {
                let host = Arc::clone(&init);
                async move { host.init(data).map_err(ActorError::from) }
            })
            .method("$start", move |_| {
                let host = Arc::clone(&start);
                async move { host.start().await.map_err(ActorError::from) }
            })
            .method("$stop", move |_| {
                let host = Arc::clone(&stop);
                async move { host.stop().await.map_err(ActorError::from) }
            })
            .build()
    }

    fn transition(&self, op: &'static str, from: &[HostState], to: HostState) -> Result<(), HostError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                tracing::debug!(from = %state, to = %to, "Host state transition");
                *state = to;
                true
            } else {
                result = Err(HostError::InvalidState { op, state: *state });
                false
            }
        });
        result
    }

    fn plugin_ids(&self) -> Vec<String> {
        self.lock_init()
            .as_ref()
            .map(|data| data.plugins.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    fn lock_init(&self) -> MutexGuard<'_, Option<PluginInitData>> {
        self.init.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("state", &self.state())
            .field("commands", &self.commands)
            .finish()
    }
}
