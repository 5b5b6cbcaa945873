//! Plugin host lifecycle: the main process initializes, starts and stops the
//! plugins loaded by a host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::{Proxy, RemoteHandle, RemoteResult};

/// A plugin the host should load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescription {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activation_events: Vec<String>,
}

/// Sent once with `$init` before any plugin is started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInitData {
    pub plugins: Vec<PluginDescription>,
    #[serde(default)]
    pub settings: Value,
}

/// Stub for the host's plugin manager.
#[derive(Debug, Clone)]
pub struct PluginManagerProxy {
    handle: RemoteHandle,
}

impl Proxy for PluginManagerProxy {
    fn from_handle(handle: RemoteHandle) -> Self {
        Self { handle }
    }
}

impl PluginManagerProxy {
    pub fn init(&self, data: &PluginInitData) -> RemoteResult<()> {
        self.handle.invoke("$init", (data,))
    }

    /// Resolves to the ids of the plugins that were started.
    pub fn start(&self) -> RemoteResult<Vec<String>> {
        self.handle.invoke("$start", ())
    }

    pub fn stop(&self) -> RemoteResult<()> {
        self.handle.invoke("$stop", ())
    }
}
