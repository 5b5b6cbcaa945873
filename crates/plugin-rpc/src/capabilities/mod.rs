//! Capabilities served over the RPC core.
//!
//! Each capability is a pair of identifiers (one per side of the connection),
//! a typed stub for calling the peer, and a local actor exposing `$`-methods.

pub mod command;
pub mod plugin;

use crate::identifier::ProxyIdentifier;

pub use command::{CommandError, CommandHandler, CommandRegistry, CommandRegistryProxy};
pub use plugin::{PluginDescription, PluginInitData, PluginManagerProxy};

/// Command registry living in the main process.
pub const COMMAND_REGISTRY_MAIN: ProxyIdentifier<CommandRegistryProxy> =
    ProxyIdentifier::new("CommandRegistryMain");

/// Command registry living in the plugin host.
pub const COMMAND_REGISTRY_EXT: ProxyIdentifier<CommandRegistryProxy> =
    ProxyIdentifier::new("CommandRegistryExt");

/// Plugin lifecycle manager living in the plugin host.
pub const PLUGIN_MANAGER_EXT: ProxyIdentifier<PluginManagerProxy> =
    ProxyIdentifier::new("PluginManagerExt");
