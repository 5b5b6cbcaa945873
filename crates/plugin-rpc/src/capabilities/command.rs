//! Command registry shared between two sides of a connection.
//!
//! Each side keeps its own handlers and tells the peer which command ids it
//! owns. `execute_command` runs a local handler when there is one, otherwise
//! forwards to the peer that announced the id.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;

use crate::actor::MethodTable;
use crate::error::{ActorError, RpcError};
use crate::proxy::{Proxy, RemoteHandle, RemoteResult};

/// Stub for the peer's command registry.
#[derive(Debug, Clone)]
pub struct CommandRegistryProxy {
    handle: RemoteHandle,
}

impl Proxy for CommandRegistryProxy {
    fn from_handle(handle: RemoteHandle) -> Self {
        Self { handle }
    }
}

impl CommandRegistryProxy {
    pub fn execute_command(&self, id: &str, args: Vec<Value>) -> RemoteResult<Value> {
        self.handle.invoke("$executeCommand", (id, args))
    }

    pub fn register_command(&self, id: &str) -> RemoteResult<()> {
        self.handle.invoke("$registerCommand", (id,))
    }

    pub fn unregister_command(&self, id: &str) -> RemoteResult<()> {
        self.handle.invoke("$unregisterCommand", (id,))
    }

    pub fn get_commands(&self) -> RemoteResult<Vec<String>> {
        self.handle.invoke("$getCommands", ())
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, args: Vec<Value>) -> Result<Value, ActorError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
{
    async fn execute(&self, args: Vec<Value>) -> Result<Value, ActorError> {
        self(args).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command '{0}' not found")]
    NotFound(String),

    #[error("command '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("command failed: {0}")]
    Handler(ActorError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct CommandRegistry {
    local: DashMap<String, Arc<dyn CommandHandler>>,
    remote: DashSet<String>,
    peer: Arc<CommandRegistryProxy>,
}

impl CommandRegistry {
    pub fn new(peer: Arc<CommandRegistryProxy>) -> Arc<Self> {
        Arc::new(Self {
            local: DashMap::new(),
            remote: DashSet::new(),
            peer,
        })
    }

    /// Register a local handler and announce it to the peer.
    ///
    /// If the announcement fails the handler stays registered locally and the
    /// error is returned.
    pub async fn register_command(
        &self,
        id: &str,
        handler: impl CommandHandler + 'static,
    ) -> Result<(), CommandError> {
        match self.local.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CommandError::AlreadyRegistered(id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(handler));
            }
        }
        tracing::debug!(command = id, "Registered command");

        self.peer.register_command(id).await?;
        Ok(())
    }

    /// Remove a local handler. Returns whether one was registered.
    pub async fn unregister_command(&self, id: &str) -> Result<bool, CommandError> {
        if self.local.remove(id).is_none() {
            return Ok(false);
        }
        tracing::debug!(command = id, "Unregistered command");

        self.peer.unregister_command(id).await?;
        Ok(true)
    }

    pub async fn execute_command(&self, id: &str, args: Vec<Value>) -> Result<Value, CommandError> {
        if let Some(handler) = self.local_handler(id) {
            tracing::trace!(command = id, "Executing local command");
            return handler.execute(args).await.map_err(CommandError::Handler);
        }

        if self.remote.contains(id) {
            tracing::trace!(command = id, "Forwarding command to peer");
            return Ok(self.peer.execute_command(id, args).await?);
        }

        Err(CommandError::NotFound(id.to_string()))
    }

    pub fn has_command(&self, id: &str) -> bool {
        self.local.contains_key(id) || self.remote.contains(id)
    }

    /// Every known command id, local and remote, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .local
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.remote.iter().map(|id| id.key().clone()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Actor the peer calls to run our commands and announce its own.
    pub fn method_table(self: &Arc<Self>) -> MethodTable {
        let execute = Arc::clone(self);
        let register = Arc::clone(self);
        let unregister = Arc::clone(self);
        let list = Arc::clone(self);

        MethodTable::builder()
            .method("$executeCommand", move |args| {
                let registry = Arc::clone(&execute);
                async move {
                    let (id, args) = command_args(args)?;
                    registry.execute_local(&id, args).await
                }
            })
            .typed("$registerCommand", move |(id,): (String,)| {
                let registry = Arc::clone(&register);
                async move {
                    tracing::debug!(command = %id, "Peer registered command");
                    registry.remote.insert(id);
                    Ok(())
                }
            })
            .typed("$unregisterCommand", move |(id,): (String,)| {
                let registry = Arc::clone(&unregister);
                async move {
                    tracing::debug!(command = %id, "Peer unregistered command");
                    registry.remote.remove(&id);
                    Ok(())
                }
            })
            .sync("$getCommands", move |_| {
                let mut ids: Vec<String> = list.local.iter().map(|e| e.key().clone()).collect();
                ids.sort_unstable();
                Ok(ids)
            })
            .build()
    }

    fn local_handler(&self, id: &str) -> Option<Arc<dyn CommandHandler>> {
        self.local.get(id).map(|entry| Arc::clone(entry.value()))
    }

    // Requests from the peer only run local handlers; forwarding them back
    // would bounce between the two sides.
    async fn execute_local(&self, id: &str, args: Vec<Value>) -> Result<Value, ActorError> {
        match self.local_handler(id) {
            Some(handler) => handler.execute(args).await,
            None => Err(ActorError::new("Error", format!("command '{id}' not found"))),
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("local", &self.local.len())
            .field("remote", &self.remote.len())
            .finish()
    }
}

fn command_args(args: Vec<Value>) -> Result<(String, Vec<Value>), ActorError> {
    let mut args = args.into_iter();
    let id = match args.next() {
        Some(Value::String(id)) => id,
        _ => return Err(ActorError::new("TypeError", "command id must be a string")),
    };
    let args = match args.next() {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    };
    Ok((id, args))
}
