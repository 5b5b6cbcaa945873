//! Client stubs for remote actors.
//!
//! Each capability gets a stub type implementing [`Proxy`]; every stub method
//! funnels into [`RemoteHandle::invoke`], the single remote dispatch path.

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;
use crate::rpc::{RemoteCall, WeakRpc};

/// Eagerly issued remote call resolving to a decoded result.
pub type RemoteResult<T> = BoxFuture<'static, Result<T, RpcError>>;

/// Prefix that marks a method as remotely invocable.
pub const REMOTE_METHOD_PREFIX: char = '$';

pub fn is_remote_method(method: &str) -> bool {
    method.starts_with(REMOTE_METHOD_PREFIX)
}

/// A stand-in for a remote actor, built once per identifier and cached.
pub trait Proxy: Send + Sync + 'static {
    fn from_handle(handle: RemoteHandle) -> Self;
}

/// Addresses one remote actor through the core that created it.
///
/// Holds the core weakly: once the core is gone, calls reject with
/// [`RpcError::Canceled`] without touching the wire.
#[derive(Clone)]
pub struct RemoteHandle {
    rpc: WeakRpc,
    proxy_id: &'static str,
}

impl RemoteHandle {
    pub(crate) fn new(rpc: WeakRpc, proxy_id: &'static str) -> Self {
        Self { rpc, proxy_id }
    }

    pub fn proxy_id(&self) -> &'static str {
        self.proxy_id
    }

    /// Issue a call with raw arguments. The request is queued before this
    /// returns; awaiting the result is optional.
    pub fn call(&self, method: &str, args: Vec<Value>) -> RemoteCall {
        if !is_remote_method(method) {
            return RemoteCall::failed(method, RpcError::NotRemote(method.to_string()));
        }
        self.rpc.remote_call(self.proxy_id, method, args)
    }

    /// Issue a call with typed arguments and decode the result.
    ///
    /// `args` should serialize to a JSON array (a tuple or `Vec`); `()` sends
    /// no arguments and any other value is sent as the only argument. Like
    /// [`call`](Self::call), the request is queued before this returns.
    pub fn invoke<A, R>(&self, method: &str, args: A) -> RemoteResult<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let call = encode_args(method, args).map(|args| self.call(method, args));
        let method = method.to_string();
        Box::pin(async move {
            let value = call?.await?;
            serde_json::from_value(value).map_err(|e| RpcError::Decode {
                method,
                reason: e.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("proxy_id", &self.proxy_id)
            .finish()
    }
}

fn encode_args<A: Serialize>(method: &str, args: A) -> Result<Vec<Value>, RpcError> {
    let value = serde_json::to_value(args).map_err(|e| RpcError::Encode {
        method: method.to_string(),
        reason: e.to_string(),
    })?;
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Untyped stand-in: any `$`-method can be called by name.
#[derive(Debug, Clone)]
pub struct DynamicProxy {
    handle: RemoteHandle,
}

impl Proxy for DynamicProxy {
    fn from_handle(handle: RemoteHandle) -> Self {
        Self { handle }
    }
}

impl DynamicProxy {
    pub fn call(&self, method: &str, args: Vec<Value>) -> RemoteCall {
        self.handle.call(method, args)
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }
}
