//! plugin-rpc: cross-process RPC between an IDE and its plugin hosts.

mod actor;
mod config;
mod error;
mod identifier;
mod multiplexer;
mod proxy;
mod rpc;

pub mod bridge;
pub mod capabilities;
pub mod relay;

pub use actor::{HandlerFuture, MethodTable, MethodTableBuilder};
pub use bridge::protocol::{CallId, ErrorInfo, Message};
pub use bridge::transport::{Channel, ChannelClosed, ChannelReceiver, ChannelSender};
pub use config::{CALL_TIMEOUT_ENV, CANCEL_ON_CLOSE_ENV, RpcConfig};
pub use error::{ActorError, RpcError};
pub use identifier::ProxyIdentifier;
pub use proxy::{
    DynamicProxy, Proxy, REMOTE_METHOD_PREFIX, RemoteHandle, RemoteResult, is_remote_method,
};
pub use relay::{Relay, relay};
pub use rpc::{RemoteCall, RpcProtocol};
