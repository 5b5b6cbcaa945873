//! RPC core - registries, call correlation and inbound dispatch.
//!
//! Flow for an outbound call:
//! 1. Allocate the next call id and park a pending entry
//! 2. Encode a Request and queue it on the multiplexer
//! 3. Settle the caller when the matching Reply/ReplyErr is received
//!
//! Flow for an inbound Request:
//! 1. Look up the local actor and method (unknown ones are answered with a ReplyErr)
//! 2. Run the handler as a tracked in-flight invocation
//! 3. Send a Reply or ReplyErr once it settles
//!
//! Teardown (`dispose`) rejects every pending call with `Canceled`, aborts
//! in-flight invocations and stops the reader task.

use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{AbortHandle, BoxFuture};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::actor::{HandlerFuture, MethodTable};
use crate::bridge::protocol::{CallId, ErrorInfo, Message};
use crate::bridge::transport::{Channel, ChannelReceiver};
use crate::config::RpcConfig;
use crate::error::{ActorError, RpcError};
use crate::identifier::ProxyIdentifier;
use crate::multiplexer::{Multiplexer, demultiplex};
use crate::proxy::{Proxy, RemoteHandle};

type CallResult = Result<Value, RpcError>;

/// One endpoint of an RPC connection.
///
/// Cheap to clone; all clones share the same registries and channel. Must be
/// created within a tokio runtime.
///
/// Calls issued without yielding leave in one batch when the caller runs on a
/// runtime thread: any task, or the `block_on` body of a current-thread
/// runtime. The `block_on` body of a multi-thread runtime is not a worker, so
/// its calls may be split across batches.
#[derive(Clone)]
pub struct RpcProtocol {
    inner: Arc<Inner>,
}

struct Inner {
    config: RpcConfig,
    multiplexer: Multiplexer,
    locals: DashMap<String, MethodTable>,
    proxies: DashMap<(&'static str, TypeId), Arc<dyn Any + Send + Sync>>,
    pending: DashMap<CallId, oneshot::Sender<CallResult>>,
    // Keyed by a local sequence number; peers may reuse request ids.
    in_flight: DashMap<u64, AbortHandle>,
    last_call_id: AtomicU64,
    last_invocation: AtomicU64,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl RpcProtocol {
    pub fn new(channel: Channel) -> Self {
        Self::with_config(channel, RpcConfig::default())
    }

    pub fn with_config(channel: Channel, config: RpcConfig) -> Self {
        let runtime = Handle::current();
        let (sender, receiver) = channel.split();
        let inner = Arc::new(Inner {
            config,
            multiplexer: Multiplexer::new(sender, runtime.clone()),
            locals: DashMap::new(),
            proxies: DashMap::new(),
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            last_call_id: AtomicU64::new(0),
            last_invocation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            runtime: runtime.clone(),
        });

        runtime.spawn(run_reader(
            Arc::downgrade(&inner),
            receiver,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    /// Stand-in for the remote actor registered under `identifier`.
    ///
    /// Created on first use and cached for the lifetime of this core.
    pub fn get_proxy<T: Proxy>(&self, identifier: &ProxyIdentifier<T>) -> Arc<T> {
        let proxy_id = identifier.id();
        let proxy = {
            let entry = self
                .inner
                .proxies
                .entry((proxy_id, TypeId::of::<T>()))
                .or_insert_with(|| {
                    tracing::trace!(proxy_id, "Creating proxy");
                    Arc::new(T::from_handle(self.remote_handle(proxy_id)))
                        as Arc<dyn Any + Send + Sync>
                });
            Arc::clone(entry.value())
        };

        match proxy.downcast::<T>() {
            Ok(proxy) => proxy,
            Err(_) => {
                tracing::error!(proxy_id, "Cached proxy has unexpected type");
                Arc::new(T::from_handle(self.remote_handle(proxy_id)))
            }
        }
    }

    /// Make `actor`'s methods reachable by peers holding the same identifier.
    ///
    /// Registering again under the same id replaces the previous actor.
    pub fn register_local<T>(&self, identifier: &ProxyIdentifier<T>, actor: impl Into<MethodTable>) {
        let table = actor.into();
        let proxy_id = identifier.id();
        tracing::debug!(proxy_id, methods = table.len(), "Registering local actor");
        if self
            .inner
            .locals
            .insert(proxy_id.to_string(), table)
            .is_some()
        {
            tracing::debug!(proxy_id, "Replaced previously registered actor");
        }
    }

    /// Reject all pending calls with [`RpcError::Canceled`], abort in-flight
    /// invocations and stop reading from the channel. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the core is disposed, explicitly or because the channel closed.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown.clone().cancelled_owned()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn in_flight_invocations(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub(crate) fn remote_call(&self, proxy_id: &str, method: &str, args: Vec<Value>) -> RemoteCall {
        self.inner.remote_call(proxy_id, method, args)
    }

    fn remote_handle(&self, proxy_id: &'static str) -> RemoteHandle {
        RemoteHandle::new(WeakRpc(Arc::downgrade(&self.inner)), proxy_id)
    }
}

impl std::fmt::Debug for RpcProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProtocol")
            .field("locals", &self.inner.locals.len())
            .field("pending", &self.inner.pending.len())
            .field("in_flight", &self.inner.in_flight.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Non-owning reference held by proxies, so cached proxies do not keep
/// their core alive.
#[derive(Clone)]
pub(crate) struct WeakRpc(Weak<Inner>);

impl WeakRpc {
    pub(crate) fn remote_call(&self, proxy_id: &str, method: &str, args: Vec<Value>) -> RemoteCall {
        match self.0.upgrade() {
            Some(inner) => inner.remote_call(proxy_id, method, args),
            None => RemoteCall::failed(method, RpcError::Canceled),
        }
    }
}

impl Inner {
    fn next_call_id(&self) -> CallId {
        CallId::new(self.last_call_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn remote_call(self: &Arc<Self>, proxy_id: &str, method: &str, args: Vec<Value>) -> RemoteCall {
        if self.shutdown.is_cancelled() {
            return RemoteCall::failed(method, RpcError::Canceled);
        }

        let id = self.next_call_id();
        let request = Message::Request {
            id,
            proxy_id: proxy_id.to_string(),
            method: method.to_string(),
            args,
        };
        let frame = match request.encode() {
            Ok(frame) => frame,
            Err(e) => {
                return RemoteCall::failed(
                    method,
                    RpcError::Encode {
                        method: method.to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // dispose() may have drained the table between the check above and the insert
        if self.shutdown.is_cancelled() {
            self.pending.remove(&id);
            return RemoteCall::failed(method, RpcError::Canceled);
        }

        tracing::trace!(call_id = %id, proxy_id, method, "Issuing remote call");
        self.multiplexer.send(frame);

        let guard = PendingGuard {
            rpc: Arc::downgrade(self),
            id,
        };
        let call = RemoteCall {
            method: method.to_string(),
            future: Box::pin(async move {
                let _guard = guard;
                rx.await.unwrap_or(Err(RpcError::Canceled))
            }),
        };

        match self.config.call_timeout {
            Some(timeout) => call.with_timeout(timeout),
            None => call,
        }
    }

    fn receive(self: &Arc<Self>, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, frame_size_bytes = frame.len(), "Dropping malformed frame");
                return;
            }
        };

        match message {
            Message::Request {
                id,
                proxy_id,
                method,
                args,
            } => self.receive_request(id, proxy_id, method, args),
            Message::Reply { id, res } => self.settle(id, Ok(res.unwrap_or(Value::Null))),
            Message::ReplyErr { id, err } => {
                let error = err.map(RpcError::Remote).unwrap_or(RpcError::RemoteOpaque);
                self.settle(id, Err(error));
            }
        }
    }

    fn receive_request(self: &Arc<Self>, id: CallId, proxy_id: String, method: String, args: Vec<Value>) {
        if self.shutdown.is_cancelled() {
            tracing::trace!(call_id = %id, "Core disposed, ignoring request");
            return;
        }
        tracing::trace!(call_id = %id, %proxy_id, %method, "Dispatching request");

        let invocation = match self.dispatch(&proxy_id, &method, args) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::debug!(call_id = %id, error = %e, "Request could not be dispatched");
                self.send_reply(id, Err(e));
                return;
            }
        };

        let (invocation, abort) =
            futures::future::abortable(AssertUnwindSafe(invocation).catch_unwind());
        let invocation_id = self.last_invocation.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(invocation_id, abort);
        // dispose() may have drained the table before the insert
        if self.shutdown.is_cancelled() {
            self.in_flight.remove(&invocation_id);
            tracing::trace!(call_id = %id, "Core disposed, dropping invocation");
            return;
        }

        let rpc = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let outcome = invocation.await;
            let Some(inner) = rpc.upgrade() else {
                return;
            };
            inner.in_flight.remove(&invocation_id);

            match outcome {
                Ok(Ok(result)) => inner.send_reply(id, result),
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(call_id = %id, %proxy_id, %method, panic = %message, "Actor method panicked");
                    inner.send_reply(
                        id,
                        Err(ActorError::new(
                            "Error",
                            format!("{method} on actor {proxy_id} panicked: {message}"),
                        )),
                    );
                }
                Err(_) => {
                    tracing::trace!(call_id = %id, "Invocation aborted");
                }
            }
        });
    }

    fn dispatch(&self, proxy_id: &str, method: &str, args: Vec<Value>) -> Result<HandlerFuture, ActorError> {
        let handler = {
            let actor = self
                .locals
                .get(proxy_id)
                .ok_or_else(|| ActorError::new("Error", format!("Unknown actor {proxy_id}")))?;
            actor.handler(method).ok_or_else(|| {
                ActorError::new("Error", format!("Unknown method {method} on actor {proxy_id}"))
            })?
        };

        // Sync handlers do their work right here.
        std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))).map_err(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(%proxy_id, %method, panic = %message, "Actor method panicked");
            ActorError::new(
                "Error",
                format!("{method} on actor {proxy_id} panicked: {message}"),
            )
        })
    }

    fn send_reply(&self, id: CallId, result: Result<Value, ActorError>) {
        if self.shutdown.is_cancelled() {
            tracing::trace!(call_id = %id, "Core disposed, dropping reply");
            return;
        }

        let message = match result {
            Ok(value) => Message::Reply {
                id,
                res: Some(value),
            },
            Err(e) => Message::ReplyErr {
                id,
                err: e.into_info(),
            },
        };

        let frame = message.encode().or_else(|e| {
            tracing::error!(call_id = %id, error = %e, "Failed to encode reply");
            Message::ReplyErr {
                id,
                err: Some(ErrorInfo::new("Error", format!("failed to encode reply: {e}"))),
            }
            .encode()
        });

        match frame {
            Ok(frame) => self.multiplexer.send(frame),
            Err(e) => tracing::error!(call_id = %id, error = %e, "Failed to encode error reply"),
        }
    }

    fn settle(&self, id: CallId, result: CallResult) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                tracing::trace!(call_id = %id, ok = result.is_ok(), "Settling call");
                if tx.send(result).is_err() {
                    tracing::trace!(call_id = %id, "Caller went away before settlement");
                }
            }
            None => {
                tracing::debug!(call_id = %id, "Ignoring reply for unknown or settled call");
            }
        }
    }

    fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let pending: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut canceled = 0usize;
        for id in pending {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Canceled));
                canceled += 1;
            }
        }

        let in_flight: Vec<u64> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        let mut aborted = 0usize;
        for id in in_flight {
            if let Some((_, abort)) = self.in_flight.remove(&id) {
                abort.abort();
                aborted += 1;
            }
        }

        tracing::debug!(canceled, aborted, "RPC core disposed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes the pending entry when a caller stops waiting (dropped or timed out).
struct PendingGuard {
    rpc: Weak<Inner>,
    id: CallId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.rpc.upgrade()
            && inner.pending.remove(&self.id).is_some()
        {
            tracing::trace!(call_id = %self.id, "Abandoned pending call");
        }
    }
}

/// Result of a remote call. The request has already been queued when this
/// value is returned; dropping it abandons the call.
pub struct RemoteCall {
    method: String,
    future: BoxFuture<'static, CallResult>,
}

impl RemoteCall {
    pub(crate) fn failed(method: &str, error: RpcError) -> Self {
        Self {
            method: method.to_string(),
            future: Box::pin(futures::future::ready(Err(error))),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Reject with [`RpcError::TimedOut`] if the call has not settled in time.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let RemoteCall { method, future } = self;
        let name = method.clone();
        Self {
            method,
            future: Box::pin(async move {
                match tokio::time::timeout(timeout, future).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::debug!(method = %name, ?timeout, "Remote call timed out");
                        Err(RpcError::TimedOut {
                            method: name,
                            timeout,
                        })
                    }
                }
            }),
        }
    }
}

impl Future for RemoteCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCall")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

async fn run_reader(rpc: Weak<Inner>, mut receiver: ChannelReceiver, shutdown: CancellationToken) {
    loop {
        let batch = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            batch = receiver.recv() => batch,
        };

        let Some(inner) = rpc.upgrade() else {
            break;
        };

        match batch {
            Some(batch) => demultiplex(batch, |frame| inner.receive(frame)),
            None => {
                if inner.config.cancel_on_close {
                    tracing::warn!(
                        pending = inner.pending.len(),
                        "Inbound channel closed, disposing RPC core"
                    );
                    inner.dispose();
                } else {
                    tracing::warn!(
                        pending = inner.pending.len(),
                        "Inbound channel closed, pending calls will not settle"
                    );
                }
                break;
            }
        }
    }
    tracing::trace!("RPC reader exiting");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{ChannelReceiver, ChannelSender};
    use crate::proxy::{DynamicProxy, RemoteResult};
    use serde_json::json;
    use tokio::sync::Notify;

    const ECHO: ProxyIdentifier<DynamicProxy> = ProxyIdentifier::new("Echo");
    const TYPED_ECHO: ProxyIdentifier<EchoProxy> = ProxyIdentifier::new("Echo");

    struct EchoProxy {
        handle: RemoteHandle,
    }

    impl Proxy for EchoProxy {
        fn from_handle(handle: RemoteHandle) -> Self {
            Self { handle }
        }
    }

    impl EchoProxy {
        fn ping(&self) -> RemoteResult<String> {
            self.handle.invoke("$ping", ())
        }

        fn add(&self, a: i64, b: i64) -> RemoteResult<i64> {
            self.handle.invoke("$add", (a, b))
        }
    }

    fn echo_actor() -> MethodTable {
        MethodTable::builder()
            .sync("$ping", |_| Ok("pong"))
            .typed("$add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .method("$identity", |mut args| async move {
                Ok(args.drain(..).next().unwrap_or(Value::Null))
            })
            .sync("$fail", |_| -> Result<(), ActorError> {
                Err(ActorError::new("TypeError", "boom").with_stack("at $fail"))
            })
            .sync("$failOpaque", |_| -> Result<(), ActorError> { Err(ActorError::opaque()) })
            .sync("$panic", |_| -> Result<(), ActorError> { panic!("kaboom") })
            .build()
    }

    fn connected() -> (RpcProtocol, RpcProtocol) {
        let (a, b) = Channel::pair();
        (RpcProtocol::new(a), RpcProtocol::new(b))
    }

    fn with_raw_peer(config: RpcConfig) -> (RpcProtocol, ChannelSender, ChannelReceiver) {
        let (local, remote) = Channel::pair();
        let rpc = RpcProtocol::with_config(local, config);
        let (tx, rx) = remote.split();
        (rpc, tx, rx)
    }

    fn reply(id: u64, res: Value) -> String {
        Message::Reply {
            id: CallId::new(id),
            res: Some(res),
        }
        .encode()
        .unwrap()
    }

    async fn nothing_received(rx: &mut ChannelReceiver) -> bool {
        tokio::time::timeout(Duration::from_millis(20), rx.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn end_to_end_ping() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let result = b.get_proxy(&ECHO).call("$ping", vec![]).await.unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn typed_stub_round_trip() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let echo = b.get_proxy(&TYPED_ECHO);
        assert_eq!(echo.ping().await.unwrap(), "pong");
        assert_eq!(echo.add(40, 2).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn round_trip_preserves_structure() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let value = json!({
            "name": "späce ✓",
            "nested": {"list": [1, 2.5, null, true, {"deep": []}]},
            "big": 9007199254740993u64,
        });
        let result = b
            .get_proxy(&ECHO)
            .call("$identity", vec![value.clone()])
            .await
            .unwrap();
        assert_eq!(result, value);
    }

    #[tokio::test]
    async fn unknown_actor_rejects() {
        let (_a, b) = connected();

        let err = b.get_proxy(&ECHO).call("$ping", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("Unknown actor Echo"), "{err}");
    }

    #[tokio::test]
    async fn unknown_method_rejects() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let err = b.get_proxy(&ECHO).call("$missing", vec![]).await.unwrap_err();
        assert!(
            err.to_string().contains("Unknown method $missing on actor Echo"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn error_name_and_message_are_reconstructed() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let err = b.get_proxy(&ECHO).call("$fail", vec![]).await.unwrap_err();
        let info = err.remote_info().expect("error-like failure");
        assert_eq!(info.name, "TypeError");
        assert_eq!(info.message, "boom");
        assert_eq!(info.stack.as_deref(), Some("at $fail"));
    }

    #[tokio::test]
    async fn opaque_failure_rejects_without_details() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let err = b.get_proxy(&ECHO).call("$failOpaque", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::RemoteOpaque), "{err:?}");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_reply_error() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let err = b.get_proxy(&ECHO).call("$panic", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("panicked: kaboom"), "{err}");

        // The endpoint keeps serving.
        let result = b.get_proxy(&ECHO).call("$ping", vec![]).await.unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn bad_typed_arguments_reject_as_type_error() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let err = b
            .get_proxy(&ECHO)
            .call("$add", vec![json!("one")])
            .await
            .unwrap_err();
        assert_eq!(err.name(), Some("TypeError"));
    }

    #[tokio::test]
    async fn synchronous_calls_share_one_batch() {
        let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());
        let proxy = rpc.get_proxy(&ECHO);

        let _calls: Vec<RemoteCall> = (0..3).map(|_| proxy.call("$ping", vec![])).collect();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        let ids: Vec<CallId> = batch
            .iter()
            .map(|frame| match Message::decode(frame).unwrap() {
                Message::Request { id, proxy_id, method, args } => {
                    assert_eq!(proxy_id, "Echo");
                    assert_eq!(method, "$ping");
                    assert!(args.is_empty());
                    id
                }
                other => panic!("expected request, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![CallId::new(1), CallId::new(2), CallId::new(3)]);

        assert!(nothing_received(&mut rx).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_from_a_worker_task_share_one_batch() {
        for _ in 0..20 {
            let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());
            let proxy = rpc.get_proxy(&ECHO);

            let calls = tokio::spawn(async move {
                (0..200)
                    .map(|_| proxy.call("$ping", vec![]))
                    .collect::<Vec<RemoteCall>>()
            })
            .await
            .unwrap();

            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.len(), 200);
            assert!(nothing_received(&mut rx).await);
            drop(calls);
        }
    }

    #[tokio::test]
    async fn replies_settle_out_of_order() {
        let (rpc, tx, mut rx) = with_raw_peer(RpcConfig::default());
        let proxy = rpc.get_proxy(&ECHO);

        let mut first = proxy.call("$ping", vec![json!("a")]);
        let second = proxy.call("$ping", vec![json!("b")]);
        assert_eq!(rx.recv().await.unwrap().len(), 2);

        tx.send(vec![reply(2, json!("b"))]).unwrap();
        assert_eq!(second.await.unwrap(), json!("b"));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut first)
                .await
                .is_err()
        );

        tx.send(vec![reply(1, json!("a"))]).unwrap();
        assert_eq!(first.await.unwrap(), json!("a"));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_reply_is_ignored() {
        let (rpc, tx, mut rx) = with_raw_peer(RpcConfig::default());
        let proxy = rpc.get_proxy(&ECHO);

        let call = proxy.call("$ping", vec![]);
        rx.recv().await.unwrap();

        tx.send(vec![reply(1, json!("first")), reply(1, json!("second"))])
            .unwrap();
        assert_eq!(call.await.unwrap(), json!("first"));

        tx.send(vec![reply(1, json!("third"))]).unwrap();
        let next = proxy.call("$ping", vec![]);
        rx.recv().await.unwrap();
        tx.send(vec![reply(2, json!("next"))]).unwrap();
        assert_eq!(next.await.unwrap(), json!("next"));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let (rpc, tx, mut rx) = with_raw_peer(RpcConfig::default());
        let proxy = rpc.get_proxy(&ECHO);

        let call = proxy.call("$ping", vec![]);
        rx.recv().await.unwrap();

        tx.send(vec![
            "not json".to_string(),
            r#"{"type":7,"id":"1"}"#.to_string(),
            reply(1, json!("ok")),
        ])
        .unwrap();
        assert_eq!(call.await.unwrap(), json!("ok"));
        assert!(!rpc.is_disposed());
    }

    #[tokio::test]
    async fn non_remote_methods_never_hit_the_wire() {
        let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());

        let err = rpc.get_proxy(&ECHO).call("ping", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::NotRemote(ref m) if m == "ping"), "{err:?}");
        assert!(nothing_received(&mut rx).await);
    }

    #[tokio::test]
    async fn proxies_are_cached_per_identifier() {
        let (_a, b) = connected();
        let first = b.get_proxy(&ECHO);
        let second = b.get_proxy(&ECHO);
        assert!(Arc::ptr_eq(&first, &second));

        let other = b.get_proxy(&ProxyIdentifier::<DynamicProxy>::new("Other"));
        assert_eq!(other.handle().proxy_id(), "Other");
    }

    #[tokio::test]
    async fn re_registration_replaces_actor() {
        let (a, b) = connected();
        a.register_local(&ECHO, MethodTable::builder().sync("$version", |_| Ok(1)));
        a.register_local(&ECHO, MethodTable::builder().sync("$version", |_| Ok(2)));

        let result = b.get_proxy(&ECHO).call("$version", vec![]).await.unwrap();
        assert_eq!(result, json!(2));
    }

    #[tokio::test]
    async fn async_handlers_complete_independently() {
        let (a, b) = connected();
        a.register_local(
            &ECHO,
            MethodTable::builder().typed("$sleep", |(ms, tag): (u64, String)| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(tag)
            }),
        );

        let proxy = b.get_proxy(&ECHO);
        let mut slow = proxy.call("$sleep", vec![json!(40), json!("slow")]);
        let fast = proxy.call("$sleep", vec![json!(1), json!("fast")]);

        assert_eq!(fast.await.unwrap(), json!("fast"));
        assert!(
            tokio::time::timeout(Duration::from_millis(5), &mut slow)
                .await
                .is_err()
        );
        assert_eq!(slow.await.unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn in_flight_invocations_are_tracked() {
        let (a, b) = connected();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        a.register_local(
            &ECHO,
            MethodTable::builder().method("$wait", move |_| {
                let (started, release) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok("released")
                }
            }),
        );

        let call = b.get_proxy(&ECHO).call("$wait", vec![]);
        started.notified().await;
        assert_eq!(a.in_flight_invocations(), 1);

        release.notify_one();
        assert_eq!(call.await.unwrap(), json!("released"));
        assert_eq!(a.in_flight_invocations(), 0);
    }

    #[tokio::test]
    async fn dispose_rejects_pending_and_future_calls() {
        let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());
        let proxy = rpc.get_proxy(&ECHO);

        let call = proxy.call("$ping", vec![]);
        assert_eq!(rx.recv().await.unwrap().len(), 1);
        assert_eq!(rpc.pending_calls(), 1);

        rpc.dispose();
        assert!(rpc.is_disposed());
        assert!(matches!(call.await, Err(RpcError::Canceled)));
        assert_eq!(rpc.pending_calls(), 0);

        let late = proxy.call("$ping", vec![]).await;
        assert!(matches!(late, Err(RpcError::Canceled)));
        assert!(nothing_received(&mut rx).await);

        rpc.dispose();
        rpc.closed().await;
    }

    #[tokio::test]
    async fn dispose_aborts_in_flight_invocations() {
        let (a, b) = connected();
        let started = Arc::new(Notify::new());
        let s = Arc::clone(&started);
        a.register_local(
            &ECHO,
            MethodTable::builder().method("$hang", move |_| {
                let started = Arc::clone(&s);
                async move {
                    started.notify_one();
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }),
        );

        let _call = b.get_proxy(&ECHO).call("$hang", vec![]);
        started.notified().await;
        assert_eq!(a.in_flight_invocations(), 1);

        a.dispose();
        assert_eq!(a.in_flight_invocations(), 0);
    }

    fn request(id: u64, method: &str) -> String {
        Message::Request {
            id: CallId::new(id),
            proxy_id: "Echo".to_string(),
            method: method.to_string(),
            args: vec![],
        }
        .encode()
        .unwrap()
    }

    /// Reports on `events` when the invocation holding it is dropped.
    struct DropReporter(tokio::sync::mpsc::UnboundedSender<&'static str>);

    impl Drop for DropReporter {
        fn drop(&mut self) {
            let _ = self.0.send("dropped");
        }
    }

    #[tokio::test]
    async fn duplicate_request_ids_are_tracked_separately() {
        let (rpc, tx, _rx) = with_raw_peer(RpcConfig::default());
        let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
        rpc.register_local(
            &ECHO,
            MethodTable::builder().method("$hang", move |_| {
                let events = events_tx.clone();
                async move {
                    let _reporter = DropReporter(events.clone());
                    let _ = events.send("started");
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }),
        );

        tx.send(vec![request(7, "$hang"), request(7, "$hang")]).unwrap();
        assert_eq!(events.recv().await, Some("started"));
        assert_eq!(events.recv().await, Some("started"));
        assert_eq!(rpc.in_flight_invocations(), 2);

        rpc.dispose();
        assert_eq!(rpc.in_flight_invocations(), 0);
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
            assert_eq!(event.unwrap(), Some("dropped"));
        }
    }

    #[tokio::test]
    async fn requests_after_dispose_are_not_dispatched() {
        let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        rpc.register_local(
            &ECHO,
            MethodTable::builder().sync("$count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        rpc.dispose();
        rpc.inner.receive(&request(1, "$count"));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(rpc.in_flight_invocations(), 0);
        assert!(nothing_received(&mut rx).await);
    }

    #[tokio::test]
    async fn calls_time_out_when_configured() {
        let config = RpcConfig::new().with_call_timeout(Duration::from_millis(20));
        let (rpc, _tx, mut rx) = with_raw_peer(config);

        let call = rpc.get_proxy(&ECHO).call("$ping", vec![]);
        rx.recv().await.unwrap();

        let err = call.await.unwrap_err();
        assert!(err.is_canceled());
        assert!(matches!(err, RpcError::TimedOut { ref method, .. } if method == "$ping"));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn explicit_timeout_wraps_a_single_call() {
        let (rpc, _tx, _rx) = with_raw_peer(RpcConfig::default());

        let err = rpc
            .get_proxy(&ECHO)
            .call("$ping", vec![])
            .with_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn channel_close_cancels_pending_calls() {
        let (rpc, tx, mut rx) = with_raw_peer(RpcConfig::default());

        let call = rpc.get_proxy(&ECHO).call("$ping", vec![]);
        rx.recv().await.unwrap();
        drop(tx);
        drop(rx);

        assert!(matches!(call.await, Err(RpcError::Canceled)));
        assert!(rpc.is_disposed());
    }

    #[tokio::test]
    async fn channel_close_can_leave_calls_pending() {
        let config = RpcConfig::new().with_cancel_on_close(false);
        let (rpc, tx, mut rx) = with_raw_peer(config);

        let mut call = rpc.get_proxy(&ECHO).call("$ping", vec![]);
        rx.recv().await.unwrap();
        drop(tx);

        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut call)
                .await
                .is_err()
        );
        assert!(!rpc.is_disposed());
        assert_eq!(rpc.pending_calls(), 1);
    }

    #[tokio::test]
    async fn dropped_core_cancels_proxy_calls() {
        let (a, b) = connected();
        a.register_local(&ECHO, echo_actor());

        let proxy = b.get_proxy(&ECHO);
        drop(b);

        let err = proxy.call("$ping", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Canceled), "{err:?}");
    }

    #[tokio::test]
    async fn abandoned_calls_leave_no_pending_entry() {
        let (rpc, _tx, mut rx) = with_raw_peer(RpcConfig::default());

        let call = rpc.get_proxy(&ECHO).call("$ping", vec![]);
        rx.recv().await.unwrap();
        assert_eq!(rpc.pending_calls(), 1);

        drop(call);
        assert_eq!(rpc.pending_calls(), 0);
    }
}
