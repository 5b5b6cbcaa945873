//! Error types for callers and actors.

use std::fmt;
use std::time::Duration;

use crate::bridge::protocol::ErrorInfo;

/// Why a remote call did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The remote actor failed with an error-like value, or the peer could
    /// not dispatch the call (unknown actor/method).
    #[error("{0}")]
    Remote(ErrorInfo),

    /// The remote actor failed with a value that carried no error details.
    #[error("remote call failed without error details")]
    RemoteOpaque,

    /// The core was torn down before the call settled, or was already torn
    /// down when the call was issued.
    #[error("Canceled")]
    Canceled,

    #[error("Canceled: {method} timed out after {timeout:?}")]
    TimedOut { method: String, timeout: Duration },

    /// Only `$`-prefixed methods cross the process boundary.
    #[error("method {0} is not remotely invocable")]
    NotRemote(String),

    #[error("failed to encode call to {method}: {reason}")]
    Encode { method: String, reason: String },

    #[error("failed to decode result of {method}: {reason}")]
    Decode { method: String, reason: String },
}

impl RpcError {
    /// True for the "Canceled" class: teardown and timeouts.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::TimedOut { .. })
    }

    pub fn remote_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Remote(info) => Some(info),
            _ => None,
        }
    }

    /// Name of the remote error (`TypeError`, `Error`, ...), if any.
    pub fn name(&self) -> Option<&str> {
        self.remote_info().map(|info| info.name.as_str())
    }
}

/// Failure of a locally registered actor operation.
///
/// Error-like failures keep name/message/stack so the caller can rebuild them;
/// [`ActorError::opaque`] reports a failure without details (`err: null`).
/// Any `std::error::Error` converts into an `ActorError`, so handlers can use `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorError {
    info: Option<ErrorInfo>,
}

impl ActorError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            info: Some(ErrorInfo::new(name, message)),
        }
    }

    pub fn opaque() -> Self {
        Self { info: None }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        if let Some(info) = self.info.take() {
            self.info = Some(info.with_stack(stack));
        }
        self
    }

    pub fn info(&self) -> Option<&ErrorInfo> {
        self.info.as_ref()
    }

    pub(crate) fn into_info(self) -> Option<ErrorInfo> {
        self.info
    }
}

impl From<ErrorInfo> for ActorError {
    fn from(info: ErrorInfo) -> Self {
        Self { info: Some(info) }
    }
}

impl<E> From<E> for ActorError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let info = ErrorInfo::new(short_type_name::<E>(), error.to_string());
        let info = if causes.is_empty() {
            info
        } else {
            info.with_stack(causes.join("\n"))
        };
        Self { info: Some(info) }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info {
            Some(info) => write!(f, "{info}"),
            None => f.write_str("actor failed without error details"),
        }
    }
}

/// `std::io::error::Error` → `Error`, `my_crate::Thing<u8>` → `Thing`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
