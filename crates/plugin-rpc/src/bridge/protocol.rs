//! Wire protocol types for RPC frames.
//!
//! Every frame is one flat JSON object discriminated by a numeric `type`:
//! - **Request** (1): `id`, `proxyId`, `method`, `args`
//! - **Reply** (2): `id`, optional `res`
//! - **ReplyErr** (3): `id`, `err` (error description or `null`)
//!
//! A batch is a JSON array of frames, sent as one channel write.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

/// One serialized message.
pub type Frame = String;

/// Ordered list of frames delivered in a single channel transmission.
pub type Batch = Vec<Frame>;

/// Correlation id of a call, unique and increasing within one core.
///
/// Encoded on the wire as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>()
            .map(CallId)
            .map_err(|_| de::Error::custom(format!("call id is not a decimal string: {raw:?}")))
    }
}

/// Description of an error-like failure raised by a remote actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Reply = 2,
    ReplyErr = 3,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            3 => Some(Self::ReplyErr),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reply => "reply",
            Self::ReplyErr => "reply error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// A decoded RPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFrame", into = "RawFrame")]
pub enum Message {
    Request {
        id: CallId,
        proxy_id: String,
        method: String,
        args: Vec<Value>,
    },
    Reply {
        id: CallId,
        res: Option<Value>,
    },
    /// `err` is `None` when the failure was not error-like.
    ReplyErr {
        id: CallId,
        err: Option<ErrorInfo>,
    },
}

impl Message {
    pub fn id(&self) -> CallId {
        match self {
            Self::Request { id, .. } | Self::Reply { id, .. } | Self::ReplyErr { id, .. } => *id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request { .. } => MessageType::Request,
            Self::Reply { .. } => MessageType::Reply,
            Self::ReplyErr { .. } => MessageType::ReplyErr,
        }
    }

    pub fn encode(&self) -> Result<Frame, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Flat on-the-wire shape shared by all three message kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    res: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireError<'a> {
    is_error: bool,
    #[serde(flatten)]
    info: &'a ErrorInfo,
}

impl RawFrame {
    fn empty(kind: MessageType, id: CallId) -> Self {
        Self {
            kind: kind as u8,
            id,
            proxy_id: None,
            method: None,
            args: None,
            res: None,
            err: None,
        }
    }
}

impl From<Message> for RawFrame {
    fn from(message: Message) -> Self {
        let mut raw = RawFrame::empty(message.message_type(), message.id());
        match message {
            Message::Request {
                proxy_id,
                method,
                args,
                ..
            } => {
                raw.proxy_id = Some(proxy_id);
                raw.method = Some(method);
                raw.args = Some(args);
            }
            Message::Reply { res, .. } => {
                raw.res = res;
            }
            Message::ReplyErr { err, .. } => {
                // Opaque failures still carry an explicit `"err": null`.
                let value = err
                    .as_ref()
                    .and_then(|info| {
                        serde_json::to_value(WireError {
                            is_error: true,
                            info,
                        })
                        .ok()
                    })
                    .unwrap_or(Value::Null);
                raw.err = Some(value);
            }
        }
        raw
    }
}

impl TryFrom<RawFrame> for Message {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        let kind = MessageType::from_u8(raw.kind).ok_or(FrameError::UnknownType(raw.kind))?;
        let missing = |field| FrameError::MissingField {
            kind: kind.as_str(),
            field,
        };

        match kind {
            MessageType::Request => Ok(Message::Request {
                id: raw.id,
                proxy_id: raw.proxy_id.ok_or_else(|| missing("proxyId"))?,
                method: raw.method.ok_or_else(|| missing("method"))?,
                args: raw.args.unwrap_or_default(),
            }),
            MessageType::Reply => Ok(Message::Reply {
                id: raw.id,
                res: raw.res,
            }),
            MessageType::ReplyErr => Ok(Message::ReplyErr {
                id: raw.id,
                err: raw.err.and_then(error_info_from_value),
            }),
        }
    }
}

fn error_info_from_value(value: Value) -> Option<ErrorInfo> {
    let is_error = value
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !is_error {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Encode frames as a batch: a JSON array whose elements are the frames verbatim.
pub fn encode_batch(frames: &[Frame]) -> String {
    let mut out = String::with_capacity(2 + frames.iter().map(|f| f.len() + 1).sum::<usize>());
    out.push('[');
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(frame);
    }
    out.push(']');
    out
}

/// Split a batch back into its frames without interpreting them.
pub fn decode_batch(bytes: &[u8]) -> Result<Batch, FrameError> {
    let frames: Vec<Box<RawValue>> = serde_json::from_slice(bytes)?;
    Ok(frames.into_iter().map(|f| f.get().to_owned()).collect())
}
