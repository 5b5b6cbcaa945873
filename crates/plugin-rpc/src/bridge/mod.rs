//! Wire layer shared by every RPC endpoint.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Reply, ReplyErr) and batch encoding
//! - **codec**: length-delimited batch codec for AsyncRead/AsyncWrite
//! - **transport**: duplex batch channels (in-memory pair, framed streams, stdio)

pub mod codec;
pub mod protocol;
pub mod transport;
