//! Framed codec for stream transports.
//!
//! Uses LengthDelimitedCodec for framing; each length-prefixed chunk holds one
//! batch (a JSON array of frames). Works over any AsyncRead/AsyncWrite (pipes,
//! sockets, etc).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Batch, decode_batch, encode_batch};

/// Codec that frames batches with a length prefix.
///
/// Chunks that are not a valid JSON array are logged and skipped so one bad
/// batch does not tear down the stream.
pub struct BatchCodec {
    inner: LengthDelimitedCodec,
}

impl Default for BatchCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Decoder for BatchCodec {
    type Item = Batch;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(bytes) = self.inner.decode(src)? {
            match decode_batch(&bytes) {
                Ok(batch) => return Ok(Some(batch)),
                Err(e) => {
                    tracing::warn!(error = %e, size_bytes = bytes.len(), "Dropping malformed batch");
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<Batch> for BatchCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Batch, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = encode_batch(&item);
        let json_len = json.len();
        tracing::trace!(frames = item.len(), json_size_bytes = json_len, "Encoding batch");
        if json_len > 100_000 {
            tracing::info!(
                frames = item.len(),
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large batch being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
