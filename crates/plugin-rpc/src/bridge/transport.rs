//! Duplex batch channels.
//!
//! A [`Channel`] is all the RPC core needs from a transport: a way to hand off
//! an outbound batch and a queue of inbound batches. Adapters:
//! - **Channel::pair**: in-memory loopback, both ends in one process
//! - **Channel::framed**: length-delimited batches over any AsyncRead/AsyncWrite
//! - **Channel::stdio**: framed over stdin/stdout (plugin host side of a pipe)

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::BatchCodec;
use super::protocol::Batch;

#[derive(Debug, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Send side of a channel. Sending never blocks.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Batch>,
}

impl ChannelSender {
    pub fn send(&self, batch: Batch) -> Result<(), ChannelClosed> {
        self.tx.send(batch).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receive side of a channel, yielding batches in delivery order.
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Batch>,
}

impl ChannelReceiver {
    /// Returns `None` once the peer side is gone.
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub fn new(tx: mpsc::UnboundedSender<Batch>, rx: mpsc::UnboundedReceiver<Batch>) -> Self {
        Self {
            sender: ChannelSender { tx },
            receiver: ChannelReceiver { rx },
        }
    }

    /// Two connected in-memory ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    /// Carry batches over a byte stream.
    ///
    /// Spawns a writer task and a reader task; must be called within a tokio
    /// runtime. The reader stops at EOF or on an I/O error, which the receiver
    /// observes as the channel closing.
    pub fn framed<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Batch>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Batch>();

        tokio::spawn(async move {
            let mut writer = FramedWrite::new(writer, BatchCodec::new());
            while let Some(batch) = outbound_rx.recv().await {
                if let Err(e) = writer.send(batch).await {
                    tracing::error!(error = %e, "Failed to write batch");
                    break;
                }
            }
            tracing::trace!("Batch writer exiting");
        });

        tokio::spawn(async move {
            let mut reader = FramedRead::new(reader, BatchCodec::new());
            loop {
                match reader.next().await {
                    Some(Ok(batch)) => {
                        if inbound_tx.send(batch).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Batch reader error");
                        break;
                    }
                    None => {
                        tracing::debug!("Batch stream closed");
                        break;
                    }
                }
            }
        });

        Self::new(outbound_tx, inbound_rx)
    }

    pub fn stdio() -> Self {
        Self::framed(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}
