//! Outbound batching and inbound demultiplexing.
//!
//! Frames sent during one scheduling tick are collected and written as a
//! single batch: the first frame into an empty buffer schedules a flush task,
//! which runs once the sending task yields. Inbound batches are fed to the core
//! one frame at a time, in list order.
//!
//! The flush is an ordinary spawned task. A sender running on a runtime worker
//! thread keeps it queued until it yields; code outside the runtime's workers
//! (a multi-thread `block_on` body, a plain thread) may see its frames split
//! across several batches. Ordering is preserved either way.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;

use crate::bridge::protocol::{Batch, Frame};
use crate::bridge::transport::ChannelSender;

pub(crate) struct Multiplexer {
    sender: ChannelSender,
    buffer: Arc<Mutex<Batch>>,
    runtime: Handle,
}

impl Multiplexer {
    pub(crate) fn new(sender: ChannelSender, runtime: Handle) -> Self {
        Self {
            sender,
            buffer: Arc::new(Mutex::new(Vec::new())),
            runtime,
        }
    }

    pub(crate) fn send(&self, frame: Frame) {
        let mut buffer = lock(&self.buffer);
        let was_empty = buffer.is_empty();
        buffer.push(frame);
        drop(buffer);

        if was_empty {
            let buffer = Arc::clone(&self.buffer);
            let sender = self.sender.clone();
            self.runtime.spawn(async move {
                flush(&buffer, &sender);
            });
        }
    }
}

fn flush(buffer: &Mutex<Batch>, sender: &ChannelSender) {
    // Send under the lock so concurrent flushes cannot reorder batches.
    let mut guard = lock(buffer);
    let batch = std::mem::take(&mut *guard);
    if batch.is_empty() {
        return;
    }
    let frames = batch.len();
    tracing::trace!(frames, "Flushing batch");
    if sender.send(batch).is_err() {
        tracing::warn!(frames, "Channel closed, dropping outbound batch");
    }
}

fn lock(buffer: &Mutex<Batch>) -> MutexGuard<'_, Batch> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand each frame of an inbound batch to `receive`, in order.
pub(crate) fn demultiplex(batch: Batch, mut receive: impl FnMut(&str)) {
    tracing::trace!(frames = batch.len(), "Received batch");
    for frame in &batch {
        receive(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::Channel;

    #[tokio::test]
    async fn frames_sent_in_one_tick_share_a_batch() {
        let (local, remote) = Channel::pair();
        let mux = Multiplexer::new(local.sender(), Handle::current());
        let (_, mut remote_rx) = remote.split();

        mux.send("a".to_string());
        mux.send("b".to_string());
        mux.send("c".to_string());

        let batch = remote_rx.recv().await.unwrap();
        assert_eq!(batch, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn later_ticks_start_new_batches() {
        let (local, remote) = Channel::pair();
        let mux = Multiplexer::new(local.sender(), Handle::current());
        let (_, mut remote_rx) = remote.split();

        mux.send("first".to_string());
        assert_eq!(remote_rx.recv().await.unwrap(), vec!["first"]);

        mux.send("second".to_string());
        mux.send("third".to_string());
        assert_eq!(remote_rx.recv().await.unwrap(), vec!["second", "third"]);
    }

    #[test]
    fn demultiplex_preserves_order() {
        let mut seen = Vec::new();
        demultiplex(
            vec!["1".to_string(), "2".to_string(), "3".to_string()],
            |frame| seen.push(frame.to_string()),
        );
        assert_eq!(seen, vec!["1", "2", "3"]);
    }
}
