//! Pass-through forwarding between two channels.
//!
//! An intermediate process (the main process between an extension host and a
//! worker) relays batches in both directions without decoding them: frames
//! arrive at the far side byte-for-byte as sent, batch boundaries intact.
//! The relay ends as soon as either inbound side closes; dropping its senders
//! passes the close on to the other end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::bridge::protocol::Batch;
use crate::bridge::transport::{Channel, ChannelSender};

#[derive(Debug, Default)]
struct Counters {
    forwarded_right: AtomicU64,
    forwarded_left: AtomicU64,
}

/// Handle to a running relay. Dropping it leaves the relay running.
#[derive(Debug)]
pub struct Relay {
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

/// Forward every batch received on `left` out of `right` and vice versa.
pub fn relay(left: Channel, right: Channel) -> Relay {
    let (left_tx, mut left_rx) = left.split();
    let (right_tx, mut right_rx) = right.split();
    let counters = Arc::new(Counters::default());
    let task_counters = Arc::clone(&counters);

    tracing::debug!("Starting relay");
    let task = tokio::spawn(async move {
        loop {
            let forwarded = tokio::select! {
                batch = left_rx.recv() => match batch {
                    Some(batch) => forward("left_to_right", &right_tx, batch, &task_counters.forwarded_right),
                    None => {
                        tracing::debug!("Relay left side closed");
                        false
                    }
                },
                batch = right_rx.recv() => match batch {
                    Some(batch) => forward("right_to_left", &left_tx, batch, &task_counters.forwarded_left),
                    None => {
                        tracing::debug!("Relay right side closed");
                        false
                    }
                },
            };
            if !forwarded {
                break;
            }
        }
        tracing::debug!("Relay finished");
    });

    Relay { task, counters }
}

impl Relay {
    /// Batches forwarded from left to right so far.
    pub fn forwarded_right(&self) -> u64 {
        self.counters.forwarded_right.load(Ordering::Relaxed)
    }

    /// Batches forwarded from right to left so far.
    pub fn forwarded_left(&self) -> u64 {
        self.counters.forwarded_left.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop forwarding in both directions.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait until the relay has ended.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

fn forward(direction: &'static str, tx: &ChannelSender, batch: Batch, forwarded: &AtomicU64) -> bool {
    let frames = batch.len();
    if tx.send(batch).is_err() {
        tracing::debug!(direction, "Relay target closed");
        return false;
    }
    forwarded.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(direction, frames, "Relayed batch");
    true
}
