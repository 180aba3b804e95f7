//! Bounded outbound command queue.
//!
//! Every command destined for the transceiver (a transmit, a region
//! reprogram, a query) passes through this queue. It has exactly one
//! consumer — the command state machine — so producers never need to
//! coordinate with each other beyond the channel itself. Capacity is
//! fixed at 100; a producer that outruns the consumer drops the newest
//! command rather than blocking, since blocking a caller on a full queue
//! would back up into the serial read loop or an HTTP handler that has
//! its own timeout to respect.

use tokio::sync::mpsc;
use tracing::warn;

pub const CAPACITY: usize = 100;

/// A single command destined for the transceiver, already hex-ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand(pub Vec<u8>);

/// Producer handle. Cheap to clone; every task that can originate an
/// outbound command holds one.
#[derive(Clone)]
pub struct QueueSender {
    inner: mpsc::Sender<OutboundCommand>,
}

impl QueueSender {
    /// Enqueue a command. Never blocks; logs and drops on a full queue.
    pub fn enqueue(&self, command: OutboundCommand) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.try_send(command) {
            warn!("outbound queue full ({CAPACITY} commands pending), dropping command");
        }
    }
}

/// Consumer handle, owned solely by the command state machine.
pub struct QueueReceiver {
    inner: mpsc::Receiver<OutboundCommand>,
}

impl QueueReceiver {
    /// Pop the next pending command without blocking.
    pub fn try_recv(&mut self) -> Option<OutboundCommand> {
        self.inner.try_recv().ok()
    }

    /// Await the next pending command.
    pub async fn recv(&mut self) -> Option<OutboundCommand> {
        self.inner.recv().await
    }
}

/// Build a fresh bounded queue.
pub fn channel() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (QueueSender { inner: tx }, QueueReceiver { inner: rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_recv_preserves_order() {
        let (tx, mut rx) = channel();
        tx.enqueue(OutboundCommand(vec![1]));
        tx.enqueue(OutboundCommand(vec![2]));

        assert_eq!(rx.recv().await, Some(OutboundCommand(vec![1])));
        assert_eq!(rx.recv().await, Some(OutboundCommand(vec![2])));
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        let (tx, mut rx) = channel();
        for i in 0..CAPACITY {
            tx.enqueue(OutboundCommand(vec![i as u8]));
        }
        // One more over capacity: dropped, not blocked.
        tx.enqueue(OutboundCommand(vec![0xFF]));

        let mut seen = Vec::new();
        while let Some(cmd) = rx.try_recv() {
            seen.push(cmd);
        }
        assert_eq!(seen.len(), CAPACITY);
        assert!(!seen.contains(&OutboundCommand(vec![0xFF])));
    }
}
