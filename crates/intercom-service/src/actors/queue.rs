//! Bounded outbound audio queue.
//!
//! Producers never wait: when the queue is full the incoming (newest) frame
//! is dropped and counted. A single consumer pops with a timeout so it can
//! recheck its own liveness while no audio is flowing.

use crate::observability::metrics;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Drop-newest FIFO of audio frames.
#[derive(Debug)]
pub struct AudioQueue {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    label: &'static str,
}

impl AudioQueue {
    /// Create a queue holding at most `capacity` frames. `label` names the
    /// queue in drop metrics.
    #[must_use]
    pub fn new(capacity: usize, label: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            label,
        }
    }

    /// Enqueue a frame without waiting. Returns `false` if it was dropped.
    pub fn push(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                metrics::record_audio_dropped(self.label);
                false
            }
        }
    }

    /// Wait up to `wait` for the next frame.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Discard everything currently queued. Returns the number discarded.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Frames currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_and_keeps_order() {
        let queue = AudioQueue::new(8, "session");

        for n in 0..8 {
            assert!(queue.push(frame(n)));
        }
        assert!(!queue.push(frame(8)), "ninth frame should be dropped");
        assert_eq!(queue.len(), 8);

        for n in 0..8 {
            let popped = queue.pop_timeout(Duration::from_millis(10)).await;
            assert_eq!(popped, Some(frame(n)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_on_empty_queue() {
        let queue = AudioQueue::new(2, "session");
        assert_eq!(queue.pop_timeout(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn test_drain_discards_queued_frames() {
        let queue = AudioQueue::new(4, "dest_to_source");
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.drain().await, 3);
        assert!(queue.is_empty());
        assert!(queue.push(frame(4)), "queue is usable after drain");
    }
}
