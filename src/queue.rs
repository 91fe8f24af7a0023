//! Ordered hand-off of decoded frames to the dispatcher.
//!
//! The queue is a bounded tokio channel sized to the buffer pool, so a
//! submission can only fail if the dispatcher has gone away: every queued
//! frame holds a pool slot, and the pool never hands out more slots than the
//! queue can carry. Frames are delivered in submission order.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::pool::CommandSlot;

/// Errors returned by [`QueueSender::submit`]. The rejected slot is released
/// back to its pool.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue was at capacity.
    #[error("dispatch queue full")]
    Full,
    /// The dispatcher has stopped.
    #[error("dispatch queue closed")]
    Closed,
}

/// Create a dispatch queue holding up to `capacity` frames.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn dispatch_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender(tx), QueueReceiver(rx))
}

/// Producer side, owned by the frame decoder's context.
#[derive(Clone, Debug)]
pub struct QueueSender(mpsc::Sender<CommandSlot>);

impl QueueSender {
    /// Enqueue `slot` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the queue is full or closed.
    pub fn submit(&self, slot: CommandSlot) -> Result<(), SubmitError> {
        self.0.try_send(slot).map_err(|err| match err {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Whether the dispatcher side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.is_closed() }
}

/// Consumer side, owned by the dispatcher.
#[derive(Debug)]
pub struct QueueReceiver(mpsc::Receiver<CommandSlot>);

impl QueueReceiver {
    /// Wait for the next frame. Returns `None` once every sender is gone and
    /// the queue is empty.
    pub async fn next(&mut self) -> Option<CommandSlot> { self.0.recv().await }

    /// Blocking variant of [`next`](Self::next) for dispatchers running on a
    /// dedicated thread.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_next(&mut self) -> Option<CommandSlot> { self.0.blocking_recv() }

    /// Take a frame if one is ready.
    pub fn try_next(&mut self) -> Option<CommandSlot> { self.0.try_recv().ok() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn slot_with_opcode(pool: &BufferPool, opcode: u8) -> CommandSlot {
        let mut slot = pool.acquire().expect("free slot");
        slot.extend(&[0x01, opcode, 0x00, 0x00, 0x00]);
        slot
    }

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let pool = BufferPool::new(3, 4);
        let (tx, mut rx) = dispatch_queue(pool.capacity());
        for opcode in 1..=3 {
            tx.submit(slot_with_opcode(&pool, opcode)).expect("submit");
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(slot) = rx.next().await {
            seen.push(slot.header().opcode);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn closed_queue_releases_slot() {
        let pool = BufferPool::new(1, 4);
        let (tx, rx) = dispatch_queue(1);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(
            tx.submit(slot_with_opcode(&pool, 1)),
            Err(SubmitError::Closed)
        );
        assert_eq!(pool.available(), 1);
    }
}
