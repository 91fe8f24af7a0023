//! Fixed-size pool of reusable command slots.
//!
//! The pool allocates all of its buffers up front. A [`CommandSlot`] is the
//! unique owner of one buffer pair (the inbound frame bytes plus a scratch
//! area for the reply) and returns it to the pool when dropped, so a buffer
//! can never be both free and referenced. Ownership moves between the
//! decoder, the dispatch queue, the dispatcher and the deferred-reply slot by
//! moving the `CommandSlot` value itself.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::BytesMut;
use thiserror::Error;

use crate::frame::{FrameHeader, HEADER_SIZE};

/// Identifier of a pooled buffer, stable for the pool's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    #[must_use]
    pub fn as_usize(self) -> usize { self.0 }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "slot#{}", self.0) }
}

struct SlotStorage {
    id: SlotId,
    raw: BytesMut,
    reply: BytesMut,
}

impl SlotStorage {
    fn clear(&mut self) {
        self.raw.clear();
        self.reply.clear();
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<SlotStorage>>>,
    capacity: usize,
    max_payload: usize,
}

impl PoolInner {
    fn free(&self) -> MutexGuard<'_, Vec<Box<SlotStorage>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded set of reusable command slots.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Allocate a pool of `capacity` slots, each able to hold a frame with up
    /// to `max_payload` payload bytes and a reply of the same size.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, max_payload: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one slot");
        let free = (0..capacity)
            .rev()
            .map(|id| {
                Box::new(SlotStorage {
                    id: SlotId(id),
                    raw: BytesMut::with_capacity(HEADER_SIZE + max_payload),
                    reply: BytesMut::with_capacity(max_payload),
                })
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
                max_payload,
            }),
        }
    }

    /// Take a free slot, or `None` if every slot is in use.
    #[must_use]
    pub fn acquire(&self) -> Option<CommandSlot> {
        let storage = self.inner.free().pop()?;
        Some(CommandSlot {
            storage: Some(storage),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return `slot` to the pool, clearing its contents.
    ///
    /// Dropping a slot has the same effect; this method only makes the hand
    /// back explicit at call sites.
    pub fn release(&self, slot: CommandSlot) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &slot.pool),
            "slot released to a foreign pool"
        );
        drop(slot);
    }

    /// Number of slots currently free.
    #[must_use]
    pub fn available(&self) -> usize { self.inner.free().len() }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize { self.inner.capacity }

    /// Largest payload a slot can hold.
    #[must_use]
    pub fn max_payload(&self) -> usize { self.inner.max_payload }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Reply written past the scratch area's capacity.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("reply of {len} bytes exceeds the {max} byte limit")]
pub struct ReplyTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Uniquely owned command buffer borrowed from a [`BufferPool`].
pub struct CommandSlot {
    storage: Option<Box<SlotStorage>>,
    pool: Arc<PoolInner>,
}

impl CommandSlot {
    fn storage(&self) -> &SlotStorage {
        self.storage
            .as_deref()
            .unwrap_or_else(|| unreachable!("slot storage is only taken on drop"))
    }

    fn storage_mut(&mut self) -> &mut SlotStorage {
        self.storage
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("slot storage is only taken on drop"))
    }

    #[must_use]
    pub fn id(&self) -> SlotId { self.storage().id }

    /// Append raw frame bytes.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        let raw = &mut self.storage_mut().raw;
        debug_assert!(
            raw.len() + bytes.len() <= raw.capacity(),
            "decoder overfilled a command slot"
        );
        raw.extend_from_slice(bytes);
    }

    /// Header of the frame held by this slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not yet hold a complete header; the decoder
    /// only hands out slots holding complete frames.
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        let head = self
            .storage()
            .raw
            .first_chunk::<HEADER_SIZE>()
            .copied()
            .unwrap_or_else(|| panic!("{} holds no complete header", self.id()));
        FrameHeader::parse(head)
    }

    /// Payload of the frame held by this slot.
    #[must_use]
    pub fn payload(&self) -> &[u8] { self.storage().raw.get(HEADER_SIZE..).unwrap_or_default() }

    /// Complete raw frame bytes, header included.
    #[must_use]
    pub fn raw(&self) -> &[u8] { &self.storage().raw }

    /// Reply bytes written by the handler so far.
    #[must_use]
    pub fn reply(&self) -> &[u8] { &self.storage().reply }

    /// Borrow the request payload and the reply scratch area together.
    pub(crate) fn split(&mut self) -> (&[u8], ReplyBuf<'_>) {
        let max = self.pool.max_payload;
        let storage = self.storage_mut();
        let payload = storage.raw.get(HEADER_SIZE..).unwrap_or_default();
        (
            payload,
            ReplyBuf {
                buf: &mut storage.reply,
                max,
            },
        )
    }
}

impl Drop for CommandSlot {
    fn drop(&mut self) {
        if let Some(mut storage) = self.storage.take() {
            storage.clear();
            self.pool.free().push(storage);
        }
    }
}

impl fmt::Debug for CommandSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSlot")
            .field("id", &self.id())
            .field("len", &self.raw().len())
            .finish()
    }
}

/// Bounded view over a slot's reply scratch area.
pub struct ReplyBuf<'a> {
    buf: &'a mut BytesMut,
    max: usize,
}

impl ReplyBuf<'_> {
    /// Append `bytes` to the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyTooLarge`] if the reply would exceed the maximum payload;
    /// the reply is left unchanged.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), ReplyTooLarge> {
        let len = self.buf.len() + bytes.len();
        if len > self.max {
            return Err(ReplyTooLarge { len, max: self.max });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Append one byte to the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyTooLarge`] if the reply is already full.
    pub fn put_u8(&mut self, byte: u8) -> Result<(), ReplyTooLarge> { self.put_slice(&[byte]) }

    /// Discard anything written so far.
    pub fn clear(&mut self) { self.buf.clear(); }

    #[must_use]
    pub fn len(&self) -> usize { self.buf.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Remaining space in bytes.
    #[must_use]
    pub fn remaining(&self) -> usize { self.max - self.buf.len() }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn pool() -> BufferPool { BufferPool::new(2, 8) }

    #[rstest]
    fn acquire_until_exhausted(pool: BufferPool) {
        let first = pool.acquire().expect("first slot");
        let second = pool.acquire().expect("second slot");
        assert_ne!(first.id(), second.id());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        pool.release(first);
        assert_eq!(pool.available(), 1);
        drop(second);
        assert_eq!(pool.available(), 2);
    }

    #[rstest]
    fn released_slot_is_cleared(pool: BufferPool) {
        let mut slot = pool.acquire().expect("slot");
        slot.extend(&[1, 2, 0, 1, 0, 9]);
        let (_, mut reply) = slot.split();
        reply.put_slice(&[7, 7]).expect("reply fits");
        pool.release(slot);

        let slots = [pool.acquire(), pool.acquire()];
        for slot in slots.iter().flatten() {
            assert!(slot.raw().is_empty());
            assert!(slot.reply().is_empty());
        }
        assert_eq!(slots.iter().flatten().count(), 2);
    }

    #[rstest]
    fn slot_exposes_header_and_payload(pool: BufferPool) {
        let mut slot = pool.acquire().expect("slot");
        slot.extend(&[0x01, 0x02, 0x00, 0x02, 0x00, 0xaa, 0xbb]);
        assert_eq!(slot.header(), FrameHeader::new(1, 2, 0, 2));
        assert_eq!(slot.payload(), &[0xaa, 0xbb]);
    }

    #[rstest]
    fn reply_is_bounded(pool: BufferPool) {
        let mut slot = pool.acquire().expect("slot");
        let (_, mut reply) = slot.split();
        reply.put_slice(&[0; 6]).expect("fits");
        assert_eq!(reply.remaining(), 2);
        assert_eq!(
            reply.put_slice(&[0; 3]),
            Err(ReplyTooLarge { len: 9, max: 8 })
        );
        assert_eq!(reply.len(), 6);
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn empty_pool_is_rejected() { let _ = BufferPool::new(0, 8); }
}
