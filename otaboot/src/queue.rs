//! Single-producer single-consumer queue of completed frames.
//!
//! The framer publishes from interrupt context; the update routine
//! receives from task context. A published slot belongs to the consumer
//! until its [`ReadyPacket`] token is dropped, so the producer can never
//! overwrite a frame that is still being processed. When every slot is
//! taken, [`PacketQueue::publish`] refuses the frame instead of
//! overwriting one.

use {
    crate::protocol::packet::PACKET_MAX_SIZE,
    core::{
        cell::UnsafeCell,
        ops::Deref,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

struct Slot {
    buf: UnsafeCell<[u8; PACKET_MAX_SIZE]>,
    len: AtomicUsize,
    full: AtomicBool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; PACKET_MAX_SIZE]),
            len: AtomicUsize::new(0),
            full: AtomicBool::new(false),
        }
    }
}

/// Bounded frame queue with `N` slots (`N - 1` usable).
///
/// Exactly one context may call [`publish`](Self::publish) and exactly one
/// may call [`receive`](Self::receive).
pub struct PacketQueue<const N: usize> {
    head: AtomicUsize,
    tail: AtomicUsize,
    borrowed: AtomicBool,
    slots: [Slot; N],
}

impl<const N: usize> Default for PacketQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PacketQueue<N> {
    /// Create an empty queue. Usable in a `static`.
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            borrowed: AtomicBool::new(false),
            slots: [const { Slot::new() }; N],
        }
    }

    #[inline]
    fn next(idx: usize) -> usize {
        (idx + 1) % N
    }

    /// Whether no frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.head
            .load(Ordering::Acquire)
            == self
                .tail
                .load(Ordering::Acquire)
    }

    /// Whether the producer would be refused.
    pub fn is_full(&self) -> bool {
        Self::next(
            self.tail
                .load(Ordering::Acquire),
        ) == self
            .head
            .load(Ordering::Acquire)
    }

    /// Copy `frame` into the next free slot. Producer side.
    ///
    /// Returns `false` without touching any slot when the queue is full or
    /// the frame is larger than a slot.
    #[allow(unsafe_code)]
    pub fn publish(&self, frame: &[u8]) -> bool {
        if frame.len() > PACKET_MAX_SIZE || self.is_full() {
            return false;
        }
        let tail = self
            .tail
            .load(Ordering::Relaxed);
        let slot = &self.slots[tail];
        if slot
            .full
            .load(Ordering::Acquire)
        {
            return false;
        }

        // SAFETY: the slot is not full, so the consumer holds no reference
        // to it, and only the single producer writes empty slots.
        let buf = unsafe { &mut *slot.buf.get() };
        buf[..frame.len()].copy_from_slice(frame);

        slot.len
            .store(frame.len(), Ordering::Release);
        slot.full
            .store(true, Ordering::Release);
        self.tail
            .store(Self::next(tail), Ordering::Release);
        true
    }

    /// Take the oldest frame. Consumer side.
    ///
    /// Returns `None` when the queue is empty or a previous token is still
    /// alive.
    #[allow(unsafe_code)]
    pub fn receive(&self) -> Option<ReadyPacket<'_, N>> {
        if self.is_empty()
            || self
                .borrowed
                .swap(true, Ordering::Acquire)
        {
            return None;
        }

        let head = self
            .head
            .load(Ordering::Relaxed);
        let slot = &self.slots[head];
        if !slot
            .full
            .load(Ordering::Acquire)
        {
            self.borrowed
                .store(false, Ordering::Release);
            return None;
        }

        let len = slot
            .len
            .load(Ordering::Acquire);
        // SAFETY: the slot is full, so the producer will not write it until
        // the token below releases it.
        let buf = unsafe { &*slot.buf.get() };
        Some(ReadyPacket {
            queue: self,
            frame: &buf[..len],
        })
    }

    /// Drop every waiting frame. Consumer side.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Some(packet) = self.receive() {
            drop(packet);
            dropped += 1;
        }
        dropped
    }

    fn release(&self) {
        let head = self
            .head
            .load(Ordering::Relaxed);
        self.slots[head]
            .full
            .store(false, Ordering::Release);
        self.head
            .store(Self::next(head), Ordering::Release);
        self.borrowed
            .store(false, Ordering::Release);
    }
}

// SAFETY: slot buffers are handed between exactly one producer and one
// consumer through the `full` flags; see `publish` and `receive`.
#[allow(unsafe_code)]
unsafe impl<const N: usize> Sync for PacketQueue<N> {}

/// Ownership of a received frame. Dropping it frees the slot.
pub struct ReadyPacket<'q, const N: usize> {
    queue: &'q PacketQueue<N>,
    frame: &'q [u8],
}

impl<const N: usize> Deref for ReadyPacket<'_, N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.frame
    }
}

impl<const N: usize> Drop for ReadyPacket<'_, N> {
    fn drop(&mut self) {
        self.queue
            .release();
    }
}
