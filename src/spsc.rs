//! SPSC Queue - bounded single-producer/single-consumer slot queue.
//!
//! The queue is split into a [`Producer`] and a [`Consumer`] handle so the
//! type system enforces one writer and one reader. Both sides work on
//! slots in place: the producer borrows the next writable slot, fills it
//! and commits; the consumer borrows the head slot, reads it and commits.
//!
//! # Memory Layout
//!
//! | Scalar          | Written by | Line            |
//! |-----------------|------------|-----------------|
//! | `write_index`   | producer   | own             |
//! | `read_index`    | consumer   | own             |
//! | `count`         | both (RMW) | own             |
//! | producer cache  | producer   | own (in handle) |
//! | consumer cache  | consumer   | own (in handle) |

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::error::{check_capacity, Result};

/// Shared state of an SPSC queue. Reached through its two handles.
pub struct SpscQueue<T> {
    write_index: CachePadded<AtomicUsize>,
    read_index: CachePadded<AtomicUsize>,
    count: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
}

// SAFETY: a slot is only touched by the side that currently owns it, as
// arbitrated by `count`.
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T: Default> SpscQueue<T> {
    /// Create a queue of `capacity` slots, pre-filled with `T::default()`.
    ///
    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> Result<(Producer<T>, Consumer<T>)> {
        check_capacity("spsc queue", capacity, 1)?;
        let slots = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
        let queue = Arc::new(Self {
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
            count: CachePadded::new(AtomicUsize::new(0)),
            slots,
            mask: capacity - 1,
        });
        debug!(capacity, slot_bytes = std::mem::size_of::<T>(), "spsc queue created");

        let producer = Producer {
            queue: Arc::clone(&queue),
            state: CachePadded::new(SideState::default()),
        };
        let consumer = Consumer { queue, state: CachePadded::new(SideState::default()) };
        Ok((producer, consumer))
    }
}

impl<T> SpscQueue<T> {
    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of committed, unread elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if no elements are waiting.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if every slot holds an unread element.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    fn slot(&self, position: usize) -> *mut T {
        self.slots[position & self.mask].get()
    }
}

impl<T> fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("write_index", &self.write_index.load(Ordering::Relaxed))
            .field("read_index", &self.read_index.load(Ordering::Relaxed))
            .finish()
    }
}

/// Per-side, non-atomic bookkeeping.
#[derive(Debug, Default)]
struct SideState {
    /// This side's position (authoritative; the atomic mirrors it)
    position: usize,
    /// Last observed position of the opposite side
    cached_opposite: usize,
    /// A slot has been handed out and not committed yet
    claimed: bool,
}

/// Writing half of an SPSC queue.
pub struct Producer<T> {
    queue: Arc<SpscQueue<T>>,
    state: CachePadded<SideState>,
}

impl<T> Producer<T> {
    /// Borrow the next writable slot, or `None` if the queue is full.
    ///
    /// The slot still holds whatever value was last read from it.
    #[inline]
    pub fn next_write_slot(&mut self) -> Option<&mut T> {
        let capacity = self.queue.capacity();
        let state = &mut *self.state;
        if state.position.wrapping_sub(state.cached_opposite) >= capacity {
            // The cache says full; ask the consumer side for real.
            let count = self.queue.count.load(Ordering::Acquire);
            if count >= capacity {
                return None;
            }
            state.cached_opposite = state.position.wrapping_sub(count);
        }
        state.claimed = true;
        // SAFETY: the slot is outside the consumer's readable window.
        Some(unsafe { &mut *self.queue.slot(state.position) })
    }

    /// Publish the slot returned by the last `next_write_slot`.
    #[inline]
    pub fn commit_write(&mut self) {
        let state = &mut *self.state;
        debug_assert!(state.claimed, "commit_write without a claimed slot");
        if !state.claimed {
            return;
        }
        state.claimed = false;
        state.position = state.position.wrapping_add(1);
        self.queue.write_index.store(state.position, Ordering::Release);
        self.queue.count.fetch_add(1, Ordering::Release);
    }

    /// Write `value` into the next slot and commit it.
    ///
    /// Hands the value back if the queue is full.
    #[inline]
    pub fn try_push(&mut self, value: T) -> std::result::Result<(), T> {
        match self.next_write_slot() {
            Some(slot) => {
                *slot = value;
                self.commit_write();
                Ok(())
            }
            None => Err(value),
        }
    }

    /// The shared queue.
    pub fn queue(&self) -> &SpscQueue<T> {
        &self.queue
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of unread elements.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no elements are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns true if the consumer has not freed any slot.
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

/// Reading half of an SPSC queue.
pub struct Consumer<T> {
    queue: Arc<SpscQueue<T>>,
    state: CachePadded<SideState>,
}

impl<T> Consumer<T> {
    #[inline]
    fn claim(&mut self) -> Option<*mut T> {
        let state = &mut *self.state;
        if state.cached_opposite == state.position {
            // The cache says empty; ask the producer side for real.
            let count = self.queue.count.load(Ordering::Acquire);
            if count == 0 {
                return None;
            }
            state.cached_opposite = state.position.wrapping_add(count);
        }
        state.claimed = true;
        Some(self.queue.slot(state.position))
    }

    /// Borrow the oldest committed element, or `None` if the queue is empty.
    #[inline]
    pub fn next_read_slot(&mut self) -> Option<&T> {
        // SAFETY: the producer published this slot and will not touch it
        // until `commit_read`.
        self.claim().map(|slot| unsafe { &*slot })
    }

    /// Release the slot returned by the last `next_read_slot`.
    #[inline]
    pub fn commit_read(&mut self) {
        let state = &mut *self.state;
        debug_assert!(state.claimed, "commit_read without a claimed slot");
        if !state.claimed {
            return;
        }
        state.claimed = false;
        state.position = state.position.wrapping_add(1);
        self.queue.read_index.store(state.position, Ordering::Release);
        self.queue.count.fetch_sub(1, Ordering::Release);
    }

    /// Look at the oldest element, apply `f`, and commit the read.
    #[inline]
    pub fn pop_with<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.claim()?;
        // SAFETY: as in `next_read_slot`; the consumer owns the slot.
        let out = f(unsafe { &mut *slot });
        self.commit_read();
        Some(out)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of unread elements.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no elements are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Default> Consumer<T> {
    /// Take the oldest element, leaving `T::default()` in its slot.
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        self.pop_with(std::mem::take)
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("queue", &self.queue).field("state", &*self.state).finish()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("queue", &self.queue).field("state", &*self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubstrateError;

    #[test]
    fn test_rejects_non_power_of_two() {
        let err = SpscQueue::<u64>::with_capacity(3).unwrap_err();
        assert!(matches!(err, SubstrateError::InvalidCapacity { capacity: 3, .. }));
        assert!(SpscQueue::<u64>::with_capacity(0).is_err());
        assert!(SpscQueue::<u64>::with_capacity(1).is_ok());
    }

    #[test]
    fn test_slot_protocol() {
        let (mut tx, mut rx) = SpscQueue::<u64>::with_capacity(4).unwrap();
        assert!(rx.next_read_slot().is_none());

        *tx.next_write_slot().unwrap() = 42;
        tx.commit_write();

        assert_eq!(rx.next_read_slot(), Some(&42));
        rx.commit_read();
        assert!(rx.next_read_slot().is_none());
    }

    #[test]
    fn test_uncommitted_write_is_invisible() {
        let (mut tx, mut rx) = SpscQueue::<u64>::with_capacity(2).unwrap();
        *tx.next_write_slot().unwrap() = 7;
        assert!(rx.next_read_slot().is_none());
        assert_eq!(tx.len(), 0);
        tx.commit_write();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_back_pressure() {
        let (mut tx, mut rx) = SpscQueue::<u32>::with_capacity(4).unwrap();
        for v in 1..=4 {
            assert!(tx.try_push(v).is_ok());
        }
        assert!(tx.is_full());
        assert!(tx.next_write_slot().is_none());
        assert_eq!(tx.try_push(5), Err(5));

        assert_eq!(rx.try_pop(), Some(1));
        assert!(tx.try_push(5).is_ok());
        assert_eq!(rx.len(), 4);
    }

    #[test]
    fn test_wraps_many_laps() {
        let (mut tx, mut rx) = SpscQueue::<usize>::with_capacity(8).unwrap();
        for lap in 0..100 {
            for i in 0..5 {
                tx.try_push(lap * 10 + i).unwrap();
            }
            for i in 0..5 {
                assert_eq!(rx.try_pop(), Some(lap * 10 + i));
            }
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_pop_with_reads_in_place() {
        let (mut tx, mut rx) = SpscQueue::<[u8; 32]>::with_capacity(2).unwrap();
        let slot = tx.next_write_slot().unwrap();
        slot[0] = 0xAA;
        slot[31] = 0xBB;
        tx.commit_write();
        assert_eq!(rx.pop_with(|msg| (msg[0], msg[31])), Some((0xAA, 0xBB)));
        assert_eq!(rx.pop_with(|msg| msg[0]), None);
    }

    #[test]
    fn test_cross_thread_order() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx) = SpscQueue::<u64>::with_capacity(64).unwrap();
        let producer = std::thread::spawn(move || {
            for v in 0..COUNT {
                let mut value = v;
                loop {
                    match tx.try_push(value) {
                        Ok(()) => break,
                        Err(back) => {
                            value = back;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(v) = rx.try_pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }
}
