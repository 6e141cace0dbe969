//! MPMC Queue - bounded multi-producer/multi-consumer queue.
//!
//! Each cell carries a sequence number that encodes whose turn it is:
//! `seq == pos` means the cell is free for the producer claiming `pos`,
//! `seq == pos + 1` means it holds the value for the consumer claiming
//! `pos`. Producers and consumers claim positions with a CAS on their own
//! index and then publish through the cell's sequence, so no operation
//! ever waits for another thread to finish.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::error::{check_capacity, Result};

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC queue.
pub struct MpmcQueue<T> {
    cells: Box<[CachePadded<Cell<T>>]>,
    mask: usize,
    write_index: CachePadded<AtomicUsize>,
    read_index: CachePadded<AtomicUsize>,
}

// SAFETY: a cell's value is only accessed by the thread that won its
// position, and handed over through the sequence number.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Create a queue holding up to `capacity` elements.
    ///
    /// `capacity` must be a power of two and at least 2.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        check_capacity("mpmc queue", capacity, 2)?;
        let cells = (0..capacity)
            .map(|i| {
                CachePadded::new(Cell {
                    sequence: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect();
        debug!(capacity, "mpmc queue created");
        Ok(Self {
            cells,
            mask: capacity - 1,
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Try to enqueue `value`. Hands it back if the queue is full.
    pub fn try_enqueue(&self, value: T) -> std::result::Result<(), T> {
        let mut pos = self.write_index.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.write_index.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS makes this thread the only
                        // writer of the cell until the sequence is bumped.
                        unsafe { (*cell.value.get()).write(value) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The cell still holds a value from the previous lap.
                return Err(value);
            } else {
                pos = self.write_index.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to dequeue the oldest value. `None` if the queue is empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut pos = self.read_index.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.read_index.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the producer published the value with the
                        // Release store we just Acquired.
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence.store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.read_index.load(Ordering::Relaxed);
            }
        }
    }

    /// Alias for [`MpmcQueue::try_enqueue`] returning only success.
    #[inline]
    pub fn enqueue(&self, value: T) -> bool {
        self.try_enqueue(value).is_ok()
    }

    /// Alias for [`MpmcQueue::try_dequeue`].
    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        self.try_dequeue()
    }

    /// Maximum number of queued elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of queued elements. Exact when quiescent.
    pub fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Acquire);
        let write = self.write_index.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity())
    }

    /// Approximate emptiness. Exact when quiescent.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubstrateError;
    use std::collections::HashSet;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_validation() {
        assert!(matches!(
            MpmcQueue::<u32>::with_capacity(1),
            Err(SubstrateError::InvalidCapacity { min: 2, .. })
        ));
        assert!(MpmcQueue::<u32>::with_capacity(6).is_err());
        assert_eq!(MpmcQueue::<u32>::with_capacity(2).unwrap().capacity(), 2);
    }

    #[test]
    fn test_fifo_single_thread() {
        let q = MpmcQueue::with_capacity(4).unwrap();
        assert_eq!(q.try_dequeue(), None::<u32>);
        for v in 0..4 {
            assert!(q.enqueue(v));
        }
        assert_eq!(q.try_enqueue(99), Err(99));
        assert_eq!(q.len(), 4);
        for v in 0..4 {
            assert_eq!(q.dequeue(), Some(v));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_sequence_laps() {
        let q = MpmcQueue::with_capacity(2).unwrap();
        for lap in 0..1000u64 {
            q.try_enqueue(lap).unwrap();
            q.try_enqueue(lap + 1).unwrap();
            assert!(q.try_enqueue(0).is_err());
            assert_eq!(q.try_dequeue(), Some(lap));
            assert_eq!(q.try_dequeue(), Some(lap + 1));
        }
    }

    #[test]
    fn test_drop_releases_queued_values() {
        let tracker = Rc::new(());
        {
            let q = MpmcQueue::with_capacity(8).unwrap();
            for _ in 0..5 {
                q.try_enqueue(Rc::clone(&tracker)).unwrap();
            }
            drop(q.try_dequeue());
            assert_eq!(Rc::strong_count(&tracker), 5);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_four_by_four_exactly_once() {
        const PER_PRODUCER: u64 = 25_000;
        const PRODUCERS: u64 = 4;
        let q = Arc::new(MpmcQueue::with_capacity(1024).unwrap());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        while let Err(back) = q.try_enqueue(v) {
                            v = back;
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        let taken = Arc::new(AtomicUsize::new(0));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                let taken = Arc::clone(&taken);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while taken.load(Ordering::Relaxed) < total {
                        if let Some(v) = q.try_dequeue() {
                            taken.fetch_add(1, Ordering::Relaxed);
                            seen.push(v);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all = HashSet::with_capacity(total);
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {v} delivered twice");
            }
        }
        assert_eq!(all.len(), total);
        assert!(q.is_empty());
    }
}
