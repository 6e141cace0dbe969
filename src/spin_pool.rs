//! Spinlock block pool.
//!
//! For callers that need several blocks taken or returned as one atomic
//! batch. The critical section covers only free-list pointer operations;
//! zeroing happens outside the lock. Waiters back off exponentially with
//! the pause instruction, capped at 64 pauses per round.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use crossbeam_utils::{Backoff, CachePadded};

use crate::block_pool::{BlockSource, PoolOptions, PoolStats, ZeroPolicy};
use crate::error::Result;
use crate::slab::{BlockIndex, Slab, NULL_INDEX};

/// Free-list state guarded by the spinlock.
struct FreeList {
    head: BlockIndex,
    next: Box<[BlockIndex]>,
    free: usize,
}

impl FreeList {
    #[inline]
    fn pop(&mut self) -> Option<BlockIndex> {
        let index = self.head;
        if index == NULL_INDEX {
            return None;
        }
        self.head = self.next[index as usize];
        self.next[index as usize] = NULL_INDEX;
        self.free -= 1;
        Some(index)
    }

    #[inline]
    fn push(&mut self, index: BlockIndex) {
        self.next[index as usize] = self.head;
        self.head = index;
        self.free += 1;
    }
}

/// Block pool whose free-list is protected by a tight spinlock.
pub struct SpinBlockPool<const B: usize, const N: usize> {
    slab: Slab,
    in_use: Box<[AtomicBool]>,
    lock: CachePadded<AtomicBool>,
    list: UnsafeCell<FreeList>,
    allocated: CachePadded<AtomicUsize>,
    zero_policy: ZeroPolicy,
}

// SAFETY: `list` is only touched while `lock` is held.
unsafe impl<const B: usize, const N: usize> Sync for SpinBlockPool<B, N> {}

struct SpinGuard<'a> {
    lock: &'a AtomicBool,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<const B: usize, const N: usize> SpinBlockPool<B, N> {
    const VALID: () = {
        assert!(B >= std::mem::size_of::<usize>(), "block must hold a free-list link");
        assert!(N > 0, "pool needs at least one block");
        assert!(N < NULL_INDEX as usize, "capacity must be less than NULL_INDEX");
    };

    /// Create a pool with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(PoolOptions::default())
    }

    /// Create a pool with explicit options.
    pub fn with_options(options: PoolOptions) -> Result<Self> {
        let () = Self::VALID;
        let slab = Slab::new(B, N, &options)?;
        let next = (0..N)
            .map(|i| if i + 1 < N { (i + 1) as BlockIndex } else { NULL_INDEX })
            .collect();
        let in_use = (0..N).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            slab,
            in_use,
            lock: CachePadded::new(AtomicBool::new(false)),
            list: UnsafeCell::new(FreeList { head: 0, next, free: N }),
            allocated: CachePadded::new(AtomicUsize::new(0)),
            zero_policy: options.zero_policy,
        })
    }

    #[inline]
    fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if self
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: &self.lock };
            }
            while self.lock.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    /// Run `f` on the free-list with the lock held.
    #[inline]
    fn with_list<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        let _guard = self.lock();
        // SAFETY: the guard gives exclusive access until it drops.
        f(unsafe { &mut *self.list.get() })
    }

    #[inline]
    fn hand_out(&self, index: BlockIndex) -> NonNull<u8> {
        self.in_use[index as usize].store(true, Ordering::Relaxed);
        if self.zero_policy == ZeroPolicy::OnAcquire {
            self.slab.clear(index);
        }
        self.slab.block_ptr(index)
    }

    /// Flip a block back to free and apply the release policy.
    /// Returns the index if the block may be linked.
    #[inline]
    fn take_back(&self, block: NonNull<u8>) -> Option<BlockIndex> {
        let index = self.slab.index_of(block)?;
        self.in_use[index as usize]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        if self.zero_policy == ZeroPolicy::OnRelease {
            self.slab.clear(index);
        }
        Some(index)
    }

    /// Allocate a block.
    #[inline]
    pub fn acquire(&self) -> Option<NonNull<u8>> {
        let index = self.with_list(FreeList::pop)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(self.hand_out(index))
    }

    /// Return a block. Foreign or already-free pointers are refused.
    #[inline]
    pub fn release(&self, block: NonNull<u8>) -> bool {
        let Some(index) = self.take_back(block) else {
            return false;
        };
        self.with_list(|list| list.push(index));
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Take exactly `n` blocks under a single lock hold, or none at all.
    pub fn acquire_exact<const K: usize>(&self, n: usize) -> Option<ArrayVec<NonNull<u8>, K>> {
        if n > K {
            return None;
        }
        let indices: ArrayVec<BlockIndex, K> = self.with_list(|list| {
            if list.free < n {
                return None;
            }
            Some((0..n).filter_map(|_| list.pop()).collect::<ArrayVec<BlockIndex, K>>())
        })?;
        self.allocated.fetch_add(indices.len(), Ordering::Relaxed);
        Some(indices.into_iter().map(|i| self.hand_out(i)).collect())
    }

    /// Number of blocks currently loaned out.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Total number of blocks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Size of each block after cache-line rounding.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.slab.block_size()
    }
}

impl<const B: usize, const N: usize> BlockSource for SpinBlockPool<B, N> {
    const BLOCK_SIZE: usize = B;
    const CAPACITY: usize = N;

    fn with_options(options: PoolOptions) -> Result<Self> {
        SpinBlockPool::with_options(options)
    }

    #[inline]
    fn acquire(&self) -> Option<NonNull<u8>> {
        SpinBlockPool::acquire(self)
    }

    #[inline]
    fn release(&self, block: NonNull<u8>) -> bool {
        SpinBlockPool::release(self, block)
    }

    fn stats(&self) -> PoolStats {
        let in_use = self.allocated().min(N);
        PoolStats { total: N, in_use, free: N - in_use }
    }

    fn is_allocated(&self, block: NonNull<u8>) -> bool {
        self.slab
            .index_of(block)
            .is_some_and(|i| self.in_use[i as usize].load(Ordering::Acquire))
    }

    fn zero_policy(&self) -> ZeroPolicy {
        self.zero_policy
    }

    fn clear_block(&self, block: NonNull<u8>) {
        if let Some(index) = self.slab.index_of(block) {
            self.slab.clear(index);
        }
    }

    /// Pops the whole batch under one lock hold.
    fn acquire_bulk<const K: usize>(&self, n: usize) -> ArrayVec<NonNull<u8>, K> {
        let want = n.min(K);
        let indices: ArrayVec<BlockIndex, K> =
            self.with_list(|list| (0..want).map_while(|_| list.pop()).collect());
        self.allocated.fetch_add(indices.len(), Ordering::Relaxed);
        indices.into_iter().map(|i| self.hand_out(i)).collect()
    }

    /// Clears outside the lock, then links the whole batch under one hold.
    fn release_bulk<I>(&self, blocks: I) -> usize
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        const CHUNK: usize = 64;
        let mut accepted = 0;
        let mut pending: ArrayVec<BlockIndex, CHUNK> = ArrayVec::new();
        let mut flush = |pending: &mut ArrayVec<BlockIndex, CHUNK>| {
            if pending.is_empty() {
                return;
            }
            self.with_list(|list| pending.iter().for_each(|&i| list.push(i)));
            self.allocated.fetch_sub(pending.len(), Ordering::Relaxed);
            accepted += pending.len();
            pending.clear();
        };
        for block in blocks {
            if let Some(index) = self.take_back(block) {
                pending.push(index);
                if pending.is_full() {
                    flush(&mut pending);
                }
            }
        }
        flush(&mut pending);
        accepted
    }
}

impl<const B: usize, const N: usize> fmt::Debug for SpinBlockPool<B, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinBlockPool")
            .field("block_size", &B)
            .field("capacity", &N)
            .field("allocated", &self.allocated())
            .field("zero_policy", &self.zero_policy)
            .finish()
    }
}
