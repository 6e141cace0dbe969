//! Lock-free block pool.
//!
//! The free-list head is a tagged pointer `(block index, epoch)` packed
//! into one `AtomicU64` and replaced by CAS. Every successful replacement
//! bumps the epoch, so a thread that stalls between reading the head and
//! swapping it cannot succeed against a head that was popped and pushed
//! back in the meantime (the ABA hazard).
//!
//! Links live in a header array next to the slab, one cache line per
//! block, so reading a stale link is always a valid (if useless) load.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::block_pool::{BlockSource, PoolOptions, PoolStats, ZeroPolicy};
use crate::error::Result;
use crate::slab::{BlockIndex, Slab, NULL_INDEX};

/// Unpacked view of the free-list head.
///
/// The epoch is 32 bits wide; a stalled thread would have to sleep through
/// exactly 2^32 head replacements for its stale CAS to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedHead {
    /// First free block, or `NULL_INDEX` when exhausted
    pub index: BlockIndex,
    /// Number of successful head replacements (mod 2^32)
    pub epoch: u32,
}

impl TaggedHead {
    #[inline(always)]
    const fn pack(self) -> u64 {
        ((self.epoch as u64) << 32) | self.index as u64
    }

    #[inline(always)]
    const fn unpack(raw: u64) -> Self {
        Self { index: raw as u32, epoch: (raw >> 32) as u32 }
    }
}

/// Per-block header, one cache line each so neighbouring blocks owned by
/// different threads never share a line.
#[repr(C, align(64))]
struct Header {
    next: AtomicU32,
    in_use: AtomicBool,
}

/// Thread-safe block pool built on a CAS free-list.
///
/// `acquire` and `release` are lock-free: a failed CAS means another
/// thread made progress. Retries are bounded only by contention.
pub struct AtomicBlockPool<const B: usize, const N: usize> {
    slab: Slab,
    headers: Box<[Header]>,
    head: CachePadded<AtomicU64>,
    allocated: CachePadded<AtomicUsize>,
    zero_policy: ZeroPolicy,
}

impl<const B: usize, const N: usize> AtomicBlockPool<B, N> {
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
        let headers = (0..N)
            .map(|i| Header {
                next: AtomicU32::new(if i + 1 < N { (i + 1) as BlockIndex } else { NULL_INDEX }),
                in_use: AtomicBool::new(false),
            })
            .collect();

        Ok(Self {
            slab,
            headers,
            head: CachePadded::new(AtomicU64::new(TaggedHead { index: 0, epoch: 0 }.pack())),
            allocated: CachePadded::new(AtomicUsize::new(0)),
            zero_policy: options.zero_policy,
        })
    }

    /// Current free-list head (diagnostic; stale as soon as it returns).
    pub fn head(&self) -> TaggedHead {
        TaggedHead::unpack(self.head.load(Ordering::Acquire))
    }

    /// One pop attempt against an observed head.
    ///
    /// `Ok(None)` means the observed list was empty, `Err` carries the head
    /// that beat us to the CAS.
    #[inline]
    fn try_pop(&self, observed: u64) -> std::result::Result<Option<BlockIndex>, u64> {
        let head = TaggedHead::unpack(observed);
        if head.index == NULL_INDEX {
            return Ok(None);
        }
        let next = self.headers[head.index as usize].next.load(Ordering::Relaxed);
        let replacement = TaggedHead { index: next, epoch: head.epoch.wrapping_add(1) };
        self.head
            .compare_exchange_weak(observed, replacement.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Some(head.index))
    }

    /// Allocate a block.
    #[inline]
    pub fn acquire(&self) -> Option<NonNull<u8>> {
        let mut observed = self.head.load(Ordering::Acquire);
        let index = loop {
            match self.try_pop(observed) {
                Ok(Some(index)) => break index,
                Ok(None) => return None,
                Err(actual) => observed = actual,
            }
        };

        self.headers[index as usize].in_use.store(true, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        if self.zero_policy == ZeroPolicy::OnAcquire {
            self.slab.clear(index);
        }
        Some(self.slab.block_ptr(index))
    }

    /// Return a block to the pool.
    ///
    /// Foreign, misaligned or already-free pointers are refused. The
    /// in-use flag flips exactly once per loan, so racing double releases
    /// cannot both link the block.
    #[inline]
    pub fn release(&self, block: NonNull<u8>) -> bool {
        let Some(index) = self.slab.index_of(block) else {
            return false;
        };
        let header = &self.headers[index as usize];
        if header
            .in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if self.zero_policy == ZeroPolicy::OnRelease {
            self.slab.clear(index);
        }

        let mut observed = self.head.load(Ordering::Relaxed);
        loop {
            let head = TaggedHead::unpack(observed);
            header.next.store(head.index, Ordering::Relaxed);
            let replacement = TaggedHead { index, epoch: head.epoch.wrapping_add(1) };
            match self.head.compare_exchange_weak(
                observed,
                replacement.pack(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        true
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

    /// NUMA node the backing store is bound to.
    pub fn node(&self) -> Option<usize> {
        self.slab.node()
    }

    /// Returns true if no blocks are loaned out.
    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    /// Returns true if the free-list is empty.
    pub fn is_full(&self) -> bool {
        self.head().index == NULL_INDEX
    }
}

impl<const B: usize, const N: usize> BlockSource for AtomicBlockPool<B, N> {
    const BLOCK_SIZE: usize = B;
    const CAPACITY: usize = N;

    fn with_options(options: PoolOptions) -> Result<Self> {
        AtomicBlockPool::with_options(options)
    }

    #[inline]
    fn acquire(&self) -> Option<NonNull<u8>> {
        AtomicBlockPool::acquire(self)
    }

    #[inline]
    fn release(&self, block: NonNull<u8>) -> bool {
        AtomicBlockPool::release(self, block)
    }

    fn stats(&self) -> PoolStats {
        let in_use = self.allocated().min(N);
        PoolStats { total: N, in_use, free: N - in_use }
    }

    fn is_allocated(&self, block: NonNull<u8>) -> bool {
        self.slab
            .index_of(block)
            .is_some_and(|i| self.headers[i as usize].in_use.load(Ordering::Acquire))
    }

    fn zero_policy(&self) -> ZeroPolicy {
        self.zero_policy
    }

    fn clear_block(&self, block: NonNull<u8>) {
        if let Some(index) = self.slab.index_of(block) {
            self.slab.clear(index);
        }
    }
}

impl<const B: usize, const N: usize> fmt::Debug for AtomicBlockPool<B, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicBlockPool")
            .field("block_size", &B)
            .field("capacity", &N)
            .field("allocated", &self.allocated())
            .field("head", &self.head())
            .field("zero_policy", &self.zero_policy)
            .finish()
    }
}
