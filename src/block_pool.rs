//! Block Pool - O(1) fixed-size block allocator with a free-list.
//!
//! Pre-allocates `N` blocks of `B` bytes at startup (optionally bound to a
//! NUMA node and prefaulted) and never touches the system allocator again.
//! This module holds the single-threaded pool plus the pieces every pool
//! variant shares: [`ZeroPolicy`], [`PoolOptions`], [`PoolStats`] and the
//! [`BlockSource`] trait.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::slab::{BlockIndex, Slab, NULL_INDEX};

/// When, if ever, a pool zero-fills block contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZeroPolicy {
    /// Contents are whatever the previous owner left.
    #[default]
    None,
    /// Zero-fill before a block is handed out.
    OnAcquire,
    /// Zero-fill before a block is linked back into the free-list.
    OnRelease,
}

/// Construction options shared by all pool variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// NUMA node for the backing store; `None` means the caller's node.
    pub node: Option<usize>,
    /// Zeroing behavior on acquire/release.
    pub zero_policy: ZeroPolicy,
    /// Touch every backing page at construction.
    pub prefault: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            node: None,
            zero_policy: ZeroPolicy::None,
            prefault: true,
        }
    }
}

impl PoolOptions {
    /// Bind the backing store to `node`.
    pub fn on_node(mut self, node: usize) -> Self {
        self.node = Some(node);
        self
    }

    /// Select the zeroing policy.
    pub fn zero_policy(mut self, policy: ZeroPolicy) -> Self {
        self.zero_policy = policy;
        self
    }

    /// Enable or disable page prefaulting.
    pub fn prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }
}

/// Snapshot of a pool's block accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Blocks owned by the pool
    pub total: usize,
    /// Blocks currently loaned to callers
    pub in_use: usize,
    /// Blocks sitting in the free-list
    pub free: usize,
}

/// Common contract of every fixed-size block pool.
///
/// Blocks are loaned out as raw pointers to `BLOCK_SIZE` bytes, 64-byte
/// aligned. The caller is the exclusive owner until it calls `release`.
pub trait BlockSource: Sized {
    /// Requested block size in bytes.
    const BLOCK_SIZE: usize;
    /// Number of blocks.
    const CAPACITY: usize;

    /// Build a pool with the given options.
    fn with_options(options: PoolOptions) -> Result<Self>;

    /// Take a block from the free-list, or `None` if the pool is exhausted.
    fn acquire(&self) -> Option<NonNull<u8>>;

    /// Return a block. Returns false (and does nothing) if `block` was not
    /// handed out by this pool or is already free.
    fn release(&self, block: NonNull<u8>) -> bool;

    /// Block accounting snapshot.
    fn stats(&self) -> PoolStats;

    /// True if `block` belongs to this pool and is currently loaned out.
    fn is_allocated(&self, block: NonNull<u8>) -> bool;

    /// The configured zeroing policy.
    fn zero_policy(&self) -> ZeroPolicy;

    /// Zero-fill a block the caller owns.
    #[doc(hidden)]
    fn clear_block(&self, block: NonNull<u8>);

    /// Acquire a block whose contents are zero regardless of policy.
    fn acquire_zeroed(&self) -> Option<NonNull<u8>> {
        let block = self.acquire()?;
        if self.zero_policy() != ZeroPolicy::OnAcquire {
            self.clear_block(block);
        }
        Some(block)
    }

    /// Acquire up to `n` blocks (at most `K`). Same as `n` scalar acquires;
    /// stops early when the pool runs dry.
    fn acquire_bulk<const K: usize>(&self, n: usize) -> ArrayVec<NonNull<u8>, K> {
        let mut out = ArrayVec::new();
        for _ in 0..n.min(K) {
            match self.acquire() {
                Some(block) => out.push(block),
                None => break,
            }
        }
        out
    }

    /// Release every block in `blocks`. Returns how many were accepted.
    fn release_bulk<I>(&self, blocks: I) -> usize
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        blocks.into_iter().filter(|&block| self.release(block)).count()
    }
}

/// Single-threaded block pool.
///
/// The free-list is a plain index chain threaded through a header array
/// (no atomics). The pool is `Send` but not `Sync`, so the compiler
/// enforces the "externally serialised" contract.
pub struct BlockPool<const B: usize, const N: usize> {
    slab: Slab,
    /// Next free block, per block
    next: Box<[Cell<BlockIndex>]>,
    /// Ownership flag, per block
    in_use: Box<[Cell<bool>]>,
    free_head: Cell<BlockIndex>,
    allocated: Cell<usize>,
    zero_policy: ZeroPolicy,
}

impl<const B: usize, const N: usize> BlockPool<B, N> {
    const VALID: () = {
        assert!(B >= std::mem::size_of::<usize>(), "block must hold a free-list link");
        assert!(N > 0, "pool needs at least one block");
        assert!(N < NULL_INDEX as usize, "capacity must be less than NULL_INDEX");
    };

    /// Create a pool with default options (caller's node, no zeroing,
    /// prefaulted).
    pub fn new() -> Result<Self> {
        Self::with_options(PoolOptions::default())
    }

    /// Create a pool with explicit options.
    pub fn with_options(options: PoolOptions) -> Result<Self> {
        let () = Self::VALID;
        let slab = Slab::new(B, N, &options)?;

        // Thread the free list: block i points at block i + 1.
        let next: Box<[Cell<BlockIndex>]> = (0..N)
            .map(|i| Cell::new(if i + 1 < N { (i + 1) as BlockIndex } else { NULL_INDEX }))
            .collect();
        let in_use = (0..N).map(|_| Cell::new(false)).collect();

        Ok(Self {
            slab,
            next,
            in_use,
            free_head: Cell::new(0),
            allocated: Cell::new(0),
            zero_policy: options.zero_policy,
        })
    }

    /// Allocate a block.
    ///
    /// # Complexity
    /// O(1) - pops from head of free list
    #[inline]
    pub fn acquire(&self) -> Option<NonNull<u8>> {
        let index = self.free_head.get();
        if index == NULL_INDEX {
            return None;
        }
        self.free_head.set(self.next[index as usize].get());
        self.next[index as usize].set(NULL_INDEX);
        self.in_use[index as usize].set(true);
        self.allocated.set(self.allocated.get() + 1);

        if self.zero_policy == ZeroPolicy::OnAcquire {
            self.slab.clear(index);
        }
        Some(self.slab.block_ptr(index))
    }

    /// Free a block back to the pool.
    ///
    /// Pointers outside the slab, off a block boundary, or already free are
    /// refused (returns false).
    ///
    /// # Complexity
    /// O(1) - pushes to head of free list
    #[inline]
    pub fn release(&self, block: NonNull<u8>) -> bool {
        let Some(index) = self.slab.index_of(block) else {
            return false;
        };
        if !self.in_use[index as usize].replace(false) {
            return false;
        }
        if self.zero_policy == ZeroPolicy::OnRelease {
            self.slab.clear(index);
        }
        self.next[index as usize].set(self.free_head.get());
        self.free_head.set(index);
        self.allocated.set(self.allocated.get() - 1);
        true
    }

    /// Number of blocks currently loaned out.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.get()
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

    /// Bytes of backing store.
    pub fn total_memory(&self) -> usize {
        self.slab.block_size() * N
    }

    /// NUMA node the backing store is bound to.
    pub fn node(&self) -> Option<usize> {
        self.slab.node()
    }

    /// Returns true if no blocks are loaned out.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated.get() == 0
    }

    /// Returns true if every block is loaned out.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_head.get() == NULL_INDEX
    }
}

impl<const B: usize, const N: usize> BlockSource for BlockPool<B, N> {
    const BLOCK_SIZE: usize = B;
    const CAPACITY: usize = N;

    fn with_options(options: PoolOptions) -> Result<Self> {
        BlockPool::with_options(options)
    }

    #[inline]
    fn acquire(&self) -> Option<NonNull<u8>> {
        BlockPool::acquire(self)
    }

    #[inline]
    fn release(&self, block: NonNull<u8>) -> bool {
        BlockPool::release(self, block)
    }

    fn stats(&self) -> PoolStats {
        let in_use = self.allocated.get();
        PoolStats { total: N, in_use, free: N - in_use }
    }

    fn is_allocated(&self, block: NonNull<u8>) -> bool {
        self.slab
            .index_of(block)
            .is_some_and(|i| self.in_use[i as usize].get())
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

impl<const B: usize, const N: usize> fmt::Debug for BlockPool<B, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &B)
            .field("capacity", &N)
            .field("allocated", &self.allocated.get())
            .field("free_head", &self.free_head.get())
            .field("zero_policy", &self.zero_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(block: NonNull<u8>, len: usize) -> &'static [u8] {
        unsafe { std::slice::from_raw_parts(block.as_ptr(), len) }
    }

    #[test]
    fn test_pool_creation() {
        let pool = BlockPool::<64, 100>::new().unwrap();
        assert_eq!(pool.capacity(), 100);
        assert_eq!(pool.allocated(), 0);
        assert!(!pool.is_full());
        assert!(pool.is_empty());
        assert_eq!(pool.total_memory(), 6400);
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = BlockPool::<64, 3>::new().unwrap();

        let b0 = pool.acquire().expect("Should allocate");
        let b1 = pool.acquire().expect("Should allocate");
        let b2 = pool.acquire().expect("Should allocate");

        assert_eq!(pool.allocated(), 3);
        assert!(pool.is_full());
        assert!(pool.acquire().is_none(), "Should be full");

        assert!(pool.release(b1));
        assert_eq!(pool.allocated(), 2);
        assert!(!pool.is_full());

        // LIFO free-list hands the same block straight back
        let b3 = pool.acquire().expect("Should allocate");
        assert_eq!(b3, b1, "Should reuse freed slot");

        assert!(pool.release(b0));
        assert!(pool.release(b2));
        assert!(pool.release(b3));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_blocks_are_cache_aligned_and_distinct() {
        let pool = BlockPool::<100, 8>::new().unwrap();
        assert_eq!(pool.block_size(), 128);
        let blocks: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        assert_eq!(blocks.len(), 8);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].as_ptr() as usize - pair[0].as_ptr() as usize, 128);
        }
        assert!(blocks.iter().all(|b| b.as_ptr() as usize % 64 == 0));
    }

    #[test]
    fn test_double_release_refused() {
        let pool = BlockPool::<64, 2>::new().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.release(b));
        assert!(!pool.release(b), "second release must be a no-op");
        assert_eq!(pool.stats(), PoolStats { total: 2, in_use: 0, free: 2 });
    }

    #[test]
    fn test_foreign_pointer_refused() {
        let pool = BlockPool::<64, 2>::new().unwrap();
        let b = pool.acquire().unwrap();
        let inner = NonNull::new(unsafe { b.as_ptr().add(1) }).unwrap();
        assert!(!pool.release(inner));
        let mut other = [0u8; 64];
        assert!(!pool.release(NonNull::from(&mut other[0])));
        assert!(pool.is_allocated(b));
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_zero_on_acquire() {
        let pool = BlockPool::<128, 4>::with_options(
            PoolOptions::default().zero_policy(ZeroPolicy::OnAcquire),
        )
        .unwrap();
        let b = pool.acquire().unwrap();
        assert!(bytes(b, 128).iter().all(|&x| x == 0));
        unsafe { std::ptr::write_bytes(b.as_ptr(), 0xCD, 128) };
        pool.release(b);
        let again = pool.acquire().unwrap();
        assert_eq!(again, b);
        assert!(bytes(again, 128).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_zero_on_release() {
        let pool = BlockPool::<128, 4>::with_options(
            PoolOptions::default().zero_policy(ZeroPolicy::OnRelease),
        )
        .unwrap();
        let b = pool.acquire().unwrap();
        unsafe { std::ptr::write_bytes(b.as_ptr(), 0xEF, 128) };
        pool.release(b);
        let again = pool.acquire().unwrap();
        assert_eq!(again, b);
        assert!(bytes(again, 128).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_no_zeroing_keeps_contents() {
        let pool = BlockPool::<128, 4>::new().unwrap();
        let b = pool.acquire().unwrap();
        unsafe { std::ptr::write_bytes(b.as_ptr(), 0x55, 128) };
        pool.release(b);
        let again = pool.acquire().unwrap();
        assert!(bytes(again, 128).iter().all(|&x| x == 0x55));

        // acquire_zeroed ignores the policy
        pool.release(again);
        let zeroed = pool.acquire_zeroed().unwrap();
        assert!(bytes(zeroed, 128).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_bulk_operations() {
        let pool = BlockPool::<64, 6>::new().unwrap();
        let first: ArrayVec<_, 8> = pool.acquire_bulk(4);
        assert_eq!(first.len(), 4);
        let rest: ArrayVec<_, 8> = pool.acquire_bulk(8);
        assert_eq!(rest.len(), 2, "stops when the pool runs dry");
        assert!(pool.is_full());

        assert_eq!(pool.release_bulk(first.iter().copied()), 4);
        assert_eq!(pool.release_bulk(rest), 2);
        assert_eq!(pool.release_bulk(first), 0, "already released");
        assert!(pool.is_empty());
    }

    #[test]
    fn test_prefault_disabled() {
        let pool = BlockPool::<64, 16>::with_options(PoolOptions::default().prefault(false)).unwrap();
        assert!(pool.acquire().is_some());
    }
}
