//! Slab - contiguous backing store shared by every block pool variant.
//!
//! Blocks are laid out back to back, each rounded up to a cache-line
//! multiple so every block starts 64-byte aligned. Free-list links and
//! ownership flags live in per-pool header arrays, never inside the
//! blocks, so a zeroed block stays zeroed until its owner writes to it.

use std::fmt;
use std::ptr::NonNull;

use tracing::debug;

use crate::block_pool::PoolOptions;
use crate::error::{Result, SubstrateError};
use crate::numa::{NumaRegion, CACHE_LINE};

/// Sentinel value terminating a free-list (like nullptr).
pub const NULL_INDEX: u32 = u32::MAX;

/// Compressed block pointer: the block's position in the slab.
pub type BlockIndex = u32;

/// Round a requested block size up to the next cache-line multiple.
#[inline]
pub const fn aligned_block_size(block_size: usize) -> usize {
    (block_size + CACHE_LINE - 1) / CACHE_LINE * CACHE_LINE
}

pub(crate) struct Slab {
    region: NumaRegion,
    block_size: usize,
    capacity: usize,
}

impl Slab {
    /// Allocate `capacity` blocks of `block_size` bytes on the requested node.
    pub(crate) fn new(block_size: usize, capacity: usize, options: &PoolOptions) -> Result<Self> {
        let block_size = aligned_block_size(block_size);
        let bytes = block_size
            .checked_mul(capacity)
            .ok_or(SubstrateError::OutOfMemory { bytes: usize::MAX, node: options.node })?;
        let mut region = NumaRegion::allocate(bytes, options.node)?;
        if options.prefault {
            region.prefault();
        }
        debug!(
            block_size,
            capacity,
            bytes,
            node = ?region.node(),
            zero_policy = ?options.zero_policy,
            "slab allocated"
        );
        Ok(Self { region, block_size, capacity })
    }

    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn node(&self) -> Option<usize> {
        self.region.node()
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    /// Pointer to the block at `index`.
    #[inline]
    pub(crate) fn block_ptr(&self, index: BlockIndex) -> NonNull<u8> {
        debug_assert!((index as usize) < self.capacity, "Index out of bounds");
        // SAFETY: index < capacity keeps the offset inside the region.
        unsafe { NonNull::new_unchecked(self.base().add(index as usize * self.block_size)) }
    }

    /// Map a block pointer back to its index.
    ///
    /// Returns `None` unless `ptr` lies in `[base, base + N*B)` and sits on
    /// a block boundary.
    #[inline]
    pub(crate) fn index_of(&self, ptr: NonNull<u8>) -> Option<BlockIndex> {
        let base = self.base() as usize;
        let addr = ptr.as_ptr() as usize;
        let offset = addr.checked_sub(base)?;
        if offset >= self.block_size * self.capacity || offset % self.block_size != 0 {
            return None;
        }
        Some((offset / self.block_size) as BlockIndex)
    }

    /// Zero-fill the whole block.
    #[inline]
    pub(crate) fn clear(&self, index: BlockIndex) {
        // SAFETY: the caller owns the block exclusively while clearing it.
        unsafe { std::ptr::write_bytes(self.block_ptr(index).as_ptr(), 0, self.block_size) }
    }
}

// SAFETY: the slab only hands out raw block pointers; exclusive access to
// each block is arbitrated by the owning pool's free-list.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("base", &self.base())
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("node", &self.node())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_block_size() {
        assert_eq!(aligned_block_size(1), 64);
        assert_eq!(aligned_block_size(64), 64);
        assert_eq!(aligned_block_size(65), 128);
        assert_eq!(aligned_block_size(200), 256);
    }

    #[test]
    fn test_index_round_trip() {
        let slab = Slab::new(100, 8, &PoolOptions::default()).unwrap();
        assert_eq!(slab.block_size(), 128);
        for i in 0..8 {
            let ptr = slab.block_ptr(i);
            assert_eq!(ptr.as_ptr() as usize % CACHE_LINE, 0);
            assert_eq!(slab.index_of(ptr), Some(i));
        }
    }

    #[test]
    fn test_index_of_rejects_foreign_pointers() {
        let slab = Slab::new(64, 4, &PoolOptions::default()).unwrap();
        let inside = slab.block_ptr(1);
        let misaligned = NonNull::new(unsafe { inside.as_ptr().add(8) }).unwrap();
        let past_end = NonNull::new(unsafe { slab.base().add(64 * 4) }).unwrap();
        let mut local = 0u8;
        let foreign = NonNull::from(&mut local);

        assert_eq!(slab.index_of(misaligned), None);
        assert_eq!(slab.index_of(past_end), None);
        assert_eq!(slab.index_of(foreign), None);
    }

    #[test]
    fn test_oversized_slab_is_refused() {
        let err = Slab::new(usize::MAX / 2, 4, &PoolOptions::default()).unwrap_err();
        assert!(matches!(err, SubstrateError::OutOfMemory { bytes: usize::MAX, .. }));
    }

    #[test]
    fn test_clear_zeroes_block() {
        let slab = Slab::new(64, 2, &PoolOptions::default()).unwrap();
        let ptr = slab.block_ptr(1);
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 64) };
        slab.clear(1);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
