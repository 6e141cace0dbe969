//! Object Pool - typed construction on top of a block pool.
//!
//! Each acquire takes one block, moves a `T` into it and hands back a
//! [`Pooled`] handle. Dropping the handle runs `T`'s destructor and returns
//! the block. The wrapper never allocates.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::atomic_pool::AtomicBlockPool;
use crate::block_pool::{BlockSource, PoolOptions, PoolStats};
use crate::error::Result;
use crate::numa::CACHE_LINE;

/// Typed pool of `T` values backed by the block pool `P`.
///
/// `P` defaults to the lock-free pool; use [`crate::BlockPool`] for a
/// thread-local pool or [`crate::SpinBlockPool`] for batch atomicity.
pub struct ObjectPool<T, P: BlockSource = AtomicBlockPool<64, 1024>> {
    pool: P,
    _marker: PhantomData<T>,
}

impl<T, P: BlockSource> ObjectPool<T, P> {
    const LAYOUT_FITS: () = {
        assert!(size_of::<T>() <= P::BLOCK_SIZE, "T does not fit in a pool block");
        assert!(align_of::<T>() <= CACHE_LINE, "blocks are only 64-byte aligned");
    };

    /// Create a pool with default block pool options.
    pub fn new() -> Result<Self> {
        Self::with_options(PoolOptions::default())
    }

    /// Create a pool with explicit block pool options.
    pub fn with_options(options: PoolOptions) -> Result<Self> {
        let () = Self::LAYOUT_FITS;
        Ok(Self { pool: P::with_options(options)?, _marker: PhantomData })
    }

    /// Move `value` into a pooled block.
    ///
    /// Hands the value back if the pool is exhausted.
    #[inline]
    pub fn acquire(&self, value: T) -> std::result::Result<Pooled<'_, T, P>, T> {
        match self.pool.acquire() {
            Some(block) => {
                let ptr = block.cast::<T>();
                // SAFETY: the block is exclusively ours, sized and aligned for T.
                unsafe { ptr.as_ptr().write(value) };
                Ok(Pooled { ptr, pool: self })
            }
            None => Err(value),
        }
    }

    /// Construct a value in a pooled block only if one is available.
    #[inline]
    pub fn acquire_with<F>(&self, init: F) -> Option<Pooled<'_, T, P>>
    where
        F: FnOnce() -> T,
    {
        let ptr = self.pool.acquire()?.cast::<T>();
        // SAFETY: as in `acquire`. If `init` panics the block leaks, which
        // is safe.
        unsafe { ptr.as_ptr().write(init()) };
        Some(Pooled { ptr, pool: self })
    }

    /// Destroy the value and return its block. Same as dropping the handle.
    #[inline]
    pub fn release(&self, handle: Pooled<'_, T, P>) {
        debug_assert!(std::ptr::eq(handle.pool, self), "handle from another pool");
        drop(handle);
    }

    /// Destroy a value detached with [`Pooled::into_raw`] and return its block.
    ///
    /// Returns false, without touching the value, if `ptr` is not a live
    /// object of this pool.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` on a handle of this pool and must not
    /// be used afterwards.
    pub unsafe fn release_raw(&self, ptr: NonNull<T>) -> bool {
        let block = ptr.cast::<u8>();
        if !self.pool.is_allocated(block) {
            return false;
        }
        std::ptr::drop_in_place(ptr.as_ptr());
        self.pool.release(block)
    }

    /// Re-attach a handle to a value detached with [`Pooled::into_raw`].
    ///
    /// # Safety
    /// Same contract as [`ObjectPool::release_raw`].
    pub unsafe fn from_raw(&self, ptr: NonNull<T>) -> Pooled<'_, T, P> {
        debug_assert!(self.pool.is_allocated(ptr.cast()), "pointer not owned by this pool");
        Pooled { ptr, pool: self }
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.stats().in_use
    }

    /// Returns true if no objects are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of objects that can still be acquired.
    #[inline]
    pub fn available(&self) -> usize {
        self.pool.stats().free
    }

    /// Maximum number of live objects.
    #[inline]
    pub fn capacity(&self) -> usize {
        P::CAPACITY
    }

    /// Block accounting of the underlying pool.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The underlying block pool.
    pub fn blocks(&self) -> &P {
        &self.pool
    }
}

impl<T, P: BlockSource + fmt::Debug> fmt::Debug for ObjectPool<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("type", &std::any::type_name::<T>())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Exclusive handle to a pooled `T`.
///
/// Derefs to the value. Dropping it destroys the value and returns the
/// block to its pool.
pub struct Pooled<'a, T, P: BlockSource> {
    ptr: NonNull<T>,
    pool: &'a ObjectPool<T, P>,
}

// SAFETY: the handle owns its T exclusively, like a Box.
unsafe impl<T: Send, P: BlockSource + Sync> Send for Pooled<'_, T, P> {}
unsafe impl<T: Sync, P: BlockSource + Sync> Sync for Pooled<'_, T, P> {}

impl<'a, T, P: BlockSource> Pooled<'a, T, P> {
    /// Detach the value from the handle without destroying it.
    ///
    /// The block stays loaned until passed to [`ObjectPool::release_raw`]
    /// (or re-attached with [`ObjectPool::from_raw`]).
    pub fn into_raw(this: Self) -> NonNull<T> {
        let this = ManuallyDrop::new(this);
        this.ptr
    }

    /// Raw pointer to the value.
    pub fn as_ptr(this: &Self) -> *mut T {
        this.ptr.as_ptr()
    }
}

impl<T, P: BlockSource> Deref for Pooled<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the value was written at acquire and lives until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, P: BlockSource> DerefMut for Pooled<'_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the handle is the only path to the value.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, P: BlockSource> Drop for Pooled<'_, T, P> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the value is live and nobody else can reach it.
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) };
        let returned = self.pool.pool.release(self.ptr.cast());
        debug_assert!(returned, "pooled block rejected on release");
    }
}

impl<T: fmt::Debug, P: BlockSource> fmt::Debug for Pooled<'_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
