//! Error types for the substrate.
//!
//! Only construction can fail. Hot-path outcomes (exhausted, full, empty)
//! are reported through return values and never become a `SubstrateError`.

use thiserror::Error;

/// Construction-time failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    /// The backing allocator refused the request.
    #[error("out of memory: {bytes} bytes requested (node {node:?})")]
    OutOfMemory {
        /// Requested size in bytes
        bytes: usize,
        /// NUMA node the allocation was bound to, if any
        node: Option<usize>,
    },

    /// Capacity is zero, below the minimum, or not a power of two.
    #[error("invalid {what} capacity {capacity}: must be a power of two >= {min}")]
    InvalidCapacity {
        /// Which primitive rejected the capacity
        what: &'static str,
        /// Requested capacity
        capacity: usize,
        /// Smallest accepted capacity
        min: usize,
    },

    /// The OS refused a scheduling affinity change.
    #[error("affinity change failed: {0}")]
    Affinity(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Reject capacities that are not powers of two or fall below `min`.
#[inline]
pub(crate) fn check_capacity(what: &'static str, capacity: usize, min: usize) -> Result<()> {
    if capacity < min || !capacity.is_power_of_two() {
        return Err(SubstrateError::InvalidCapacity { what, capacity, min });
    }
    Ok(())
}
