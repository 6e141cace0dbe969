//! # Flash-Substrate
//!
//! Memory and messaging primitives for a low-latency trading pipeline.
//!
//! ## Design Principles
//!
//! - **No allocation after construction**: every pool, queue and ring is
//!   sized up front and prefaulted
//! - **Bounded, non-blocking**: operations report exhausted/full/empty
//!   through return values and never wait
//! - **Cache-Optimized**: 64-byte aligned blocks, one writer per cache line
//! - **NUMA-aware**: backing memory is bound to the node of the consumer
//!
//! ## Architecture
//!
//! ```text
//! [Socket] --> [ByteRing] --> [Parser] --> [SpscQueue<Tick>] --> [Worker (Pinned)]
//!                                                                     |
//!                                                    [ObjectPool<Enriched>]
//!                                                                     |
//!                                                         [MpmcQueue] --> [Consumers]
//! ```

pub mod error;
pub mod numa;
pub mod slab;
pub mod block_pool;
pub mod atomic_pool;
pub mod spin_pool;
pub mod object_pool;
pub mod spsc;
pub mod mpmc;
pub mod byte_ring;

// Re-exports for convenience
pub use error::{Result, SubstrateError};
pub use numa::{NumaRegion, CACHE_LINE};
pub use slab::{BlockIndex, NULL_INDEX};
pub use block_pool::{BlockPool, BlockSource, PoolOptions, PoolStats, ZeroPolicy};
pub use atomic_pool::{AtomicBlockPool, TaggedHead};
pub use spin_pool::SpinBlockPool;
pub use object_pool::{ObjectPool, Pooled};
pub use spsc::{Consumer, Producer, SpscQueue};
pub use mpmc::MpmcQueue;
pub use byte_ring::{ByteRing, RingReader, RingWriter};
