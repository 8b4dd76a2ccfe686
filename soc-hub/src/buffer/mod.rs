//! Fixed-capacity pool of DMA-capable buffer descriptors.
//!
//! - [`BufferPool`]: the descriptor table, free list and availability count
//! - [`Buffer`]: move-only handle to one acquired descriptor and its payload
//! - [`BufferHandle`]: `{index, generation}` identity of a descriptor
//!
//! Ownership of a [`Buffer`] *is* ownership of its descriptor. Passing it to
//! a ring buffer, a pipe or the pool moves the payload pointer, never the
//! bytes. Dropping it returns the descriptor to the free list, so a
//! descriptor cannot be released twice.

pub mod pool;
mod handle;

pub use handle::{Buffer, BufferHandle};
pub use pool::{BufferPool, PoolStats};
