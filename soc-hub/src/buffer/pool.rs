use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::Buffer;
use crate::error::{protocol_violation, PoolError};
use crate::osal::{CountingSemaphore, Timeout};
use crate::protocol_assert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescState {
    Free,
    InFlight,
}

#[derive(Debug)]
struct Descriptor {
    generation: u32,
    state: DescState,
}

struct DescriptorTable {
    descriptors: Vec<Descriptor>,
    /// Indices of `Free` descriptors, oldest first.
    free: VecDeque<u16>,
}

/// Snapshot of pool occupancy taken under the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
}

pub(crate) struct PoolShared {
    table: Mutex<DescriptorTable>,
    /// One unit per free descriptor.
    available: CountingSemaphore,
    capacity: usize,
}

impl PoolShared {
    /// Return a descriptor to the free list. Called from `Buffer::drop`.
    pub(crate) fn reclaim(&self, index: u16, generation: u32) {
        {
            let mut table = self.table.lock();
            let desc = &mut table.descriptors[index as usize];
            protocol_assert!(
                desc.state == DescState::InFlight && desc.generation == generation,
                "descriptor {} released in state {:?} (generation {}, handle generation {})",
                index,
                desc.state,
                desc.generation,
                generation
            );
            desc.state = DescState::Free;
            desc.generation = desc.generation.wrapping_add(1);
            table.free.push_back(index);
        }
        self.available.give();
    }
}

/// Pool of buffer descriptors backing variably sized payloads.
///
/// The descriptor count is fixed at construction and never grows. When every
/// descriptor is in use [`acquire`](Self::acquire) blocks, which makes the
/// pool the system's backpressure valve.
///
/// Cloning a `BufferPool` yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool of `capacity` descriptors, all free.
    pub fn new(capacity: usize) -> Self {
        protocol_assert!(
            capacity > 0 && capacity <= u16::MAX as usize,
            "pool capacity {} out of range",
            capacity
        );
        let descriptors = (0..capacity)
            .map(|_| Descriptor {
                generation: 0,
                state: DescState::Free,
            })
            .collect();
        let free = (0..capacity as u16).collect();
        BufferPool {
            shared: Arc::new(PoolShared {
                table: Mutex::new(DescriptorTable { descriptors, free }),
                available: CountingSemaphore::new(capacity, capacity),
                capacity,
            }),
        }
    }

    /// Acquire a descriptor with a zeroed payload of `size` bytes.
    ///
    /// Waits up to `timeout` for a descriptor to become free. `size == 0`
    /// yields a descriptor with no payload.
    pub fn acquire(&self, size: usize, timeout: Timeout) -> Option<Buffer> {
        if !self.shared.available.take(timeout) {
            return None;
        }

        let (index, generation) = {
            let mut table = self.shared.table.lock();
            let Some(index) = table.free.pop_front() else {
                protocol_violation(format_args!("pool semaphore granted but free list is empty"));
            };
            let desc = &mut table.descriptors[index as usize];
            protocol_assert!(
                desc.state == DescState::Free,
                "descriptor {} on free list in state {:?}",
                index,
                desc.state
            );
            desc.state = DescState::InFlight;
            (index, desc.generation)
        };

        let payload = vec![0u8; size].into_boxed_slice();
        Some(Buffer::new(self.shared.clone(), index, generation, payload))
    }

    /// Acquire a buffer sized to `src` and copy `src` into it.
    pub fn acquire_copy(&self, src: &[u8], timeout: Timeout) -> Result<Buffer, PoolError> {
        let mut buf = self.acquire(src.len(), timeout).ok_or(PoolError::Exhausted)?;
        buf.storage_mut().copy_from_slice(src);
        Ok(buf)
    }

    /// Release a buffer back to this pool.
    ///
    /// A buffer acquired from a different pool is rejected with
    /// [`PoolError::ForeignBuffer`]; it still returns to the pool it came from.
    pub fn release(&self, buf: Buffer) -> Result<(), PoolError> {
        if !buf.belongs_to(&self.shared) {
            log::warn!("rejected release of {:?} from a foreign pool", buf.handle());
            return Err(PoolError::ForeignBuffer);
        }
        drop(buf);
        Ok(())
    }

    /// Whether `buf` was acquired from this pool.
    pub fn owns(&self, buf: &Buffer) -> bool {
        buf.belongs_to(&self.shared)
    }

    /// Total number of descriptors.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Descriptors that `acquire` can hand out without waiting.
    pub fn available(&self) -> usize {
        self.shared.available.count()
    }

    /// Descriptors currently held by callers or in flight on a ring.
    pub fn in_use(&self) -> usize {
        self.stats().in_use
    }

    /// Occupancy snapshot. `available + in_use == capacity` always holds.
    pub fn stats(&self) -> PoolStats {
        let table = self.shared.table.lock();
        let in_use = table
            .descriptors
            .iter()
            .filter(|d| d.state == DescState::InFlight)
            .count();
        PoolStats {
            capacity: self.shared.capacity,
            available: table.free.len(),
            in_use,
        }
    }
}
