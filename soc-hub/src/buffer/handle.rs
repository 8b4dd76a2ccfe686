use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::pool::{BufferPool, PoolShared};
use crate::error::PoolError;
use crate::hub::PeripheralId;
use crate::osal::Timeout;
use crate::protocol_assert;

/// Opaque identity of a pool descriptor: slot index plus the generation it
/// was acquired under. Recovering the descriptor is an array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u16,
    generation: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Exclusive handle to one acquired descriptor and its payload.
///
/// Derefs to the valid bytes (`..len()`); [`storage_mut`](Self::storage_mut)
/// exposes the whole allocation for DMA writes. Dropping the buffer releases
/// the descriptor back to its pool.
pub struct Buffer {
    handle: BufferHandle,
    payload: Box<[u8]>,
    len: usize,
    device: Option<PeripheralId>,
    pool: Arc<PoolShared>,
}

impl Buffer {
    pub(crate) fn new(pool: Arc<PoolShared>, index: u16, generation: u32, payload: Box<[u8]>) -> Self {
        Buffer {
            handle: BufferHandle { index, generation },
            len: payload.len(),
            payload,
            device: None,
            pool,
        }
    }

    /// Acquire a buffer from `pool` holding a copy of `src`.
    pub fn from_pool_copy(pool: &BufferPool, src: &[u8], timeout: Timeout) -> Result<Self, PoolError> {
        pool.acquire_copy(src, timeout)
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the attached payload allocation.
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Set the number of valid bytes, e.g. after a DMA receive.
    pub fn set_len(&mut self, len: usize) {
        protocol_assert!(
            len <= self.payload.len(),
            "buffer length {} exceeds capacity {}",
            len,
            self.payload.len()
        );
        self.len = len;
    }

    /// The whole payload allocation, regardless of `len()`.
    pub fn storage(&self) -> &[u8] {
        &self.payload
    }

    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Peripheral this buffer is posted to, if any.
    pub fn device(&self) -> Option<PeripheralId> {
        self.device
    }

    pub fn set_device(&mut self, device: Option<PeripheralId>) {
        self.device = device;
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.payload[..self.len]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.payload[..self.len]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("capacity", &self.payload.len())
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.reclaim(self.handle.index, self.handle.generation);
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::BufferPool;
    use crate::osal::Timeout;

    #[test]
    fn set_len_limits_visible_bytes() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire(8, Timeout::NoWait).unwrap();
        buf.storage_mut()[..3].copy_from_slice(b"abc");
        buf.set_len(3);
        assert_eq!(&buf[..], b"abc");
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn set_len_past_capacity_is_fatal() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire(2, Timeout::NoWait).unwrap();
        buf.set_len(3);
    }

    #[test]
    fn drop_returns_descriptor() {
        let pool = BufferPool::new(1);
        {
            let _buf = pool.acquire(4, Timeout::NoWait).unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn zero_size_descriptor_has_no_payload() {
        let pool = BufferPool::new(1);
        let buf = pool.acquire(0, Timeout::NoWait).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
    }
}
