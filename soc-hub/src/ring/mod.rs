//! Per-peripheral DMA descriptor rings.
//!
//! Each configured peripheral owns one receive and one transmit
//! [`DmaRingBuf`]. The application side posts buffers and reclaims completed
//! ones; the hub takes waiting chains, moves the bytes and marks them done.

mod dma_ring;

pub use dma_ring::{DmaRingBuf, Direction, HubTransfer, PendingTransfer, Reclaimed, RingIndices, SlotState};
