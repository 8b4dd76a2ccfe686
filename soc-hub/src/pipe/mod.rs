//! Intertile pipes.
//!
//! A [`PipeManager`] owns one intertile peripheral and multiplexes any number
//! of point-to-point [`Pipe`]s over it. Every frame on the link carries a
//! [`Footer`] naming the `(stream, addr)` pair it belongs to:
//!
//! ```text
//! ┌──────────────── payload ────────────────┬─ addr (u32 LE) ─┬ stream ┐
//! │                 0..frame_size-5         │       4         │   1    │
//! └─────────────────────────────────────────┴─────────────────┴────────┘
//! ```
//!
//! Received frames are reclaimed by the peripheral's ISR and handed to a
//! worker thread, which reposts a fresh receive buffer and routes the frame
//! to the pipe's single-slot queue. Transmit is a two-segment chain
//! (payload, footer) so payload buffers are sent without copying.

mod frame;
mod manager;
mod table;


pub use frame::{Footer, StreamId};
pub use manager::{Pipe, PipeManager, PipeManagerConfig};
pub use table::PipeTable;
