//! # soc-hub
//!
//! Host-side model of a multi-tile SoC's peripheral plumbing: a hub that
//! moves bytes between hardware channels and software DMA rings, a
//! fixed-capacity buffer pool, and a pipe manager that multiplexes
//! zero-copy point-to-point pipes over one intertile link.
//!
//! ## Architecture
//!
//! | Layer | Module | Purpose |
//! |-------|--------|---------|
//! | RTOS | [`osal`] | Timeouts, counting semaphore, deferred work queue |
//! | Memory | [`buffer`] | Buffer descriptor pool with move-only handles |
//! | DMA | [`ring`] | Lock-free descriptor ring shared by hub and driver |
//! | Hub | [`hub`] / [`isr`] | Peripheral registry, channel servicing, interrupt delivery |
//! | Control | [`control`] / [`rpc`] | Control-channel calls, RPC marshalling |
//! | Pipes | [`pipe`] | Footer-routed pipes over an intertile peripheral |
//! | Link | [`intertile`] | Software relay joining two tiles' hubs |
//! | I2C | [`i2c_rpc`] | `embedded-hal` I2C over RPC (feature-gated) |
//!
//! ## Quick start
//!
//! ```ignore
//! use soc_hub::buffer::BufferPool;
//! use soc_hub::hub::{CooperativeDispatcher, PeripheralHub};
//! use soc_hub::intertile::{channels_for_tile, IntertileLink};
//! use soc_hub::pipe::{PipeManager, PipeManagerConfig};
//!
//! let (chans_a, dev_a) = channels_for_tile();
//! let (chans_b, dev_b) = channels_for_tile();
//! let _link = IntertileLink::connect(dev_a, dev_b, 512)?;
//!
//! let hub_a = PeripheralHub::new();
//! let id_a = hub_a.register(chans_a);
//! let tile_a = PipeManager::start(hub_a.clone(), id_a, BufferPool::new(16), PipeManagerConfig::default())?;
//! let _dispatch_a = CooperativeDispatcher::new(hub_a).spawn()?;
//! // ... the same for tile B ...
//!
//! let pipe = tile_a.open(0, 1)?;
//! pipe.send(b"hello")?;
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Enables |
//! |---------|---------|---------|
//! | `i2c-rpc` | yes | Remote I2C master over a pipe (requires `embedded-hal`) |
//!
//! ## Failure model
//!
//! Recoverable conditions are typed errors in [`error`]. Broken protocol
//! invariants (ring over-post, oversized transfer, double registration) are
//! logged and panic through [`protocol_assert!`].

pub mod constants;
pub mod error;
pub mod osal;
pub mod buffer;
pub mod ring;
pub mod hub;
pub mod isr;
pub mod control;
pub mod rpc;
pub mod pipe;
pub mod intertile;

#[cfg(feature = "i2c-rpc")]
pub mod i2c_rpc;
