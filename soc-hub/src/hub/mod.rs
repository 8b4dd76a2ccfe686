//! The peripheral hub.
//!
//! The hub owns every registered [`Peripheral`] and moves bytes between the
//! peripherals' hardware channels and their software-owned DMA rings. One
//! servicing context drives it, either a [`CooperativeDispatcher`] thread or
//! an [`IsrDispatcher`] entry point; both share the same servicing code.
//!
//! ```text
//!   driver task                   hub                         device
//!   ───────────                   ───                         ──────
//!   ring.post_tx(buf) ──┐
//!   hub.dma_request() ──┴─► wake, rescan ── Ready ─────────► rx_dma_ready()
//!                           service(Tx)  ◄── Request ─────── rx_dma_xfer()
//!                                        ── Data ─────────►
//!   isr(TX_DONE) ◄────────  raise()
//! ```

mod channel;
mod dispatch;
mod peripheral;

pub use channel::{chan_pair, irq_send, rx_dma_ready, rx_dma_xfer, tx_dma_xfer, ChanEnd, Token};
pub use dispatch::{
    spawn_interrupt_driven, ChannelKind, ChannelTag, CooperativeDispatcher, HubHandle, IsrDispatcher, Rearm,
};
pub use peripheral::{DataPath, DirectPort, DmaBuf, IrqTarget, Peripheral, PeripheralChannels};

pub use crate::constants::{DEVICE_IRQ_SHIFT, DMA_RX_DONE_BM, DMA_TX_DONE_BM};

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use heapless::Vec as FixedVec;
use parking_lot::RwLock;

use crate::constants::MAX_PERIPHERALS;
use crate::error::protocol_violation;
use crate::isr::PeripheralIsr;
use crate::protocol_assert;
use crate::ring::Direction;

/// Stable index of a registered peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(u8);

impl PeripheralId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "periph{}", self.0)
    }
}

/// Registry of peripherals plus the "new work" signal.
pub struct PeripheralHub {
    peripherals: RwLock<FixedVec<Arc<Peripheral>, MAX_PERIPHERALS>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stop: AtomicBool,
    next_irq_source: AtomicUsize,
}

impl PeripheralHub {
    pub fn new() -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        Arc::new(PeripheralHub {
            peripherals: RwLock::new(FixedVec::new()),
            wake_tx,
            wake_rx,
            stop: AtomicBool::new(false),
            next_irq_source: AtomicUsize::new(0),
        })
    }

    fn insert(&self, make: impl FnOnce(PeripheralId) -> Peripheral) -> PeripheralId {
        let mut table = self.peripherals.write();
        protocol_assert!(
            table.len() < MAX_PERIPHERALS,
            "cannot register more than {} peripherals",
            MAX_PERIPHERALS
        );
        let id = PeripheralId(table.len() as u8);
        if table.push(Arc::new(make(id))).is_err() {
            protocol_violation(format_args!("peripheral table full"));
        }
        log::debug!("registered {}", id);
        id
    }

    /// Register a device whose hardware half talks to the hub over channels.
    pub fn register(&self, channels: PeripheralChannels) -> PeripheralId {
        self.insert(|id| {
            Peripheral::new(
                id,
                channels.data_in.map(DataPath::Channel),
                channels.data_out.map(DataPath::Channel),
                channels.control,
                channels.irq,
            )
        })
    }

    /// Register a device that runs on the hub's own core.
    ///
    /// Transmit chains go straight to `port`; receive data is delivered with
    /// [`direct_rx`](Self::direct_rx). No channel round-trip is involved.
    pub fn register_direct(
        &self,
        port: Arc<dyn DirectPort>,
        control: Option<ChanEnd>,
        irq: Option<ChanEnd>,
    ) -> PeripheralId {
        self.insert(|id| {
            Peripheral::new(
                id,
                Some(DataPath::Direct(port.clone())),
                Some(DataPath::Direct(port)),
                control,
                irq,
            )
        })
    }

    /// Look up a registered peripheral. An unknown id is a protocol violation.
    pub fn peripheral(&self, id: PeripheralId) -> Arc<Peripheral> {
        match self.peripherals.read().get(id.index()) {
            Some(p) => p.clone(),
            None => protocol_violation(format_args!("{} is not registered", id)),
        }
    }

    pub fn peripheral_count(&self) -> usize {
        self.peripherals.read().len()
    }

    pub(crate) fn snapshot(&self) -> FixedVec<Arc<Peripheral>, MAX_PERIPHERALS> {
        self.peripherals.read().clone()
    }

    /// Size the peripheral's rings.
    ///
    /// A `rx_buf_size` above zero allocates and posts `rx_depth` receive
    /// buffers of that size. With zero the driver posts its own. A depth of
    /// zero leaves that direction unconfigured. Rings are configured once.
    pub fn configure(&self, id: PeripheralId, rx_depth: usize, rx_buf_size: usize, tx_depth: usize) {
        let p = self.peripheral(id);
        protocol_assert!(p.init_rings(rx_depth, tx_depth), "{} rings configured twice", id);

        if rx_buf_size > 0 {
            if let Some(rx) = p.rx_ring() {
                for _ in 0..rx_depth {
                    rx.post_rx(DmaBuf::zeroed(rx_buf_size), rx_buf_size);
                }
            }
        }
        log::debug!(
            "{} configured: rx depth {} ({} byte buffers), tx depth {}",
            id,
            rx_depth,
            rx_buf_size,
            tx_depth
        );
        self.dma_request();
    }

    /// Route `id`'s interrupts to `isr` on `core`.
    pub fn register_handler(&self, id: PeripheralId, core: usize, isr: Arc<dyn PeripheralIsr>) -> IrqTarget {
        let target = IrqTarget {
            core,
            source: self.next_irq_source.fetch_add(1, Ordering::Relaxed),
        };
        self.peripheral(id).set_handler(target, isr);
        target
    }

    /// Tell the hub that new ring work was posted. Never blocks.
    pub fn dma_request(&self) {
        // A full signal queue already has a wake pending.
        let _ = self.wake_tx.try_send(());
    }

    /// Same-core receive fast path.
    ///
    /// `fill` writes the frame straight into the next posted receive buffer
    /// and returns its length. Returns `false` without calling `fill` when no
    /// receive buffer is posted. Only one context may deliver to a given
    /// peripheral.
    pub fn direct_rx<F>(&self, id: PeripheralId, fill: F) -> bool
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let p = self.peripheral(id);
        protocol_assert!(
            p.data_in().is_some_and(DataPath::is_direct),
            "{} has no direct receive path",
            id
        );
        let Some(ring) = p.rx_ring() else {
            return false;
        };
        let Some(mut xfer) = ring.hub_take() else {
            return false;
        };
        let (buf, max_len) = xfer.segment_mut(0);
        let room = max_len.min(buf.len());
        let len = fill(&mut buf[..room]);
        xfer.release(len, Direction::Rx);
        p.raise(DMA_RX_DONE_BM);
        true
    }

    pub(crate) fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.dma_request();
    }
}

impl fmt::Debug for PeripheralHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHub")
            .field("peripherals", &self.peripheral_count())
            .finish()
    }
}
