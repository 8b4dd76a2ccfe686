use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::channel::ChanEnd;
use super::PeripheralId;
use crate::buffer::Buffer;
use crate::isr::{IsrReturn, PeripheralIsr};
use crate::ring::DmaRingBuf;

/// Buffer held in a peripheral's DMA ring.
///
/// Pool-backed buffers are used by the pipe manager for zero-copy hand-off;
/// plain allocations back rings configured with a fixed receive buffer size.
#[derive(Debug)]
pub enum DmaBuf {
    Pooled(Buffer),
    Owned(Box<[u8]>),
}

impl DmaBuf {
    /// Zeroed heap buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        DmaBuf::Owned(vec![0u8; len].into_boxed_slice())
    }

    /// The pool buffer, if this is one.
    pub fn into_pooled(self) -> Option<Buffer> {
        match self {
            DmaBuf::Pooled(b) => Some(b),
            DmaBuf::Owned(_) => None,
        }
    }
}

impl From<Buffer> for DmaBuf {
    fn from(b: Buffer) -> Self {
        DmaBuf::Pooled(b)
    }
}

impl From<Vec<u8>> for DmaBuf {
    fn from(v: Vec<u8>) -> Self {
        DmaBuf::Owned(v.into_boxed_slice())
    }
}

/// Full storage of the buffer; the ring slot carries the transfer length.
impl Deref for DmaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            DmaBuf::Pooled(b) => b.storage(),
            DmaBuf::Owned(b) => b,
        }
    }
}

impl DerefMut for DmaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            DmaBuf::Pooled(b) => b.storage_mut(),
            DmaBuf::Owned(b) => b,
        }
    }
}

/// Same-core transmit endpoint.
///
/// The hub hands each pending transmit chain to [`transmit`](Self::transmit)
/// in place, with no channel round-trip. Returning `false` leaves the chain
/// pending; the hub retries on its next pass.
pub trait DirectPort: Send + Sync {
    fn transmit(&self, segments: &[&[u8]]) -> bool;
}

/// How one data direction reaches the device.
pub enum DataPath {
    /// Device runs on another core; transfers use the channel handshake.
    Channel(ChanEnd),
    /// Device shares the hub's core. Transmit goes through the port;
    /// receive is delivered with [`PeripheralHub::direct_rx`](super::PeripheralHub::direct_rx).
    Direct(Arc<dyn DirectPort>),
}

impl DataPath {
    pub fn is_direct(&self) -> bool {
        matches!(self, DataPath::Direct(_))
    }

    pub(crate) fn chan(&self) -> Option<&ChanEnd> {
        match self {
            DataPath::Channel(c) => Some(c),
            DataPath::Direct(_) => None,
        }
    }
}

impl fmt::Debug for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPath::Channel(_) => f.write_str("Channel"),
            DataPath::Direct(_) => f.write_str("Direct"),
        }
    }
}

/// Hub-side channel ends supplied at registration. Any may be absent.
#[derive(Debug, Default)]
pub struct PeripheralChannels {
    /// Device to hub (receive ring).
    pub data_in: Option<ChanEnd>,
    /// Hub to device (transmit ring).
    pub data_out: Option<ChanEnd>,
    pub control: Option<ChanEnd>,
    pub irq: Option<ChanEnd>,
}

/// Where a peripheral's interrupts are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqTarget {
    pub core: usize,
    pub source: usize,
}

struct Handler {
    target: IrqTarget,
    isr: Arc<dyn PeripheralIsr>,
}

/// Channel that saw its peer go away. No longer armed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Detach {
    DataIn = 0,
    DataOut = 1,
    Irq = 2,
}

/// One registered device.
pub struct Peripheral {
    id: PeripheralId,
    data_in: Option<DataPath>,
    data_out: Option<DataPath>,
    control: Option<ChanEnd>,
    irq: Option<ChanEnd>,
    rx_ring: OnceLock<DmaRingBuf<DmaBuf>>,
    tx_ring: OnceLock<DmaRingBuf<DmaBuf>>,
    interrupt_status: AtomicU32,
    /// The device has been sent `Ready` for the pending transmit.
    tx_ready: AtomicBool,
    handler: RwLock<Option<Handler>>,
    detached: [AtomicBool; 3],
}

impl Peripheral {
    pub(crate) fn new(
        id: PeripheralId,
        data_in: Option<DataPath>,
        data_out: Option<DataPath>,
        control: Option<ChanEnd>,
        irq: Option<ChanEnd>,
    ) -> Self {
        Peripheral {
            id,
            data_in,
            data_out,
            control,
            irq,
            rx_ring: OnceLock::new(),
            tx_ring: OnceLock::new(),
            interrupt_status: AtomicU32::new(0),
            tx_ready: AtomicBool::new(false),
            handler: RwLock::new(None),
            detached: Default::default(),
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    /// Receive ring, once configured.
    pub fn rx_ring(&self) -> Option<&DmaRingBuf<DmaBuf>> {
        self.rx_ring.get()
    }

    /// Transmit ring, once configured.
    pub fn tx_ring(&self) -> Option<&DmaRingBuf<DmaBuf>> {
        self.tx_ring.get()
    }

    pub fn data_in(&self) -> Option<&DataPath> {
        self.data_in.as_ref()
    }

    pub fn data_out(&self) -> Option<&DataPath> {
        self.data_out.as_ref()
    }

    /// Control channel for device configuration calls.
    pub fn control(&self) -> Option<&ChanEnd> {
        self.control.as_ref()
    }

    pub(crate) fn irq_chan(&self) -> Option<&ChanEnd> {
        self.irq.as_ref()
    }

    /// Read and clear the sticky interrupt status. Zero means no new event.
    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status.swap(0, Ordering::AcqRel)
    }

    pub fn irq_target(&self) -> Option<IrqTarget> {
        self.handler.read().as_ref().map(|h| h.target)
    }

    pub(crate) fn init_rings(&self, rx_depth: usize, tx_depth: usize) -> bool {
        let rx = rx_depth == 0 || self.rx_ring.set(DmaRingBuf::new(rx_depth)).is_ok();
        let tx = tx_depth == 0 || self.tx_ring.set(DmaRingBuf::new(tx_depth)).is_ok();
        rx && tx
    }

    pub(crate) fn set_handler(&self, target: IrqTarget, isr: Arc<dyn PeripheralIsr>) {
        *self.handler.write() = Some(Handler { target, isr });
    }

    /// OR `bits` into the status and deliver the interrupt if a handler is
    /// registered. Without one the bits stay latched for polling.
    pub(crate) fn raise(&self, bits: u32) -> IsrReturn {
        self.interrupt_status.fetch_or(bits, Ordering::AcqRel);
        let handler = self.handler.read();
        match handler.as_ref() {
            Some(h) => {
                let status = self.interrupt_status();
                log::trace!("{} irq {:#x} to core {}", self.id, status, h.target.core);
                h.isr.isr(self, status)
            }
            None => IsrReturn::NoYield,
        }
    }

    pub(crate) fn tx_ready(&self) -> bool {
        self.tx_ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_tx_ready(&self, ready: bool) {
        self.tx_ready.store(ready, Ordering::Release);
    }

    pub(crate) fn is_detached(&self, which: Detach) -> bool {
        self.detached[which as usize].load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self, which: Detach) {
        if !self.detached[which as usize].swap(true, Ordering::AcqRel) {
            log::debug!("{} {:?} channel disconnected", self.id, which);
        }
    }
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.id)
            .field("data_in", &self.data_in)
            .field("data_out", &self.data_out)
            .field("rx_depth", &self.rx_ring().map(|r| r.depth()))
            .field("tx_depth", &self.tx_ring().map(|r| r.depth()))
            .finish()
    }
}
