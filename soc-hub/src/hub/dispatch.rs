use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Select};

use super::channel::{Polled, Token};
use super::peripheral::{DataPath, Detach, Peripheral};
use super::{PeripheralHub, DMA_RX_DONE_BM, DMA_TX_DONE_BM};
use crate::error::protocol_violation;
use crate::protocol_assert;
use crate::ring::Direction;

/// How long the loop waits before retrying a same-core port that refused a
/// transfer.
const DIRECT_RETRY: Duration = Duration::from_millis(1);

/// Which of a peripheral's serviced channels fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The device asked for transmit data.
    Tx,
    /// The device sent receive data.
    Rx,
    /// The device raised interrupt bits.
    Irq,
}

/// Identifies one trigger in the hub's event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelTag {
    Peripheral { id: super::PeripheralId, kind: ChannelKind },
    /// An application posted new ring work.
    Request,
}

impl PeripheralHub {
    /// Service the trigger `tag`. Returns whether a transfer or interrupt
    /// was handled.
    pub(crate) fn service(&self, tag: ChannelTag) -> bool {
        match tag {
            ChannelTag::Request => {
                // Coalesced: any number of requests cause one rescan.
                while self.wake_receiver().try_recv().is_ok() {}
                false
            }
            ChannelTag::Peripheral { id, kind } => {
                let p = self.peripheral(id);
                match kind {
                    ChannelKind::Rx => device_to_dma(&p),
                    ChannelKind::Tx => dma_to_device(&p),
                    ChannelKind::Irq => device_irq(&p),
                }
            }
        }
    }

    /// Compute the trigger set for the current ring occupancy.
    ///
    /// A transmit trigger is armed only while the TX ring has a pending
    /// chain; the device is told once with a `Ready` token. A receive
    /// trigger is armed only while an RX buffer is posted. Interrupt
    /// channels are always armed.
    pub(crate) fn rescan(&self) -> Vec<ChannelTag> {
        let mut armed = Vec::new();
        for p in self.snapshot().iter() {
            let id = p.id();

            let tx_pending = p.tx_ring().is_some_and(|r| r.hub_peek().is_some());
            match p.data_out() {
                Some(DataPath::Direct(_)) if tx_pending => {
                    armed.push(ChannelTag::Peripheral { id, kind: ChannelKind::Tx });
                }
                Some(DataPath::Channel(chan)) if tx_pending && !p.is_detached(Detach::DataOut) => {
                    if !p.tx_ready() {
                        match chan.hub_send(Token::Ready) {
                            Ok(()) => p.set_tx_ready(true),
                            Err(_) => p.detach(Detach::DataOut),
                        }
                    }
                    if p.tx_ready() {
                        armed.push(ChannelTag::Peripheral { id, kind: ChannelKind::Tx });
                    }
                }
                _ => {}
            }

            if let Some(DataPath::Channel(_)) = p.data_in() {
                let rx_posted = p.rx_ring().is_some_and(|r| r.hub_peek().is_some());
                if rx_posted && !p.is_detached(Detach::DataIn) {
                    armed.push(ChannelTag::Peripheral { id, kind: ChannelKind::Rx });
                }
            }

            if p.irq_chan().is_some() && !p.is_detached(Detach::Irq) {
                armed.push(ChannelTag::Peripheral { id, kind: ChannelKind::Irq });
            }
        }
        armed
    }
}

fn device_to_dma(p: &Peripheral) -> bool {
    let Some(chan) = p.data_in().and_then(DataPath::chan) else {
        protocol_violation(format_args!("{} has no receive channel", p.id()));
    };
    let Some(ring) = p.rx_ring() else {
        protocol_violation(format_args!("{} receive ring not configured", p.id()));
    };
    let Some(mut xfer) = ring.hub_take() else {
        protocol_violation(format_args!("{} receive fired with no buffer posted", p.id()));
    };

    let data = match chan.poll() {
        Polled::Token(Token::Data(d)) => d,
        Polled::Token(other) => protocol_violation(format_args!(
            "{} sent {} on its receive channel",
            p.id(),
            other.name()
        )),
        Polled::Empty => return false,
        Polled::Disconnected => {
            p.detach(Detach::DataIn);
            return false;
        }
    };

    let (buf, max_len) = xfer.segment_mut(0);
    let room = max_len.min(buf.len());
    protocol_assert!(
        data.len() <= room,
        "{} sent {} bytes into a {} byte receive buffer",
        p.id(),
        data.len(),
        room
    );
    buf[..data.len()].copy_from_slice(&data);
    xfer.release(data.len(), Direction::Rx);
    log::trace!("{} rx {} bytes", p.id(), data.len());

    p.raise(DMA_RX_DONE_BM);
    true
}

fn dma_to_device(p: &Peripheral) -> bool {
    let Some(ring) = p.tx_ring() else {
        protocol_violation(format_args!("{} transmit ring not configured", p.id()));
    };

    match p.data_out() {
        Some(DataPath::Direct(port)) => {
            let Some(xfer) = ring.hub_take() else {
                return false;
            };
            let total = xfer.total_len();
            let segments: Vec<&[u8]> = (0..xfer.segments())
                .map(|i| {
                    let (buf, len) = xfer.segment(i);
                    &buf[..len]
                })
                .collect();
            if !port.transmit(&segments) {
                return false;
            }
            drop(segments);
            xfer.release(total, Direction::Tx);
            log::trace!("{} direct tx {} bytes", p.id(), total);
        }
        Some(DataPath::Channel(chan)) => {
            let Some(xfer) = ring.hub_take() else {
                protocol_violation(format_args!("{} asked for data with nothing posted", p.id()));
            };
            let max_len = match chan.poll() {
                Polled::Token(Token::Request { max_len }) => max_len,
                Polled::Token(other) => protocol_violation(format_args!(
                    "{} sent {} on its transmit channel",
                    p.id(),
                    other.name()
                )),
                Polled::Empty => return false,
                Polled::Disconnected => {
                    p.detach(Detach::DataOut);
                    return false;
                }
            };

            let total = xfer.total_len();
            protocol_assert!(
                total <= max_len,
                "{} requested {} bytes but the chain holds {}",
                p.id(),
                max_len,
                total
            );
            let mut data = Vec::with_capacity(total);
            for i in 0..xfer.segments() {
                let (buf, len) = xfer.segment(i);
                data.extend_from_slice(&buf[..len]);
            }
            if chan.hub_send(Token::Data(data)).is_err() {
                p.detach(Detach::DataOut);
                return false;
            }
            p.set_tx_ready(false);
            xfer.release(total, Direction::Tx);
            log::trace!("{} tx {} bytes", p.id(), total);
        }
        None => protocol_violation(format_args!("{} has no transmit path", p.id())),
    }

    p.raise(DMA_TX_DONE_BM);
    true
}

fn device_irq(p: &Peripheral) -> bool {
    let Some(chan) = p.irq_chan() else {
        protocol_violation(format_args!("{} has no irq channel", p.id()));
    };
    match chan.poll() {
        Polled::Token(Token::Word(status)) => {
            p.raise(status);
            true
        }
        Polled::Token(other) => protocol_violation(format_args!(
            "{} sent {} on its irq channel",
            p.id(),
            other.name()
        )),
        Polled::Empty => false,
        Polled::Disconnected => {
            p.detach(Detach::Irq);
            false
        }
    }
}

fn trigger_receiver(p: &Peripheral, kind: ChannelKind) -> Option<&Receiver<Token>> {
    let chan = match kind {
        ChannelKind::Tx => p.data_out().and_then(DataPath::chan),
        ChannelKind::Rx => p.data_in().and_then(DataPath::chan),
        ChannelKind::Irq => p.irq_chan(),
    };
    chan.map(|c| c.receiver())
}

/// One armed event set: channel triggers in a select, plus same-core
/// transfers that need no trigger at all.
struct Triggers<'a> {
    sel: Select<'a>,
    ops: Vec<ChannelTag>,
    live: usize,
    direct: Vec<ChannelTag>,
}

impl<'a> Triggers<'a> {
    fn arm(hub: &'a PeripheralHub, peripherals: &'a [Arc<Peripheral>], armed: &[ChannelTag]) -> Self {
        let mut sel = Select::new();
        let mut ops = Vec::with_capacity(armed.len() + 1);
        let mut direct = Vec::new();

        for &tag in armed {
            let ChannelTag::Peripheral { id, kind } = tag else {
                continue;
            };
            let rx = peripherals
                .get(id.index())
                .and_then(|p| trigger_receiver(p, kind));
            match rx {
                Some(rx) => {
                    let index = sel.recv(rx);
                    debug_assert_eq!(index, ops.len());
                    ops.push(tag);
                }
                None => direct.push(tag),
            }
        }
        sel.recv(hub.wake_receiver());
        ops.push(ChannelTag::Request);

        let live = ops.len();
        Triggers { sel, ops, live, direct }
    }

    /// Block until a trigger fires and disable it. Bounded when same-core
    /// work is waiting to be retried.
    fn wait(&mut self) -> Option<ChannelTag> {
        let index = if self.direct.is_empty() {
            self.sel.ready()
        } else {
            self.sel.ready_timeout(DIRECT_RETRY).ok()?
        };
        Some(self.take(index))
    }

    /// Next trigger that has already fired, without waiting.
    fn poll(&mut self) -> Option<ChannelTag> {
        if self.live == 0 {
            return None;
        }
        let index = self.sel.try_ready().ok()?;
        Some(self.take(index))
    }

    fn take(&mut self, index: usize) -> ChannelTag {
        self.sel.remove(index);
        self.live -= 1;
        self.ops[index]
    }
}

/// Single-thread event loop over every peripheral.
///
/// Each pass re-arms the minimal trigger set, services same-core transfers
/// directly, waits for one trigger, services it, then drains every trigger
/// that fired in the meantime before re-arming.
pub struct CooperativeDispatcher {
    hub: Arc<PeripheralHub>,
}

impl CooperativeDispatcher {
    pub fn new(hub: Arc<PeripheralHub>) -> Self {
        CooperativeDispatcher { hub }
    }

    /// Run until [`HubHandle::shutdown`].
    pub fn run(&self) {
        let hub = &*self.hub;
        log::info!("hub dispatcher running with {} peripherals", hub.peripheral_count());

        while !hub.stopping() {
            let armed = hub.rescan();
            let peripherals = hub.snapshot();
            let mut triggers = Triggers::arm(hub, &peripherals, &armed);

            let mut progressed = false;
            for &tag in &triggers.direct {
                progressed |= hub.service(tag);
            }
            if progressed {
                continue;
            }

            let Some(tag) = triggers.wait() else {
                continue;
            };
            hub.service(tag);
            while let Some(tag) = triggers.poll() {
                hub.service(tag);
            }
        }
        log::info!("hub dispatcher stopped");
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> std::io::Result<HubHandle> {
        let hub = self.hub.clone();
        let thread = thread::Builder::new()
            .name("soc-hub".into())
            .spawn(move || self.run())?;
        Ok(HubHandle {
            hub,
            thread: Some(thread),
        })
    }
}

/// Result of one interrupt entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rearm {
    /// The fired trigger moved data or delivered an interrupt.
    pub serviced: bool,
    /// Triggers to enable before returning from the interrupt.
    pub armed: Vec<ChannelTag>,
}

/// Interrupt-driven entry point. The caller owns the event source and calls
/// [`entry`](Self::entry) with the tag of whichever trigger fired.
pub struct IsrDispatcher {
    hub: Arc<PeripheralHub>,
}

impl IsrDispatcher {
    pub fn new(hub: Arc<PeripheralHub>) -> Self {
        IsrDispatcher { hub }
    }

    /// Service the one peripheral direction `tag` names, then rescan every
    /// peripheral for triggers that still have pending work.
    pub fn entry(&self, tag: ChannelTag) -> Rearm {
        let serviced = self.hub.service(tag);
        Rearm {
            serviced,
            armed: self.hub.rescan(),
        }
    }

    /// Trigger set for the current ring occupancy.
    pub fn rescan(&self) -> Vec<ChannelTag> {
        self.hub.rescan()
    }
}

/// Drive an [`IsrDispatcher`] from channel readiness on a dedicated thread,
/// one entry per fired trigger.
pub fn spawn_interrupt_driven(hub: Arc<PeripheralHub>) -> std::io::Result<HubHandle> {
    let isr = IsrDispatcher::new(hub.clone());
    let thread = thread::Builder::new().name("soc-hub-isr".into()).spawn(move || {
        let hub = isr.hub.clone();
        log::info!("hub interrupt entry running with {} peripherals", hub.peripheral_count());

        let mut armed = isr.rescan();
        while !hub.stopping() {
            let peripherals = hub.snapshot();
            let mut triggers = Triggers::arm(&hub, &peripherals, &armed);

            if let Some(&tag) = triggers.direct.first() {
                let rearm = isr.entry(tag);
                if rearm.serviced {
                    armed = rearm.armed;
                    continue;
                }
            }

            armed = match triggers.wait() {
                Some(tag) => isr.entry(tag).armed,
                None => isr.rescan(),
            };
        }
        log::info!("hub interrupt entry stopped");
    })?;
    Ok(HubHandle {
        hub,
        thread: Some(thread),
    })
}

/// Owner of a running dispatcher thread. Dropping it stops the thread.
pub struct HubHandle {
    hub: Arc<PeripheralHub>,
    thread: Option<JoinHandle<()>>,
}

impl HubHandle {
    pub fn hub(&self) -> &Arc<PeripheralHub> {
        &self.hub
    }

    /// Stop the dispatcher and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.hub.request_stop();
            if thread.join().is_err() {
                log::error!("hub dispatcher thread panicked");
            }
        }
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
