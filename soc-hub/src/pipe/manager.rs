use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use super::frame::{Footer, StreamId};
use super::table::PipeTable;
use crate::buffer::{Buffer, BufferPool};
use crate::constants::{
    FOOTER_LEN, INTERTILE_BUFSIZE, NUM_RX_BUFFERS, TX_RING_DEPTH, WORK_QUEUE_LEN,
};
use crate::error::{protocol_violation, PipeError, WorkQueueFull};
use crate::hub::{
    DataPath, DmaBuf, Peripheral, PeripheralHub, PeripheralId, DMA_RX_DONE_BM, DMA_TX_DONE_BM,
};
use crate::isr::{IsrReturn, PeripheralIsr};
use crate::osal::{queue_receive, queue_send, CountingSemaphore, Timeout, WorkQueue};
use crate::protocol_assert;
use crate::ring::DmaRingBuf;

/// Segments per transmitted frame: payload, then footer.
const SLOTS_PER_FRAME: usize = 2;

/// Pipe manager sizing and default timeouts.
#[derive(Debug, Clone, Copy)]
pub struct PipeManagerConfig {
    /// Receive buffers kept posted to the hub.
    pub rx_buffers: usize,
    /// Transmit ring slots. Each frame needs two.
    pub tx_ring_depth: usize,
    /// Largest frame on the link, footer included.
    pub frame_size: usize,
    /// Classification work items that may wait at once.
    pub work_queue_len: usize,
    /// How long classification waits for a pipe's receiver before dropping
    /// the frame.
    pub classify_timeout: Timeout,
    /// Initial send timeout of new pipes.
    pub send_timeout: Timeout,
    /// Initial receive timeout of new pipes.
    pub recv_timeout: Timeout,
    /// Core the receive and transmit interrupts are routed to.
    pub isr_core: usize,
}

impl Default for PipeManagerConfig {
    fn default() -> Self {
        PipeManagerConfig {
            rx_buffers: NUM_RX_BUFFERS,
            tx_ring_depth: TX_RING_DEPTH,
            frame_size: INTERTILE_BUFSIZE,
            work_queue_len: WORK_QUEUE_LEN,
            classify_timeout: Timeout::millis(100),
            send_timeout: Timeout::Forever,
            recv_timeout: Timeout::Forever,
            isr_core: 0,
        }
    }
}

impl PipeManagerConfig {
    /// Largest payload a pipe can send.
    pub fn max_payload(&self) -> usize {
        self.frame_size - FOOTER_LEN
    }
}

struct Shared {
    hub: Arc<PeripheralHub>,
    peripheral: Arc<Peripheral>,
    pool: BufferPool,
    cfg: PipeManagerConfig,
    table: Mutex<PipeTable>,
    work: OnceLock<WorkQueue<Buffer>>,
    /// Serializes receive posts from the ISR and the worker.
    rx_post: Mutex<()>,
    /// Serializes transmit chain posts with their completion entries.
    tx_post: Mutex<()>,
    tx_slots: CountingSemaphore,
    /// One entry per posted frame, in ring order.
    completions: Mutex<VecDeque<Option<Sender<()>>>>,
    direct_tx: bool,
    ready: AtomicBool,
}

impl Shared {
    fn rx_ring(&self) -> &DmaRingBuf<DmaBuf> {
        match self.peripheral.rx_ring() {
            Some(r) => r,
            None => protocol_violation(format_args!("{} receive ring missing", self.peripheral.id())),
        }
    }

    fn tx_ring(&self) -> &DmaRingBuf<DmaBuf> {
        match self.peripheral.tx_ring() {
            Some(r) => r,
            None => protocol_violation(format_args!("{} transmit ring missing", self.peripheral.id())),
        }
    }

    fn post_rx(&self, mut buf: Buffer) {
        buf.set_device(Some(self.peripheral.id()));
        let max_len = buf.capacity();
        {
            let _guard = self.rx_post.lock();
            self.rx_ring().post_rx(DmaBuf::Pooled(buf), max_len);
        }
        self.hub.dma_request();
    }

    fn post_frame(
        &self,
        payload: Buffer,
        footer: Footer,
        done: Option<Sender<()>>,
        timeout: Timeout,
    ) -> Result<(), PipeError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(PipeError::Closed);
        }
        if !self.tx_slots.take_n(SLOTS_PER_FRAME, timeout) {
            return Err(PipeError::Timeout);
        }

        let len = payload.len();
        {
            let _guard = self.tx_post.lock();
            self.completions.lock().push_back(done);
            self.tx_ring().post_tx_chain([
                (DmaBuf::Pooled(payload), len),
                (DmaBuf::Owned(Box::new(footer.encode())), FOOTER_LEN),
            ]);
        }
        trace!("{} queued {} byte frame for {}", footer.stream, len, footer.addr);
        self.hub.dma_request();
        Ok(())
    }

    fn work(&self) -> &WorkQueue<Buffer> {
        match self.work.get() {
            Some(w) => w,
            None => protocol_violation(format_args!("pipe manager worker not started")),
        }
    }

    fn rx_done(&self) -> IsrReturn {
        let mut ret = IsrReturn::NoYield;
        while let Some(done) = self.rx_ring().app_reclaim() {
            let Some(mut buf) = done.buf.into_pooled() else {
                protocol_violation(format_args!("pipe receive ring held a non-pool buffer"));
            };
            buf.set_len(done.len);
            match self.work().pend(buf) {
                Ok(()) => ret = IsrReturn::Yield,
                Err(WorkQueueFull(buf)) => {
                    warn!("classification queue full, dropping {} byte frame", buf.len());
                    self.post_rx(buf);
                }
            }
        }
        ret
    }

    fn tx_done(&self) -> IsrReturn {
        let mut ret = IsrReturn::NoYield;
        while let Some(done) = self.tx_ring().app_reclaim() {
            // Releases the payload back to its pool.
            drop(done.buf);
            self.tx_slots.give();
            if done.more {
                continue;
            }
            if let Some(Some(waiter)) = self.completions.lock().pop_front() {
                if waiter.try_send(()).is_ok() {
                    ret = IsrReturn::Yield;
                }
            }
        }
        ret
    }

    /// Route one received frame to its pipe. Runs on the worker thread.
    fn classify(&self, buf: Buffer) {
        match self.pool.acquire(self.cfg.frame_size, Timeout::NoWait) {
            Some(replacement) => self.post_rx(replacement),
            None => {
                warn!("no spare receive buffer, dropping {} byte frame", buf.len());
                self.post_rx(buf);
                return;
            }
        }

        let footer = match Footer::decode(&buf) {
            Some(Ok(footer)) => footer,
            Some(Err(e)) => {
                warn!("dropping {} byte frame: {}", buf.len(), e);
                return;
            }
            None => {
                warn!("dropping {} byte frame shorter than its footer", buf.len());
                return;
            }
        };

        let queue = self.table.lock().lookup(footer.stream, footer.addr);
        let Some(queue) = queue else {
            warn!(
                "no pipe open on {} address {}, dropping {} byte frame",
                footer.stream,
                footer.addr,
                buf.len()
            );
            return;
        };
        if let Err(buf) = queue_send(&queue, buf, self.cfg.classify_timeout) {
            warn!(
                "{} address {} not drained in time, dropping {} byte frame",
                footer.stream,
                footer.addr,
                buf.len()
            );
        }
    }
}

struct PipeIsr(Weak<Shared>);

impl PeripheralIsr for PipeIsr {
    fn isr(&self, _peripheral: &Peripheral, status: u32) -> IsrReturn {
        let Some(shared) = self.0.upgrade() else {
            return IsrReturn::NoYield;
        };
        let mut ret = IsrReturn::NoYield;
        if status & DMA_TX_DONE_BM != 0 {
            ret |= shared.tx_done();
        }
        if status & DMA_RX_DONE_BM != 0 {
            ret |= shared.rx_done();
        }
        ret
    }
}

/// Multiplexes pipes over one intertile peripheral.
///
/// Cloning is cheap; all clones share the rings, the worker and the pipe
/// table. The manager shuts down when the last clone and the last [`Pipe`]
/// are dropped.
#[derive(Clone)]
pub struct PipeManager {
    shared: Arc<Shared>,
}

impl PipeManager {
    /// Configure `peripheral` for pipe traffic and start routing.
    ///
    /// Buffers for receive and transmit come from `pool`, which must hold
    /// at least `cfg.rx_buffers` descriptors plus one spare per frame in
    /// flight.
    pub fn start(
        hub: Arc<PeripheralHub>,
        peripheral: PeripheralId,
        pool: BufferPool,
        cfg: PipeManagerConfig,
    ) -> Result<PipeManager, PipeError> {
        protocol_assert!(
            cfg.tx_ring_depth >= SLOTS_PER_FRAME,
            "transmit ring depth {} cannot hold one frame",
            cfg.tx_ring_depth
        );
        protocol_assert!(
            cfg.frame_size > FOOTER_LEN,
            "frame size {} leaves no room for a payload",
            cfg.frame_size
        );
        protocol_assert!(cfg.rx_buffers > 0, "pipe manager needs receive buffers");

        // Everything that can fail happens before the peripheral is touched,
        // so a failed start can be retried.
        let primed = (0..cfg.rx_buffers)
            .map(|_| pool.acquire(cfg.frame_size, Timeout::NoWait))
            .collect::<Option<Vec<Buffer>>>()
            .ok_or_else(|| {
                warn!(
                    "{}: pool has {} free buffers, {} needed to start",
                    peripheral,
                    pool.available(),
                    cfg.rx_buffers
                );
                PipeError::NoBuffer
            })?;

        let p = hub.peripheral(peripheral);
        let direct_tx = p.data_out().is_some_and(DataPath::is_direct);

        let shared = Arc::new(Shared {
            hub: hub.clone(),
            peripheral: p,
            pool,
            cfg,
            table: Mutex::new(PipeTable::new()),
            work: OnceLock::new(),
            rx_post: Mutex::new(()),
            tx_post: Mutex::new(()),
            tx_slots: CountingSemaphore::new(cfg.tx_ring_depth, cfg.tx_ring_depth),
            completions: Mutex::new(VecDeque::new()),
            direct_tx,
            ready: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let work = WorkQueue::spawn(&format!("pipes-{}", peripheral), cfg.work_queue_len, move |buf: Buffer| {
            if let Some(shared) = weak.upgrade() {
                shared.classify(buf);
            }
        })
        .map_err(|e| {
            log::error!("{}: cannot start pipe worker: {}", peripheral, e);
            PipeError::WorkerSpawn
        })?;
        if shared.work.set(work).is_err() {
            protocol_violation(format_args!("{} pipe worker started twice", peripheral));
        }

        hub.configure(peripheral, cfg.rx_buffers, 0, cfg.tx_ring_depth);
        hub.register_handler(peripheral, cfg.isr_core, Arc::new(PipeIsr(Arc::downgrade(&shared))));
        for buf in primed {
            shared.post_rx(buf);
        }

        shared.ready.store(true, Ordering::Release);
        info!(
            "pipe manager ready on {}: {} rx buffers of {} bytes, tx depth {}",
            peripheral, cfg.rx_buffers, cfg.frame_size, cfg.tx_ring_depth
        );
        Ok(PipeManager { shared })
    }

    /// True from a successful [`start`](Self::start) until
    /// [`shutdown`](Self::shutdown).
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Stop routing. Sends on every pipe fail with [`PipeError::Closed`];
    /// frames already delivered can still be received. Frames that arrive
    /// later go back to the receive ring unrouted.
    pub fn shutdown(&self) {
        if !self.shared.ready.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.work().shutdown();
        info!("pipe manager on {} stopped", self.peripheral());
    }

    /// Open the pipe for `(stream, addr)`. Frames the peer sends with the
    /// same pair are delivered to it.
    pub fn open(&self, stream: u8, addr: u32) -> Result<Pipe, PipeError> {
        let stream = StreamId::new(stream)?;
        let (queue, rx) = bounded(1);
        let slot = self.shared.table.lock().insert(stream, addr, queue)?;
        debug!("opened {} address {} in slot {}", stream, addr, slot);
        Ok(Pipe {
            shared: self.shared.clone(),
            stream,
            addr,
            slot,
            rx,
            send_timeout: self.shared.cfg.send_timeout,
            recv_timeout: self.shared.cfg.recv_timeout,
        })
    }

    /// Number of pipes currently open.
    pub fn open_pipes(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    pub fn peripheral(&self) -> PeripheralId {
        self.shared.peripheral.id()
    }

    pub fn config(&self) -> &PipeManagerConfig {
        &self.shared.cfg
    }
}

impl fmt::Debug for PipeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeManager")
            .field("peripheral", &self.peripheral())
            .field("ready", &self.is_ready())
            .field("open_pipes", &self.open_pipes())
            .finish()
    }
}

/// One end of a point-to-point pipe.
///
/// Each pipe has a single-slot receive queue; a frame that is not collected
/// within the manager's classify timeout is dropped. Dropping the pipe
/// closes it.
pub struct Pipe {
    shared: Arc<Shared>,
    stream: StreamId,
    addr: u32,
    slot: usize,
    rx: Receiver<Buffer>,
    send_timeout: Timeout,
    recv_timeout: Timeout,
}

impl Pipe {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Largest payload one frame of this pipe carries.
    pub fn max_payload(&self) -> usize {
        self.shared.cfg.max_payload()
    }

    pub fn set_timeouts(&mut self, send: Timeout, recv: Timeout) {
        self.send_timeout = send;
        self.recv_timeout = recv;
    }

    fn footer(&self) -> Footer {
        Footer {
            stream: self.stream,
            addr: self.addr,
        }
    }

    fn check_len(&self, len: usize) -> Result<(), PipeError> {
        let max = self.max_payload();
        if len > max {
            return Err(PipeError::FrameTooLarge { len, max });
        }
        Ok(())
    }

    /// Copy `data` into a pool buffer and send it.
    ///
    /// On a same-core link this returns once the frame has been delivered;
    /// across cores it returns once the frame is queued for transmit.
    pub fn send(&self, data: &[u8]) -> Result<usize, PipeError> {
        self.check_len(data.len())?;
        let payload =
            Buffer::from_pool_copy(&self.shared.pool, data, self.send_timeout).map_err(|_| PipeError::NoBuffer)?;

        if !self.shared.direct_tx {
            self.shared.post_frame(payload, self.footer(), None, self.send_timeout)?;
            return Ok(data.len());
        }

        let (done_tx, done_rx) = bounded(1);
        self.shared
            .post_frame(payload, self.footer(), Some(done_tx), self.send_timeout)?;
        queue_receive(&done_rx, self.send_timeout).ok_or(PipeError::Timeout)?;
        Ok(data.len())
    }

    /// Send `buf` without copying. Ownership passes to the transmit path and
    /// the buffer returns to its pool once the frame is on the wire.
    pub fn send_buffer(&self, buf: Buffer) -> Result<usize, PipeError> {
        self.check_len(buf.len())?;
        let len = buf.len();
        self.shared.post_frame(buf, self.footer(), None, self.send_timeout)?;
        Ok(len)
    }

    /// Next frame for this pipe. The buffer's length is the payload length;
    /// the footer stays in its storage.
    pub fn recv(&self) -> Result<Buffer, PipeError> {
        let mut buf = queue_receive(&self.rx, self.recv_timeout).ok_or(PipeError::Timeout)?;
        let payload = Footer::payload_len(buf.len());
        buf.set_len(payload);
        Ok(buf)
    }

    /// Receive into `out`. A frame larger than `out` is discarded with
    /// [`PipeError::FrameTooLarge`].
    pub fn recv_copy(&self, out: &mut [u8]) -> Result<usize, PipeError> {
        let buf = self.recv()?;
        if buf.len() > out.len() {
            return Err(PipeError::FrameTooLarge {
                len: buf.len(),
                max: out.len(),
            });
        }
        out[..buf.len()].copy_from_slice(&buf);
        Ok(buf.len())
    }

    pub fn close(self) {}
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.shared.table.lock().remove(self.stream, self.slot);
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        debug!(
            "closed {} address {}, {} undelivered frames dropped",
            self.stream, self.addr, dropped
        );
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("stream", &self.stream)
            .field("addr", &self.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::PeripheralChannels;
    use crate::ring::Direction;
    use std::thread;
    use std::time::{Duration, Instant};

    fn manager(cfg: PipeManagerConfig) -> PipeManager {
        let hub = PeripheralHub::new();
        let id = hub.register(PeripheralChannels::default());
        PipeManager::start(hub, id, BufferPool::new(16), cfg).unwrap()
    }

    fn small() -> PipeManagerConfig {
        PipeManagerConfig {
            rx_buffers: 2,
            tx_ring_depth: 4,
            frame_size: 64,
            ..Default::default()
        }
    }

    /// Play the hub: fill the next posted receive buffer with one frame.
    fn deliver(ring: &DmaRingBuf<DmaBuf>, footer: Footer, payload: &[u8]) {
        let mut xfer = ring.hub_take().unwrap();
        let (buf, _) = xfer.segment_mut(0);
        buf[..payload.len()].copy_from_slice(payload);
        buf[payload.len()..payload.len() + FOOTER_LEN].copy_from_slice(&footer.encode());
        xfer.release(payload.len() + FOOTER_LEN, Direction::Rx);
    }

    fn reclaim(ring: &DmaRingBuf<DmaBuf>) -> Buffer {
        let done = ring.app_reclaim().unwrap();
        let mut frame = done.buf.into_pooled().unwrap();
        frame.set_len(done.len);
        frame
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_primes_receive_buffers() {
        let mgr = manager(small());
        assert!(mgr.is_ready());
        assert_eq!(mgr.pool().in_use(), 2);
        let ring = mgr.shared.rx_ring();
        assert_eq!(ring.hub_peek().map(|p| p.total_len), Some(64));
    }

    #[test]
    fn open_rejects_duplicates_and_bad_streams() {
        let mgr = manager(small());
        let _a = mgr.open(0, 1).unwrap();
        assert_eq!(
            mgr.open(0, 1).err(),
            Some(PipeError::AddressInUse { stream: 0, addr: 1 })
        );
        assert_eq!(mgr.open(200, 1).err(), Some(PipeError::InvalidStream(200)));
        assert_eq!(mgr.open_pipes(), 1);
    }

    #[test]
    fn closing_frees_the_address() {
        let mgr = manager(small());
        let a = mgr.open(3, 7).unwrap();
        a.close();
        assert_eq!(mgr.open_pipes(), 0);
        assert!(mgr.open(3, 7).is_ok());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mgr = manager(small());
        let pipe = mgr.open(0, 1).unwrap();
        let big = vec![0u8; 60];
        assert_eq!(
            pipe.send(&big),
            Err(PipeError::FrameTooLarge { len: 60, max: 59 })
        );
        assert_eq!(mgr.pool().in_use(), 2);
    }

    #[test]
    fn send_reserves_two_slots_per_frame() {
        // Nothing services the hub, so frames stay queued in the ring.
        let mgr = manager(small());
        let mut pipe = mgr.open(0, 1).unwrap();
        pipe.set_timeouts(Timeout::NoWait, Timeout::NoWait);
        assert_eq!(pipe.send(b"one"), Ok(3));
        assert_eq!(pipe.send(b"two"), Ok(3));
        assert_eq!(pipe.send(b"three"), Err(PipeError::Timeout));
        let pending = mgr.shared.tx_ring().hub_peek().unwrap();
        assert_eq!((pending.segments, pending.total_len), (2, 3 + FOOTER_LEN));
    }

    #[test]
    fn recv_times_out_when_nothing_arrives() {
        let mgr = manager(small());
        let mut pipe = mgr.open(0, 1).unwrap();
        pipe.set_timeouts(Timeout::NoWait, Timeout::millis(10));
        assert_eq!(pipe.recv().err(), Some(PipeError::Timeout));
    }

    #[test]
    fn unrouted_frame_is_released() {
        let mgr = manager(small());
        let footer = Footer {
            stream: StreamId::new(1).unwrap(),
            addr: 9,
        };
        let ring = mgr.shared.rx_ring();
        deliver(ring, footer, b"xx");
        mgr.shared.classify(reclaim(ring));
        // Dropped with a replacement posted in its place.
        assert_eq!(mgr.pool().in_use(), 2);
        assert_eq!(ring.indices().producer, 3);
    }

    #[test]
    fn full_work_queue_reposts_the_frame() {
        let mgr = manager(PipeManagerConfig {
            work_queue_len: 1,
            classify_timeout: Timeout::millis(5000),
            ..small()
        });
        let mut pipe = mgr.open(1, 4).unwrap();
        pipe.set_timeouts(Timeout::NoWait, Timeout::millis(2000));
        let footer = pipe.footer();
        let ring = mgr.shared.rx_ring();

        // Frame 1 fills the pipe and frame 2 parks the worker behind it.
        deliver(ring, footer, &[1; 3]);
        assert_eq!(mgr.shared.rx_done(), IsrReturn::Yield);
        wait_until("first replacement", || ring.indices().producer == 3);
        deliver(ring, footer, &[2; 3]);
        mgr.shared.rx_done();
        wait_until("second replacement", || ring.indices().producer == 4);
        // Frame 3 takes the only queue slot.
        deliver(ring, footer, &[3; 3]);
        assert_eq!(mgr.shared.rx_done(), IsrReturn::Yield);
        assert_eq!(mgr.shared.work().len(), 1);

        let in_use = mgr.pool().in_use();
        deliver(ring, footer, &[4; 3]);
        assert_eq!(mgr.shared.rx_done(), IsrReturn::NoYield);
        assert_eq!(ring.indices().producer, 5);
        assert_eq!(mgr.pool().in_use(), in_use);

        for n in 1..=3u8 {
            assert_eq!(&pipe.recv().unwrap()[..], &[n; 3][..]);
        }
        pipe.set_timeouts(Timeout::NoWait, Timeout::millis(50));
        assert_eq!(pipe.recv().err(), Some(PipeError::Timeout));
    }

    #[test]
    fn exhausted_pool_reposts_the_frame() {
        let mgr = manager(small());
        let mut pipe = mgr.open(1, 4).unwrap();
        pipe.set_timeouts(Timeout::NoWait, Timeout::millis(50));
        let held: Vec<Buffer> = std::iter::from_fn(|| mgr.pool().acquire(64, Timeout::NoWait)).collect();
        assert_eq!(mgr.pool().available(), 0);
        let in_use = mgr.pool().in_use();

        let ring = mgr.shared.rx_ring();
        deliver(ring, pipe.footer(), b"lost");
        mgr.shared.classify(reclaim(ring));
        assert_eq!(ring.indices().producer, 3);
        assert_eq!(mgr.pool().in_use(), in_use);
        assert_eq!(pipe.recv().err(), Some(PipeError::Timeout));

        // Routing resumes once buffers come back.
        drop(held);
        deliver(ring, pipe.footer(), b"kept");
        mgr.shared.classify(reclaim(ring));
        assert_eq!(ring.indices().producer, 4);
        assert_eq!(&pipe.recv().unwrap()[..], b"kept");
    }

    #[test]
    fn failed_start_can_be_retried() {
        let hub = PeripheralHub::new();
        let id = hub.register(PeripheralChannels::default());
        assert_eq!(
            PipeManager::start(hub.clone(), id, BufferPool::new(1), small()).err(),
            Some(PipeError::NoBuffer)
        );
        assert!(hub.peripheral(id).rx_ring().is_none());

        let mgr = PipeManager::start(hub, id, BufferPool::new(16), small()).unwrap();
        assert!(mgr.is_ready());
        assert_eq!(mgr.pool().in_use(), 2);
    }

    #[test]
    fn shutdown_closes_every_pipe() {
        let mgr = manager(small());
        let pipe = mgr.open(0, 1).unwrap();
        mgr.shutdown();
        assert!(!mgr.is_ready());
        assert_eq!(pipe.send(b"late"), Err(PipeError::Closed));
        assert_eq!(mgr.pool().in_use(), 2);
        // A second call is a no-op.
        mgr.shutdown();
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn single_slot_tx_ring_is_fatal() {
        manager(PipeManagerConfig {
            tx_ring_depth: 1,
            ..small()
        });
    }
}
