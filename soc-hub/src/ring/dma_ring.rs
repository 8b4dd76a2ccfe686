//! Descriptor ring shared between the application side and the hub.
//!
//! # Safety Contract
//!
//! - Only ONE context may post ([`post_rx`](DmaRingBuf::post_rx),
//!   [`post_tx`](DmaRingBuf::post_tx), [`post_tx_chain`](DmaRingBuf::post_tx_chain)).
//! - Only ONE context may reclaim ([`app_reclaim`](DmaRingBuf::app_reclaim)).
//! - Only ONE context (the hub) may call [`hub_take`](DmaRingBuf::hub_take).
//!
//! These may run concurrently. A slot's state says who owns its contents:
//! `Ready` belongs to the poster, `Waiting` to the hub, `RxDone`/`TxDone` to
//! the reclaimer. Every state store that hands a slot to another context is
//! a `Release` store, paired with an `Acquire` load on the other side, so
//! buffer and length fields are visible before the new state is.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::protocol_assert;

/// State of one descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Ready = 0,
    Waiting = 1,
    RxDone = 2,
    TxDone = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Ready,
            1 => SlotState::Waiting,
            2 => SlotState::RxDone,
            _ => SlotState::TxDone,
        }
    }
}

/// Transfer direction, as seen from the software side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

struct SlotData<T> {
    buf: Option<T>,
    len: usize,
    last: bool,
}

struct Slot<T> {
    data: UnsafeCell<SlotData<T>>,
    state: AtomicU8,
}

impl<T> Slot<T> {
    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Work the hub would service next: one whole scatter-gather chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    pub segments: usize,
    pub total_len: usize,
}

/// Monotonic slot counters. Slot index is `counter % depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndices {
    pub producer: usize,
    pub consumer: usize,
    pub retire: usize,
}

/// A completed slot handed back to the application side.
#[derive(Debug)]
pub struct Reclaimed<T> {
    pub buf: T,
    pub len: usize,
    /// More segments of the same chain follow.
    pub more: bool,
    pub direction: Direction,
}

/// Fixed-depth circular array of DMA descriptor slots.
///
/// Each slot moves `Ready → Waiting → RxDone|TxDone → Ready` and never skips
/// a state. Slots are serviced strictly in index order, and a scatter-gather
/// chain is exposed to the hub only once every segment is in place.
pub struct DmaRingBuf<T> {
    slots: Box<[Slot<T>]>,
    /// Next slot to post (only modified by the poster).
    producer: AtomicUsize,
    /// Next slot the hub services (only modified by the hub).
    consumer: AtomicUsize,
    /// Next slot to reclaim (only modified by the reclaimer).
    retire: AtomicUsize,
    /// A `HubTransfer` guard is outstanding.
    hub_busy: AtomicBool,
}

// SAFETY: T: Send is required because buffers cross thread/ISR boundaries.
// Slot contents are only touched by the context that owns the slot's current
// state (see the module-level contract), and ownership moves with
// Release/Acquire state transitions.
unsafe impl<T: Send> Sync for DmaRingBuf<T> {}
unsafe impl<T: Send> Send for DmaRingBuf<T> {}

impl<T> DmaRingBuf<T> {
    /// Create a ring of `depth` slots, all `Ready`.
    pub fn new(depth: usize) -> Self {
        protocol_assert!(depth > 0, "ring depth must be at least 1");
        let slots = (0..depth)
            .map(|_| Slot {
                data: UnsafeCell::new(SlotData {
                    buf: None,
                    len: 0,
                    last: true,
                }),
                state: AtomicU8::new(SlotState::Ready as u8),
            })
            .collect();
        DmaRingBuf {
            slots,
            producer: AtomicUsize::new(0),
            consumer: AtomicUsize::new(0),
            retire: AtomicUsize::new(0),
            hub_busy: AtomicBool::new(false),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, counter: usize) -> &Slot<T> {
        &self.slots[counter % self.slots.len()]
    }

    /// State of slot `index` (`0..depth`).
    pub fn slot_state(&self, index: usize) -> SlotState {
        self.slots[index].state()
    }

    pub fn indices(&self) -> RingIndices {
        RingIndices {
            producer: self.producer.load(Ordering::Acquire),
            consumer: self.consumer.load(Ordering::Acquire),
            retire: self.retire.load(Ordering::Acquire),
        }
    }

    /// Slots that can be posted right now.
    pub fn free_slots(&self) -> usize {
        let retire = self.retire.load(Ordering::Acquire);
        let producer = self.producer.load(Ordering::Acquire);
        self.depth() - (producer - retire)
    }

    /// Post an empty receive buffer able to hold `max_len` bytes.
    pub fn post_rx(&self, buf: T, max_len: usize) {
        self.post_chain_inner(core::iter::once((buf, max_len)), 1, "rx");
    }

    /// Post one transmit buffer holding `len` bytes.
    pub fn post_tx(&self, buf: T, len: usize) {
        self.post_chain_inner(core::iter::once((buf, len)), 1, "tx");
    }

    /// Post a scatter-gather chain of `(buffer, len)` segments as one
    /// logical transfer.
    pub fn post_tx_chain<I>(&self, segments: I)
    where
        I: IntoIterator<Item = (T, usize)>,
        I::IntoIter: ExactSizeIterator,
    {
        let segments = segments.into_iter();
        let count = segments.len();
        self.post_chain_inner(segments, count, "tx chain");
    }

    fn post_chain_inner<I>(&self, mut segments: I, count: usize, what: &str)
    where
        I: Iterator<Item = (T, usize)>,
    {
        protocol_assert!(count > 0, "empty {} post", what);
        protocol_assert!(
            count <= self.depth(),
            "{} of {} segments exceeds ring depth {}",
            what,
            count,
            self.depth()
        );

        let p = self.producer.load(Ordering::Relaxed);
        for i in 0..count {
            let state = self.slot(p + i).state();
            protocol_assert!(
                state == SlotState::Ready,
                "{} post into slot {} in state {:?}: more posts than ring depth {}",
                what,
                (p + i) % self.depth(),
                state,
                self.depth()
            );
        }

        // Head segment is published last so the hub never sees a partial chain.
        let Some(head) = segments.next() else {
            return;
        };
        for (i, (buf, len)) in segments.enumerate() {
            let slot = self.slot(p + 1 + i);
            // SAFETY: the slot is Ready, so the poster owns its contents.
            unsafe {
                *slot.data.get() = SlotData {
                    buf: Some(buf),
                    len,
                    last: i + 2 == count,
                };
            }
            slot.set_state(SlotState::Waiting);
        }

        let slot = self.slot(p);
        // SAFETY: as above.
        unsafe {
            *slot.data.get() = SlotData {
                buf: Some(head.0),
                len: head.1,
                last: count == 1,
            };
        }
        self.producer.store(p + count, Ordering::Release);
        slot.set_state(SlotState::Waiting);
    }

    /// Report the next pending chain without taking it.
    ///
    /// Either the full chain is reported or nothing is.
    pub fn hub_peek(&self) -> Option<PendingTransfer> {
        let c = self.consumer.load(Ordering::Relaxed);
        if self.slot(c).state() != SlotState::Waiting {
            return None;
        }

        let mut segments = 0;
        let mut total_len = 0;
        loop {
            let slot = self.slot(c + segments);
            protocol_assert!(
                slot.state() == SlotState::Waiting,
                "chain segment {} not waiting",
                segments
            );
            // SAFETY: Waiting slots belong to the hub; the Acquire load above
            // makes the poster's writes visible.
            let data = unsafe { &*slot.data.get() };
            segments += 1;
            total_len += data.len;
            if data.last {
                break;
            }
            protocol_assert!(segments < self.depth(), "unterminated chain in ring");
        }
        Some(PendingTransfer { segments, total_len })
    }

    /// Take the next pending chain for servicing.
    pub fn hub_take(&self) -> Option<HubTransfer<'_, T>> {
        let pending = self.hub_peek()?;
        let was_busy = self.hub_busy.swap(true, Ordering::Acquire);
        protocol_assert!(!was_busy, "hub_take while a transfer is outstanding");
        Some(HubTransfer {
            ring: self,
            start: self.consumer.load(Ordering::Relaxed),
            pending,
        })
    }

    /// Reclaim the oldest completed slot, returning it to `Ready`.
    pub fn app_reclaim(&self) -> Option<Reclaimed<T>> {
        let r = self.retire.load(Ordering::Relaxed);
        let slot = self.slot(r);
        let direction = match slot.state() {
            SlotState::RxDone => Direction::Rx,
            SlotState::TxDone => Direction::Tx,
            SlotState::Ready | SlotState::Waiting => return None,
        };

        // SAFETY: Done slots belong to the reclaimer.
        let data = unsafe { &mut *slot.data.get() };
        let Some(buf) = data.buf.take() else {
            crate::error::protocol_violation(format_args!("completed slot {} has no buffer", r % self.depth()));
        };
        let reclaimed = Reclaimed {
            buf,
            len: data.len,
            more: !data.last,
            direction,
        };
        self.retire.store(r + 1, Ordering::Release);
        slot.set_state(SlotState::Ready);
        Some(reclaimed)
    }
}

/// Exclusive hub-side access to one pending chain.
///
/// Dropping the guard without [`release`](Self::release) leaves the chain
/// pending.
pub struct HubTransfer<'a, T> {
    ring: &'a DmaRingBuf<T>,
    start: usize,
    pending: PendingTransfer,
}

impl<'a, T> HubTransfer<'a, T> {
    pub fn segments(&self) -> usize {
        self.pending.segments
    }

    pub fn total_len(&self) -> usize {
        self.pending.total_len
    }

    fn data(&self, i: usize) -> &SlotData<T> {
        assert!(i < self.pending.segments);
        // SAFETY: the chain's slots are Waiting and this guard is the only
        // hub-side accessor (hub_busy).
        unsafe { &*self.ring.slot(self.start + i).data.get() }
    }

    /// Segment `i` and its posted length.
    pub fn segment(&self, i: usize) -> (&T, usize) {
        let data = self.data(i);
        match &data.buf {
            Some(buf) => (buf, data.len),
            None => crate::error::protocol_violation(format_args!("waiting slot without buffer")),
        }
    }

    pub fn segment_mut(&mut self, i: usize) -> (&mut T, usize) {
        assert!(i < self.pending.segments);
        // SAFETY: as in `data`, and `&mut self` prevents aliasing.
        let data = unsafe { &mut *self.ring.slot(self.start + i).data.get() };
        let len = data.len;
        match &mut data.buf {
            Some(buf) => (buf, len),
            None => crate::error::protocol_violation(format_args!("waiting slot without buffer")),
        }
    }

    /// Mark the chain done after the hardware transfer of `len` bytes.
    ///
    /// Receive transfers are single-slot and `len` may not exceed the posted
    /// buffer size. Transmit transfers must have sent the whole chain.
    pub fn release(self, len: usize, direction: Direction) {
        let (done, segments) = match direction {
            Direction::Rx => {
                protocol_assert!(
                    self.pending.segments == 1,
                    "rx transfer spans {} slots",
                    self.pending.segments
                );
                protocol_assert!(
                    len <= self.pending.total_len,
                    "received {} bytes into a {} byte buffer",
                    len,
                    self.pending.total_len
                );
                // SAFETY: slot is still Waiting and owned by this guard.
                unsafe { (*self.ring.slot(self.start).data.get()).len = len };
                (SlotState::RxDone, 1)
            }
            Direction::Tx => {
                protocol_assert!(
                    len == self.pending.total_len,
                    "sent {} of {} chained bytes",
                    len,
                    self.pending.total_len
                );
                (SlotState::TxDone, self.pending.segments)
            }
        };

        for i in 0..segments {
            self.ring.consumer.store(self.start + i + 1, Ordering::Release);
            self.ring.slot(self.start + i).set_state(done);
        }
    }
}

impl<T> Drop for HubTransfer<'_, T> {
    fn drop(&mut self) {
        self.ring.hub_busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn check_indices<T>(ring: &DmaRingBuf<T>) {
        let i = ring.indices();
        assert!(i.producer >= i.consumer, "{:?}", i);
        assert!(i.consumer >= i.retire, "{:?}", i);
        assert!(i.producer - i.retire <= ring.depth(), "{:?}", i);
    }

    #[test]
    fn rx_slot_lifecycle() {
        let ring: DmaRingBuf<Vec<u8>> = DmaRingBuf::new(2);
        assert_eq!(ring.slot_state(0), SlotState::Ready);

        ring.post_rx(vec![0; 16], 16);
        assert_eq!(ring.slot_state(0), SlotState::Waiting);
        assert!(ring.app_reclaim().is_none());

        let mut xfer = ring.hub_take().unwrap();
        xfer.segment_mut(0).0[..3].copy_from_slice(b"abc");
        xfer.release(3, Direction::Rx);
        assert_eq!(ring.slot_state(0), SlotState::RxDone);

        let r = ring.app_reclaim().unwrap();
        assert_eq!(r.len, 3);
        assert_eq!(&r.buf[..3], b"abc");
        assert_eq!(r.direction, Direction::Rx);
        assert!(!r.more);
        assert_eq!(ring.slot_state(0), SlotState::Ready);
        check_indices(&ring);
    }

    #[test]
    fn depth_three_never_overruns() {
        let ring: DmaRingBuf<Vec<u8>> = DmaRingBuf::new(3);
        for _ in 0..3 {
            ring.post_rx(vec![0; 256], 256);
        }

        // Four hardware completions: only three find a waiting slot.
        let mut serviced = 0;
        for _ in 0..4 {
            if let Some(xfer) = ring.hub_take() {
                xfer.release(100, Direction::Rx);
                serviced += 1;
            }
        }
        assert_eq!(serviced, 3);

        for _ in 0..3 {
            assert_eq!(ring.app_reclaim().unwrap().len, 100);
        }
        assert!(ring.app_reclaim().is_none());
        assert_eq!(ring.slot_state(0), SlotState::Ready);
        check_indices(&ring);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn over_post_is_fatal() {
        let ring: DmaRingBuf<u32> = DmaRingBuf::new(2);
        ring.post_tx(1, 1);
        ring.post_tx(2, 1);
        ring.post_tx(3, 1);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn chain_longer_than_ring_is_fatal() {
        let ring: DmaRingBuf<u32> = DmaRingBuf::new(2);
        ring.post_tx_chain(vec![(1, 1), (2, 1), (3, 1)]);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn rx_longer_than_buffer_is_fatal() {
        let ring: DmaRingBuf<Vec<u8>> = DmaRingBuf::new(1);
        ring.post_rx(vec![0; 4], 4);
        ring.hub_take().unwrap().release(5, Direction::Rx);
    }

    #[test]
    fn chain_peeked_as_one_transfer() {
        let ring: DmaRingBuf<&'static [u8]> = DmaRingBuf::new(4);
        ring.post_tx_chain(vec![(&b"payload"[..], 7), (&b"ftr"[..], 3)]);
        assert_eq!(
            ring.hub_peek(),
            Some(PendingTransfer { segments: 2, total_len: 10 })
        );

        let xfer = ring.hub_take().unwrap();
        assert_eq!(xfer.segment(0), (&&b"payload"[..], 7));
        assert_eq!(xfer.segment(1).1, 3);
        xfer.release(10, Direction::Tx);

        let first = ring.app_reclaim().unwrap();
        assert!(first.more);
        assert_eq!(first.direction, Direction::Tx);
        let second = ring.app_reclaim().unwrap();
        assert!(!second.more);
        assert_eq!(second.buf, &b"ftr"[..]);
    }

    #[test]
    fn dropped_guard_leaves_chain_pending() {
        let ring: DmaRingBuf<u8> = DmaRingBuf::new(2);
        ring.post_tx(7, 1);
        drop(ring.hub_take().unwrap());
        assert_eq!(ring.hub_peek(), Some(PendingTransfer { segments: 1, total_len: 1 }));
        assert!(ring.hub_take().is_some());
    }

    #[test]
    fn chains_never_partially_visible_across_threads() {
        const CHAINS: usize = 2_000;
        let ring: Arc<DmaRingBuf<usize>> = Arc::new(DmaRingBuf::new(4));

        let hub = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut done = 0;
                while done < CHAINS {
                    if let Some(p) = ring.hub_peek() {
                        assert_eq!(p.segments, 2);
                        assert_eq!(p.total_len, 1000);
                        let xfer = ring.hub_take().unwrap();
                        let total = xfer.total_len();
                        xfer.release(total, Direction::Tx);
                        done += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut posted = 0;
        let mut reclaimed = 0;
        while reclaimed < CHAINS * 2 {
            if posted < CHAINS && ring.free_slots() >= 2 {
                ring.post_tx_chain(vec![(posted, posted % 1000), (posted, 1000 - posted % 1000)]);
                posted += 1;
            }
            while let Some(r) = ring.app_reclaim() {
                assert_eq!(r.buf, reclaimed / 2);
                reclaimed += 1;
            }
            thread::yield_now();
        }
        hub.join().unwrap();
        check_indices(&*ring);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Post,
        PostChain,
        Service,
        Reclaim,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Post),
            Just(Op::PostChain),
            Just(Op::Service),
            Just(Op::Reclaim),
        ]
    }

    proptest! {
        #[test]
        fn indices_stay_ordered(depth in 1usize..6, ops in proptest::collection::vec(op(), 0..200)) {
            let ring: DmaRingBuf<u32> = DmaRingBuf::new(depth);
            let mut next_id = 0u32;
            let mut expect_reclaim = 0u32;

            for op in ops {
                match op {
                    Op::Post if ring.free_slots() >= 1 => {
                        ring.post_tx(next_id, 1);
                        next_id += 1;
                    }
                    Op::PostChain if ring.free_slots() >= 2 => {
                        ring.post_tx_chain(vec![(next_id, 1), (next_id + 1, 1)]);
                        next_id += 2;
                    }
                    Op::Service => {
                        if let Some(xfer) = ring.hub_take() {
                            let total = xfer.total_len();
                            xfer.release(total, Direction::Tx);
                        }
                    }
                    Op::Reclaim => {
                        if let Some(r) = ring.app_reclaim() {
                            // FIFO, each slot reclaimed exactly once.
                            prop_assert_eq!(r.buf, expect_reclaim);
                            expect_reclaim += 1;
                        }
                    }
                    _ => {}
                }
                let i = ring.indices();
                prop_assert!(i.producer >= i.consumer);
                prop_assert!(i.consumer >= i.retire);
                prop_assert!(i.producer - i.retire <= depth);
            }
        }
    }
}
