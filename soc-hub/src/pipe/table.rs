use crossbeam::channel::Sender;

use super::frame::StreamId;
use crate::buffer::Buffer;
use crate::constants::{MAX_PIPES_PER_STREAM, STREAM_ID_COUNT};
use crate::error::PipeError;

#[derive(Debug)]
struct Entry {
    addr: u32,
    queue: Sender<Buffer>,
}

/// Open pipes indexed by `[stream][slot]`.
///
/// Allocation is first-fit starting after the last slot handed out for that
/// stream, so recently closed slots are not reused immediately.
#[derive(Debug)]
pub struct PipeTable {
    slots: [[Option<Entry>; MAX_PIPES_PER_STREAM]; STREAM_ID_COUNT],
    cursor: [usize; STREAM_ID_COUNT],
}

impl Default for PipeTable {
    fn default() -> Self {
        PipeTable {
            slots: Default::default(),
            cursor: [0; STREAM_ID_COUNT],
        }
    }
}

impl PipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot for `(stream, addr)`; returns the slot index.
    pub fn insert(&mut self, stream: StreamId, addr: u32, queue: Sender<Buffer>) -> Result<usize, PipeError> {
        let row = &mut self.slots[stream.index()];
        if row.iter().flatten().any(|e| e.addr == addr) {
            return Err(PipeError::AddressInUse {
                stream: stream.get(),
                addr,
            });
        }

        let start = self.cursor[stream.index()];
        for i in 0..MAX_PIPES_PER_STREAM {
            let slot = (start + i) % MAX_PIPES_PER_STREAM;
            if row[slot].is_none() {
                row[slot] = Some(Entry { addr, queue });
                self.cursor[stream.index()] = (slot + 1) % MAX_PIPES_PER_STREAM;
                return Ok(slot);
            }
        }
        Err(PipeError::TableFull(stream.get()))
    }

    pub fn remove(&mut self, stream: StreamId, slot: usize) {
        self.slots[stream.index()][slot] = None;
    }

    /// Queue of the pipe open on `(stream, addr)`.
    pub fn lookup(&self, stream: StreamId, addr: u32) -> Option<Sender<Buffer>> {
        self.slots[stream.index()]
            .iter()
            .flatten()
            .find(|e| e.addr == addr)
            .map(|e| e.queue.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    fn s(id: u8) -> StreamId {
        StreamId::new(id).unwrap()
    }

    #[test]
    fn one_pipe_per_address() {
        let mut t = PipeTable::new();
        let (tx, _rx) = bounded(1);
        t.insert(s(0), 1, tx.clone()).unwrap();
        assert_eq!(
            t.insert(s(0), 1, tx.clone()),
            Err(PipeError::AddressInUse { stream: 0, addr: 1 })
        );
        // Same address on another stream is a different pipe.
        assert!(t.insert(s(1), 1, tx).is_ok());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn cursor_rotates_past_freed_slot() {
        let mut t = PipeTable::new();
        let (tx, _rx) = bounded(1);
        assert_eq!(t.insert(s(2), 10, tx.clone()), Ok(0));
        assert_eq!(t.insert(s(2), 11, tx.clone()), Ok(1));
        t.remove(s(2), 0);
        assert_eq!(t.insert(s(2), 12, tx.clone()), Ok(2));
        assert!(t.lookup(s(2), 10).is_none());
        assert!(t.lookup(s(2), 12).is_some());
    }

    #[test]
    fn full_stream_is_reported() {
        let mut t = PipeTable::new();
        let (tx, _rx) = bounded(1);
        for addr in 0..MAX_PIPES_PER_STREAM as u32 {
            t.insert(s(0), addr, tx.clone()).unwrap();
        }
        assert_eq!(t.insert(s(0), 99, tx.clone()), Err(PipeError::TableFull(0)));
        t.remove(s(0), 5);
        assert_eq!(t.insert(s(0), 99, tx), Ok(5));
    }
}
