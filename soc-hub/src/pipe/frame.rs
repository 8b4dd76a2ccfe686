use core::fmt;

use crate::constants::{FOOTER_LEN, STREAM_ID_COUNT};
use crate::error::PipeError;

/// Tag that selects a family of pipes on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u8);

impl StreamId {
    pub fn new(id: u8) -> Result<Self, PipeError> {
        if (id as usize) < STREAM_ID_COUNT {
            Ok(StreamId(id))
        } else {
            Err(PipeError::InvalidStream(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

impl TryFrom<u8> for StreamId {
    type Error = PipeError;

    fn try_from(id: u8) -> Result<Self, PipeError> {
        StreamId::new(id)
    }
}

/// Routing tag stored in the last [`FOOTER_LEN`] bytes of every frame:
/// `addr` as a little-endian word, then the stream id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub stream: StreamId,
    pub addr: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let a = self.addr.to_le_bytes();
        [a[0], a[1], a[2], a[3], self.stream.0]
    }

    /// Read the footer from the end of `frame`. `None` if the frame is
    /// shorter than a footer.
    pub fn decode(frame: &[u8]) -> Option<Result<Footer, PipeError>> {
        let start = frame.len().checked_sub(FOOTER_LEN)?;
        let f = &frame[start..];
        let addr = u32::from_le_bytes([f[0], f[1], f[2], f[3]]);
        Some(StreamId::new(f[4]).map(|stream| Footer { stream, addr }))
    }

    /// Payload length of a frame of `frame_len` bytes.
    pub fn payload_len(frame_len: usize) -> usize {
        frame_len.saturating_sub(FOOTER_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_sits_at_end_of_frame() {
        let footer = Footer {
            stream: StreamId::new(3).unwrap(),
            addr: 0x0102_0304,
        };
        let mut frame = b"payload".to_vec();
        frame.extend_from_slice(&footer.encode());
        assert_eq!(&frame[frame.len() - 5..], &[4, 3, 2, 1, 3]);
        assert_eq!(Footer::decode(&frame), Some(Ok(footer)));
        assert_eq!(Footer::payload_len(frame.len()), 7);
    }

    #[test]
    fn short_frame_has_no_footer() {
        assert_eq!(Footer::decode(&[1, 2, 3, 4]), None);
    }

    #[test]
    fn stream_id_is_bounded() {
        assert!(StreamId::new(STREAM_ID_COUNT as u8 - 1).is_ok());
        assert_eq!(
            StreamId::try_from(STREAM_ID_COUNT as u8),
            Err(PipeError::InvalidStream(STREAM_ID_COUNT as u8))
        );
        let mut frame = vec![0u8; 4];
        frame.push(0xff);
        assert_eq!(Footer::decode(&frame), Some(Err(PipeError::InvalidStream(0xff))));
    }
}
