//! Hardware channel model.
//!
//! A [`ChanEnd`] is one end of a full-duplex point-to-point channel. Two
//! ends created by [`chan_pair`] talk to each other; the FIFO in each
//! direction holds [`CHANNEL_FIFO_DEPTH`] tokens, so senders block once the
//! peer stops draining.
//!
//! The free functions at the bottom are the device-side ("bitstream") half of
//! the hub's data protocol:
//!
//! | Direction     | Device                        | Hub                           |
//! |---------------|-------------------------------|-------------------------------|
//! | device → hub  | [`tx_dma_xfer`]: `Data`       | receives into an RX slot      |
//! | hub → device  | [`rx_dma_ready`]: waits `Ready` | sends `Ready` when TX pending |
//! |               | [`rx_dma_xfer`]: `Request`    | answers with `Data`           |
//! | interrupt     | [`irq_send`]: `Word`          | ORs the word into the status  |

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::constants::CHANNEL_FIFO_DEPTH;
use crate::error::ChannelError;
use crate::osal::Timeout;
use crate::protocol_assert;

/// Unit of transfer on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Control token: the sender is ready for the next transaction.
    Ready,
    /// A device asks for up to `max_len` bytes.
    Request { max_len: usize },
    /// A block of bytes.
    Data(Vec<u8>),
    /// One 32-bit word.
    Word(u32),
}

impl Token {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Token::Ready => "Ready",
            Token::Request { .. } => "Request",
            Token::Data(_) => "Data",
            Token::Word(_) => "Word",
        }
    }
}

/// One end of a full-duplex channel.
#[derive(Debug)]
pub struct ChanEnd {
    tx: Sender<Token>,
    rx: Receiver<Token>,
}

/// Create a connected pair of channel ends.
pub fn chan_pair() -> (ChanEnd, ChanEnd) {
    let (a_tx, b_rx) = bounded(CHANNEL_FIFO_DEPTH);
    let (b_tx, a_rx) = bounded(CHANNEL_FIFO_DEPTH);
    (ChanEnd { tx: a_tx, rx: a_rx }, ChanEnd { tx: b_tx, rx: b_rx })
}

pub(crate) enum Polled {
    Token(Token),
    Empty,
    Disconnected,
}

impl ChanEnd {
    /// Send a token, blocking while the peer's FIFO is full.
    pub fn out_token(&self, token: Token) -> Result<(), ChannelError> {
        self.tx.send(token).map_err(|_| ChannelError::Disconnected)
    }

    /// Receive the next token, blocking until one arrives.
    pub fn in_token(&self) -> Result<Token, ChannelError> {
        self.rx.recv().map_err(|_| ChannelError::Disconnected)
    }

    /// Receive with a bounded wait. `Ok(None)` on timeout.
    pub fn in_token_timeout(&self, timeout: Timeout) -> Result<Option<Token>, ChannelError> {
        match timeout {
            Timeout::Forever => self.in_token().map(Some),
            Timeout::NoWait => match self.poll() {
                Polled::Token(t) => Ok(Some(t)),
                Polled::Empty => Ok(None),
                Polled::Disconnected => Err(ChannelError::Disconnected),
            },
            Timeout::After(d) => match self.rx.recv_timeout(d) {
                Ok(t) => Ok(Some(t)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
            },
        }
    }

    pub fn out_word(&self, word: u32) -> Result<(), ChannelError> {
        self.out_token(Token::Word(word))
    }

    pub fn in_word(&self) -> Result<u32, ChannelError> {
        match self.in_token()? {
            Token::Word(w) => Ok(w),
            other => Err(unexpected(&other, "Word")),
        }
    }

    pub fn out_bytes(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.out_token(Token::Data(bytes.to_vec()))
    }

    pub fn in_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        match self.in_token()? {
            Token::Data(d) => Ok(d),
            other => Err(unexpected(&other, "Data")),
        }
    }

    pub(crate) fn poll(&self) -> Polled {
        match self.rx.try_recv() {
            Ok(t) => Polled::Token(t),
            Err(TryRecvError::Empty) => Polled::Empty,
            Err(TryRecvError::Disconnected) => Polled::Disconnected,
        }
    }

    /// Hub-side send. The hub never blocks on a channel: a full FIFO here
    /// means the device broke the handshake.
    pub(crate) fn hub_send(&self, token: Token) -> Result<(), ChannelError> {
        match self.tx.try_send(token) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(ChannelError::Disconnected),
            Err(TrySendError::Full(t)) => {
                crate::error::protocol_violation(format_args!("device FIFO full on hub send of {}", t.name()))
            }
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<Token> {
        &self.rx
    }
}

fn unexpected(got: &Token, expected: &'static str) -> ChannelError {
    log::debug!("expected {} token, got {}", expected, got.name());
    ChannelError::UnexpectedToken { expected }
}

/// Device side: wait until the hub has transmit data for this device.
pub fn rx_dma_ready(c: &ChanEnd) -> Result<(), ChannelError> {
    match c.in_token()? {
        Token::Ready => Ok(()),
        other => Err(unexpected(&other, "Ready")),
    }
}

/// Device side: fetch one transmit transfer from the hub into `buf`.
///
/// Must follow [`rx_dma_ready`]. Returns the number of bytes received.
pub fn rx_dma_xfer(c: &ChanEnd, buf: &mut [u8]) -> Result<usize, ChannelError> {
    c.out_token(Token::Request { max_len: buf.len() })?;
    let data = c.in_bytes()?;
    protocol_assert!(
        data.len() <= buf.len(),
        "hub sent {} bytes for a {} byte request",
        data.len(),
        buf.len()
    );
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
}

/// Device side: hand `data` to the hub's receive ring.
pub fn tx_dma_xfer(c: &ChanEnd, data: &[u8]) -> Result<(), ChannelError> {
    c.out_bytes(data)
}

/// Device side: raise device-defined interrupt bits.
pub fn irq_send(c: &ChanEnd, status: u32) -> Result<(), ChannelError> {
    c.out_word(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pair_is_full_duplex() {
        let (a, b) = chan_pair();
        a.out_word(7).unwrap();
        b.out_bytes(b"hi").unwrap();
        assert_eq!(b.in_word().unwrap(), 7);
        assert_eq!(a.in_bytes().unwrap(), b"hi");
    }

    #[test]
    fn wrong_token_is_reported() {
        let (a, b) = chan_pair();
        a.out_word(1).unwrap();
        assert_eq!(
            b.in_bytes(),
            Err(ChannelError::UnexpectedToken { expected: "Data" })
        );
    }

    #[test]
    fn dropped_peer_disconnects() {
        let (a, b) = chan_pair();
        drop(b);
        assert_eq!(a.in_word(), Err(ChannelError::Disconnected));
        assert_eq!(a.out_word(1), Err(ChannelError::Disconnected));
    }

    #[test]
    fn in_token_timeout_expires() {
        let (a, _b) = chan_pair();
        assert_eq!(a.in_token_timeout(Timeout::millis(10)), Ok(None));
        assert_eq!(a.in_token_timeout(Timeout::NoWait), Ok(None));
    }

    #[test]
    fn rx_dma_handshake() {
        let (hub, dev) = chan_pair();
        let device = thread::spawn(move || {
            rx_dma_ready(&dev).unwrap();
            let mut buf = [0u8; 8];
            let n = rx_dma_xfer(&dev, &mut buf).unwrap();
            buf[..n].to_vec()
        });

        hub.hub_send(Token::Ready).unwrap();
        assert_eq!(hub.in_token().unwrap(), Token::Request { max_len: 8 });
        hub.hub_send(Token::Data(b"frame".to_vec())).unwrap();
        assert_eq!(device.join().unwrap(), b"frame");
    }
}
