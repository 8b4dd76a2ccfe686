//! Software stand-in for the intertile link.
//!
//! On hardware each tile's intertile peripheral is a device that pulls
//! transmit frames out of its hub and pushes them into the other tile's hub.
//! [`IntertileLink`] plays that device: one relay thread per direction,
//! built only from the device-side channel helpers.
//!
//! ```text
//! tile A hub ── data_out ──► relay a→b ── data_in ──► tile B hub
//! tile A hub ◄── data_in ─── relay b→a ◄── data_out ── tile B hub
//! ```

use std::io;
use std::thread::{self, JoinHandle};

use crate::error::ChannelError;
use crate::hub::{chan_pair, rx_dma_ready, rx_dma_xfer, tx_dma_xfer, ChanEnd, PeripheralChannels};

/// Device-side ends of one tile's data channels.
#[derive(Debug)]
pub struct DeviceEnds {
    /// Feeds the tile's receive ring.
    pub data_in: ChanEnd,
    /// Drains the tile's transmit ring.
    pub data_out: ChanEnd,
}

/// Create the data channels for one tile's intertile peripheral.
///
/// The first half is registered with that tile's hub; the second is given
/// to [`IntertileLink::connect`].
pub fn channels_for_tile() -> (PeripheralChannels, DeviceEnds) {
    let (hub_in, dev_in) = chan_pair();
    let (hub_out, dev_out) = chan_pair();
    let hub_side = PeripheralChannels {
        data_in: Some(hub_in),
        data_out: Some(hub_out),
        ..Default::default()
    };
    (
        hub_side,
        DeviceEnds {
            data_in: dev_in,
            data_out: dev_out,
        },
    )
}

/// Two running relays joining tiles `a` and `b`.
///
/// The relays exit when either hub drops its channels. Dropping the link
/// detaches them.
pub struct IntertileLink {
    relays: Vec<JoinHandle<()>>,
}

impl IntertileLink {
    /// Start relaying frames of up to `frame_size` bytes in both directions.
    pub fn connect(a: DeviceEnds, b: DeviceEnds, frame_size: usize) -> io::Result<IntertileLink> {
        let a_to_b = spawn_relay("intertile-a-b", a.data_out, b.data_in, frame_size)?;
        let b_to_a = spawn_relay("intertile-b-a", b.data_out, a.data_in, frame_size)?;
        Ok(IntertileLink {
            relays: vec![a_to_b, b_to_a],
        })
    }

    /// Wait for both relays to exit.
    pub fn join(self) {
        for relay in self.relays {
            if relay.join().is_err() {
                log::error!("intertile relay panicked");
            }
        }
    }
}

fn spawn_relay(name: &str, from: ChanEnd, to: ChanEnd, frame_size: usize) -> io::Result<JoinHandle<()>> {
    let label = name.to_owned();
    thread::Builder::new().name(label.clone()).spawn(move || {
        let mut frame = vec![0u8; frame_size];
        let mut frames = 0u64;
        match relay(&from, &to, &mut frame, &mut frames) {
            Err(ChannelError::Disconnected) => {
                log::debug!("{} stopped after {} frames", label, frames)
            }
            Err(e) => log::warn!("{} stopped after {} frames: {}", label, frames, e),
            Ok(()) => {}
        }
    })
}

fn relay(from: &ChanEnd, to: &ChanEnd, frame: &mut [u8], frames: &mut u64) -> Result<(), ChannelError> {
    loop {
        rx_dma_ready(from)?;
        let len = rx_dma_xfer(from, frame)?;
        tx_dma_xfer(to, &frame[..len])?;
        *frames += 1;
        log::trace!("relayed {} byte frame", len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Token;

    #[test]
    fn relay_moves_one_frame() {
        let (a_hub, a_dev) = channels_for_tile();
        let (b_hub, b_dev) = channels_for_tile();
        let link = IntertileLink::connect(a_dev, b_dev, 16).unwrap();

        let a_out = a_hub.data_out.unwrap();
        let b_in = b_hub.data_in.unwrap();
        a_out.out_token(Token::Ready).unwrap();
        assert_eq!(a_out.in_token().unwrap(), Token::Request { max_len: 16 });
        a_out.out_token(Token::Data(b"frame".to_vec())).unwrap();
        assert_eq!(b_in.in_bytes().unwrap(), b"frame");

        drop((a_out, b_in, a_hub.data_in, b_hub.data_out));
        link.join();
    }
}
