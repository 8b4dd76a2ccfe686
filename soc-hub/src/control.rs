//! Peripheral control-channel protocol.
//!
//! A control call is a function-code word followed by fixed-length argument
//! blocks in each direction. Both sides must agree on the argument list; a
//! length mismatch means the two halves were built from different
//! definitions and is treated as a protocol violation.
//!
//! ```text
//! driver                          device
//! function_code_tx(c, WRITE) ───► function_code_rx(c)
//! varlist_tx(c, &[addr, data]) ─► varlist_rx(c, &mut [addr, data])
//! varlist_rx(c, &mut [res])  ◄─── varlist_tx(c, &[res])
//! ```

use crate::error::ChannelError;
use crate::hub::ChanEnd;
use crate::protocol_assert;

/// Send a function code.
pub fn function_code_tx(c: &ChanEnd, code: u32) -> Result<(), ChannelError> {
    c.out_word(code)
}

/// Receive a function code.
pub fn function_code_rx(c: &ChanEnd) -> Result<u32, ChannelError> {
    c.in_word()
}

/// Send each argument as one block, in order.
pub fn varlist_tx(c: &ChanEnd, args: &[&[u8]]) -> Result<(), ChannelError> {
    for arg in args {
        c.out_bytes(arg)?;
    }
    Ok(())
}

/// Receive one block into each argument, in order. Every block must match
/// the length of its destination.
pub fn varlist_rx(c: &ChanEnd, args: &mut [&mut [u8]]) -> Result<(), ChannelError> {
    for (i, arg) in args.iter_mut().enumerate() {
        let data = c.in_bytes()?;
        protocol_assert!(
            data.len() == arg.len(),
            "control argument {}: expected {} bytes, got {}",
            i,
            arg.len(),
            data.len()
        );
        arg.copy_from_slice(&data);
    }
    Ok(())
}

/// Device-side handler for control calls.
pub trait PeripheralControl {
    /// Error type for control operations.
    type Error: From<ChannelError>;

    /// Handle one call whose function code was already received. The
    /// handler reads its arguments from `c` and writes its results back.
    fn control(&mut self, code: u32, c: &ChanEnd) -> Result<(), Self::Error>;
}

/// Serve control calls until the driver side disconnects.
pub fn serve_control<H: PeripheralControl>(c: &ChanEnd, handler: &mut H) -> Result<(), H::Error> {
    loop {
        let code = match function_code_rx(c) {
            Ok(code) => code,
            Err(ChannelError::Disconnected) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        log::trace!("control call {:#x}", code);
        handler.control(code, c)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::chan_pair;
    use std::thread;

    const REG_WRITE: u32 = 3;
    const REG_READ: u32 = 4;

    struct Registers([u8; 4]);

    impl PeripheralControl for Registers {
        type Error = ChannelError;

        fn control(&mut self, code: u32, c: &ChanEnd) -> Result<(), ChannelError> {
            match code {
                REG_WRITE => {
                    let (mut reg, mut val) = ([0u8], [0u8]);
                    varlist_rx(c, &mut [&mut reg, &mut val])?;
                    self.0[reg[0] as usize] = val[0];
                    varlist_tx(c, &[&[0]])
                }
                REG_READ => {
                    let mut reg = [0u8];
                    varlist_rx(c, &mut [&mut reg])?;
                    varlist_tx(c, &[&[self.0[reg[0] as usize]], &[0]])
                }
                _ => Err(ChannelError::UnexpectedToken { expected: "function code" }),
            }
        }
    }

    #[test]
    fn register_write_then_read() {
        let (driver, device) = chan_pair();
        let server = thread::spawn(move || {
            let mut regs = Registers([0; 4]);
            serve_control(&device, &mut regs).unwrap();
            regs.0
        });

        function_code_tx(&driver, REG_WRITE).unwrap();
        varlist_tx(&driver, &[&[2], &[0x5a]]).unwrap();
        let mut res = [0xffu8];
        varlist_rx(&driver, &mut [&mut res]).unwrap();
        assert_eq!(res, [0]);

        function_code_tx(&driver, REG_READ).unwrap();
        varlist_tx(&driver, &[&[2]]).unwrap();
        let (mut val, mut res) = ([0u8], [0xffu8]);
        varlist_rx(&driver, &mut [&mut val, &mut res]).unwrap();
        assert_eq!(val, [0x5a]);

        drop(driver);
        assert_eq!(server.join().unwrap(), [0, 0, 0x5a, 0]);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn argument_length_mismatch_is_fatal() {
        let (a, b) = chan_pair();
        varlist_tx(&a, &[&[1, 2, 3]]).unwrap();
        let mut one = [0u8; 1];
        let _ = varlist_rx(&b, &mut [&mut one]);
    }
}
