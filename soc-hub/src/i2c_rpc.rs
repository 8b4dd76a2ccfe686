//! I2C bus access from another tile.
//!
//! The tile that owns the bus runs [`serve_i2c`] on a pipe; any other tile
//! wraps its end of the same pipe in a [`RemoteI2c`], which implements
//! [`embedded_hal::i2c::I2c`] so existing drivers work unchanged.
//!
//! | fcode              | inputs                      | outputs          |
//! |--------------------|-----------------------------|------------------|
//! | `FCODE_WRITE`      | addr, bytes, stop           | bytes sent, status |
//! | `FCODE_READ`       | addr, len, stop             | bytes, status    |
//! | `FCODE_STOP_BIT_SEND` | none                     | status           |
//! | `FCODE_REG_WRITE`  | addr, reg, value            | status           |
//! | `FCODE_REG_READ`   | addr, reg                   | value, status    |
//!
//! The server holds writes sent without a stop bit and issues them together
//! with the next read to the same address, so `write_read` keeps its
//! repeated start.
//!
//! A read and its status byte travel back in one frame, so a single read
//! is limited to the pipe's payload size minus [`READ_REPLY_OVERHEAD`].

use embedded_hal::i2c::{self, Error as _, ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use thiserror::Error;

use crate::constants::{FOOTER_LEN, INTERTILE_BUFSIZE};
use crate::error::{PipeError, RpcError};
use crate::pipe::Pipe;
use crate::rpc::{ParamDesc, RpcClient, RpcRequest, RpcServer, MAX_PARAM_LEN, RESPONSE_HEADER_LEN};

pub const FCODE_WRITE: i32 = 0;
pub const FCODE_READ: i32 = 1;
pub const FCODE_STOP_BIT_SEND: i32 = 2;
pub const FCODE_REG_WRITE: i32 = 3;
pub const FCODE_REG_READ: i32 = 4;

const STATUS_OK: u8 = 0;

/// Response bytes of a read besides the data itself.
pub const READ_REPLY_OVERHEAD: usize = RESPONSE_HEADER_LEN + 1;

fn write_params(len: usize) -> [ParamDesc; 5] {
    [
        ParamDesc::value(1),
        ParamDesc::in_buffer(len),
        ParamDesc::value(1),
        ParamDesc::ret(4),
        ParamDesc::ret(1),
    ]
}

fn read_params(len: usize) -> [ParamDesc; 5] {
    [
        ParamDesc::value(1),
        ParamDesc::value(4),
        ParamDesc::value(1),
        ParamDesc::out_buffer(len),
        ParamDesc::ret(1),
    ]
}

const STOP_BIT_PARAMS: [ParamDesc; 1] = [ParamDesc::ret(1)];

const REG_WRITE_PARAMS: [ParamDesc; 4] = [
    ParamDesc::value(1),
    ParamDesc::value(1),
    ParamDesc::value(1),
    ParamDesc::ret(1),
];

const REG_READ_PARAMS: [ParamDesc; 4] = [
    ParamDesc::value(1),
    ParamDesc::value(1),
    ParamDesc::out_buffer(1),
    ParamDesc::ret(1),
];

fn status_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address) => 1,
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data) => 2,
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown) => 3,
        ErrorKind::Bus => 4,
        ErrorKind::ArbitrationLoss => 5,
        ErrorKind::Overrun => 6,
        _ => 7,
    }
}

fn status_kind(code: u8) -> ErrorKind {
    match code {
        1 => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
        2 => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data),
        3 => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
        4 => ErrorKind::Bus,
        5 => ErrorKind::ArbitrationLoss,
        6 => ErrorKind::Overrun,
        _ => ErrorKind::Other,
    }
}

/// Error from a remote bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum I2cRpcError {
    /// The call did not complete.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The call completed and the remote bus reported a failure.
    #[error("remote i2c error: {0:?}")]
    Bus(ErrorKind),
}

impl i2c::Error for I2cRpcError {
    fn kind(&self) -> ErrorKind {
        match self {
            I2cRpcError::Bus(kind) => *kind,
            I2cRpcError::Rpc(_) => ErrorKind::Other,
        }
    }
}

fn check_status(status: &[u8]) -> Result<(), I2cRpcError> {
    match status {
        [STATUS_OK] => Ok(()),
        [code] => Err(I2cRpcError::Bus(status_kind(*code))),
        _ => Err(RpcError::ArgLength {
            index: 0,
            expected: 1,
            got: status.len(),
        }
        .into()),
    }
}

fn outputs<const N: usize>(out: Vec<Vec<u8>>) -> Result<[Vec<u8>; N], I2cRpcError> {
    let got = out.len();
    out.try_into()
        .map_err(|_| RpcError::ArgCount { expected: N, got }.into())
}

/// I2C master on another tile, reached through a pipe.
pub struct RemoteI2c<'p> {
    rpc: RpcClient<'p>,
}

impl<'p> RemoteI2c<'p> {
    pub fn new(pipe: &'p Pipe) -> Self {
        RemoteI2c {
            rpc: RpcClient::new(pipe),
        }
    }

    fn write_chunk(&self, addr: u8, bytes: &[u8], stop: bool) -> Result<usize, I2cRpcError> {
        if bytes.len() > MAX_PARAM_LEN {
            return Err(RpcError::ArgLength {
                index: 1,
                expected: MAX_PARAM_LEN,
                got: bytes.len(),
            }
            .into());
        }
        let out = self
            .rpc
            .call(FCODE_WRITE, &write_params(bytes.len()), &[&[addr], bytes, &[stop as u8]])?;
        let [sent, status] = outputs::<2>(out)?;
        check_status(&status)?;
        let sent: [u8; 4] = sent.as_slice().try_into().map_err(|_| RpcError::ArgLength {
            index: 0,
            expected: 4,
            got: sent.len(),
        })?;
        Ok(u32::from_le_bytes(sent) as usize)
    }

    /// Fails with [`PipeError::FrameTooLarge`] before touching the bus when
    /// the data cannot come back in one frame.
    fn read_chunk(&self, addr: u8, buf: &mut [u8], stop: bool) -> Result<(), I2cRpcError> {
        if buf.len() > MAX_PARAM_LEN {
            return Err(RpcError::ArgLength {
                index: 3,
                expected: MAX_PARAM_LEN,
                got: buf.len(),
            }
            .into());
        }
        let len = (buf.len() as u32).to_le_bytes();
        let out = self
            .rpc
            .call(FCODE_READ, &read_params(buf.len()), &[&[addr], &len, &[stop as u8]])?;
        let [data, status] = outputs::<2>(out)?;
        check_status(&status)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Release the bus after writes sent without a stop bit.
    pub fn stop_bit_send(&mut self) -> Result<(), I2cRpcError> {
        let [status] = outputs::<1>(self.rpc.call(FCODE_STOP_BIT_SEND, &STOP_BIT_PARAMS, &[])?)?;
        check_status(&status)
    }

    /// Write one 8-bit register.
    pub fn reg_write(&mut self, addr: u8, reg: u8, value: u8) -> Result<(), I2cRpcError> {
        let [status] = outputs::<1>(self.rpc.call(FCODE_REG_WRITE, &REG_WRITE_PARAMS, &[&[addr], &[reg], &[value]])?)?;
        check_status(&status)
    }

    /// Read one 8-bit register.
    pub fn reg_read(&mut self, addr: u8, reg: u8) -> Result<u8, I2cRpcError> {
        let [value, status] = outputs::<2>(self.rpc.call(FCODE_REG_READ, &REG_READ_PARAMS, &[&[addr], &[reg]])?)?;
        check_status(&status)?;
        match value.as_slice() {
            [v] => Ok(*v),
            _ => Err(RpcError::ArgLength {
                index: 0,
                expected: 1,
                got: value.len(),
            }
            .into()),
        }
    }
}

impl ErrorType for RemoteI2c<'_> {
    type Error = I2cRpcError;
}

impl I2c for RemoteI2c<'_> {
    /// Each operation is one remote call; the stop bit is sent after the
    /// last. A read is executed as soon as it arrives, so reads must come
    /// last in a transaction to share its repeated start.
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        let last = operations.len().saturating_sub(1);
        for (i, op) in operations.iter_mut().enumerate() {
            let stop = i == last;
            match op {
                Operation::Write(bytes) => {
                    self.write_chunk(address, bytes, stop)?;
                }
                Operation::Read(buf) => self.read_chunk(address, buf, stop)?,
            }
        }
        Ok(())
    }
}

fn input<'a>(req: &RpcRequest<'a>, index: usize) -> Result<&'a [u8], RpcError> {
    req.input(index).ok_or(RpcError::ArgCount {
        expected: index + 1,
        got: req.inputs().count(),
    })
}

fn byte(req: &RpcRequest<'_>, index: usize) -> Result<u8, RpcError> {
    match input(req, index)? {
        [b] => Ok(*b),
        other => Err(RpcError::ArgLength {
            index,
            expected: 1,
            got: other.len(),
        }),
    }
}

/// Executes remote requests on a local bus.
pub struct I2cServer<I> {
    bus: I,
    /// Longest read the reply frame can carry.
    max_read: usize,
    /// Writes sent without a stop bit, waiting for the rest of their
    /// transaction.
    pending: Option<(u8, Vec<Vec<u8>>)>,
}

impl<I: I2c> I2cServer<I> {
    /// Serve `bus` with reads sized for the default frame.
    pub fn new(bus: I) -> Self {
        I2cServer {
            bus,
            max_read: INTERTILE_BUFSIZE - FOOTER_LEN - READ_REPLY_OVERHEAD,
            pending: None,
        }
    }

    /// Reject reads longer than `max_read` bytes.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    pub fn into_inner(self) -> I {
        self.bus
    }

    fn run(&mut self, addr: u8, writes: &[Vec<u8>], read: Option<&mut [u8]>) -> u8 {
        let mut ops: Vec<Operation<'_>> = writes.iter().map(|w| Operation::Write(w.as_slice())).collect();
        if let Some(buf) = read {
            ops.push(Operation::Read(buf));
        }
        match self.bus.transaction(addr, &mut ops) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                log::debug!("i2c transaction to {:#04x} failed: {:?}", addr, e.kind());
                status_code(e.kind())
            }
        }
    }

    /// Issue held writes on their own.
    fn flush(&mut self) -> u8 {
        match self.pending.take() {
            Some((addr, writes)) => self.run(addr, &writes, None),
            None => STATUS_OK,
        }
    }

    /// Held writes for `addr`. Writes held for another address are issued
    /// first.
    fn pending_for(&mut self, addr: u8) -> Vec<Vec<u8>> {
        match self.pending.take() {
            Some((a, writes)) if a == addr => writes,
            Some(other) => {
                self.pending = Some(other);
                self.flush();
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Handle one request and produce its output blocks.
    pub fn handle(&mut self, req: &RpcRequest<'_>) -> Result<Vec<Vec<u8>>, RpcError> {
        match req.fcode {
            FCODE_WRITE => {
                let addr = byte(req, 0)?;
                let data = input(req, 1)?;
                let stop = byte(req, 2)? != 0;
                let mut writes = self.pending_for(addr);
                writes.push(data.to_vec());
                let status = if stop {
                    self.run(addr, &writes, None)
                } else {
                    self.pending = Some((addr, writes));
                    STATUS_OK
                };
                let sent = if status == STATUS_OK { data.len() as u32 } else { 0 };
                Ok(vec![sent.to_le_bytes().to_vec(), vec![status]])
            }
            FCODE_READ => {
                let addr = byte(req, 0)?;
                let len = input(req, 1)?;
                let len: [u8; 4] = len.try_into().map_err(|_| RpcError::ArgLength {
                    index: 1,
                    expected: 4,
                    got: len.len(),
                })?;
                let len = u32::from_le_bytes(len) as usize;
                if len > self.max_read {
                    return Err(RpcError::ArgLength {
                        index: 1,
                        expected: self.max_read,
                        got: len,
                    });
                }
                let mut buf = vec![0u8; len];
                let writes = self.pending_for(addr);
                let status = self.run(addr, &writes, Some(&mut buf));
                Ok(vec![buf, vec![status]])
            }
            FCODE_STOP_BIT_SEND => Ok(vec![vec![self.flush()]]),
            FCODE_REG_WRITE => {
                let (addr, reg, value) = (byte(req, 0)?, byte(req, 1)?, byte(req, 2)?);
                self.flush();
                let status = self.run(addr, &[vec![reg, value]], None);
                Ok(vec![vec![status]])
            }
            FCODE_REG_READ => {
                let (addr, reg) = (byte(req, 0)?, byte(req, 1)?);
                self.flush();
                let mut value = [0u8];
                let status = self.run(addr, &[vec![reg]], Some(&mut value));
                Ok(vec![value.to_vec(), vec![status]])
            }
            other => Err(RpcError::UnknownFunction(other)),
        }
    }
}

/// Serve bus requests arriving on `pipe` until a receive times out, then
/// hand the bus back.
///
/// The idle timeout is the pipe's receive timeout; with
/// [`Timeout::Forever`](crate::osal::Timeout::Forever) this serves for as
/// long as the pipe delivers. A failed request, or a reply that cannot be
/// sent, only ends that request.
pub fn serve_i2c<I: I2c>(pipe: &Pipe, bus: I) -> Result<I, RpcError> {
    let server = RpcServer::new(pipe);
    let max_read = pipe.max_payload().saturating_sub(READ_REPLY_OVERHEAD);
    let mut i2c = I2cServer::new(bus).with_max_read(max_read);
    loop {
        match server.serve_one(|req| i2c.handle(req)) {
            Ok(fcode) => log::trace!("served i2c call {}", fcode),
            Err(RpcError::Pipe(PipeError::Timeout)) => {
                i2c.flush();
                return Ok(i2c.into_inner());
            }
            Err(RpcError::Pipe(e)) => return Err(RpcError::Pipe(e)),
            Err(e) => log::debug!("i2c call not served: {}", e),
        }
    }
}
