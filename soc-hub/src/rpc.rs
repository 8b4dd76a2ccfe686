//! Remote procedure calls over a pipe.
//!
//! Request layout (all integers little-endian):
//!
//! ```text
//! fcode: i32 | param_count: i32 | param_count × descriptor: u32 | input bytes...
//! ```
//!
//! Response layout:
//!
//! ```text
//! fcode: i32 | status: i32 | output bytes...
//! ```
//!
//! A non-zero status carries no outputs; the server replies to every
//! request it can read, including the ones it rejects.
//!
//! Input bytes appear in parameter order for every parameter with the
//! `input` bit set; output bytes likewise for `output`. A descriptor packs
//! the byte length into bits 0..24, with `ptr`, `input` and `output` flags in
//! bits 24, 25 and 26.

use crate::error::{PipeError, RpcError};
use crate::pipe::Pipe;

const LEN_MASK: u32 = 0x00ff_ffff;
const PTR_BIT: u32 = 1 << 24;
const INPUT_BIT: u32 = 1 << 25;
const OUTPUT_BIT: u32 = 1 << 26;

/// Largest parameter length a descriptor can carry.
pub const MAX_PARAM_LEN: usize = LEN_MASK as usize;

/// Bytes in front of the outputs of a response.
pub const RESPONSE_HEADER_LEN: usize = 8;

const STATUS_OK: i32 = 0;
const STATUS_UNKNOWN_FUNCTION: i32 = 1;
const STATUS_BAD_ARGUMENTS: i32 = 2;
const STATUS_FAILED: i32 = 3;

fn status_of(err: &RpcError) -> i32 {
    match err {
        RpcError::UnknownFunction(_) => STATUS_UNKNOWN_FUNCTION,
        RpcError::Truncated { .. }
        | RpcError::ArgCount { .. }
        | RpcError::ArgLength { .. }
        | RpcError::ParamCount(_) => STATUS_BAD_ARGUMENTS,
        _ => STATUS_FAILED,
    }
}

/// Describes one parameter of a remote function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDesc {
    len: u32,
    ptr: bool,
    input: bool,
    output: bool,
}

impl ParamDesc {
    /// A by-value argument of `len` bytes.
    pub const fn value(len: usize) -> Self {
        Self::new(len, false, true, false)
    }

    /// The return value, `len` bytes.
    pub const fn ret(len: usize) -> Self {
        Self::new(len, false, false, true)
    }

    /// A buffer the callee reads.
    pub const fn in_buffer(len: usize) -> Self {
        Self::new(len, true, true, false)
    }

    /// A buffer the callee fills.
    pub const fn out_buffer(len: usize) -> Self {
        Self::new(len, true, false, true)
    }

    /// A buffer the callee reads and rewrites.
    pub const fn inout_buffer(len: usize) -> Self {
        Self::new(len, true, true, true)
    }

    const fn new(len: usize, ptr: bool, input: bool, output: bool) -> Self {
        assert!(len <= MAX_PARAM_LEN, "parameter too long for a descriptor");
        ParamDesc {
            len: len as u32,
            ptr,
            input,
            output,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_ptr(&self) -> bool {
        self.ptr
    }

    pub fn is_input(&self) -> bool {
        self.input
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn to_word(self) -> u32 {
        let mut w = self.len & LEN_MASK;
        if self.ptr {
            w |= PTR_BIT;
        }
        if self.input {
            w |= INPUT_BIT;
        }
        if self.output {
            w |= OUTPUT_BIT;
        }
        w
    }

    pub fn from_word(w: u32) -> Self {
        ParamDesc {
            len: w & LEN_MASK,
            ptr: w & PTR_BIT != 0,
            input: w & INPUT_BIT != 0,
            output: w & OUTPUT_BIT != 0,
        }
    }
}

fn check_args(params: &[ParamDesc], want: impl Fn(&ParamDesc) -> bool, args: &[&[u8]]) -> Result<usize, RpcError> {
    let expected: Vec<&ParamDesc> = params.iter().filter(|p| want(*p)).collect();
    if expected.len() != args.len() {
        return Err(RpcError::ArgCount {
            expected: expected.len(),
            got: args.len(),
        });
    }
    let mut total = 0;
    for (index, (p, arg)) in expected.iter().zip(args).enumerate() {
        if p.len() != arg.len() {
            return Err(RpcError::ArgLength {
                index,
                expected: p.len(),
                got: arg.len(),
            });
        }
        total += arg.len();
    }
    Ok(total)
}

/// Build a request. `inputs` holds one block per input parameter, in order.
pub fn marshall_request(fcode: i32, params: &[ParamDesc], inputs: &[&[u8]]) -> Result<Vec<u8>, RpcError> {
    let payload = check_args(params, ParamDesc::is_input, inputs)?;
    let mut msg = Vec::with_capacity(8 + 4 * params.len() + payload);
    msg.extend_from_slice(&fcode.to_le_bytes());
    msg.extend_from_slice(&(params.len() as i32).to_le_bytes());
    for p in params {
        msg.extend_from_slice(&p.to_word().to_le_bytes());
    }
    for arg in inputs {
        msg.extend_from_slice(arg);
    }
    Ok(msg)
}

struct Reader<'a> {
    msg: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RpcError> {
        let end = self.pos + n;
        if end > self.msg.len() {
            return Err(RpcError::Truncated {
                needed: end,
                got: self.msg.len(),
            });
        }
        let s = &self.msg[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn word(&mut self) -> Result<[u8; 4], RpcError> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }
}

/// A parsed request. Input blocks borrow from the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest<'a> {
    pub fcode: i32,
    pub params: Vec<ParamDesc>,
    inputs: Vec<Option<&'a [u8]>>,
}

impl<'a> RpcRequest<'a> {
    /// Input bytes of parameter `index`, if it is an input.
    pub fn input(&self, index: usize) -> Option<&'a [u8]> {
        self.inputs.get(index).copied().flatten()
    }

    /// Input blocks in parameter order.
    pub fn inputs(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.inputs.iter().filter_map(|i| *i)
    }
}

pub fn parse_request(msg: &[u8]) -> Result<RpcRequest<'_>, RpcError> {
    let mut r = Reader { msg, pos: 0 };
    let fcode = i32::from_le_bytes(r.word()?);
    let count = i32::from_le_bytes(r.word()?);
    let count = usize::try_from(count).map_err(|_| RpcError::ParamCount(count))?;

    let mut params = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        params.push(ParamDesc::from_word(u32::from_le_bytes(r.word()?)));
    }
    let mut inputs = Vec::with_capacity(params.len());
    for p in &params {
        inputs.push(if p.is_input() { Some(r.take(p.len())?) } else { None });
    }
    Ok(RpcRequest { fcode, params, inputs })
}

/// Build the response to `request`. `outputs` holds one block per output
/// parameter, in order.
pub fn marshall_response(request: &RpcRequest<'_>, outputs: &[&[u8]]) -> Result<Vec<u8>, RpcError> {
    let payload = check_args(&request.params, ParamDesc::is_output, outputs)?;
    let mut msg = Vec::with_capacity(RESPONSE_HEADER_LEN + payload);
    msg.extend_from_slice(&request.fcode.to_le_bytes());
    msg.extend_from_slice(&STATUS_OK.to_le_bytes());
    for out in outputs {
        msg.extend_from_slice(out);
    }
    Ok(msg)
}

/// Build the reply to a request for `fcode` that failed with `err`.
pub fn marshall_error(fcode: i32, err: &RpcError) -> Vec<u8> {
    let mut msg = Vec::with_capacity(RESPONSE_HEADER_LEN);
    msg.extend_from_slice(&fcode.to_le_bytes());
    msg.extend_from_slice(&status_of(err).to_le_bytes());
    msg
}

/// Split a response into its output blocks.
pub fn parse_response<'a>(msg: &'a [u8], fcode: i32, params: &[ParamDesc]) -> Result<Vec<&'a [u8]>, RpcError> {
    let mut r = Reader { msg, pos: 0 };
    let got = i32::from_le_bytes(r.word()?);
    if got != fcode {
        return Err(RpcError::FcodeMismatch { expected: fcode, got });
    }
    match i32::from_le_bytes(r.word()?) {
        STATUS_OK => {}
        STATUS_UNKNOWN_FUNCTION => return Err(RpcError::UnknownFunction(fcode)),
        status => return Err(RpcError::Remote(status)),
    }
    params
        .iter()
        .filter(|p| p.is_output())
        .map(|p| r.take(p.len()))
        .collect()
}

/// Calling side of a pipe.
pub struct RpcClient<'p> {
    pipe: &'p Pipe,
}

impl<'p> RpcClient<'p> {
    pub fn new(pipe: &'p Pipe) -> Self {
        RpcClient { pipe }
    }

    /// Call `fcode` remotely and wait for its outputs, one block per output
    /// parameter.
    ///
    /// Both the request and the response must fit in one frame; a call
    /// whose response would not is rejected before anything is sent.
    pub fn call(&self, fcode: i32, params: &[ParamDesc], inputs: &[&[u8]]) -> Result<Vec<Vec<u8>>, RpcError> {
        let reply_len = RESPONSE_HEADER_LEN
            + params.iter().filter(|p| p.is_output()).map(ParamDesc::len).sum::<usize>();
        let max = self.pipe.max_payload();
        if reply_len > max {
            return Err(PipeError::FrameTooLarge { len: reply_len, max }.into());
        }
        let request = marshall_request(fcode, params, inputs)?;
        self.pipe.send(&request)?;
        let response = self.pipe.recv()?;
        let outputs = parse_response(&response, fcode, params)?;
        log::trace!("rpc {} returned {} outputs", fcode, outputs.len());
        Ok(outputs.into_iter().map(<[u8]>::to_vec).collect())
    }
}

/// Serving side of a pipe.
pub struct RpcServer<'p> {
    pipe: &'p Pipe,
}

impl<'p> RpcServer<'p> {
    pub fn new(pipe: &'p Pipe) -> Self {
        RpcServer { pipe }
    }

    /// Receive one request, run `handler` on it and send the response.
    ///
    /// The handler returns one block per output parameter. When it fails
    /// the caller still gets an error reply, and the error is returned.
    /// [`RpcError::Pipe`] means no request arrived; [`RpcError::Reply`]
    /// means one did but its response could not be sent.
    pub fn serve_one<F>(&self, handler: F) -> Result<i32, RpcError>
    where
        F: FnMut(&RpcRequest<'_>) -> Result<Vec<Vec<u8>>, RpcError>,
    {
        let msg = self.pipe.recv()?;
        let Some(word) = msg.get(..4) else {
            log::warn!("dropping {} byte rpc request without a function code", msg.len());
            return Err(RpcError::Truncated { needed: 4, got: msg.len() });
        };
        let fcode = i32::from_le_bytes([word[0], word[1], word[2], word[3]]);

        let err = match respond(&msg, handler) {
            Ok(response) => match self.pipe.send(&response) {
                Ok(_) => return Ok(fcode),
                Err(e) => RpcError::Reply(e),
            },
            Err(e) => e,
        };
        log::warn!("rpc {} failed: {}", fcode, err);
        self.pipe.send(&marshall_error(fcode, &err)).map_err(RpcError::Reply)?;
        Err(err)
    }
}

fn respond<F>(msg: &[u8], mut handler: F) -> Result<Vec<u8>, RpcError>
where
    F: FnMut(&RpcRequest<'_>) -> Result<Vec<Vec<u8>>, RpcError>,
{
    let request = parse_request(msg)?;
    let outputs = handler(&request)?;
    let views: Vec<&[u8]> = outputs.iter().map(Vec::as_slice).collect();
    marshall_response(&request, &views)
}
