//! Error types and the fatal protocol-violation path.
//!
//! Two classes of failure exist in this crate:
//!
//! - **Recoverable** conditions (pool exhausted, pipe timeouts, routing
//!   misses, malformed RPC messages) are returned as typed `Result` errors.
//! - **Protocol violations** (posting into a busy ring slot, a transfer longer
//!   than its posted buffer, releasing a descriptor twice) are programming
//!   errors. They are logged and then abort the current context through
//!   [`protocol_violation`]. There is no partial-transfer recovery.

use core::fmt;

use thiserror::Error;

/// Assert a hub/ring/pool protocol invariant.
///
/// On failure the message is logged at `error` level and the caller panics
/// with a `"protocol violation: ..."` message.
#[macro_export]
macro_rules! protocol_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::protocol_violation(format_args!($($arg)+));
        }
    };
}

/// Log and panic. Reached only through [`protocol_assert!`] or directly
/// for unconditional violations.
#[cold]
#[track_caller]
pub fn protocol_violation(args: fmt::Arguments<'_>) -> ! {
    log::error!("protocol violation: {}", args);
    panic!("protocol violation: {}", args);
}

/// Buffer pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("buffer was not acquired from this pool")]
    ForeignBuffer,
    #[error("no buffer descriptor became available before the timeout")]
    Exhausted,
}

/// Hardware channel errors seen by device-side helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel peer disconnected")]
    Disconnected,
    #[error("unexpected token on channel: expected {expected}")]
    UnexpectedToken { expected: &'static str },
}

/// Pipe manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("stream id {0} is out of range")]
    InvalidStream(u8),
    #[error("a pipe for stream {stream} address {addr} is already open")]
    AddressInUse { stream: u8, addr: u32 },
    #[error("no free pipe slot for stream {0}")]
    TableFull(u8),
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("timed out")]
    Timeout,
    #[error("no buffer available")]
    NoBuffer,
    #[error("pipe manager is not running")]
    Closed,
    #[error("failed to start the classification worker")]
    WorkerSpawn,
}

/// RPC marshalling errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("message truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("response function code {got} does not match request {expected}")]
    FcodeMismatch { expected: i32, got: i32 },
    #[error("expected {expected} arguments, got {got}")]
    ArgCount { expected: usize, got: usize },
    #[error("argument {index}: expected {expected} bytes, got {got}")]
    ArgLength { index: usize, expected: usize, got: usize },
    #[error("invalid parameter count {0}")]
    ParamCount(i32),
    #[error("unknown function code {0}")]
    UnknownFunction(i32),
    #[error("remote call failed with status {0}")]
    Remote(i32),
    #[error("response not sent: {0}")]
    Reply(PipeError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

/// Returned by [`WorkQueue::pend`](crate::osal::WorkQueue::pend) when the
/// queue is full. Carries the rejected item back to the caller.
pub struct WorkQueueFull<T>(pub T);

impl<T> fmt::Debug for WorkQueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkQueueFull(..)")
    }
}

impl<T> fmt::Display for WorkQueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deferred work queue is full")
    }
}

impl<T> std::error::Error for WorkQueueFull<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "protocol violation: slot 3 busy")]
    fn protocol_assert_panics_with_message() {
        let slot = 3;
        protocol_assert!(slot == 0, "slot {} busy", slot);
    }

    #[test]
    fn protocol_assert_passes_when_true() {
        protocol_assert!(1 + 1 == 2, "arithmetic");
    }

    #[test]
    fn rpc_error_wraps_pipe_error() {
        let e: RpcError = PipeError::Timeout.into();
        assert_eq!(e, RpcError::Pipe(PipeError::Timeout));
        assert_eq!(e.to_string(), "timed out");
    }
}
