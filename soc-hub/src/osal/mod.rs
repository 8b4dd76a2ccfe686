//! The RTOS contracts the hub and pipe manager depend on.
//!
//! Only the behaviour the core needs is modelled here: bounded waits
//! ([`Timeout`]), a counting semaphore for availability, and a bounded
//! deferred-work queue that interrupt context can feed without blocking.

mod semaphore;
mod work_queue;

pub use semaphore::CountingSemaphore;
pub use work_queue::WorkQueue;

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately.
    NoWait,
    /// Wait up to this long.
    After(Duration),
    /// Wait until the operation succeeds.
    Forever,
}

impl Timeout {
    /// Shorthand for `Timeout::After(Duration::from_millis(ms))`.
    pub const fn millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    /// Absolute deadline, `None` for [`Timeout::Forever`].
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::NoWait => Some(Instant::now()),
            Timeout::After(d) => Some(Instant::now() + d),
            Timeout::Forever => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::NoWait
        } else {
            Timeout::After(d)
        }
    }
}

/// Receive from a queue with a bounded wait.
pub fn queue_receive<T>(rx: &Receiver<T>, timeout: Timeout) -> Option<T> {
    match timeout {
        Timeout::NoWait => rx.try_recv().ok(),
        Timeout::After(d) => match rx.recv_timeout(d) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        },
        Timeout::Forever => rx.recv().ok(),
    }
}

/// Send to a queue with a bounded wait. The value comes back on failure.
pub fn queue_send<T>(tx: &Sender<T>, value: T, timeout: Timeout) -> Result<(), T> {
    match timeout {
        Timeout::NoWait => tx.try_send(value).map_err(|e| match e {
            TrySendError::Full(v) | TrySendError::Disconnected(v) => v,
        }),
        Timeout::After(d) => tx.send_timeout(value, d).map_err(|e| match e {
            SendTimeoutError::Timeout(v) | SendTimeoutError::Disconnected(v) => v,
        }),
        Timeout::Forever => tx.send(value).map_err(|e| e.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn zero_duration_is_no_wait() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::NoWait);
        assert_eq!(Timeout::from(Duration::from_millis(5)), Timeout::millis(5));
    }

    #[test]
    fn queue_helpers_respect_capacity() {
        let (tx, rx) = bounded::<u8>(1);
        assert!(queue_send(&tx, 1, Timeout::NoWait).is_ok());
        assert_eq!(queue_send(&tx, 2, Timeout::millis(10)), Err(2));
        assert_eq!(queue_receive(&rx, Timeout::NoWait), Some(1));
        assert_eq!(queue_receive(&rx, Timeout::millis(10)), None);
    }

    #[test]
    fn forever_has_no_deadline() {
        assert!(Timeout::Forever.deadline().is_none());
        assert!(Timeout::NoWait.deadline().is_some());
    }
}
