use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::Timeout;
use crate::protocol_assert;

/// Counting semaphore with bounded waits.
///
/// One unit per available resource. The count never exceeds `max`; giving
/// past it means a resource was returned twice.
pub struct CountingSemaphore {
    count: Mutex<usize>,
    max: usize,
    cond: Condvar,
}

impl CountingSemaphore {
    pub fn new(initial: usize, max: usize) -> Self {
        protocol_assert!(initial <= max, "semaphore initial count {} > max {}", initial, max);
        CountingSemaphore {
            count: Mutex::new(initial),
            max,
            cond: Condvar::new(),
        }
    }

    /// Take one unit, waiting up to `timeout`. Returns `false` on timeout.
    pub fn take(&self, timeout: Timeout) -> bool {
        self.take_n(1, timeout)
    }

    /// Take `n` units at once, waiting up to `timeout` for all of them.
    pub fn take_n(&self, n: usize, timeout: Timeout) -> bool {
        protocol_assert!(n <= self.max, "cannot take {} units from a semaphore of {}", n, self.max);
        let mut count = self.count.lock();
        match timeout {
            Timeout::NoWait => {}
            Timeout::Forever => {
                while *count < n {
                    self.cond.wait(&mut count);
                }
            }
            Timeout::After(d) => {
                let deadline = Instant::now() + d;
                while *count < n {
                    if self.cond.wait_until(&mut count, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        if *count < n {
            return false;
        }
        *count -= n;
        true
    }

    /// Return one unit.
    pub fn give(&self) {
        self.give_n(1);
    }

    /// Return `n` units.
    pub fn give_n(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        protocol_assert!(*count <= self.max, "semaphore over-given: {} > {}", *count, self.max);
        drop(count);
        // Waiters may want different unit counts.
        self.cond.notify_all();
    }

    /// Units currently available.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn take_until_empty() {
        let sem = CountingSemaphore::new(2, 2);
        assert!(sem.take(Timeout::NoWait));
        assert!(sem.take(Timeout::NoWait));
        assert!(!sem.take(Timeout::NoWait));
        assert!(!sem.take(Timeout::millis(10)));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn blocked_take_wakes_on_give() {
        let sem = Arc::new(CountingSemaphore::new(0, 1));
        let s = sem.clone();
        let waiter = thread::spawn(move || s.take(Timeout::After(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        sem.give();
        assert!(waiter.join().unwrap());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn take_n_needs_all_units() {
        let sem = CountingSemaphore::new(1, 4);
        assert!(!sem.take_n(2, Timeout::NoWait));
        sem.give();
        assert!(sem.take_n(2, Timeout::NoWait));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn over_give_is_fatal() {
        let sem = CountingSemaphore::new(1, 1);
        sem.give();
    }
}
