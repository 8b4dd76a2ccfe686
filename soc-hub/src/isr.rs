use crate::hub::Peripheral;

/// Whether servicing an interrupt made a higher-priority task runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsrReturn {
    #[default]
    NoYield,
    Yield,
}

impl IsrReturn {
    pub fn yielded(self) -> bool {
        self == IsrReturn::Yield
    }
}

impl core::ops::BitOr for IsrReturn {
    type Output = IsrReturn;

    fn bitor(self, rhs: IsrReturn) -> IsrReturn {
        if self.yielded() || rhs.yielded() {
            IsrReturn::Yield
        } else {
            IsrReturn::NoYield
        }
    }
}

impl core::ops::BitOrAssign for IsrReturn {
    fn bitor_assign(&mut self, rhs: IsrReturn) {
        *self = *self | rhs;
    }
}

/// Interrupt handler for one peripheral.
///
/// The hub calls [`isr`](Self::isr) from its servicing context every time it
/// raises the peripheral's interrupt, passing the status bits it just read
/// and cleared. Implementations must not block: anything that may wait
/// (allocating from a pool, pushing to a full queue, delivering to an
/// application task) is pended on a [`WorkQueue`](crate::osal::WorkQueue)
/// instead, and the handler returns [`IsrReturn::Yield`] when it did so.
pub trait PeripheralIsr: Send + Sync {
    fn isr(&self, peripheral: &Peripheral, status: u32) -> IsrReturn;
}

impl<F> PeripheralIsr for F
where
    F: Fn(&Peripheral, u32) -> IsrReturn + Send + Sync,
{
    fn isr(&self, peripheral: &Peripheral, status: u32) -> IsrReturn {
        self(peripheral, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yield_is_sticky_under_or() {
        let mut r = IsrReturn::NoYield;
        r |= IsrReturn::NoYield;
        assert!(!r.yielded());
        r |= IsrReturn::Yield;
        r |= IsrReturn::NoYield;
        assert!(r.yielded());
    }
}
