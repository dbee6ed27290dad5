// Reasons a device may be suspended
use bitflags::bitflags;

bitflags! {
    /// Why a device is suspended. Several causes can be active at once; the
    /// device only runs again once every cause has been cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SuspendCause: u32 {
        /// Explicitly requested by the user.
        const USER = 1 << 0;
        /// Another application asked for the device.
        const APPLICATION = 1 << 1;
        /// Nothing used the device for longer than the idle timeout.
        const IDLE = 1 << 2;
        /// The user session is inactive.
        const SESSION = 1 << 3;
        const PASSTHROUGH = 1 << 4;
        const INTERNAL = 1 << 5;
        /// Another process holds the device reservation lock.
        const RESERVATION = 1 << 6;
    }
}

impl SuspendCause {
    pub fn is_idle(self) -> bool {
        self.contains(Self::IDLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causes_clear_independently() {
        let mut causes = SuspendCause::IDLE | SuspendCause::RESERVATION;
        assert!(causes.is_idle());

        causes.remove(SuspendCause::IDLE);
        assert!(!causes.is_idle());
        assert_eq!(causes, SuspendCause::RESERVATION);

        causes.remove(SuspendCause::RESERVATION);
        assert!(causes.is_empty());
    }
}
