//! spi-sdmmc - Time keeping for protocol deadlines.
//!
//! Every blocking wait in the driver is bounded by a deadline computed from
//! a monotonic clock, so a card that stops answering surfaces as a timeout
//! instead of a hang.

/// Instant of the driver's monotonic clock, millisecond resolution.
pub type Instant = fugit::TimerInstantU64<1_000>;

/// Duration used for protocol deadlines, millisecond resolution.
pub type Duration = fugit::TimerDurationU64<1_000>;

/// Monotonic time source and scheduler yield used by the polling loops.
pub trait Clock {
    /// Returns the current instant. Must never move backwards.
    fn now(&mut self) -> Instant;

    /// Gives other threads a chance to run between polls of the bus.
    ///
    /// On a bare-metal target without a scheduler the default no-op is
    /// adequate.
    fn yield_now(&mut self) {}
}

impl<T> Clock for &mut T
where
    T: Clock,
{
    fn now(&mut self) -> Instant {
        (*self).now()
    }

    fn yield_now(&mut self) {
        (*self).yield_now()
    }
}
