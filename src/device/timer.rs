//! Single-shot timer service which must be implemented by calling code.

use core::fmt::Debug;

/// Logical timers armed by the MAC.
///
/// The identifier is also the handle: arming an id that is already pending replaces it, and
/// expiry is reported back by posting [`crate::mac::event::Event::TimerFired`] with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Opening of the first receive window.
    Rx1,
    /// Opening of the second receive window.
    Rx2,
    /// Retransmission, join retry or duty-cycle wait.
    Backoff,
    /// Class B beacon window.
    Beacon,
    /// Class B ping slot.
    PingSlot,
}

/// Millisecond timer capable of scheduling single-shot expiries.
pub trait Timer {
    #[cfg(feature = "defmt")]
    /// Implementation specific error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Implementation specific error.
    type Error: Debug;

    /// Monotonic time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Arm `id` to fire once after `delay_ms`.
    fn schedule_once(&mut self, delay_ms: u32, id: TimerId) -> Result<(), Self::Error>;

    /// Disarm `id`. Cancelling a timer which is not armed is not an error.
    fn cancel(&mut self, id: TimerId);

    /// Smallest delay the hardware can schedule.
    fn min_delay_ms(&self) -> u32 {
        1
    }
}
