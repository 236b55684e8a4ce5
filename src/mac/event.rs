//! Events fed into the MAC by interrupt handlers and timers.

use heapless::{Deque, Vec};

use crate::device::radio::types::RxQuality;
use crate::device::timer::TimerId;

/// Largest frame the radio can hand over.
pub const MAX_RX_SIZE: usize = 256;

/// Completion of a radio or timer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// The frame passed to `Radio::send` is on air and complete.
    TxDone,
    /// The transmission did not complete in time.
    TxTimeout,
    /// A frame was received.
    RxDone {
        #[allow(missing_docs)]
        payload: Vec<u8, MAX_RX_SIZE>,
        #[allow(missing_docs)]
        quality: RxQuality,
    },
    /// The receive window closed without a preamble.
    RxTimeout,
    /// A frame was received with a bad CRC or header.
    RxError,
    /// A timer armed with `Timer::schedule_once` expired.
    TimerFired(TimerId),
}

impl Event {
    /// Build an `RxDone` from a driver buffer, truncating frames that are too long.
    pub fn rx_done(payload: &[u8], quality: RxQuality) -> Self {
        let len = payload.len().min(MAX_RX_SIZE);
        let mut buf = Vec::new();
        // cannot fail, len is bounded by the capacity
        let _ = buf.extend_from_slice(&payload[..len]);
        Event::RxDone { payload: buf, quality }
    }
}

/// Bounded FIFO of pending events.
pub struct EventQueue<const N: usize> {
    events: Deque<Event, N>,
}

impl<const N: usize> EventQueue<N> {
    #[allow(missing_docs)]
    pub const fn new() -> Self {
        Self { events: Deque::new() }
    }

    /// Append an event; a full queue hands it back.
    pub fn push(&mut self, event: Event) -> Result<(), Event> {
        self.events.push_back(event)
    }

    /// Oldest pending event.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
