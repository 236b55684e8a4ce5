//! Duty-cycle accounting per sub-band.
//!
//! After a transmission of `airtime` ms in a band with divisor `d` (a 1/d duty cycle), the band
//! stays closed for `airtime * d` ms after the end of the transmission. Join-Requests are
//! further limited by the join back-off divisor and every uplink by the aggregated duty cycle
//! the network sets with DutyCycleReq. The most restrictive limit wins.

use heapless::Vec;

/// Largest number of bands a region may declare.
pub const MAX_BANDS: usize = 8;

const HOUR_MS: u64 = 3_600_000;

/// Join back-off divisor after `elapsed_ms` of join attempts: 1 % during the first hour,
/// 0.1 % until 11 hours, 0.01 % afterwards.
pub fn join_duty_cycle_divisor(elapsed_ms: u64) -> u32 {
    if elapsed_ms < HOUR_MS {
        100
    } else if elapsed_ms < 11 * HOUR_MS {
        1000
    } else {
        10000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Band {
    divisor: u32,
    last_tx_end: Option<u64>,
    time_off: u64,
}

impl Band {
    fn blocked_until(&self) -> u64 {
        self.last_tx_end.map(|end| end + self.time_off).unwrap_or(0)
    }
}

/// Duty-cycle state of the bands of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Bands {
    bands: Vec<Band, MAX_BANDS>,
    aggregated_divisor: u32,
    aggregated_until: u64,
    join_started_at: Option<u64>,
}

impl Bands {
    /// One band per entry of `divisors`; a divisor of 1 means no restriction.
    pub fn new(divisors: &[u16]) -> Self {
        let mut bands = Vec::new();
        for divisor in divisors.iter().take(MAX_BANDS) {
            let band = Band { divisor: u32::from(*divisor).max(1), last_tx_end: None, time_off: 0 };
            // cannot fail, bounded by take above
            let _ = bands.push(band);
        }
        Self { bands, aggregated_divisor: 1, aggregated_until: 0, join_started_at: None }
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Apply a DutyCycleReq: the aggregated limit becomes `1 / 2^max_duty_cycle`.
    pub fn set_aggregated_duty_cycle(&mut self, max_duty_cycle: u8) {
        self.aggregated_divisor = 1 << max_duty_cycle.min(15);
    }

    /// Enter join mode: subsequent transmissions also obey the join back-off divisor.
    pub fn start_join(&mut self, now_ms: u64) {
        if self.join_started_at.is_none() {
            self.join_started_at = Some(now_ms);
        }
    }

    /// Leave join mode after a successful join.
    pub fn end_join(&mut self) {
        self.join_started_at = None;
    }

    fn divisor(&self, band: usize, tx_end_ms: u64) -> u32 {
        let divisor = self.bands.get(band).map(|b| b.divisor).unwrap_or(1);
        match self.join_started_at {
            Some(start) => divisor.max(join_duty_cycle_divisor(tx_end_ms.saturating_sub(start))),
            None => divisor,
        }
    }

    /// Account a transmission of `airtime_ms` ending at `tx_end_ms` on `band`.
    pub fn record_transmission(&mut self, band: usize, airtime_ms: u32, tx_end_ms: u64) {
        let divisor = self.divisor(band, tx_end_ms);
        if let Some(b) = self.bands.get_mut(band) {
            b.time_off = u64::from(airtime_ms) * u64::from(divisor);
            b.last_tx_end = Some(tx_end_ms);
        }
        if self.aggregated_divisor > 1 {
            self.aggregated_until = tx_end_ms + u64::from(airtime_ms) * u64::from(self.aggregated_divisor);
        }
        trace!("band {} closed until {}", band, tx_end_ms + u64::from(airtime_ms) * u64::from(divisor));
    }

    /// Whether `band` may transmit at `now_ms`.
    pub fn is_band_available(&self, band: usize, now_ms: u64) -> bool {
        self.time_until_available(band, now_ms) == 0
    }

    /// Milliseconds until `band` may transmit, 0 if it may transmit now.
    pub fn time_until_available(&self, band: usize, now_ms: u64) -> u64 {
        let band_until = self.bands.get(band).map(|b| b.blocked_until()).unwrap_or(0);
        band_until.max(self.aggregated_until).saturating_sub(now_ms)
    }
}
