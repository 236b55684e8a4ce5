//! Class B: beacon tracking and ping slot timing.
//!
//! The MAC opens a long receive window to acquire the first beacon, then wakes up once per
//! beacon period. Between beacons the device listens in ping slots whose position inside the
//! period is derived from the beacon time and the DevAddr. Timestamps are local milliseconds
//! from [`crate::device::timer::Timer::now_ms`].

use crc::{Crc, CRC_16_XMODEM};

use super::region::BeaconLayout;
use super::types::DR;

/// Beacon period.
pub const BEACON_INTERVAL_MS: u64 = 128_000;
/// Time reserved for the beacon at the start of each period.
pub const BEACON_RESERVED_MS: u64 = 2_120;
/// Quiet time ahead of each beacon, no ping slot may start in it.
pub const BEACON_GUARD_MS: u64 = 3_000;
/// Number of ping slots in the beacon window.
pub const BEACON_WINDOW_SLOTS: u32 = 4096;
/// Length of one ping slot.
pub const PING_SLOT_WINDOW_MS: u64 = 30;
/// Without a beacon for this long the device falls back to Class A.
pub const MAX_BEACON_LESS_PERIOD_MS: u64 = 7_200_000;

const BEACON_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Gateway specific part of a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GatewayInfo {
    #[allow(missing_docs)]
    pub info_desc: u8,
    #[allow(missing_docs)]
    pub info: [u8; 6],
}

/// Content of a beacon frame. Each half is only present when its CRC matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Beacon {
    /// GPS time in seconds of the start of the beacon period.
    pub time: Option<u32>,
    #[allow(missing_docs)]
    pub gateway: Option<GatewayInfo>,
}

/// Parse a beacon laid out as `layout`. `None` if the size is wrong or both CRCs fail.
pub fn parse_beacon(payload: &[u8], layout: BeaconLayout) -> Option<Beacon> {
    if payload.len() != layout.size() {
        return None;
    }
    let time_end = layout.rfu1 + 4;
    let crc0 = u16::from_le_bytes([payload[time_end], payload[time_end + 1]]);
    let time = (BEACON_CRC.checksum(&payload[..time_end]) == crc0).then(|| {
        u32::from_le_bytes([
            payload[layout.rfu1],
            payload[layout.rfu1 + 1],
            payload[layout.rfu1 + 2],
            payload[layout.rfu1 + 3],
        ])
    });

    let gw_start = time_end + 2;
    let gw_end = gw_start + 7 + layout.rfu2;
    let crc1 = u16::from_le_bytes([payload[gw_end], payload[gw_end + 1]]);
    let gateway = (BEACON_CRC.checksum(&payload[gw_start..gw_end]) == crc1).then(|| {
        let mut info = [0u8; 6];
        info.copy_from_slice(&payload[gw_start + 1..gw_start + 7]);
        GatewayInfo { info_desc: payload[gw_start], info }
    });

    if time.is_none() && gateway.is_none() {
        None
    } else {
        Some(Beacon { time, gateway })
    }
}

/// Ping slots per beacon period and the distance between them, in slots.
pub fn ping_nb_and_period(periodicity: u8) -> (u16, u16) {
    let periodicity = periodicity.min(7);
    let ping_nb = 1u16 << (7 - periodicity);
    (ping_nb, (BEACON_WINDOW_SLOTS / u32::from(ping_nb)) as u16)
}

/// Beacon tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconState {
    /// Class B not running.
    Off,
    /// Listening for the first beacon.
    Acquisition,
    /// Last expected beacon was received.
    Locked,
    /// Beacons are missed but the last known timing is still used.
    Reacquisition,
}

/// Outcome of an expected beacon not showing up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Missed {
    /// Keep listening with the last known timing.
    Tracking,
    /// The beacon-less period is over; Class B stops.
    Lost,
}

/// Beacon and ping slot bookkeeping.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassB {
    state: BeaconState,
    last_beacon_rx: u64,
    beacon_time: u32,
    ping_nb: u16,
    ping_period: u16,
    ping_offset: u16,
    ping_frequency: Option<u32>,
    ping_data_rate: Option<DR>,
    beacon_frequency: Option<u32>,
}

impl ClassB {
    #[allow(missing_docs)]
    pub fn new(periodicity: u8) -> Self {
        let (ping_nb, ping_period) = ping_nb_and_period(periodicity);
        Self {
            state: BeaconState::Off,
            last_beacon_rx: 0,
            beacon_time: 0,
            ping_nb,
            ping_period,
            ping_offset: 0,
            ping_frequency: None,
            ping_data_rate: None,
            beacon_frequency: None,
        }
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> BeaconState {
        self.state
    }

    /// Ping slots are served while locked or reacquiring.
    pub fn is_tracking(&self) -> bool {
        matches!(self.state, BeaconState::Locked | BeaconState::Reacquisition)
    }

    #[allow(missing_docs)]
    pub fn beacon_time(&self) -> u32 {
        self.beacon_time
    }

    #[allow(missing_docs)]
    pub fn ping_period(&self) -> u16 {
        self.ping_period
    }

    /// Change the periodicity announced in PingSlotInfoReq.
    pub fn set_periodicity(&mut self, periodicity: u8) {
        let (ping_nb, ping_period) = ping_nb_and_period(periodicity);
        self.ping_nb = ping_nb;
        self.ping_period = ping_period;
    }

    /// Listen for a beacon during a whole period; returns the receive timeout.
    pub fn start_acquisition(&mut self) -> u32 {
        self.state = BeaconState::Acquisition;
        BEACON_INTERVAL_MS as u32
    }

    #[allow(missing_docs)]
    pub fn stop(&mut self) {
        self.state = BeaconState::Off;
    }

    /// A beacon arrived whose transmission started at `rx_start_ms`. Returns its GPS time.
    pub fn on_beacon(&mut self, beacon: &Beacon, rx_start_ms: u64) -> u32 {
        self.beacon_time = match beacon.time {
            Some(time) => time,
            None => self.beacon_time.wrapping_add((BEACON_INTERVAL_MS / 1000) as u32),
        };
        self.last_beacon_rx = rx_start_ms;
        self.state = BeaconState::Locked;
        self.beacon_time
    }

    /// The expected beacon did not arrive by `now_ms`.
    pub fn on_beacon_missed(&mut self, now_ms: u64) -> Missed {
        if self.state == BeaconState::Acquisition
            || now_ms.saturating_sub(self.last_beacon_rx) > MAX_BEACON_LESS_PERIOD_MS
        {
            self.state = BeaconState::Off;
            return Missed::Lost;
        }
        self.beacon_time = self.beacon_time.wrapping_add((BEACON_INTERVAL_MS / 1000) as u32);
        self.state = BeaconState::Reacquisition;
        Missed::Tracking
    }

    fn period_start(&self, now_ms: u64) -> u64 {
        now_ms - (now_ms.saturating_sub(self.last_beacon_rx) % BEACON_INTERVAL_MS)
    }

    /// Start of the next beacon after `now_ms`.
    pub fn next_beacon_ms(&self, now_ms: u64) -> u64 {
        self.period_start(now_ms) + BEACON_INTERVAL_MS
    }

    #[allow(missing_docs)]
    pub fn set_ping_offset(&mut self, ping_offset: u16) {
        self.ping_offset = ping_offset;
    }

    /// Delay from `now_ms` to the next ping slot of the current period, `None` once the
    /// remaining slots would run into the beacon guard.
    pub fn next_ping_slot_delay(&self, now_ms: u64) -> Option<u64> {
        if !self.is_tracking() {
            return None;
        }
        let slot_spacing = u64::from(self.ping_period) * PING_SLOT_WINDOW_MS;
        let mut slot =
            self.period_start(now_ms) + BEACON_RESERVED_MS + u64::from(self.ping_offset) * PING_SLOT_WINDOW_MS;
        let mut current_slot = 0;
        if slot < now_ms {
            current_slot = (now_ms - slot) / slot_spacing + 1;
            slot += current_slot * slot_spacing;
        }
        let limit = self.next_beacon_ms(now_ms) - BEACON_GUARD_MS - PING_SLOT_WINDOW_MS;
        (current_slot < u64::from(self.ping_nb) && slot <= limit).then(|| slot - now_ms)
    }

    /// PingSlotChannelReq: `None` restores the region default.
    pub fn set_ping_slot_channel(&mut self, frequency: Option<u32>, data_rate: DR) {
        self.ping_frequency = frequency;
        self.ping_data_rate = frequency.map(|_| data_rate);
    }

    #[allow(missing_docs)]
    pub fn ping_slot_channel(&self) -> (Option<u32>, Option<DR>) {
        (self.ping_frequency, self.ping_data_rate)
    }

    /// BeaconFreqReq: `None` restores the region default.
    pub fn set_beacon_frequency(&mut self, frequency: Option<u32>) {
        self.beacon_frequency = frequency;
    }

    #[allow(missing_docs)]
    pub fn beacon_frequency(&self) -> Option<u32> {
        self.beacon_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EU: BeaconLayout = BeaconLayout { rfu1: 2, rfu2: 0 };

    fn beacon(time: u32) -> [u8; 17] {
        let mut frame = [0u8; 17];
        frame[2..6].copy_from_slice(&time.to_le_bytes());
        let crc = BEACON_CRC.checksum(&frame[..6]);
        frame[6..8].copy_from_slice(&crc.to_le_bytes());
        frame[8] = 0x01;
        frame[9..15].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let crc = BEACON_CRC.checksum(&frame[8..15]);
        frame[15..17].copy_from_slice(&crc.to_le_bytes());
        frame
    }

    #[test]
    fn crc_is_xmodem() {
        assert_eq!(BEACON_CRC.checksum(b"123456789"), 0x31c3);
    }

    #[test]
    fn parse_valid_beacon() {
        let parsed = parse_beacon(&beacon(1_234_567_808), EU).unwrap();
        assert_eq!(parsed.time, Some(1_234_567_808));
        assert_eq!(parsed.gateway, Some(GatewayInfo { info_desc: 1, info: [1, 2, 3, 4, 5, 6] }));
    }

    #[test]
    fn parse_rejects_bad_beacons() {
        let mut frame = beacon(128);
        assert!(parse_beacon(&frame[..16], EU).is_none());
        frame[3] ^= 0xff;
        let parsed = parse_beacon(&frame, EU).unwrap();
        assert_eq!(parsed.time, None);
        assert!(parsed.gateway.is_some());
        frame[10] ^= 0xff;
        assert!(parse_beacon(&frame, EU).is_none());
    }

    #[test]
    fn periodicity() {
        assert_eq!(ping_nb_and_period(0), (128, 32));
        assert_eq!(ping_nb_and_period(7), (1, 4096));
    }

    #[test]
    fn ping_slots_inside_period() {
        let mut class_b = ClassB::new(7);
        class_b.on_beacon(&Beacon { time: Some(128), gateway: None }, 0);
        class_b.set_ping_offset(100);
        assert_eq!(class_b.next_ping_slot_delay(1_000), Some(4_120));
        // single slot per period already passed
        assert_eq!(class_b.next_ping_slot_delay(6_000), None);
        // next period
        assert_eq!(class_b.next_ping_slot_delay(128_000), Some(5_120));

        let mut class_b = ClassB::new(0);
        class_b.on_beacon(&Beacon { time: Some(128), gateway: None }, 0);
        class_b.set_ping_offset(5);
        assert_eq!(class_b.next_ping_slot_delay(3_000), Some(230));
        // last slots collide with the guard
        assert_eq!(class_b.next_ping_slot_delay(124_900), None);
    }

    #[test]
    fn beacon_loss() {
        let mut class_b = ClassB::new(7);
        class_b.start_acquisition();
        assert_eq!(class_b.on_beacon_missed(128_000), Missed::Lost);

        class_b.start_acquisition();
        class_b.on_beacon(&Beacon { time: Some(1_000), gateway: None }, 0);
        assert_eq!(class_b.on_beacon_missed(128_000), Missed::Tracking);
        assert_eq!(class_b.beacon_time(), 1_128);
        assert_eq!(class_b.state(), BeaconState::Reacquisition);
        assert!(class_b.next_ping_slot_delay(130_000).is_some());
        assert_eq!(class_b.on_beacon_missed(MAX_BEACON_LESS_PERIOD_MS + 1), Missed::Lost);
        assert_eq!(class_b.state(), BeaconState::Off);
    }
}
