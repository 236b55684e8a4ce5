//! Properties used in LoRaWAN MAC processing.

use heapless::Vec;

use crate::device::radio::types::RxQuality;
use crate::encoding::parser::{DevAddr, MAX_FRM_PAYLOAD_SIZE};

/// Basic send/receive properties.
///
/// Fields left as `None` fall back to the region defaults.
#[derive(Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Configuration {
    /// Aggregated duty cycle exponent set by DutyCycleReq, the limit is `1 / 2^max_duty_cycle`.
    pub(crate) max_duty_cycle: u8,
    pub(crate) tx_power: Option<i8>,
    pub(crate) tx_data_rate: Option<DR>,
    pub(crate) rx1_data_rate_offset: Option<u8>,
    pub(crate) rx_delay: Option<u8>,
    pub(crate) rx2_data_rate: Option<DR>,
    pub(crate) rx2_frequency: Option<u32>,
    pub(crate) number_of_transmissions: u8,
    pub(crate) max_retries: u8,
    pub(crate) max_join_attempts: u8,
    pub(crate) rx_window_ms: u32,
    pub(crate) rx_window_lead_ms: u32,
    pub(crate) class: Class,
    pub(crate) ping_slot_periodicity: u8,
    pub(crate) adr: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_duty_cycle: 0,
            tx_power: None,
            tx_data_rate: None,
            rx1_data_rate_offset: None,
            rx_delay: None,
            rx2_data_rate: None,
            rx2_frequency: None,
            number_of_transmissions: 1,
            max_retries: 8,
            max_join_attempts: 8,
            rx_window_ms: 800,
            rx_window_lead_ms: 20,
            class: Class::A,
            ping_slot_periodicity: 7,
            adr: true,
        }
    }
}

impl Configuration {
    /// Total number of transmissions of a confirmed uplink before giving up.
    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Number of Join-Requests sent before a join is reported as failed.
    pub fn with_max_join_attempts(mut self, attempts: u8) -> Self {
        self.max_join_attempts = attempts.max(1);
        self
    }

    /// How long the radio listens in RX1 and RX2.
    pub fn with_rx_window_ms(mut self, rx_window_ms: u32) -> Self {
        self.rx_window_ms = rx_window_ms;
        self
    }

    /// How early the radio is started ahead of the nominal window opening.
    pub fn with_rx_window_lead_ms(mut self, lead_ms: u32) -> Self {
        self.rx_window_lead_ms = lead_ms;
        self
    }

    #[allow(missing_docs)]
    pub fn with_class(mut self, class: Class) -> Self {
        self.class = class;
        self
    }

    /// Ping slot periodicity announced in PingSlotInfoReq, 0 to 7.
    pub fn with_ping_slot_periodicity(mut self, periodicity: u8) -> Self {
        self.ping_slot_periodicity = periodicity.min(7);
        self
    }

    /// Initial uplink data rate.
    pub fn with_data_rate(mut self, dr: DR) -> Self {
        self.tx_data_rate = Some(dr);
        self
    }

    /// Whether the ADR bit is set and ADR back-off runs.
    pub fn with_adr(mut self, adr: bool) -> Self {
        self.adr = adr;
        self
    }

    #[allow(missing_docs)]
    pub fn class(&self) -> Class {
        self.class
    }

    #[allow(missing_docs)]
    pub fn tx_data_rate(&self) -> Option<DR> {
        self.tx_data_rate
    }

    #[allow(missing_docs)]
    pub fn tx_power(&self) -> Option<i8> {
        self.tx_power
    }

    #[allow(missing_docs)]
    pub fn number_of_transmissions(&self) -> u8 {
        self.number_of_transmissions
    }

    #[allow(missing_docs)]
    pub fn rx_delay(&self) -> Option<u8> {
        self.rx_delay
    }

    #[allow(missing_docs)]
    pub fn rx2_frequency(&self) -> Option<u32> {
        self.rx2_frequency
    }

    #[allow(missing_docs)]
    pub fn rx2_data_rate(&self) -> Option<DR> {
        self.rx2_data_rate
    }

    #[allow(missing_docs)]
    pub fn max_duty_cycle(&self) -> u8 {
        self.max_duty_cycle
    }
}

/// Identification properties used to enable communication with a network server.
///
/// The AppKey moves into the security context when the MAC is created.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Credentials {
    pub(crate) app_eui: [u8; 8],
    pub(crate) dev_eui: [u8; 8],
    pub(crate) app_key: [u8; 16],
}

impl Credentials {
    /// EUIs are given most significant byte first, as printed on labels.
    pub fn new(app_eui: [u8; 8], dev_eui: [u8; 8], app_key: [u8; 16]) -> Self {
        Self { app_eui, dev_eui, app_key }
    }

    #[allow(missing_docs)]
    pub fn dev_eui(&self) -> [u8; 8] {
        self.dev_eui
    }

    #[allow(missing_docs)]
    pub fn app_eui(&self) -> [u8; 8] {
        self.app_eui
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum DR {
    _0 = 0,
    _1 = 1,
    _2 = 2,
    _3 = 3,
    _4 = 4,
    _5 = 5,
    _6 = 6,
    _7 = 7,
    _8 = 8,
    _9 = 9,
    _10 = 10,
    _11 = 11,
    _12 = 12,
    _13 = 13,
    _14 = 14,
    _15 = 15,
}

impl DR {
    /// Is this DR within range?
    pub fn in_range(&self, range: (DR, DR)) -> bool {
        (range.0 as u8 <= *self as u8) && (*self as u8 <= range.1 as u8)
    }
}

impl TryFrom<u8> for DR {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DR::_0),
            1 => Ok(DR::_1),
            2 => Ok(DR::_2),
            3 => Ok(DR::_3),
            4 => Ok(DR::_4),
            5 => Ok(DR::_5),
            6 => Ok(DR::_6),
            7 => Ok(DR::_7),
            8 => Ok(DR::_8),
            9 => Ok(DR::_9),
            10 => Ok(DR::_10),
            11 => Ok(DR::_11),
            12 => Ok(DR::_12),
            13 => Ok(DR::_13),
            14 => Ok(DR::_14),
            15 => Ok(DR::_15),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Frame {
    Join,
    Data,
}

/// Receive window a downlink arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Window {
    _1,
    _2,
    /// Class C continuous reception outside RX1.
    Continuous,
    /// Class B ping slot.
    PingSlot,
}

/// Device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Class {
    A,
    B,
    C,
}

/// MAC state. `Idle` with an active session is the joined idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum State {
    Idle,
    Joining,
    Transmitting,
    WaitingRx1,
    WaitingRx2,
    ProcessingDownlink,
    Backoff,
}

/// Application data received in a downlink.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Downlink {
    /// Application port, never 0.
    pub fport: u8,
    /// Decrypted FRMPayload.
    pub data: Vec<u8, MAX_FRM_PAYLOAD_SIZE>,
    #[allow(missing_docs)]
    pub quality: RxQuality,
    #[allow(missing_docs)]
    pub window: Window,
    /// The network has more data pending.
    pub pending: bool,
    /// Group address of a multicast frame, `None` when sent to this device.
    pub multicast: Option<DevAddr>,
}

/// Outcomes reported to the application by [`crate::mac::Mac::next_response`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    /// A Join-Accept was validated and a session installed.
    JoinAccepted,
    /// No valid Join-Accept after the configured number of attempts.
    JoinFailed,
    /// The uplink cycle finished. `acked` is only meaningful for confirmed uplinks.
    UplinkDone {
        #[allow(missing_docs)]
        fcnt: u32,
        #[allow(missing_docs)]
        acked: bool,
    },
    /// The pending uplink was abandoned.
    UplinkFailed(super::Error),
    #[allow(missing_docs)]
    Downlink(Downlink),
    /// A downlink was dropped by the security checks.
    AuthFailed(super::AuthError),
    /// LinkCheckAns arrived.
    LinkCheck {
        #[allow(missing_docs)]
        margin: u8,
        #[allow(missing_docs)]
        gateway_count: u8,
    },
    /// DeviceTimeAns arrived.
    DeviceTime {
        /// GPS epoch seconds.
        seconds: u32,
        /// Fraction of a second in 1/256 s steps.
        fractional: u8,
    },
    /// A beacon was received and the device is synchronized.
    BeaconLocked {
        /// GPS time of the beacon in seconds.
        time: u32,
    },
    /// No beacon for longer than the allowed beacon-less period; Class B stopped.
    BeaconLost,
}
