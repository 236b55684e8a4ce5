//! Specification of functionality implemented for each supported LoRaWAN region.

use crate::device::radio::types::{CodingRate, Datarate};
use crate::device::Device;
use crate::encoding::parser::DevAddr;

use super::types::{Frame, DR};
pub mod channel_plan;

/// Regions with an area reserved in the persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum RegionId {
    EU868,
    US915,
    CN470,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    InvalidTxPower,
    InvalidChannelIndex,
    InvalidChannelMaskCtrl,
    InvalidFrequency,
    DataRateNotSupported(DR),
    UnsupportedRx1DROffset(DR, u8),
    /// No enabled channel supports the requested data rate.
    NoChannelAvailable,
    /// Channels exist but every one of them sits in a band closed by the duty cycle.
    DutyCycleRestricted {
        /// Time until the earliest band opens again.
        wait_ms: u64,
    },
    InvalidCfListType,
    CommandNotImplementedForRegion,
}
impl<D> From<Error> for crate::Error<D>
where
    D: Device,
{
    fn from(value: Error) -> Self {
        Self::Region(value)
    }
}

/// Position of the variable parts of a Class B beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BeaconLayout {
    /// RFU bytes ahead of the time field.
    pub rfu1: usize,
    /// RFU bytes between the gateway specific part and the second CRC.
    pub rfu2: usize,
}

impl BeaconLayout {
    /// Total length of a beacon frame.
    pub const fn size(&self) -> usize {
        self.rfu1 + 4 + 2 + 7 + self.rfu2 + 2
    }
}

/// Specification of functionality to describe regional characteristics.
pub trait Region {
    /// Key of the region in the storage layout.
    const ID: RegionId;
    /// Get the number of default uplink or downlink channels for the region.
    fn default_channels(is_uplink: bool) -> usize;
    /// Get the default uplink or downlink frequency based on channel index for the region.
    fn mandatory_frequency(index: usize, is_uplink: bool) -> u32;
    /// Get the default uplink data rate based on channel index for the region.
    fn mandatory_ul_data_rate_range(index: usize) -> (DR, DR);
    /// Get the uplink data rate range.
    fn ul_data_rate_range() -> (DR, DR);
    /// Get the default data rate for the region.
    fn default_data_rate() -> DR;
    /// Override the uplink data rate based on region, frame type (join or data), and frequency.
    fn override_ul_data_rate_if_necessary(dr: DR, frame: Frame, ul_frequency: u32) -> DR;
    /// Get the default coding rate for the region.
    fn default_coding_rate() -> CodingRate;
    /// Get the default RX2 frequency for the region.
    fn default_rx2_frequency() -> u32;
    /// Get the default RX2 data rate for the region.
    fn default_rx2_data_rate() -> DR;
    /// Get the maximum EIRP for the region.
    fn max_eirp() -> i8;
    /// Get the minimum frequency for the region.
    fn min_frequency() -> u32;
    /// Get the maximum frequency for the region.
    fn max_frequency() -> u32;
    /// Convert the data rate to spreading factor and bandwidth for the region.
    fn convert_data_rate(dr: DR) -> Result<Datarate, Error>;
    /// Next lower uplink data rate for ADR back-off, the lowest rate maps to itself.
    fn next_lower_data_rate(dr: DR) -> DR;
    /// For the region, determine the RX1 data rate based on the uplink data rate and data rate offset.
    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, Error>;
    /// Does the region support TXParamSetupReq packet processing?
    fn supports_tx_param_setup() -> bool;
    /// Based on the LinkADRReq packet and the region, modify the configured transmission power.
    fn modify_dbm(tx_power: u8, cur_dbm: Option<i8>, max_eirp: i8) -> Result<Option<i8>, Error>;
    /// Largest application payload (N) at `dr`.
    fn max_payload_size(dr: DR) -> usize;
    /// Duty-cycle divisors of the sub-bands, 1 for an unrestricted band.
    fn band_divisors() -> &'static [u16];
    /// Sub-band `frequency` belongs to, `None` outside every band.
    fn band_for_frequency(frequency: u32) -> Option<usize>;
    /// Frequency the beacon of `beacon_time` is sent on.
    fn beacon_frequency(beacon_time: u32) -> u32;
    /// Data rate of beacons.
    fn beacon_data_rate() -> DR;
    #[allow(missing_docs)]
    fn beacon_layout() -> BeaconLayout;
    /// Default ping slot frequency for `dev_addr` during the beacon period of `beacon_time`.
    fn ping_slot_frequency(dev_addr: DevAddr, beacon_time: u32) -> u32;
    /// Default ping slot data rate.
    fn ping_slot_data_rate() -> DR;
    /// Get the default RX delay for the region.
    fn default_rx_delay() -> u32 {
        1000
    }
    /// Get the default RX1 data rate offset for the region.
    fn default_rx1_data_rate_offset() -> u8;
    /// Get the default delay from the end of transmission to the RX1 window of a join.
    fn default_join_accept_delay1() -> u32 {
        5000
    }
    /// Get the default delay from the end of transmission to the RX2 window of a join.
    fn default_join_accept_delay2() -> u32 {
        Self::default_join_accept_delay1() + 1000
    }
}

pub mod eu868;
pub mod us915;
