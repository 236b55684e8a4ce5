//! Processing for the US915 region, which uses a fixed channel plan.

use super::{BeaconLayout, Error, RegionId};
use crate::device::radio::types::{Bandwidth, CodingRate, Datarate, SpreadingFactor};
use crate::encoding::parser::DevAddr;
use crate::mac::types::{Frame, DR};

const DOWNLINK_CHANNELS: u32 = 8;

/// Specific processing for the US915 region.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct US915;

impl US915 {
    fn downlink_frequency(index: u32) -> u32 {
        923_300_000 + 600_000 * (index % DOWNLINK_CHANNELS)
    }
}

impl crate::mac::Region for US915 {
    const ID: RegionId = RegionId::US915;

    fn default_channels(is_uplink: bool) -> usize {
        if is_uplink {
            72
        } else {
            8
        }
    }

    fn mandatory_frequency(index: usize, is_uplink: bool) -> u32 {
        let index = index as u32;
        if is_uplink {
            // upstream: 64 (902.3 to 914.9 [+ by 0.2]) + 8 (903.0 to 914.2 [+ by 1.6])
            if index < 64 {
                902_300_000 + (200_000 * index)
            } else {
                903_000_000 + (1_600_000 * (index - 64))
            }
        } else {
            // downstream: 8 (923.3 to 927.5 [+ by 0.6])
            Self::downlink_frequency(index)
        }
    }

    fn mandatory_ul_data_rate_range(index: usize) -> (DR, DR) {
        // 64 125 KHz channels using DR0 through DR3 + 8 500 KHz channels using DR4
        if index < 64 {
            (DR::_0, DR::_3)
        } else {
            (DR::_4, DR::_4)
        }
    }

    fn ul_data_rate_range() -> (DR, DR) {
        (DR::_0, DR::_4)
    }

    fn default_data_rate() -> DR {
        DR::_0
    }

    fn override_ul_data_rate_if_necessary(dr: DR, frame: Frame, ul_frequency: u32) -> DR {
        // the 8 500KHz uplink channels always use DR4
        for index in 0..8 {
            if (903_000_000 + (1_600_000 * index)) == ul_frequency {
                return DR::_4;
            }
        }

        // adjust the DR for the 125KHz channels as necessary
        if frame == Frame::Join {
            DR::_0
        } else if dr.in_range((DR::_0, DR::_3)) {
            dr
        } else {
            US915::default_data_rate()
        }
    }

    fn default_coding_rate() -> CodingRate {
        CodingRate::_4_5
    }

    fn default_rx2_frequency() -> u32 {
        923_300_000
    }

    fn default_rx2_data_rate() -> DR {
        DR::_8
    }

    fn max_eirp() -> i8 {
        30
    }

    fn min_frequency() -> u32 {
        902000000
    }

    fn max_frequency() -> u32 {
        928000000
    }

    fn convert_data_rate(dr: DR) -> Result<Datarate, super::Error> {
        match dr {
            DR::_0 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_10,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_1 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_9,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_2 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_8,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_3 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_7,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_4 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_8,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_8 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_12,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_9 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_11,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_10 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_10,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_11 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_9,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_12 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_8,
                bandwidth: Bandwidth::_500KHz,
            }),
            DR::_13 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_7,
                bandwidth: Bandwidth::_500KHz,
            }),
            _ => Err(super::Error::DataRateNotSupported(dr)),
        }
    }

    fn next_lower_data_rate(dr: DR) -> DR {
        match dr {
            DR::_1 => DR::_0,
            DR::_2 => DR::_1,
            DR::_3 => DR::_2,
            DR::_4 => DR::_3,
            _ => DR::_0,
        }
    }

    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, super::Error> {
        if rx1_dr_offset > 3 {
            return Err(super::Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        let dl_dr_matrix = [
            [DR::_10, DR::_9, DR::_8, DR::_8],
            [DR::_11, DR::_10, DR::_9, DR::_8],
            [DR::_12, DR::_11, DR::_10, DR::_9],
            [DR::_13, DR::_12, DR::_11, DR::_10],
            [DR::_13, DR::_13, DR::_12, DR::_11],
        ];
        match ul_dr {
            DR::_0 | DR::_1 | DR::_2 | DR::_3 | DR::_4 => {
                Ok(dl_dr_matrix[ul_dr as usize][rx1_dr_offset as usize])
            }
            _ => Err(super::Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset)),
        }
    }

    fn supports_tx_param_setup() -> bool {
        false
    }

    fn modify_dbm(tx_power: u8, cur_dbm: Option<i8>, max_eirp: i8) -> Result<Option<i8>, Error> {
        match tx_power {
            0..=10 => Ok(Some(max_eirp.min(Self::max_eirp()) - (tx_power as i8 * 2))),
            15 => Ok(cur_dbm),
            _ => Err(Error::InvalidTxPower),
        }
    }

    fn default_rx1_data_rate_offset() -> u8 {
        0
    }

    fn max_payload_size(dr: DR) -> usize {
        match dr {
            DR::_0 => 11,
            DR::_1 | DR::_8 => 53,
            DR::_2 => 125,
            DR::_9 => 129,
            _ => 242,
        }
    }

    fn band_divisors() -> &'static [u16] {
        &[1]
    }

    fn band_for_frequency(frequency: u32) -> Option<usize> {
        (Self::min_frequency()..=Self::max_frequency()).contains(&frequency).then_some(0)
    }

    fn beacon_frequency(beacon_time: u32) -> u32 {
        Self::downlink_frequency(beacon_time / 128)
    }

    fn beacon_data_rate() -> DR {
        DR::_8
    }

    fn beacon_layout() -> BeaconLayout {
        BeaconLayout { rfu1: 5, rfu2: 3 }
    }

    fn ping_slot_frequency(dev_addr: DevAddr, beacon_time: u32) -> u32 {
        Self::downlink_frequency(dev_addr.0.wrapping_add(beacon_time / 128))
    }

    fn ping_slot_data_rate() -> DR {
        DR::_8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::Region;

    #[test]
    fn channel_frequencies() {
        assert_eq!(US915::mandatory_frequency(0, true), 902_300_000);
        assert_eq!(US915::mandatory_frequency(63, true), 914_900_000);
        assert_eq!(US915::mandatory_frequency(71, true), 914_200_000);
        assert_eq!(US915::mandatory_frequency(7, false), 927_500_000);
        assert_eq!(US915::override_ul_data_rate_if_necessary(DR::_2, Frame::Data, 903_000_000), DR::_4);
    }

    #[test]
    fn beacon_hops_over_downlink_channels() {
        assert_eq!(US915::beacon_frequency(0), 923_300_000);
        assert_eq!(US915::beacon_frequency(128), 923_900_000);
        assert_eq!(US915::beacon_frequency(128 * 8), 923_300_000);
        assert_eq!(US915::ping_slot_frequency(DevAddr(1), 0), 923_900_000);
        assert_eq!(US915::beacon_layout().size(), 23);
    }

    #[test]
    fn tx_power_and_rx1() {
        assert_eq!(US915::modify_dbm(5, None, 30), Ok(Some(20)));
        assert_eq!(US915::modify_dbm(11, None, 30), Err(Error::InvalidTxPower));
        assert_eq!(US915::get_rx1_dr(DR::_0, 0), Ok(DR::_10));
        assert_eq!(US915::get_rx1_dr(DR::_4, 3), Ok(DR::_11));
    }
}
