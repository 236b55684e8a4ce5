//! Processing for the EU868 region, which uses a dynamic channel plan.

use super::{BeaconLayout, Error, RegionId};
use crate::device::radio::types::{Bandwidth, CodingRate, Datarate, SpreadingFactor};
use crate::encoding::parser::DevAddr;
use crate::mac::types::{Frame, DR};

const JOIN_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];
const BEACON_FREQUENCY: u32 = 869_525_000;
/// g, g1, g2, g3 and the 869.7 MHz band: 1 %, 1 %, 0.1 %, 10 %, 1 %.
const BAND_DIVISORS: [u16; 5] = [100, 100, 1000, 10, 100];

/// Specific processing for the EU868 region.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EU868;
impl crate::mac::Region for EU868 {
    const ID: RegionId = RegionId::EU868;

    fn default_channels(_is_uplink: bool) -> usize {
        3
    }
    fn mandatory_frequency(index: usize, _is_uplink: bool) -> u32 {
        JOIN_CHANNELS.get(index).copied().unwrap_or(JOIN_CHANNELS[0])
    }
    fn mandatory_ul_data_rate_range(_index: usize) -> (DR, DR) {
        (DR::_0, DR::_5)
    }
    fn ul_data_rate_range() -> (DR, DR) {
        (DR::_0, DR::_5)
    }
    fn min_frequency() -> u32 {
        863000000
    }
    fn max_frequency() -> u32 {
        870000000
    }
    fn default_rx2_frequency() -> u32 {
        869525000
    }
    fn default_rx2_data_rate() -> DR {
        DR::_0
    }
    fn default_data_rate() -> DR {
        DR::_0
    }
    fn override_ul_data_rate_if_necessary(dr: DR, _frame: Frame, _ul_frequency: u32) -> DR {
        if dr.in_range(EU868::ul_data_rate_range()) {
            dr
        } else {
            EU868::default_data_rate()
        }
    }

    fn default_rx1_data_rate_offset() -> u8 {
        0
    }

    fn convert_data_rate(dr: DR) -> Result<Datarate, super::Error> {
        match dr {
            DR::_0 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_12,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_1 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_11,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_2 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_10,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_3 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_9,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_4 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_8,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_5 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_7,
                bandwidth: Bandwidth::_125KHz,
            }),
            DR::_6 => Ok(Datarate {
                spreading_factor: SpreadingFactor::_7,
                bandwidth: Bandwidth::_250KHz,
            }),
            _ => Err(super::Error::DataRateNotSupported(dr)),
        }
    }

    fn next_lower_data_rate(dr: DR) -> DR {
        match dr {
            DR::_0 => DR::_0,
            _ => DR::try_from(dr as u8 - 1).unwrap_or(DR::_0).min(DR::_5),
        }
    }

    fn default_coding_rate() -> CodingRate {
        CodingRate::_4_5
    }
    fn max_eirp() -> i8 {
        16
    }
    fn supports_tx_param_setup() -> bool {
        false
    }

    fn modify_dbm(tx_power: u8, cur_dbm: Option<i8>, max_eirp: i8) -> Result<Option<i8>, Error> {
        match tx_power {
            0..=7 => {
                let next_dbm = max_eirp.checked_sub_unsigned(tx_power * 2);
                if next_dbm.is_none() {
                    Err(Error::InvalidTxPower)
                } else {
                    Ok(next_dbm)
                }
            }
            15 => Ok(cur_dbm),
            _ => Err(Error::InvalidTxPower),
        }
    }

    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, super::Error> {
        if rx1_dr_offset > 5 {
            return Err(super::Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        if !ul_dr.in_range((DR::_0, DR::_7)) {
            return Err(super::Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        Ok(DR::try_from((ul_dr as u8).saturating_sub(rx1_dr_offset)).unwrap_or(DR::_0))
    }

    fn max_payload_size(dr: DR) -> usize {
        match dr {
            DR::_0 | DR::_1 | DR::_2 => 51,
            DR::_3 => 115,
            _ => 242,
        }
    }

    fn band_divisors() -> &'static [u16] {
        &BAND_DIVISORS
    }

    fn band_for_frequency(frequency: u32) -> Option<usize> {
        match frequency {
            863_000_000..=864_999_999 => Some(2),
            865_000_000..=868_000_000 => Some(0),
            868_000_001..=868_600_000 => Some(1),
            868_700_000..=869_200_000 => Some(2),
            869_400_000..=869_650_000 => Some(3),
            869_700_000..=870_000_000 => Some(4),
            _ => None,
        }
    }

    fn beacon_frequency(_beacon_time: u32) -> u32 {
        BEACON_FREQUENCY
    }

    fn beacon_data_rate() -> DR {
        DR::_3
    }

    fn beacon_layout() -> BeaconLayout {
        BeaconLayout { rfu1: 2, rfu2: 0 }
    }

    fn ping_slot_frequency(_dev_addr: DevAddr, _beacon_time: u32) -> u32 {
        BEACON_FREQUENCY
    }

    fn ping_slot_data_rate() -> DR {
        DR::_3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::Region;

    #[test]
    fn frequencies_map_to_bands() {
        assert_eq!(EU868::band_for_frequency(868_100_000), Some(1));
        assert_eq!(EU868::band_for_frequency(867_100_000), Some(0));
        assert_eq!(EU868::band_for_frequency(864_000_000), Some(2));
        assert_eq!(EU868::band_for_frequency(869_525_000), Some(3));
        assert_eq!(EU868::band_for_frequency(869_850_000), Some(4));
        assert_eq!(EU868::band_for_frequency(868_650_000), None);
        assert_eq!(EU868::band_for_frequency(915_000_000), None);
        assert_eq!(EU868::band_divisors()[3], 10);
    }

    #[test]
    fn rx1_data_rate_follows_offset() {
        assert_eq!(EU868::get_rx1_dr(DR::_5, 2), Ok(DR::_3));
        assert_eq!(EU868::get_rx1_dr(DR::_1, 3), Ok(DR::_0));
        assert!(EU868::get_rx1_dr(DR::_5, 6).is_err());
    }

    #[test]
    fn tx_power_steps() {
        assert_eq!(EU868::modify_dbm(0, None, 16), Ok(Some(16)));
        assert_eq!(EU868::modify_dbm(7, None, 16), Ok(Some(2)));
        assert_eq!(EU868::modify_dbm(15, Some(4), 16), Ok(Some(4)));
        assert_eq!(EU868::modify_dbm(8, None, 16), Err(Error::InvalidTxPower));
    }

    #[test]
    fn lower_data_rates() {
        assert_eq!(EU868::next_lower_data_rate(DR::_5), DR::_4);
        assert_eq!(EU868::next_lower_data_rate(DR::_0), DR::_0);
        assert_eq!(EU868::max_payload_size(DR::_0), 51);
        assert_eq!(EU868::max_payload_size(DR::_5), 242);
    }
}
