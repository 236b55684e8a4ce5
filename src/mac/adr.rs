//! ADR back-off: what the device does on its own when the network stops answering.

use super::region::Region;
use super::types::DR;

/// Uplinks without any downlink before ADRACKReq is set.
pub const ADR_ACK_LIMIT: u32 = 64;
/// Further uplinks between back-off steps.
pub const ADR_ACK_DELAY: u32 = 32;

/// Uplink settings the back-off works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdrSettings {
    #[allow(missing_docs)]
    pub data_rate: DR,
    /// `None` is the region default power.
    pub tx_power: Option<i8>,
    #[allow(missing_docs)]
    pub nb_trans: u8,
}

/// Result of [`calc_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdrDecision {
    /// Set ADRACKReq in the next uplink.
    pub adr_ack_req: bool,
    #[allow(missing_docs)]
    pub settings: AdrSettings,
    /// Re-enable the default channels of the region.
    pub restore_default_channels: bool,
}

/// Settings for the next uplink given `adr_ack_counter` uplinks since the last downlink.
pub fn calc_next<R: Region>(adr_enabled: bool, adr_ack_counter: u32, current: AdrSettings) -> AdrDecision {
    let mut decision =
        AdrDecision { adr_ack_req: false, settings: current, restore_default_channels: false };
    if !adr_enabled {
        return decision;
    }
    let min_dr = R::ul_data_rate_range().0;
    if decision.settings.data_rate < min_dr {
        decision.settings.data_rate = min_dr;
    }

    decision.adr_ack_req = adr_ack_counter >= ADR_ACK_LIMIT;
    if adr_ack_counter >= ADR_ACK_LIMIT + ADR_ACK_DELAY {
        decision.settings.tx_power = None;
    }
    if adr_ack_counter >= ADR_ACK_LIMIT + 2 * ADR_ACK_DELAY
        && (adr_ack_counter - ADR_ACK_LIMIT) % ADR_ACK_DELAY == 0
    {
        if decision.settings.data_rate == min_dr {
            decision.restore_default_channels = true;
            decision.settings.nb_trans = 1;
        }
        decision.settings.data_rate = R::next_lower_data_rate(decision.settings.data_rate);
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::region::eu868::EU868;

    fn settings(dr: DR) -> AdrSettings {
        AdrSettings { data_rate: dr, tx_power: Some(4), nb_trans: 3 }
    }

    #[test]
    fn disabled_adr_changes_nothing() {
        let d = calc_next::<EU868>(false, 500, settings(DR::_5));
        assert_eq!(d.settings, settings(DR::_5));
        assert!(!d.adr_ack_req);
    }

    #[test]
    fn back_off_sequence() {
        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT - 1, settings(DR::_5));
        assert!(!d.adr_ack_req);

        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT, settings(DR::_5));
        assert!(d.adr_ack_req);
        assert_eq!(d.settings.tx_power, Some(4));

        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT + ADR_ACK_DELAY, settings(DR::_5));
        assert_eq!(d.settings.tx_power, None);
        assert_eq!(d.settings.data_rate, DR::_5);

        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT + 2 * ADR_ACK_DELAY, settings(DR::_5));
        assert_eq!(d.settings.data_rate, DR::_4);
        assert_eq!(d.settings.nb_trans, 3);

        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT + 2 * ADR_ACK_DELAY + 1, settings(DR::_5));
        assert_eq!(d.settings.data_rate, DR::_5);

        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT + 3 * ADR_ACK_DELAY, settings(DR::_4));
        assert_eq!(d.settings.data_rate, DR::_3);
    }

    #[test]
    fn lowest_rate_restores_defaults() {
        let d = calc_next::<EU868>(true, ADR_ACK_LIMIT + 2 * ADR_ACK_DELAY, settings(DR::_0));
        assert!(d.restore_default_channels);
        assert_eq!(d.settings.nb_trans, 1);
        assert_eq!(d.settings.data_rate, DR::_0);
    }
}
