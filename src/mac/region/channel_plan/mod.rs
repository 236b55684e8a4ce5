//! Channel plans: which channels exist, which are enabled, and how one is picked for an uplink.

use heapless::Vec;

use crate::encoding::maccommands::{ChannelMask, DataRateRange};
use crate::encoding::parser::CfList;
use crate::mac::band::Bands;
use crate::mac::types::*;
pub mod dynamic;
pub mod fixed;

use super::{Error, Region};

/// Largest number of channels a plan may hold.
pub const MAX_CHANNELS: usize = 80;
/// Bytes a plan needs in the persistent store.
pub const CHANNEL_STATE_SIZE: usize = 10 + 16 * 8;

/// Properties of a single channel.
pub trait Channel {
    #[allow(missing_docs)]
    fn ul_frequency(&self) -> u32;
    /// Frequency of the RX1 window after an uplink on this channel.
    fn dl_frequency(&self) -> u32;
    #[allow(missing_docs)]
    fn ul_data_rate_range(&self) -> (DR, DR);
    /// Duty-cycle band of the uplink frequency.
    fn band(&self) -> usize;
}

/// Channel bookkeeping shared by the fixed and dynamic plans.
pub trait ChannelPlan<R>: Default
where
    R: Region,
{
    #[allow(missing_docs)]
    type Channel: Channel + Copy + core::fmt::Debug;

    /// Randomly pick an enabled channel supporting `data_rate` whose band is open at `now_ms`.
    fn select_channel(
        &self,
        random: u32,
        frame: Frame,
        data_rate: DR,
        bands: &Bands,
        now_ms: u64,
    ) -> Result<Self::Channel, Error>;
    /// Add, replace or (with a frequency of 0) remove a channel.
    fn handle_new_channel_req(
        &mut self,
        channel_index: u8,
        frequency: u32,
        data_rate_range: DataRateRange,
    ) -> Result<(), Error>;
    /// Set the RX1 frequency of an existing channel.
    fn handle_dl_channel_req(&mut self, channel_index: u8, frequency: u32) -> Result<(), Error>;
    #[allow(missing_docs)]
    fn check_uplink_frequency_exists(&self, index: usize) -> bool;
    /// Apply one ChMask/ChMaskCntl pair of a LinkADRReq block to `new_mask`.
    fn handle_channel_mask(
        &self,
        new_mask: &mut [bool; MAX_CHANNELS],
        channel_mask: ChannelMask,
        channel_mask_ctrl: u8,
    ) -> Result<(), Error>;
    #[allow(missing_docs)]
    fn channel_mask(&self) -> [bool; MAX_CHANNELS];
    /// Install a new mask; a mask leaving no usable channel is refused.
    fn set_channel_mask(&mut self, mask: [bool; MAX_CHANNELS]) -> Result<(), Error>;
    #[allow(missing_docs)]
    fn handle_cf_list(&mut self, cf_list: CfList) -> Result<(), Error>;
    /// Check a downlink frequency set by the network.
    fn validate_frequency(&self, frequency: u32) -> Result<(), Error>;
    /// Turn the default channels back on.
    fn reactivate_channels(&mut self);
    /// Serialize channels and mask for the persistent store.
    fn save(&self, out: &mut [u8; CHANNEL_STATE_SIZE]);
    /// Counterpart of [`ChannelPlan::save`].
    fn restore(&mut self, data: &[u8; CHANNEL_STATE_SIZE]);
}

/// Pick among `candidates`, skipping channels whose band is still closed.
pub(crate) fn pick_available<'a, C, I>(
    candidates: I,
    random: u32,
    bands: &Bands,
    now_ms: u64,
) -> Result<C, Error>
where
    C: Channel + Copy + 'a,
    I: Iterator<Item = &'a C>,
{
    let mut available: Vec<C, MAX_CHANNELS> = Vec::new();
    let mut earliest: Option<u64> = None;
    for channel in candidates {
        let wait = bands.time_until_available(channel.band(), now_ms);
        if wait == 0 {
            if available.push(*channel).is_err() {
                break;
            }
        } else {
            earliest = Some(earliest.map_or(wait, |e| e.min(wait)));
        }
    }
    if available.is_empty() {
        return match earliest {
            Some(wait_ms) => Err(Error::DutyCycleRestricted { wait_ms }),
            None => Err(Error::NoChannelAvailable),
        };
    }
    let index = (random % available.len() as u32) as usize;
    available.get(index).copied().ok_or(Error::NoChannelAvailable)
}

pub(crate) fn mask_to_bytes(mask: &[bool; MAX_CHANNELS], out: &mut [u8]) {
    for (i, enabled) in mask.iter().enumerate() {
        if *enabled {
            out[i / 8] |= 1 << (i % 8);
        } else {
            out[i / 8] &= !(1 << (i % 8));
        }
    }
}

pub(crate) fn mask_from_bytes(data: &[u8]) -> [bool; MAX_CHANNELS] {
    let mut mask = [false; MAX_CHANNELS];
    for (i, enabled) in mask.iter_mut().enumerate() {
        *enabled = data[i / 8] & (1 << (i % 8)) != 0;
    }
    mask
}
