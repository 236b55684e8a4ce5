//! Fixed channel plan processing.

use core::marker::PhantomData;

use super::Error;
use crate::encoding::maccommands::{ChannelMask, DataRateRange};
use crate::encoding::parser::CfList;
use crate::mac::band::Bands;
use crate::mac::region::Region;
use crate::mac::types::*;

use super::{
    mask_from_bytes, mask_to_bytes, pick_available, Channel, ChannelPlan, CHANNEL_STATE_SIZE,
    MAX_CHANNELS,
};

const NUM_OF_CHANNELS_IN_BLOCK: usize = 8;

/// Composition of properties and functions needed to represent a fixed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedChannel {
    pub(crate) ul_frequency: u32,
    pub(crate) dl_frequency: u32,
    pub(crate) ul_data_rate_range: (DR, DR),
    pub(crate) band: usize,
}

impl Channel for FixedChannel {
    fn ul_frequency(&self) -> u32 {
        self.ul_frequency
    }

    fn dl_frequency(&self) -> u32 {
        self.dl_frequency
    }

    fn ul_data_rate_range(&self) -> (DR, DR) {
        self.ul_data_rate_range
    }

    fn band(&self) -> usize {
        self.band
    }
}

/// Composition of properties and functions needed to control a fixed channel plan.
pub struct FixedChannelPlan<R>
where
    R: Region,
{
    channels: [Option<FixedChannel>; MAX_CHANNELS],
    mask: [bool; MAX_CHANNELS],
    region: PhantomData<R>,
}

impl<R> FixedChannelPlan<R>
where
    R: Region,
{
    fn channel_count() -> usize {
        R::default_channels(true).min(MAX_CHANNELS)
    }

    fn usable(&self, mask: &[bool; MAX_CHANNELS]) -> bool {
        self.channels.iter().zip(mask.iter()).any(|(c, enabled)| c.is_some() && *enabled)
    }
}

impl<R> Default for FixedChannelPlan<R>
where
    R: Region,
{
    fn default() -> Self {
        let mut channels = [None; MAX_CHANNELS];
        let mut mask = [false; MAX_CHANNELS];
        for index in 0..Self::channel_count() {
            let ul_frequency = R::mandatory_frequency(index, true);
            channels[index] = Some(FixedChannel {
                ul_frequency,
                dl_frequency: R::mandatory_frequency(index % R::default_channels(false), false),
                ul_data_rate_range: R::mandatory_ul_data_rate_range(index),
                band: R::band_for_frequency(ul_frequency).unwrap_or(0),
            });
            mask[index] = true;
        }
        Self { channels, mask, region: PhantomData }
    }
}

impl<R> ChannelPlan<R> for FixedChannelPlan<R>
where
    R: Region,
{
    type Channel = FixedChannel;

    fn select_channel(
        &self,
        random: u32,
        _frame: Frame,
        data_rate: DR,
        bands: &Bands,
        now_ms: u64,
    ) -> Result<FixedChannel, Error> {
        let eligible = self.channels.iter().enumerate().filter_map(|(index, c)| match c {
            Some(ch) if self.mask[index] && data_rate.in_range(ch.ul_data_rate_range) => Some(ch),
            _ => None,
        });
        pick_available(eligible, random, bands, now_ms)
    }

    fn handle_new_channel_req(
        &mut self,
        _channel_index: u8,
        _frequency: u32,
        _data_rate_range: DataRateRange,
    ) -> Result<(), Error> {
        Err(Error::CommandNotImplementedForRegion)
    }

    fn handle_dl_channel_req(&mut self, _channel_index: u8, _frequency: u32) -> Result<(), Error> {
        Err(Error::CommandNotImplementedForRegion)
    }

    fn check_uplink_frequency_exists(&self, index: usize) -> bool {
        self.channels.get(index).map(|c| c.is_some()).unwrap_or(false)
    }

    fn handle_channel_mask(
        &self,
        new_mask: &mut [bool; MAX_CHANNELS],
        channel_mask: ChannelMask,
        channel_mask_ctrl: u8,
    ) -> Result<(), Error> {
        let count = Self::channel_count();
        match channel_mask_ctrl {
            0..=4 => {
                for (i, enabled) in channel_mask.statuses().iter().enumerate() {
                    let index = i + (channel_mask_ctrl as usize * 16);
                    if index < count {
                        new_mask[index] = *enabled;
                    }
                }
                Ok(())
            }
            5 => {
                // Bit n switches the block of 8 channels starting at 8 * n.
                for (block, enabled) in channel_mask.statuses().iter().enumerate() {
                    let start = block * NUM_OF_CHANNELS_IN_BLOCK;
                    for index in start..(start + NUM_OF_CHANNELS_IN_BLOCK).min(count) {
                        new_mask[index] = *enabled;
                    }
                }
                Ok(())
            }
            6 | 7 => {
                new_mask[..64.min(count)].fill(channel_mask_ctrl == 6);
                for i in 0..NUM_OF_CHANNELS_IN_BLOCK {
                    if 64 + i < count {
                        new_mask[64 + i] = channel_mask.is_enabled(i);
                    }
                }
                Ok(())
            }
            _ => Err(Error::InvalidChannelMaskCtrl),
        }
    }

    fn channel_mask(&self) -> [bool; MAX_CHANNELS] {
        self.mask
    }

    fn set_channel_mask(&mut self, mask: [bool; MAX_CHANNELS]) -> Result<(), Error> {
        if !self.usable(&mask) {
            return Err(Error::NoChannelAvailable);
        }
        self.mask = mask;
        Ok(())
    }

    fn handle_cf_list(&mut self, cf_list: CfList) -> Result<(), Error> {
        let CfList::FixedChannel(masks) = cf_list else {
            return Err(Error::InvalidCfListType);
        };
        let mut mask = [false; MAX_CHANNELS];
        for (block, channel_mask) in masks.iter().enumerate() {
            for (i, enabled) in channel_mask.statuses().iter().enumerate() {
                mask[block * 16 + i] = *enabled;
            }
        }
        self.set_channel_mask(mask)
    }

    fn validate_frequency(&self, frequency: u32) -> Result<(), Error> {
        if (R::min_frequency()..=R::max_frequency()).contains(&frequency) {
            Ok(())
        } else {
            Err(Error::InvalidFrequency)
        }
    }

    fn reactivate_channels(&mut self) {
        self.mask = [false; MAX_CHANNELS];
        self.mask[..Self::channel_count()].fill(true);
    }

    fn save(&self, out: &mut [u8; CHANNEL_STATE_SIZE]) {
        out.fill(0);
        mask_to_bytes(&self.mask, &mut out[..10]);
    }

    fn restore(&mut self, data: &[u8; CHANNEL_STATE_SIZE]) {
        let mask = mask_from_bytes(&data[..10]);
        if self.set_channel_mask(mask).is_err() {
            warn!("stored channel mask leaves no channel, keeping defaults");
        }
    }
}
