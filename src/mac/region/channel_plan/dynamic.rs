//! Dynamic channel plan processing, for regions where the network adds channels.

use core::marker::PhantomData;

use crate::encoding::maccommands::{ChannelMask, DataRateRange};
use crate::encoding::parser::CfList;
use crate::mac::band::Bands;
use crate::mac::region::{Error, Region};
use crate::mac::types::*;

use super::{
    mask_from_bytes, mask_to_bytes, pick_available, Channel, ChannelPlan, CHANNEL_STATE_SIZE,
    MAX_CHANNELS,
};

const CHANNEL_RECORD_SIZE: usize = 8;

/// Composition of properties needed to represent a dynamic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DynamicChannel {
    pub(crate) frequency: u32,
    pub(crate) dl_frequency: Option<u32>,
    pub(crate) min_data_rate: DR,
    pub(crate) max_data_rate: DR,
    pub(crate) band: usize,
}

impl Channel for DynamicChannel {
    fn ul_frequency(&self) -> u32 {
        self.frequency
    }

    fn dl_frequency(&self) -> u32 {
        self.dl_frequency.unwrap_or(self.frequency)
    }

    fn ul_data_rate_range(&self) -> (DR, DR) {
        (self.min_data_rate, self.max_data_rate)
    }

    fn band(&self) -> usize {
        self.band
    }
}

/// Up to `N` channels, the first `R::default_channels` of which are fixed by the region.
pub struct DynamicChannelPlan<R, const N: usize = 16>
where
    R: Region,
{
    channels: [Option<DynamicChannel>; N],
    mask: [bool; MAX_CHANNELS],
    region: PhantomData<R>,
}

impl<R, const N: usize> DynamicChannelPlan<R, N>
where
    R: Region,
{
    fn default_channel(index: usize) -> Option<DynamicChannel> {
        let frequency = R::mandatory_frequency(index, true);
        let (min_data_rate, max_data_rate) = R::mandatory_ul_data_rate_range(index);
        R::band_for_frequency(frequency).map(|band| DynamicChannel {
            frequency,
            dl_frequency: None,
            min_data_rate,
            max_data_rate,
            band,
        })
    }

    fn new_channel(frequency: u32, min_dr: u8, max_dr: u8) -> Result<DynamicChannel, Error> {
        let (region_min, region_max) = R::ul_data_rate_range();
        let min_data_rate = DR::try_from(min_dr).map_err(|_| Error::DataRateNotSupported(region_min))?;
        let max_data_rate = DR::try_from(max_dr).map_err(|_| Error::DataRateNotSupported(region_max))?;
        if min_data_rate > max_data_rate || !max_data_rate.in_range((region_min, region_max)) {
            return Err(Error::DataRateNotSupported(max_data_rate));
        }
        let band = Self::band_of(frequency)?;
        Ok(DynamicChannel { frequency, dl_frequency: None, min_data_rate, max_data_rate, band })
    }

    fn band_of(frequency: u32) -> Result<usize, Error> {
        if frequency < R::min_frequency() || frequency > R::max_frequency() {
            return Err(Error::InvalidFrequency);
        }
        R::band_for_frequency(frequency).ok_or(Error::InvalidFrequency)
    }
}

impl<R, const N: usize> Default for DynamicChannelPlan<R, N>
where
    R: Region,
{
    fn default() -> Self {
        let mut channels = [None; N];
        for (index, channel) in channels.iter_mut().enumerate().take(R::default_channels(true)) {
            *channel = Self::default_channel(index);
        }
        Self { channels, mask: [true; MAX_CHANNELS], region: PhantomData }
    }
}

impl<R, const N: usize> ChannelPlan<R> for DynamicChannelPlan<R, N>
where
    R: Region,
{
    type Channel = DynamicChannel;

    fn select_channel(
        &self,
        random: u32,
        frame: Frame,
        data_rate: DR,
        bands: &Bands,
        now_ms: u64,
    ) -> Result<DynamicChannel, Error> {
        let candidates = match frame {
            Frame::Join => &self.channels[..R::default_channels(true).min(N)],
            Frame::Data => &self.channels[..],
        };
        let eligible = candidates.iter().enumerate().filter_map(|(index, c)| match c {
            Some(ch) if self.mask[index] && data_rate.in_range(ch.ul_data_rate_range()) => Some(ch),
            _ => None,
        });
        pick_available(eligible, random, bands, now_ms)
    }

    fn handle_new_channel_req(
        &mut self,
        channel_index: u8,
        frequency: u32,
        data_rate_range: DataRateRange,
    ) -> Result<(), Error> {
        let index = channel_index as usize;
        if index < R::default_channels(true) || index >= N {
            return Err(Error::InvalidChannelIndex);
        }
        if frequency == 0 {
            self.channels[index] = None;
            self.mask[index] = false;
            return Ok(());
        }
        let channel = Self::new_channel(
            frequency,
            data_rate_range.min_data_rate(),
            data_rate_range.max_data_rate(),
        )?;
        self.channels[index] = Some(channel);
        self.mask[index] = true;
        Ok(())
    }

    fn handle_dl_channel_req(&mut self, channel_index: u8, frequency: u32) -> Result<(), Error> {
        let index = channel_index as usize;
        if !self.check_uplink_frequency_exists(index) {
            return Err(Error::InvalidChannelIndex);
        }
        Self::band_of(frequency)?;
        if let Some(channel) = self.channels[index].as_mut() {
            channel.dl_frequency = Some(frequency);
        }
        Ok(())
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
        match channel_mask_ctrl {
            0 => {
                for (i, enabled) in channel_mask.statuses().iter().enumerate() {
                    if *enabled && !self.check_uplink_frequency_exists(i) {
                        return Err(Error::InvalidChannelIndex);
                    }
                    new_mask[i] = *enabled;
                }
                Ok(())
            }
            6 => {
                for (i, enabled) in new_mask.iter_mut().enumerate() {
                    *enabled = self.check_uplink_frequency_exists(i);
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
        let usable = self.channels.iter().enumerate().any(|(i, c)| c.is_some() && mask[i]);
        if !usable {
            return Err(Error::NoChannelAvailable);
        }
        self.mask = mask;
        Ok(())
    }

    fn handle_cf_list(&mut self, cf_list: CfList) -> Result<(), Error> {
        let CfList::DynamicChannel(frequencies) = cf_list else {
            return Err(Error::InvalidCfListType);
        };
        let (min_dr, max_dr) = R::mandatory_ul_data_rate_range(0);
        for (offset, frequency) in frequencies.iter().enumerate() {
            let index = R::default_channels(true) + offset;
            if index >= N {
                break;
            }
            let frequency = frequency.value();
            if frequency == 0 {
                self.channels[index] = None;
                continue;
            }
            self.channels[index] = Self::new_channel(frequency, min_dr as u8, max_dr as u8).ok();
            self.mask[index] = self.channels[index].is_some();
        }
        Ok(())
    }

    fn validate_frequency(&self, frequency: u32) -> Result<(), Error> {
        Self::band_of(frequency).map(|_| ())
    }

    fn reactivate_channels(&mut self) {
        for index in 0..R::default_channels(true).min(N) {
            self.mask[index] = true;
        }
    }

    fn save(&self, out: &mut [u8; CHANNEL_STATE_SIZE]) {
        out.fill(0);
        mask_to_bytes(&self.mask, &mut out[..10]);
        for (index, channel) in self.channels.iter().enumerate().take(16) {
            let Some(channel) = channel else { continue };
            let record = &mut out[10 + index * CHANNEL_RECORD_SIZE..][..CHANNEL_RECORD_SIZE];
            record[0] = 1;
            record[1..4].copy_from_slice(&(channel.frequency / 100).to_le_bytes()[..3]);
            let dl = channel.dl_frequency.map(|f| f / 100).unwrap_or(0);
            record[4..7].copy_from_slice(&dl.to_le_bytes()[..3]);
            record[7] = (channel.max_data_rate as u8) << 4 | channel.min_data_rate as u8;
        }
    }

    fn restore(&mut self, data: &[u8; CHANNEL_STATE_SIZE]) {
        let mut channels = [None; N];
        for (index, channel) in channels.iter_mut().enumerate().take(16) {
            let record = &data[10 + index * CHANNEL_RECORD_SIZE..][..CHANNEL_RECORD_SIZE];
            if record[0] != 1 {
                continue;
            }
            let frequency = u32::from_le_bytes([record[1], record[2], record[3], 0]) * 100;
            let dl = u32::from_le_bytes([record[4], record[5], record[6], 0]) * 100;
            *channel = Self::new_channel(frequency, record[7] & 0x0f, record[7] >> 4)
                .ok()
                .map(|c| DynamicChannel { dl_frequency: (dl != 0).then_some(dl), ..c });
        }
        if channels.iter().take(R::default_channels(true)).any(|c| c.is_none()) {
            warn!("stored channel plan lacks default channels, keeping defaults");
            return;
        }
        self.channels = channels;
        self.mask = mask_from_bytes(&data[..10]);
    }
}
