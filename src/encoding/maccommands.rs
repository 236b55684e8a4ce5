// Copyright (c) 2018,2020 Ivaylo Petrov
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
// author: Ivaylo Petrov <ivajloip@gmail.com>

//! MAC commands carried in FOpts or in an FRMPayload on port 0.

use super::parser::DLSettings;
use super::Error;

/// ChannelMask represents a 16 bit channel mask as carried by LinkADRReq and CFList.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMask([u8; 2]);

impl ChannelMask {
    /// Constructs a new ChannelMask from the first two bytes of `data`.
    ///
    /// Improper use of this method could lead to panic during runtime!
    pub fn new_from_raw(data: &[u8]) -> Self {
        ChannelMask([data[0], data[1]])
    }

    /// Verifies if a given channel is enabled. Indexes above 15 are never enabled.
    pub fn is_enabled(&self, index: usize) -> bool {
        index < 16 && self.0[index >> 3] & (1 << (index & 0x07)) != 0
    }

    /// Provides information for each of the 16 channels if they are enabled.
    pub fn statuses(&self) -> [bool; 16] {
        let mut res = [false; 16];
        for (i, c) in res.iter_mut().enumerate() {
            *c = self.is_enabled(i);
        }
        res
    }

    /// The mask as a little endian integer, bit n for channel n.
    pub fn bits(&self) -> u16 {
        u16::from_le_bytes(self.0)
    }
}

impl From<[u8; 2]> for ChannelMask {
    fn from(v: [u8; 2]) -> Self {
        ChannelMask(v)
    }
}

impl AsRef<[u8]> for ChannelMask {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

/// A frequency in units of 100 Hz, 24 bit little endian on the wire.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Frequency([u8; 3]);

#[cfg(feature = "defmt")]
impl defmt::Format for Frequency {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Frequency({})", self.value())
    }
}

impl Frequency {
    /// Constructs a new Frequency from the first three bytes of `data`.
    ///
    /// Improper use of this method could lead to panic during runtime!
    pub fn new_from_raw(data: &[u8]) -> Self {
        Self([data[0], data[1], data[2]])
    }

    /// Frequency nearest to `hz` that the wire format can carry.
    pub fn from_hz(hz: u32) -> Self {
        let data = (hz / 100).to_le_bytes();
        Self([data[0], data[1], data[2]])
    }

    /// Provides the decimal value in Hz of the frequency.
    pub fn value(&self) -> u32 {
        ((u32::from(self.0[2]) << 16) + (u32::from(self.0[1]) << 8) + u32::from(self.0[0])) * 100
    }
}

impl From<[u8; 3]> for Frequency {
    fn from(v: [u8; 3]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for Frequency {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

/// Data rate range of a NewChannelReq: MinDR in the low nibble, MaxDR in the high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataRateRange(pub u8);

impl DataRateRange {
    #[allow(missing_docs)]
    pub fn min_data_rate(&self) -> u8 {
        self.0 & 0x0f
    }

    #[allow(missing_docs)]
    pub fn max_data_rate(&self) -> u8 {
        self.0 >> 4
    }
}

/// Commands sent by the network server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum DownlinkMacCommand {
    LinkCheckAns { margin: u8, gateway_count: u8 },
    LinkADRReq { data_rate: u8, tx_power: u8, channel_mask: ChannelMask, ch_mask_cntl: u8, nb_trans: u8 },
    DutyCycleReq { max_duty_cycle: u8 },
    RXParamSetupReq { dl_settings: DLSettings, frequency: Frequency },
    DevStatusReq,
    NewChannelReq { channel_index: u8, frequency: Frequency, data_rate_range: DataRateRange },
    RXTimingSetupReq { delay: u8 },
    TXParamSetupReq { downlink_dwell_time: bool, uplink_dwell_time: bool, max_eirp: u8 },
    DlChannelReq { channel_index: u8, frequency: Frequency },
    DeviceTimeAns { seconds: u32, fractional: u8 },
    PingSlotInfoAns,
    PingSlotChannelReq { frequency: Frequency, data_rate: u8 },
    BeaconFreqReq { frequency: Frequency },
}

macro_rules! downlink_payload_len {
    ($($cid:literal => $len:literal,)*) => {
        /// Payload length of the downlink command `cid`, or `None` if unknown.
        pub const fn downlink_payload_len(cid: u8) -> Option<usize> {
            match cid {
                $($cid => Some($len),)*
                _ => None,
            }
        }
    };
}

downlink_payload_len! {
    0x02 => 2,
    0x03 => 4,
    0x04 => 1,
    0x05 => 4,
    0x06 => 0,
    0x07 => 5,
    0x08 => 1,
    0x09 => 1,
    0x0A => 4,
    0x0D => 5,
    0x10 => 0,
    0x11 => 4,
    0x13 => 3,
}

impl DownlinkMacCommand {
    fn decode(cid: u8, p: &[u8]) -> Result<Self, Error> {
        let cmd = match cid {
            0x02 => Self::LinkCheckAns { margin: p[0], gateway_count: p[1] },
            0x03 => Self::LinkADRReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0f,
                channel_mask: ChannelMask::new_from_raw(&p[1..3]),
                ch_mask_cntl: (p[3] >> 4) & 0x07,
                nb_trans: p[3] & 0x0f,
            },
            0x04 => Self::DutyCycleReq { max_duty_cycle: p[0] & 0x0f },
            0x05 => Self::RXParamSetupReq {
                dl_settings: DLSettings(p[0]),
                frequency: Frequency::new_from_raw(&p[1..4]),
            },
            0x06 => Self::DevStatusReq,
            0x07 => Self::NewChannelReq {
                channel_index: p[0],
                frequency: Frequency::new_from_raw(&p[1..4]),
                data_rate_range: DataRateRange(p[4]),
            },
            0x08 => Self::RXTimingSetupReq { delay: p[0] & 0x0f },
            0x09 => Self::TXParamSetupReq {
                downlink_dwell_time: p[0] & 0x20 != 0,
                uplink_dwell_time: p[0] & 0x10 != 0,
                max_eirp: p[0] & 0x0f,
            },
            0x0A => Self::DlChannelReq {
                channel_index: p[0],
                frequency: Frequency::new_from_raw(&p[1..4]),
            },
            0x0D => Self::DeviceTimeAns {
                seconds: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                fractional: p[4],
            },
            0x10 => Self::PingSlotInfoAns,
            0x11 => Self::PingSlotChannelReq {
                frequency: Frequency::new_from_raw(&p[0..3]),
                data_rate: p[3] & 0x0f,
            },
            0x13 => Self::BeaconFreqReq { frequency: Frequency::new_from_raw(&p[0..3]) },
            _ => return Err(Error::InvalidMacCommand),
        };
        Ok(cmd)
    }
}

/// Parses downlink MAC commands.
///
/// The iterator yields an error and stops at the first unknown or truncated command, since the
/// length of anything after it cannot be known.
///
/// ```
/// use lorawan_node::encoding::maccommands::{parse_downlink_mac_commands, DownlinkMacCommand};
///
/// let cmds: Vec<_> = parse_downlink_mac_commands(&[0x06, 0x08, 0x01]).collect();
/// assert_eq!(cmds[0], Ok(DownlinkMacCommand::DevStatusReq));
/// assert_eq!(cmds[1], Ok(DownlinkMacCommand::RXTimingSetupReq { delay: 1 }));
/// ```
pub fn parse_downlink_mac_commands(data: &[u8]) -> MacCommandIterator<'_> {
    MacCommandIterator { data, index: 0 }
}

/// Implementation of iterator for downlink mac commands.
pub struct MacCommandIterator<'a> {
    data: &'a [u8],
    index: usize,
}

impl Iterator for MacCommandIterator<'_> {
    type Item = Result<DownlinkMacCommand, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let cid = *self.data.get(self.index)?;
        let start = self.index + 1;
        let Some(len) = downlink_payload_len(cid) else {
            self.index = self.data.len();
            return Some(Err(Error::InvalidMacCommand));
        };
        if start + len > self.data.len() {
            self.index = self.data.len();
            return Some(Err(Error::InvalidMacCommand));
        }
        self.index = start + len;
        Some(DownlinkMacCommand::decode(cid, &self.data[start..start + len]))
    }
}

/// Commands sent by the end device, mostly answers to [`DownlinkMacCommand`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum UplinkMacCommand {
    LinkCheckReq,
    LinkADRAns { power_ack: bool, data_rate_ack: bool, channel_mask_ack: bool },
    DutyCycleAns,
    RXParamSetupAns { rx1_dr_offset_ack: bool, rx2_data_rate_ack: bool, channel_ack: bool },
    /// `margin` is the demodulation SNR, clamped to -32..=31.
    DevStatusAns { battery: u8, margin: i8 },
    NewChannelAns { data_rate_range_ack: bool, channel_freq_ack: bool },
    RXTimingSetupAns,
    TXParamSetupAns,
    DlChannelAns { channel_freq_ack: bool, uplink_freq_exists: bool },
    DeviceTimeReq,
    PingSlotInfoReq { periodicity: u8 },
    PingSlotChannelAns { data_rate_ack: bool, channel_freq_ack: bool },
    BeaconFreqAns { beacon_freq_ack: bool },
}

fn bits(flags: &[bool]) -> u8 {
    flags.iter().enumerate().fold(0, |acc, (i, on)| acc | ((*on as u8) << i))
}

impl UplinkMacCommand {
    /// Command identifier.
    pub const fn cid(&self) -> u8 {
        match self {
            Self::LinkCheckReq => 0x02,
            Self::LinkADRAns { .. } => 0x03,
            Self::DutyCycleAns => 0x04,
            Self::RXParamSetupAns { .. } => 0x05,
            Self::DevStatusAns { .. } => 0x06,
            Self::NewChannelAns { .. } => 0x07,
            Self::RXTimingSetupAns => 0x08,
            Self::TXParamSetupAns => 0x09,
            Self::DlChannelAns { .. } => 0x0A,
            Self::DeviceTimeReq => 0x0D,
            Self::PingSlotInfoReq { .. } => 0x10,
            Self::PingSlotChannelAns { .. } => 0x11,
            Self::BeaconFreqAns { .. } => 0x13,
        }
    }

    /// length of the payload of the mac command.
    pub const fn payload_len(&self) -> usize {
        match self {
            Self::DevStatusAns { .. } => 2,
            Self::LinkCheckReq
            | Self::DutyCycleAns
            | Self::RXTimingSetupAns
            | Self::TXParamSetupAns
            | Self::DeviceTimeReq => 0,
            _ => 1,
        }
    }

    /// Answers that must be repeated in every uplink until a downlink is received.
    pub const fn is_sticky(&self) -> bool {
        matches!(
            self,
            Self::RXParamSetupAns { .. } | Self::RXTimingSetupAns | Self::DlChannelAns { .. }
        )
    }

    /// Writes CID and payload, returning the number of bytes used.
    pub fn write_to(&self, out: &mut [u8]) -> Result<usize, Error> {
        let len = self.payload_len() + 1;
        if out.len() < len {
            return Err(Error::BufferTooSmall);
        }
        out[0] = self.cid();
        match *self {
            Self::LinkADRAns { power_ack, data_rate_ack, channel_mask_ack } => {
                out[1] = bits(&[channel_mask_ack, data_rate_ack, power_ack]);
            }
            Self::RXParamSetupAns { rx1_dr_offset_ack, rx2_data_rate_ack, channel_ack } => {
                out[1] = bits(&[channel_ack, rx2_data_rate_ack, rx1_dr_offset_ack]);
            }
            Self::DevStatusAns { battery, margin } => {
                out[1] = battery;
                out[2] = (margin.clamp(-32, 31) as u8) & 0x3f;
            }
            Self::NewChannelAns { data_rate_range_ack, channel_freq_ack } => {
                out[1] = bits(&[channel_freq_ack, data_rate_range_ack]);
            }
            Self::DlChannelAns { channel_freq_ack, uplink_freq_exists } => {
                out[1] = bits(&[channel_freq_ack, uplink_freq_exists]);
            }
            Self::PingSlotInfoReq { periodicity } => out[1] = periodicity & 0x07,
            Self::PingSlotChannelAns { data_rate_ack, channel_freq_ack } => {
                out[1] = bits(&[channel_freq_ack, data_rate_ack]);
            }
            Self::BeaconFreqAns { beacon_freq_ack } => out[1] = bits(&[beacon_freq_ack]),
            _ => {}
        }
        Ok(len)
    }
}

/// Calculates the len in bytes of a sequence of mac commands, including the CIDs.
pub fn mac_commands_len(cmds: &[UplinkMacCommand]) -> usize {
    cmds.iter().map(|mc| mc.payload_len() + 1).sum()
}

/// Serializes `cmds` back to back into `out`.
pub fn build_mac_commands(cmds: &[UplinkMacCommand], out: &mut [u8]) -> Result<usize, Error> {
    if mac_commands_len(cmds) > out.len() {
        return Err(Error::BufferTooSmall);
    }
    let mut i = 0;
    for mc in cmds {
        i += mc.write_to(&mut out[i..])?;
    }
    Ok(i)
}
