//! Decoding of LoRaWAN 1.0.x frames.
//!
//! All multi-byte fields are little endian on the wire and are assembled byte by byte.

use heapless::Vec;

use super::keys::MIC;
use super::maccommands::{ChannelMask, Frequency};
use super::Error;

/// Size of the MHDR field.
pub const MHDR_SIZE: usize = 1;
/// Size of the MIC field.
pub const MIC_SIZE: usize = 4;
/// Size of DevAddr + FCtrl + FCnt.
pub const FHDR_MIN_SIZE: usize = 7;
/// Maximum size of the FOpts field.
pub const MAX_FOPTS_SIZE: usize = 15;
/// Maximum size of an FRMPayload.
pub const MAX_FRM_PAYLOAD_SIZE: usize = 242;
/// Smallest data frame: MHDR, FHDR without FOpts and MIC.
pub const DATA_MIN_SIZE: usize = MHDR_SIZE + FHDR_MIN_SIZE + MIC_SIZE;
/// Join-Accept without CFList.
pub const JOIN_ACCEPT_SIZE: usize = 17;
/// Size of the optional CFList.
pub const CF_LIST_SIZE: usize = 16;

/// MHDR represents LoRaWAN MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MHDR(pub u8);

impl MHDR {
    /// Build an MHDR for the given message type and LoRaWAN R1.
    pub fn new(mtype: MType) -> MHDR {
        MHDR((mtype as u8) << 5)
    }

    /// Gives the type of message that PhyPayload is carrying.
    pub fn mtype(&self) -> MType {
        match self.0 >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::RFU,
            _ => MType::Proprietary,
        }
    }

    /// Gives the version of LoRaWAN payload format.
    pub fn major(&self) -> Major {
        if self.0 & 0b11 == 0 {
            Major::LoRaWANR1
        } else {
            Major::RFU
        }
    }
}

impl From<u8> for MHDR {
    fn from(v: u8) -> Self {
        MHDR(v)
    }
}

/// MType gives the possible message types of the PhyPayload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    RFU = 6,
    Proprietary = 7,
}

impl MType {
    /// Whether this is one of the four data message types.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }

    /// Whether the frame travels from the device to the network.
    pub fn is_uplink(self) -> bool {
        matches!(self, MType::JoinRequest | MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }

    /// Whether the frame requests an acknowledgement.
    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }
}

/// Major gives the supported LoRaWAN payload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Major {
    LoRaWANR1,
    RFU,
}

/// DevAddr represents a 32 bit device address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Address as sent on the wire.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Address from its wire representation.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        DevAddr(u32::from_le_bytes(bytes))
    }
}

/// FCtrl represents the FCtrl from FHDR.
///
/// Bit 4 is FPending on downlinks and the Class B flag on uplinks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FCtrl(pub u8);

impl FCtrl {
    const ADR: u8 = 1 << 7;
    const ADR_ACK_REQ: u8 = 1 << 6;
    const ACK: u8 = 1 << 5;
    const F_PENDING: u8 = 1 << 4;

    /// Gives whether ADR is enabled or not.
    pub fn adr(&self) -> bool {
        self.0 & Self::ADR != 0
    }

    /// Gives whether ADR ACK is requested.
    pub fn adr_ack_req(&self) -> bool {
        self.0 & Self::ADR_ACK_REQ != 0
    }

    /// Gives whether ack bit is set.
    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// Gives whether there are more payloads pending.
    pub fn f_pending(&self) -> bool {
        self.0 & Self::F_PENDING != 0
    }

    /// Gives the size of FOpts.
    pub fn f_opts_len(&self) -> u8 {
        self.0 & 0x0f
    }

    #[allow(missing_docs)]
    pub fn set_adr(&mut self, on: bool) -> &mut Self {
        self.set(Self::ADR, on)
    }

    #[allow(missing_docs)]
    pub fn set_adr_ack_req(&mut self, on: bool) -> &mut Self {
        self.set(Self::ADR_ACK_REQ, on)
    }

    #[allow(missing_docs)]
    pub fn set_ack(&mut self, on: bool) -> &mut Self {
        self.set(Self::ACK, on)
    }

    /// FPending on downlinks, Class B enabled on uplinks.
    pub fn set_f_pending(&mut self, on: bool) -> &mut Self {
        self.set(Self::F_PENDING, on)
    }

    #[allow(missing_docs)]
    pub fn set_f_opts_len(&mut self, len: u8) -> &mut Self {
        self.0 = (self.0 & 0xf0) | (len & 0x0f);
        self
    }

    fn set(&mut self, bit: u8, on: bool) -> &mut Self {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }
}

/// DLSettings carried by Join-Accept and RXParamSetupReq.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DLSettings(pub u8);

impl DLSettings {
    /// Offset between uplink and RX1 data rates.
    pub fn rx1_dr_offset(&self) -> u8 {
        (self.0 >> 4) & 0x07
    }

    /// Data rate of the RX2 window.
    pub fn rx2_data_rate(&self) -> u8 {
        self.0 & 0x0f
    }
}

/// Channel Frequency List delivered in a Join-Accept.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CfList {
    /// Five extra channel frequencies for regions with a dynamic channel plan.
    DynamicChannel([Frequency; 5]),
    /// Channel masks for regions with a fixed channel plan.
    FixedChannel([ChannelMask; 5]),
}

impl CfList {
    /// Interpret the raw 16 bytes according to the CFListType in the last byte.
    pub fn decode(raw: &[u8; CF_LIST_SIZE]) -> Result<CfList, Error> {
        match raw[15] {
            0 => {
                let mut frequencies = [Frequency::default(); 5];
                for (i, f) in frequencies.iter_mut().enumerate() {
                    *f = Frequency::new_from_raw(&raw[i * 3..i * 3 + 3]);
                }
                Ok(CfList::DynamicChannel(frequencies))
            }
            1 => {
                let mut masks = [ChannelMask::default(); 5];
                for (i, m) in masks.iter_mut().enumerate() {
                    *m = ChannelMask::new_from_raw(&raw[i * 2..i * 2 + 2]);
                }
                Ok(CfList::FixedChannel(masks))
            }
            _ => Err(Error::InvalidCfListType),
        }
    }
}

/// Decrypted Join-Accept.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct JoinAcceptMessage {
    pub mhdr: MHDR,
    /// 24 bit nonce chosen by the join server.
    pub join_nonce: u32,
    /// 24 bit network identifier.
    pub net_id: u32,
    pub dev_addr: DevAddr,
    pub dl_settings: DLSettings,
    pub rx_delay: u8,
    /// Raw CFList, present only when the frame is exactly 16 bytes longer than the minimum.
    pub cf_list: Option<[u8; CF_LIST_SIZE]>,
    pub mic: MIC,
}

/// Data message, uplink or downlink depending on the MHDR.
///
/// `frm_payload` holds the bytes as carried on the wire, i.e. encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct DataMessage {
    pub mhdr: MHDR,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    /// Low 16 bits of the frame counter.
    pub fcnt: u16,
    pub fopts: Vec<u8, MAX_FOPTS_SIZE>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8, MAX_FRM_PAYLOAD_SIZE>,
    pub mic: MIC,
}

fn read_u24(b: &[u8]) -> u32 {
    u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16)
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16) | (u32::from(b[3]) << 24)
}

fn read_mic(bytes: &[u8]) -> MIC {
    let len = bytes.len();
    MIC([bytes[len - 4], bytes[len - 3], bytes[len - 2], bytes[len - 1]])
}

fn check_mhdr(byte: u8) -> Result<MHDR, Error> {
    let mhdr = MHDR(byte);
    if mhdr.major() != Major::LoRaWANR1 {
        return Err(Error::UnsupportedMajorVersion);
    }
    Ok(mhdr)
}

/// Parses a decrypted Join-Accept.
///
/// The CFList has no length field of its own: 0 bytes between RxDelay and the MIC mean no
/// CFList, 16 bytes mean a CFList, anything else is rejected.
pub fn parse_join_accept(bytes: &[u8]) -> Result<JoinAcceptMessage, Error> {
    if bytes.len() < JOIN_ACCEPT_SIZE {
        return Err(Error::InvalidLength);
    }
    let mhdr = check_mhdr(bytes[0])?;
    if mhdr.mtype() != MType::JoinAccept {
        return Err(Error::UnsupportedMessageType);
    }

    let join_nonce = read_u24(&bytes[1..4]);
    let net_id = read_u24(&bytes[4..7]);
    let dev_addr = DevAddr(read_u32(&bytes[7..11]));
    let dl_settings = DLSettings(bytes[11]);
    let rx_delay = bytes[12];

    let cf_list = match bytes.len() - JOIN_ACCEPT_SIZE {
        0 => None,
        CF_LIST_SIZE => {
            let mut cf_list = [0; CF_LIST_SIZE];
            cf_list.copy_from_slice(&bytes[13..13 + CF_LIST_SIZE]);
            Some(cf_list)
        }
        _ => return Err(Error::InvalidLength),
    };

    Ok(JoinAcceptMessage {
        mhdr,
        join_nonce,
        net_id,
        dev_addr,
        dl_settings,
        rx_delay,
        cf_list,
        mic: read_mic(bytes),
    })
}

/// Parses a data message (uplink or downlink).
pub fn parse_data_message(bytes: &[u8]) -> Result<DataMessage, Error> {
    let len = bytes.len();
    if len < DATA_MIN_SIZE {
        return Err(Error::InvalidLength);
    }
    let mhdr = check_mhdr(bytes[0])?;
    if !mhdr.mtype().is_data() {
        return Err(Error::UnsupportedMessageType);
    }

    let dev_addr = DevAddr(read_u32(&bytes[1..5]));
    let fctrl = FCtrl(bytes[5]);
    let fcnt = u16::from(bytes[6]) | (u16::from(bytes[7]) << 8);

    let fopts_len = fctrl.f_opts_len() as usize;
    let mic_start = len - MIC_SIZE;
    let fopts_end = MHDR_SIZE + FHDR_MIN_SIZE + fopts_len;
    if fopts_end > mic_start {
        return Err(Error::FOptsOverrun);
    }
    let fopts = Vec::from_slice(&bytes[MHDR_SIZE + FHDR_MIN_SIZE..fopts_end])
        .map_err(|_| Error::PayloadTooLarge)?;

    let rest = &bytes[fopts_end..mic_start];
    let (fport, frm_payload) = match rest.split_first() {
        Some((fport, payload)) => {
            (Some(*fport), Vec::from_slice(payload).map_err(|_| Error::PayloadTooLarge)?)
        }
        None => (None, Vec::new()),
    };

    Ok(DataMessage { mhdr, dev_addr, fctrl, fcnt, fopts, fport, frm_payload, mic: read_mic(bytes) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_accept(extra: usize) -> std::vec::Vec<u8> {
        let mut data = std::vec![
            0x20, // MHDR
            0x01, 0x02, 0x03, // JoinNonce
            0x13, 0x00, 0x00, // NetID
            0x04, 0x03, 0x02, 0x01, // DevAddr
            0x23, // DLSettings
            0x05, // RxDelay
        ];
        data.extend((0..extra).map(|i| i as u8));
        data.extend([0xaa, 0xbb, 0xcc, 0xdd]);
        data
    }

    #[test]
    fn join_accept_without_cf_list() {
        let data = join_accept(0);
        assert_eq!(data.len(), 17);
        let msg = parse_join_accept(&data).unwrap();
        assert_eq!(msg.join_nonce, 0x030201);
        assert_eq!(msg.net_id, 0x13);
        assert_eq!(msg.dev_addr, DevAddr(0x01020304));
        assert_eq!(msg.dl_settings.rx1_dr_offset(), 2);
        assert_eq!(msg.dl_settings.rx2_data_rate(), 3);
        assert_eq!(msg.rx_delay, 5);
        assert_eq!(msg.cf_list, None);
        assert_eq!(msg.mic.value(), 0xddccbbaa);
    }

    #[test]
    fn join_accept_with_cf_list() {
        let data = join_accept(16);
        assert_eq!(data.len(), 33);
        let msg = parse_join_accept(&data).unwrap();
        let mut expected = [0u8; 16];
        for (i, b) in expected.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(msg.cf_list, Some(expected));
        assert_eq!(msg.mic.value(), 0xddccbbaa);
    }

    #[test]
    fn join_accept_with_ambiguous_remainder() {
        let data = join_accept(8);
        assert_eq!(data.len(), 25);
        assert_eq!(parse_join_accept(&data), Err(Error::InvalidLength));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let data = join_accept(0);
        for len in 0..JOIN_ACCEPT_SIZE {
            assert_eq!(parse_join_accept(&data[..len]), Err(Error::InvalidLength));
        }
        let data = [0x60u8; DATA_MIN_SIZE];
        for len in 0..DATA_MIN_SIZE {
            assert_eq!(parse_data_message(&data[..len]), Err(Error::InvalidLength));
        }
    }

    #[test]
    fn data_message_fields() {
        let data = [
            0x60, // unconfirmed down
            0x04, 0x03, 0x02, 0x01, // DevAddr
            0xa2, // ADR, ACK, FOptsLen 2
            0x34, 0x12, // FCnt
            0x02, 0x05, // FOpts
            0x0a, // FPort
            0xde, 0xad, // FRMPayload
            0x01, 0x02, 0x03, 0x04, // MIC
        ];
        let msg = parse_data_message(&data).unwrap();
        assert_eq!(msg.mhdr.mtype(), MType::UnconfirmedDataDown);
        assert_eq!(msg.dev_addr, DevAddr(0x01020304));
        assert!(msg.fctrl.adr());
        assert!(msg.fctrl.ack());
        assert!(!msg.fctrl.f_pending());
        assert_eq!(msg.fcnt, 0x1234);
        assert_eq!(&msg.fopts[..], &[0x02, 0x05]);
        assert_eq!(msg.fport, Some(0x0a));
        assert_eq!(&msg.frm_payload[..], &[0xde, 0xad]);
        assert_eq!(msg.mic.value(), 0x04030201);
    }

    #[test]
    fn data_message_without_port() {
        let data = [0x60, 4, 3, 2, 1, 0x00, 0x01, 0x00, 9, 9, 9, 9];
        let msg = parse_data_message(&data).unwrap();
        assert_eq!(msg.fport, None);
        assert!(msg.frm_payload.is_empty());
        assert_eq!(msg.mic, MIC([9, 9, 9, 9]));
    }

    #[test]
    fn every_fopts_len_that_fits_parses() {
        for fopts_len in 0..=15u8 {
            let mut data = std::vec![0x60, 4, 3, 2, 1, fopts_len, 0, 0];
            data.extend(core::iter::repeat(0x06).take(fopts_len as usize));
            data.extend([0, 0, 0, 0]);
            let msg = parse_data_message(&data).unwrap();
            assert_eq!(msg.fopts.len(), fopts_len as usize);
            assert_eq!(msg.fport, None);
        }
    }

    #[test]
    fn fopts_len_beyond_buffer_is_rejected() {
        // claims 15 bytes of FOpts but only carries 2 before the MIC
        let data = [0x60, 4, 3, 2, 1, 0x0f, 0, 0, 1, 2, 0, 0, 0, 0];
        assert_eq!(parse_data_message(&data), Err(Error::FOptsOverrun));
    }

    #[test]
    fn rejects_foreign_types_and_versions() {
        let mut data = join_accept(0);
        assert_eq!(parse_data_message(&data), Err(Error::UnsupportedMessageType));
        data[0] = 0x21;
        assert_eq!(parse_join_accept(&data), Err(Error::UnsupportedMajorVersion));
    }

    #[test]
    fn decodes_dynamic_cf_list() {
        let mut raw = [0u8; 16];
        // 867.1 MHz in units of 100 Hz
        raw[0..3].copy_from_slice(&[0x18, 0x4f, 0x84]);
        let CfList::DynamicChannel(frequencies) = CfList::decode(&raw).unwrap() else {
            panic!("expected a dynamic channel list");
        };
        assert_eq!(frequencies[0].value(), 867_100_000);
        assert_eq!(frequencies[1].value(), 0);
        raw[15] = 7;
        assert_eq!(CfList::decode(&raw), Err(Error::InvalidCfListType));
    }
}
