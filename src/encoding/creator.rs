//! Serialization of uplink frames.

use super::keys::{CryptoFactory, AES128, MIC};
use super::parser::{DataMessage, MType, MHDR, MIC_SIZE};
use super::securityhelpers::calculate_mic;
use super::Error;

/// Size of a serialized Join-Request.
pub const JOIN_REQUEST_SIZE: usize = 23;

/// Join-Request of an over-the-air activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JoinRequest {
    /// AppEUI (JoinEUI), most significant byte first.
    pub app_eui: [u8; 8],
    /// DevEUI, most significant byte first.
    pub dev_eui: [u8; 8],
    #[allow(missing_docs)]
    pub dev_nonce: u16,
    #[allow(missing_docs)]
    pub mic: MIC,
}

impl JoinRequest {
    /// An unsigned request.
    pub fn new(app_eui: [u8; 8], dev_eui: [u8; 8], dev_nonce: u16) -> Self {
        Self { app_eui, dev_eui, dev_nonce, mic: MIC::default() }
    }

    fn write_header(&self, out: &mut [u8; JOIN_REQUEST_SIZE - MIC_SIZE]) {
        out[0] = MHDR::new(MType::JoinRequest).0;
        for (dst, src) in out[1..9].iter_mut().zip(self.app_eui.iter().rev()) {
            *dst = *src;
        }
        for (dst, src) in out[9..17].iter_mut().zip(self.dev_eui.iter().rev()) {
            *dst = *src;
        }
        out[17..19].copy_from_slice(&self.dev_nonce.to_le_bytes());
    }

    /// Computes the MIC with the AppKey.
    pub fn sign<F: CryptoFactory>(&mut self, factory: &F, app_key: &AES128) {
        let mut header = [0u8; JOIN_REQUEST_SIZE - MIC_SIZE];
        self.write_header(&mut header);
        self.mic = calculate_mic(factory, app_key, &header);
    }

    /// Writes the request with its current MIC.
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, Error> {
        if out.len() < JOIN_REQUEST_SIZE {
            return Err(Error::BufferTooSmall);
        }
        let mut header = [0u8; JOIN_REQUEST_SIZE - MIC_SIZE];
        self.write_header(&mut header);
        out[..header.len()].copy_from_slice(&header);
        out[header.len()..JOIN_REQUEST_SIZE].copy_from_slice(&self.mic.0);
        Ok(JOIN_REQUEST_SIZE)
    }
}

impl DataMessage {
    /// Size of the serialized frame including the MIC.
    pub fn serialized_len(&self) -> usize {
        let port = if self.fport.is_some() { 1 } else { 0 };
        8 + self.fopts.len() + port + self.frm_payload.len() + MIC_SIZE
    }

    /// Writes every field except the MIC, returning the number of bytes written.
    ///
    /// FOptsLen in the written FCtrl always reflects `fopts`.
    pub fn serialize_without_mic(&self, out: &mut [u8]) -> Result<usize, Error> {
        if self.fport.is_none() && !self.frm_payload.is_empty() {
            return Err(Error::InvalidLength);
        }
        let len = self.serialized_len() - MIC_SIZE;
        if out.len() < len {
            return Err(Error::BufferTooSmall);
        }
        let mut fctrl = self.fctrl;
        fctrl.set_f_opts_len(self.fopts.len() as u8);

        out[0] = self.mhdr.0;
        out[1..5].copy_from_slice(&self.dev_addr.to_le_bytes());
        out[5] = fctrl.0;
        out[6..8].copy_from_slice(&self.fcnt.to_le_bytes());
        let mut i = 8;
        out[i..i + self.fopts.len()].copy_from_slice(&self.fopts);
        i += self.fopts.len();
        if let Some(fport) = self.fport {
            out[i] = fport;
            i += 1;
            out[i..i + self.frm_payload.len()].copy_from_slice(&self.frm_payload);
            i += self.frm_payload.len();
        }
        Ok(i)
    }

    /// Writes the whole frame, MIC last.
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, Error> {
        let len = self.serialized_len();
        if out.len() < len {
            return Err(Error::BufferTooSmall);
        }
        let i = self.serialize_without_mic(out)?;
        out[i..i + MIC_SIZE].copy_from_slice(&self.mic.0);
        Ok(i + MIC_SIZE)
    }
}
