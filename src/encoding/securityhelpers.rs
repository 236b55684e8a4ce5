//! AES based building blocks of LoRaWAN 1.0.x frame protection.

use super::keys::{Block, Cmac, CryptoFactory, Encrypter, AES128, MIC};
use super::parser::DevAddr;
use super::Error;

const BLOCK_SIZE: usize = 16;

/// Frame direction as used in the B0 and A_i blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// Prefix byte selecting which session key is derived from a Join-Accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SessionKeyType {
    /// Network session key.
    Network = 0x01,
    /// Application session key.
    Application = 0x02,
}

fn mic_from_block(block: &Block) -> MIC {
    MIC([block[0], block[1], block[2], block[3]])
}

/// MIC over raw bytes, used for Join-Request and Join-Accept.
pub fn calculate_mic<F: CryptoFactory>(factory: &F, key: &AES128, data: &[u8]) -> MIC {
    let mut mac = factory.new_mac(key);
    mac.input(data);
    mic_from_block(&mac.result())
}

fn counter_block(
    tag: u8,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    last: u8,
) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// MIC of a data message: CMAC over B0 followed by `data` (the frame without its MIC).
pub fn calculate_data_mic<F: CryptoFactory>(
    factory: &F,
    key: &AES128,
    data: &[u8],
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
) -> MIC {
    let b0 = counter_block(0x49, dir, dev_addr, fcnt, data.len() as u8);
    let mut mac = factory.new_mac(key);
    mac.input(&b0);
    mac.input(data);
    mic_from_block(&mac.result())
}

/// Encrypts or decrypts an FRMPayload in place; the operation is its own inverse.
pub fn encrypt_frm_data_payload<F: CryptoFactory>(
    factory: &F,
    key: &AES128,
    payload: &mut [u8],
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
) {
    let enc = factory.new_enc(key);
    for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
        let a = counter_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        let mut s = Block::clone_from_slice(&a);
        enc.encrypt_block(&mut s);
        for (b, k) in chunk.iter_mut().zip(s.iter()) {
            *b ^= k;
        }
    }
}

/// Recovers a Join-Accept in place.
///
/// The network encrypts with AES decrypt, so the device applies AES encrypt to every 16 byte
/// block after the MHDR.
pub fn decrypt_join_accept<F: CryptoFactory>(
    factory: &F,
    key: &AES128,
    phy: &mut [u8],
) -> Result<(), Error> {
    if phy.len() < 17 || (phy.len() - 1) % BLOCK_SIZE != 0 {
        return Err(Error::InvalidLength);
    }
    let enc = factory.new_enc(key);
    for chunk in phy[1..].chunks_mut(BLOCK_SIZE) {
        let block = Block::from_mut_slice(chunk);
        enc.encrypt_block(block);
    }
    Ok(())
}

/// Derives NwkSKey or AppSKey from the Join-Accept values and the DevNonce of the request.
pub fn derive_session_key<F: CryptoFactory>(
    factory: &F,
    key: &AES128,
    key_type: SessionKeyType,
    join_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> AES128 {
    let mut block = Block::default();
    block[0] = key_type as u8;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    factory.new_enc(key).encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    AES128(out)
}

/// Pseudo random ping slot offset for the beacon period starting at `beacon_time`.
///
/// `ping_period` must be non zero.
pub fn ping_offset<F: CryptoFactory>(
    factory: &F,
    beacon_time: u32,
    dev_addr: DevAddr,
    ping_period: u16,
) -> u16 {
    let mut block = Block::default();
    block[0..4].copy_from_slice(&beacon_time.to_le_bytes());
    block[4..8].copy_from_slice(&dev_addr.to_le_bytes());
    factory.new_enc(&AES128([0; 16])).encrypt_block(&mut block);
    let rand = u16::from(block[0]) + (u16::from(block[1]) << 8);
    rand % ping_period.max(1)
}
