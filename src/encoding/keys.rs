// Copyright (c) 2017-2020 Ivaylo Petrov
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
// author: Ivaylo Petrov <ivajloip@gmail.com>

//! Key material and the crypto capability used to protect LoRaWAN frames.

/// A single AES block.
pub type Block = aes::Block;

/// AES128 represents 128 bit AES key.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub struct AES128(pub [u8; 16]);

impl From<[u8; 16]> for AES128 {
    fn from(v: [u8; 16]) -> Self {
        AES128(v)
    }
}

// keys never end up in debug output
impl core::fmt::Debug for AES128 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AES128(..)")
    }
}

/// MIC represents LoRaWAN MIC, in wire order.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct MIC(pub [u8; 4]);

impl MIC {
    /// The MIC as the little endian 32 bit value found on the wire.
    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<[u8; 4]> for MIC {
    fn from(v: [u8; 4]) -> Self {
        MIC(v)
    }
}

impl From<u32> for MIC {
    fn from(v: u32) -> Self {
        MIC(v.to_le_bytes())
    }
}

/// Trait for implementations of AES128 encryption.
pub trait Encrypter {
    /// Encrypt a data block.
    fn encrypt_block(&self, block: &mut Block);
}

/// Trait for implementations of cipher-based message authentication code (CMAC).
pub trait Cmac {
    /// Update the data to be processed.
    fn input(&mut self, data: &[u8]);
    /// Process the data.
    fn result(self) -> Block;
}

/// Represents an abstraction over the crypto functions.
///
/// This trait provides a way to pick a different implementation of the crypto primitives, for
/// instance a secure element holding the keys.
pub trait CryptoFactory {
    /// Encrypter type.
    type E: Encrypter;
    /// MAC calculator type.
    type M: Cmac;

    /// Method that creates an Encrypter.
    fn new_enc(&self, key: &AES128) -> Self::E;

    /// Method that creates a MAC calculator.
    fn new_mac(&self, key: &AES128) -> Self::M;
}
