//! LoRaWAN 1.0.x frame codec: message layouts, MAC commands and the security primitives used
//! to protect them.

pub mod creator;
pub mod default_crypto;
pub mod keys;
pub mod maccommands;
pub mod parser;
pub mod securityhelpers;

/// Failure to decode or encode a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The buffer length does not match any admissible layout.
    InvalidLength,
    /// FCtrl announces more FOpts bytes than the frame carries.
    FOptsOverrun,
    /// The MHDR carries a message type the operation does not handle.
    UnsupportedMessageType,
    /// The MHDR major version is not LoRaWAN R1.
    UnsupportedMajorVersion,
    /// The output buffer cannot hold the serialized frame.
    BufferTooSmall,
    /// FOpts exceed 15 bytes or FRMPayload exceeds the maximum size.
    PayloadTooLarge,
    /// A MAC command is truncated or carries an unknown identifier.
    InvalidMacCommand,
    /// The CFList type byte is not known.
    InvalidCfListType,
}
