//! Half-duplex LoRa transceiver which must be implemented by calling code.

pub mod types;
use core::fmt::Debug;
use types::*;

/// A non-blocking radio driver.
///
/// Every call returns as soon as the operation is started. Completion is reported by the
/// driver's interrupt handler posting the matching [`crate::mac::event::Event`]: `TxDone` or
/// `TxTimeout` after [`Radio::send`], and `RxDone`, `RxTimeout` or `RxError` after
/// [`Radio::receive`].
pub trait Radio {
    #[cfg(feature = "defmt")]
    /// Implementation specific error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Implementation specific error.
    type Error: Debug;

    /// Start transmitting `buf` with the given configuration. The driver must report
    /// `TxTimeout` if the transmission does not complete within `timeout_ms`.
    fn send(&mut self, config: TxConfig, buf: &[u8], timeout_ms: u32) -> Result<(), Self::Error>;

    /// Configure the receiver for the next call to [`Radio::receive`].
    fn set_rx_config(&mut self, config: RfConfig) -> Result<(), Self::Error>;

    /// Start receiving. A `timeout_ms` of 0 requests continuous reception.
    fn receive(&mut self, timeout_ms: u32) -> Result<(), Self::Error>;

    /// Place the radio in sleep mode, aborting any ongoing operation.
    fn sleep(&mut self) -> Result<(), Self::Error>;
}
