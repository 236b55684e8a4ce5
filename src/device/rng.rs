//! Random number source which must be implemented by calling code.

use core::fmt::Debug;

/// Random number generator used for channel selection and back-off jitter.
pub trait Rng {
    #[cfg(feature = "defmt")]
    /// Implementation specific error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Implementation specific error.
    type Error: Debug;

    /// Next random 32 bit value.
    fn next_u32(&mut self) -> Result<u32, Self::Error>;
}
