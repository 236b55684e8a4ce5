#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

use core::fmt::Debug;
use device::Device;
use mac::region;

pub mod device;
pub mod encoding;
pub mod mac;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error<D>
where
    D: Device,
{
    Device(device::Error<D>),
    Region(region::Error),
    Mac(mac::Error),
    Encoding(encoding::Error),
}

impl<D> Debug for Error<D>
where
    D: Device,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Device(e) => f.debug_tuple("Device").field(e).finish(),
            Error::Region(e) => f.debug_tuple("Region").field(e).finish(),
            Error::Mac(e) => f.debug_tuple("Mac").field(e).finish(),
            Error::Encoding(e) => f.debug_tuple("Encoding").field(e).finish(),
        }
    }
}

impl<D> From<encoding::Error> for Error<D>
where
    D: Device,
{
    fn from(value: encoding::Error) -> Self {
        Self::Encoding(value)
    }
}

impl<D> Error<D>
where
    D: Device,
{
    /// The MAC-level error, if this is one.
    pub fn mac(&self) -> Option<&mac::Error> {
        match self {
            Error::Mac(e) => Some(e),
            _ => None,
        }
    }
}
