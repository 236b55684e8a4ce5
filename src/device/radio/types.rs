//! Modulation settings exchanged with the radio driver.

/// Number of preamble symbols used by LoRaWAN.
pub const PREAMBLE_SYMBOLS: u32 = 8;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Bandwidth {
    _125KHz,
    _250KHz,
    _500KHz,
}

impl Bandwidth {
    /// Bandwidth in Hz.
    pub fn hz(self) -> u32 {
        match self {
            Bandwidth::_125KHz => 125_000,
            Bandwidth::_250KHz => 250_000,
            Bandwidth::_500KHz => 500_000,
        }
    }
}

/// Convert the bandwidth for use in the external lora-modulation crate
impl From<Bandwidth> for lora_modulation::Bandwidth {
    fn from(bw: Bandwidth) -> Self {
        match bw {
            Bandwidth::_125KHz => lora_modulation::Bandwidth::_125KHz,
            Bandwidth::_250KHz => lora_modulation::Bandwidth::_250KHz,
            Bandwidth::_500KHz => lora_modulation::Bandwidth::_500KHz,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SpreadingFactor {
    _7,
    _8,
    _9,
    _10,
    _11,
    _12,
}

impl SpreadingFactor {
    /// Number of bits per symbol.
    pub fn factor(self) -> u32 {
        match self {
            SpreadingFactor::_7 => 7,
            SpreadingFactor::_8 => 8,
            SpreadingFactor::_9 => 9,
            SpreadingFactor::_10 => 10,
            SpreadingFactor::_11 => 11,
            SpreadingFactor::_12 => 12,
        }
    }
}

/// Convert the spreading factor for use in the external lora-modulation crate
impl From<SpreadingFactor> for lora_modulation::SpreadingFactor {
    fn from(sf: SpreadingFactor) -> Self {
        match sf {
            SpreadingFactor::_7 => lora_modulation::SpreadingFactor::_7,
            SpreadingFactor::_8 => lora_modulation::SpreadingFactor::_8,
            SpreadingFactor::_9 => lora_modulation::SpreadingFactor::_9,
            SpreadingFactor::_10 => lora_modulation::SpreadingFactor::_10,
            SpreadingFactor::_11 => lora_modulation::SpreadingFactor::_11,
            SpreadingFactor::_12 => lora_modulation::SpreadingFactor::_12,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CodingRate {
    _4_5,
    _4_6,
    _4_7,
    _4_8,
}

impl CodingRate {
    fn redundancy(self) -> u32 {
        match self {
            CodingRate::_4_5 => 1,
            CodingRate::_4_6 => 2,
            CodingRate::_4_7 => 3,
            CodingRate::_4_8 => 4,
        }
    }
}

/// Convert the coding rate for use in the external lora-modulation crate
impl From<CodingRate> for lora_modulation::CodingRate {
    fn from(cr: CodingRate) -> Self {
        match cr {
            CodingRate::_4_5 => lora_modulation::CodingRate::_4_5,
            CodingRate::_4_6 => lora_modulation::CodingRate::_4_6,
            CodingRate::_4_7 => lora_modulation::CodingRate::_4_7,
            CodingRate::_4_8 => lora_modulation::CodingRate::_4_8,
        }
    }
}

/// Frequency and modulation of a transmission or receive window.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RfConfig {
    pub frequency: u32,
    pub coding_rate: CodingRate,
    pub data_rate: Datarate,
}

impl RfConfig {
    /// Time on air of a `len` byte LoRa frame with explicit header and CRC, rounded up to
    /// the next millisecond.
    pub fn time_on_air_ms(&self, len: usize) -> u32 {
        let sf = self.data_rate.spreading_factor.factor() as i64;
        let symbol_us = (1i64 << sf) * 1_000_000 / self.data_rate.bandwidth.hz() as i64;
        // low data rate optimization is mandated above 16 ms per symbol
        let de = if symbol_us >= 16_000 { 1 } else { 0 };

        let preamble_us = (4 * PREAMBLE_SYMBOLS as i64 + 17) * symbol_us / 4;
        let numerator = 8 * len as i64 - 4 * sf + 28 + 16;
        let denominator = 4 * (sf - 2 * de);
        let blocks = if numerator > 0 { (numerator + denominator - 1) / denominator } else { 0 };
        let payload_symbols = 8 + blocks * (self.coding_rate.redundancy() as i64 + 4);

        let total_us = preamble_us + payload_symbols * symbol_us;
        ((total_us + 999) / 1000) as u32
    }
}

/// Spreading factor and bandwidth pair a LoRaWAN data rate maps to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Datarate {
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
}

/// Transmission parameters.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TxConfig {
    /// Output power in dBm.
    pub pw: i8,
    pub rf: RfConfig,
}

/// Signal quality of a received frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxQuality {
    rssi: i16,
    snr: i8,
}

impl RxQuality {
    /// Creation.
    pub fn new(rssi: i16, snr: i8) -> RxQuality {
        RxQuality { rssi, snr }
    }

    /// Received signal strength in dBm.
    pub fn rssi(self) -> i16 {
        self.rssi
    }

    /// Signal to noise ratio in dB.
    pub fn snr(self) -> i8 {
        self.snr
    }
}
