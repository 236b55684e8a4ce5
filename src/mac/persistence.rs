//! State kept across power cycles: DevNonce, session, network-assigned radio settings and the
//! channel plan. The record is protected by a CRC-16 and lives at the region's offset of the
//! [`StorageLayout`](crate::device::non_volatile_store::StorageLayout).

use crc::{Crc, CRC_16_IBM_3740};

use super::region::channel_plan::CHANNEL_STATE_SIZE;
use super::security::SESSION_SIZE;
use super::types::{Configuration, DR};
use crate::device::non_volatile_store::NonVolatileStore;

const MAGIC: [u8; 2] = [0x4c, 0x31];
const SETTINGS_SIZE: usize = 12;
const NONE: u8 = 0xff;

/// Bytes taken by a record in the persistent store.
pub const STORABLE_SIZE: usize = 2 + 2 + SESSION_SIZE + SETTINGS_SIZE + CHANNEL_STATE_SIZE + 2;

const RECORD_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Snapshot of everything that must survive a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storable {
    pub(crate) dev_nonce: u16,
    pub(crate) session: [u8; SESSION_SIZE],
    pub(crate) rx1_data_rate_offset: Option<u8>,
    pub(crate) rx_delay: Option<u8>,
    pub(crate) rx2_data_rate: Option<DR>,
    pub(crate) rx2_frequency: Option<u32>,
    pub(crate) max_duty_cycle: u8,
    pub(crate) tx_data_rate: Option<DR>,
    pub(crate) tx_power: Option<i8>,
    pub(crate) number_of_transmissions: u8,
    pub(crate) channels: [u8; CHANNEL_STATE_SIZE],
}

impl Default for Storable {
    fn default() -> Self {
        Self {
            dev_nonce: 0,
            session: [0; SESSION_SIZE],
            rx1_data_rate_offset: None,
            rx_delay: None,
            rx2_data_rate: None,
            rx2_frequency: None,
            max_duty_cycle: 0,
            tx_data_rate: None,
            tx_power: None,
            number_of_transmissions: 1,
            channels: [0; CHANNEL_STATE_SIZE],
        }
    }
}

fn opt_u8(value: Option<u8>) -> u8 {
    value.unwrap_or(NONE)
}

fn u8_opt(value: u8) -> Option<u8> {
    (value != NONE).then_some(value)
}

impl Storable {
    /// Take the network-assigned settings out of `configuration`.
    pub(crate) fn set_configuration(&mut self, configuration: &Configuration) {
        self.rx1_data_rate_offset = configuration.rx1_data_rate_offset;
        self.rx_delay = configuration.rx_delay;
        self.rx2_data_rate = configuration.rx2_data_rate;
        self.rx2_frequency = configuration.rx2_frequency;
        self.max_duty_cycle = configuration.max_duty_cycle;
        self.tx_data_rate = configuration.tx_data_rate;
        self.tx_power = configuration.tx_power;
        self.number_of_transmissions = configuration.number_of_transmissions;
    }

    /// Put the stored settings back into `configuration`.
    pub(crate) fn apply_configuration(&self, configuration: &mut Configuration) {
        configuration.rx1_data_rate_offset = self.rx1_data_rate_offset;
        configuration.rx_delay = self.rx_delay;
        configuration.rx2_data_rate = self.rx2_data_rate;
        configuration.rx2_frequency = self.rx2_frequency;
        configuration.max_duty_cycle = self.max_duty_cycle;
        configuration.tx_data_rate = self.tx_data_rate.or(configuration.tx_data_rate);
        configuration.tx_power = self.tx_power;
        configuration.number_of_transmissions = self.number_of_transmissions.max(1);
    }

    #[allow(missing_docs)]
    pub fn to_bytes(&self) -> [u8; STORABLE_SIZE] {
        let mut out = [0u8; STORABLE_SIZE];
        out[0..2].copy_from_slice(&MAGIC);
        out[2..4].copy_from_slice(&self.dev_nonce.to_le_bytes());
        let mut pos = 4;
        out[pos..pos + SESSION_SIZE].copy_from_slice(&self.session);
        pos += SESSION_SIZE;

        let settings = &mut out[pos..pos + SETTINGS_SIZE];
        settings[0] = opt_u8(self.rx1_data_rate_offset);
        settings[1] = opt_u8(self.rx_delay);
        settings[2] = opt_u8(self.rx2_data_rate.map(|dr| dr as u8));
        settings[3..7].copy_from_slice(&self.rx2_frequency.unwrap_or(0).to_le_bytes());
        settings[7] = self.max_duty_cycle;
        settings[8] = opt_u8(self.tx_data_rate.map(|dr| dr as u8));
        settings[9] = self.tx_power.is_some() as u8;
        settings[10] = self.tx_power.unwrap_or(0) as u8;
        settings[11] = self.number_of_transmissions;
        pos += SETTINGS_SIZE;

        out[pos..pos + CHANNEL_STATE_SIZE].copy_from_slice(&self.channels);
        pos += CHANNEL_STATE_SIZE;
        let crc = RECORD_CRC.checksum(&out[..pos]);
        out[pos..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// `None` for an erased, foreign or corrupted record.
    pub fn from_bytes(data: &[u8; STORABLE_SIZE]) -> Option<Self> {
        let body = STORABLE_SIZE - 2;
        let crc = u16::from_le_bytes([data[body], data[body + 1]]);
        if data[0..2] != MAGIC || RECORD_CRC.checksum(&data[..body]) != crc {
            return None;
        }
        let mut record = Storable { dev_nonce: u16::from_le_bytes([data[2], data[3]]), ..Default::default() };
        let mut pos = 4;
        record.session.copy_from_slice(&data[pos..pos + SESSION_SIZE]);
        pos += SESSION_SIZE;

        let settings = &data[pos..pos + SETTINGS_SIZE];
        record.rx1_data_rate_offset = u8_opt(settings[0]);
        record.rx_delay = u8_opt(settings[1]);
        record.rx2_data_rate = u8_opt(settings[2]).and_then(|dr| DR::try_from(dr).ok());
        let rx2_frequency = u32::from_le_bytes([settings[3], settings[4], settings[5], settings[6]]);
        record.rx2_frequency = (rx2_frequency != 0).then_some(rx2_frequency);
        record.max_duty_cycle = settings[7];
        record.tx_data_rate = u8_opt(settings[8]).and_then(|dr| DR::try_from(dr).ok());
        record.tx_power = (settings[9] != 0).then_some(settings[10] as i8);
        record.number_of_transmissions = settings[11];
        pos += SETTINGS_SIZE;

        record.channels.copy_from_slice(&data[pos..pos + CHANNEL_STATE_SIZE]);
        Some(record)
    }

    /// Read the record at `offset`. A missing or invalid record is `Ok(None)`.
    pub fn load<S: NonVolatileStore>(store: &mut S, offset: usize) -> Result<Option<Self>, S::Error> {
        let mut data = [0u8; STORABLE_SIZE];
        store.read(offset, &mut data)?;
        Ok(Self::from_bytes(&data))
    }

    #[allow(missing_docs)]
    pub fn save<S: NonVolatileStore>(&self, store: &mut S, offset: usize) -> Result<(), S::Error> {
        store.write(offset, &self.to_bytes())
    }
}
