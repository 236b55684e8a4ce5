//! Storage capability supporting persistence during power-off which must be implemented by calling code.

use core::fmt::Debug;

use heapless::Vec;

use crate::mac::region::RegionId;

/// Byte-addressable persistent memory, e.g. EEPROM or a flash page emulating it.
pub trait NonVolatileStore {
    #[cfg(feature = "defmt")]
    /// Implementation specific error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Implementation specific error.
    type Error: Debug;

    /// Fill `buf` with the bytes stored at `offset`.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Store `data` at `offset`.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;
}

const MAX_LAYOUT_ENTRIES: usize = 8;

/// Keyed table mapping a region to the start of its area in the persistent store.
///
/// Each region keeps its own session and channel state so that switching regions does not
/// clobber the other.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageLayout {
    entries: Vec<(RegionId, usize), MAX_LAYOUT_ENTRIES>,
}

impl StorageLayout {
    /// Creation of an empty table.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add or replace the offset of `region`, builder style.
    pub fn with(mut self, region: RegionId, offset: usize) -> Self {
        // a full table keeps its previous entries
        let _ = self.insert(region, offset);
        self
    }

    /// Add or replace the offset of `region`. Fails when the table is full.
    pub fn insert(&mut self, region: RegionId, offset: usize) -> Result<(), (RegionId, usize)> {
        if let Some(entry) = self.entries.iter_mut().find(|(r, _)| *r == region) {
            entry.1 = offset;
            return Ok(());
        }
        self.entries.push((region, offset))
    }

    /// Get the offset reserved for `region`.
    pub fn offset(&self, region: RegionId) -> Option<usize> {
        self.entries.iter().find(|(r, _)| *r == region).map(|(_, offset)| *offset)
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new()
            .with(RegionId::EU868, 0)
            .with(RegionId::US915, 1200)
            .with(RegionId::CN470, 2400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_legacy_offsets() {
        let layout = StorageLayout::default();
        assert_eq!(layout.offset(RegionId::EU868), Some(0));
        assert_eq!(layout.offset(RegionId::US915), Some(1200));
        assert_eq!(layout.offset(RegionId::CN470), Some(2400));
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let mut layout = StorageLayout::new();
        assert_eq!(layout.offset(RegionId::US915), None);
        layout.insert(RegionId::US915, 64).unwrap();
        layout.insert(RegionId::US915, 128).unwrap();
        assert_eq!(layout.offset(RegionId::US915), Some(128));
        assert_eq!(layout.offset(RegionId::EU868), None);
    }
}
