//! Persisted boot state
//!
//! The boot record lives in the data/ota partition as two sectors of one erase
//! block each. Every update writes the next generation into the sector that is
//! not current, so an interrupted write leaves the previous record in charge.
//!
//! Record layout (little-endian, 32 bytes):
//!
//! ```text
//! 0   magic          u32  "DBOT"
//! 4   version        u16
//! 6   running        u8
//! 7   next_boot      u8
//! 8   previous       u8
//! 9   pending_verify u8
//! 10  override_from  u8   0xFF = none
//! 11  reserved       [u8; 13]
//! 24  generation     u32
//! 28  crc32          u32  over bytes 0..28
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FlashError, OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::partition::{Partition, SlotId};

/// Record magic ("DBOT").
pub const RECORD_MAGIC: u32 = 0x544F_4244;
/// Record format version.
pub const RECORD_VERSION: u16 = 1;
/// Encoded record size in bytes.
pub const RECORD_LEN: usize = 32;

const NO_SLOT: u8 = 0xFF;

/// Boot slot bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    /// Slot currently executing
    pub running: SlotId,

    /// Slot the bootloader loads on the next cold boot
    pub next_boot: SlotId,

    /// Whether `next_boot` (or, after the first boot into it, `running`) still
    /// awaits confirmation
    pub pending_verify: bool,

    /// Slot to revert to if the pending image is never confirmed
    pub previous: SlotId,

    /// `next_boot` before a manual override, if one is active
    pub override_from: Option<SlotId>,

    /// Monotonic (wrapping) record generation
    pub generation: u32,
}

impl BootState {
    /// Initial state of a freshly provisioned device.
    #[must_use]
    pub fn initial(slot: SlotId) -> Self {
        Self {
            running: slot,
            next_boot: slot,
            pending_verify: false,
            previous: slot,
            override_from: None,
            generation: 0,
        }
    }

    /// Encode the record.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut body = Vec::with_capacity(RECORD_LEN);
        body.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        body.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        body.push(self.running.0);
        body.push(self.next_boot.0);
        body.push(self.previous.0);
        body.push(u8::from(self.pending_verify));
        body.push(self.override_from.map_or(NO_SLOT, |s| s.0));
        body.extend_from_slice(&[0u8; 13]);
        body.extend_from_slice(&self.generation.to_le_bytes());
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        out.copy_from_slice(&body);
        out
    }

    /// Decode a record, returning `None` for erased, torn or foreign sectors.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record = bytes.get(..RECORD_LEN)?;
        let (body, crc) = record.split_at(RECORD_LEN - 4);
        let crc = u32::from_le_bytes(crc.try_into().ok()?);
        if crc32fast::hash(body) != crc {
            return None;
        }
        let &[m0, m1, m2, m3, v0, v1, running, next_boot, previous, pending, override_from, ..] =
            body
        else {
            return None;
        };
        if u32::from_le_bytes([m0, m1, m2, m3]) != RECORD_MAGIC
            || u16::from_le_bytes([v0, v1]) != RECORD_VERSION
            || pending > 1
        {
            return None;
        }
        let generation = u32::from_le_bytes(body.get(24..28)?.try_into().ok()?);
        Some(Self {
            running: SlotId(running),
            next_boot: SlotId(next_boot),
            pending_verify: pending == 1,
            previous: SlotId(previous),
            override_from: (override_from != NO_SLOT).then_some(SlotId(override_from)),
            generation,
        })
    }

    /// Whether `self` is newer than `other`, tolerating counter wrap-around.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        let delta = self.generation.wrapping_sub(other.generation);
        delta != 0 && delta < u32::MAX / 2
    }
}

/// Double-buffered boot record store inside the data/ota partition
#[derive(Debug, Clone)]
pub struct BootRecordStore {
    region_offset: u64,
    sector_size: u64,
    current: Option<usize>,
}

impl BootRecordStore {
    /// Create a store over the given region.
    #[must_use]
    pub fn new(region: &Partition, block_size: u32) -> Self {
        Self {
            region_offset: u64::from(region.offset),
            sector_size: u64::from(block_size),
            current: None,
        }
    }

    fn sector_offset(&self, sector: usize) -> u64 {
        if sector == 0 {
            self.region_offset
        } else {
            self.region_offset + self.sector_size
        }
    }

    /// Index of the sector holding the current record, if any.
    #[must_use]
    pub fn current_sector(&self) -> Option<usize> {
        self.current
    }

    /// Read both sectors and return the newest valid record.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be read.
    pub fn load<F: FlashDevice + ?Sized>(&mut self, flash: &mut F) -> OtaResult<Option<BootState>> {
        let mut best: Option<(usize, BootState)> = None;
        for sector in 0..2 {
            let mut buf = [0u8; RECORD_LEN];
            flash.read(self.sector_offset(sector), &mut buf)?;
            match BootState::decode(&buf) {
                Some(state) => {
                    let newer = best
                        .as_ref()
                        .is_none_or(|(_, current)| state.is_newer_than(current));
                    if newer {
                        best = Some((sector, state));
                    }
                }
                None if buf.iter().any(|b| *b != crate::flash::ERASED_BYTE) => {
                    warn!(sector, "Ignoring invalid boot record sector");
                }
                None => {}
            }
        }
        self.current = best.as_ref().map(|(sector, _)| *sector);
        Ok(best.map(|(_, state)| state))
    }

    /// Persist `state` as the next generation and return the stored record.
    ///
    /// The sector that is not current is erased and programmed; the current
    /// sector is left intact so a failure at any point keeps the previous
    /// record valid.
    ///
    /// # Errors
    ///
    /// Returns an error if erasing or programming fails, or the programmed
    /// record does not read back intact.
    pub fn store<F: FlashDevice + ?Sized>(
        &mut self,
        flash: &mut F,
        state: &BootState,
        previous_generation: u32,
    ) -> OtaResult<BootState> {
        let target = match self.current {
            Some(0) => 1,
            _ => 0,
        };
        let mut next = *state;
        next.generation = previous_generation.wrapping_add(1);
        let offset = self.sector_offset(target);
        let encoded = next.encode();

        flash.erase(offset, self.sector_size)?;
        flash.write(offset, &encoded)?;

        let mut check = [0u8; RECORD_LEN];
        flash.read(offset, &mut check)?;
        if BootState::decode(&check) != Some(next) {
            return Err(OtaError::Flash(FlashError::Hardware {
                offset,
                reason: "boot record did not read back intact".to_string(),
            }));
        }

        debug!(
            sector = target,
            generation = next.generation,
            "Boot record written"
        );
        self.current = Some(target);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FaultPlan, MemoryFlash};
    use crate::partition::{DATA_SUBTYPE_OTA, PartitionKind};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn region() -> Partition {
        Partition::new("otadata", PartitionKind::Data, DATA_SUBTYPE_OTA, 0x2000, 0x2000)
    }

    fn sample() -> BootState {
        BootState {
            running: SlotId(0),
            next_boot: SlotId(1),
            pending_verify: true,
            previous: SlotId(0),
            override_from: None,
            generation: 7,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let state = sample();
        assert_eq!(BootState::decode(&state.encode()), Some(state));

        let forced = BootState {
            override_from: Some(SlotId(0)),
            ..state
        };
        assert_eq!(BootState::decode(&forced.encode()), Some(forced));
    }

    #[test]
    fn test_corrupted_record_rejected() {
        let mut bytes = sample().encode();
        if let Some(b) = bytes.get_mut(7) {
            *b ^= 0x01;
        }
        assert_eq!(BootState::decode(&bytes), None);
        assert_eq!(BootState::decode(&[0xFF; RECORD_LEN]), None);
        assert_eq!(BootState::decode(&[0u8; 4]), None);
    }

    #[test]
    fn test_generation_wraps() {
        let old = BootState {
            generation: u32::MAX,
            ..sample()
        };
        let new = BootState {
            generation: 0,
            ..sample()
        };
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!new.is_newer_than(&new));
    }

    #[test]
    fn test_store_alternates_sectors() -> TestResult {
        let mut flash = MemoryFlash::new(0x8000, 0x1000)?;
        let mut store = BootRecordStore::new(&region(), 0x1000);
        assert_eq!(store.load(&mut flash)?, None);

        let first = store.store(&mut flash, &BootState::initial(SlotId(0)), 0)?;
        assert_eq!(store.current_sector(), Some(0));
        let second = store.store(&mut flash, &sample(), first.generation)?;
        assert_eq!(store.current_sector(), Some(1));
        assert_eq!(second.generation, 2);

        let mut reloaded = BootRecordStore::new(&region(), 0x1000);
        assert_eq!(reloaded.load(&mut flash)?, Some(second));
        assert_eq!(reloaded.current_sector(), Some(1));
        Ok(())
    }

    #[test]
    fn test_torn_write_keeps_previous_record() -> TestResult {
        let mut flash = MemoryFlash::new(0x8000, 0x1000)?;
        let mut store = BootRecordStore::new(&region(), 0x1000);
        let first = store.store(&mut flash, &BootState::initial(SlotId(0)), 0)?;

        // erase succeeds, program is torn
        flash.set_faults(FaultPlan {
            power_cut_after: Some(1),
            ..FaultPlan::default()
        });
        let result = store.store(&mut flash, &sample(), first.generation);
        assert!(matches!(result, Err(OtaError::Flash(_))));

        flash.set_faults(FaultPlan::default());
        let mut reloaded = BootRecordStore::new(&region(), 0x1000);
        assert_eq!(reloaded.load(&mut flash)?, Some(first));
        Ok(())
    }
}
