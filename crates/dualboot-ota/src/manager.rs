//! Partition manager with A/B boot-slot bookkeeping
//!
//! Owns the flash medium, the provisioned partition table and the persisted
//! boot state. It is constructed once and passed by reference to
//! [`FirmwareWriter`](crate::writer::FirmwareWriter) and
//! [`RollbackController`](crate::rollback::RollbackController).

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::boot_state::{BootRecordStore, BootState};
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::image::{IMAGE_HEADER_LEN, ImageDigest, ImageHeader};
use crate::partition::{Partition, PartitionTable, SlotId};

struct BootCell {
    state: BootState,
    store: BootRecordStore,
}

/// Boot-slot manager for a dual-slot flash layout
pub struct PartitionManager<F: FlashDevice> {
    table: PartitionTable,
    config: OtaConfig,
    block_size: u32,
    /// First app partition; every slot in the boot state is checked against
    /// the table, so lookups never fall back to it.
    primary: Partition,
    flash: Mutex<F>,
    boot: Mutex<BootCell>,
    busy: Mutex<HashSet<String>>,
}

impl<F: FlashDevice> std::fmt::Debug for PartitionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("table", &self.table)
            .field("config", &self.config)
            .field("boot_state", &self.boot_state())
            .finish_non_exhaustive()
    }
}

impl<F: FlashDevice> PartitionManager<F> {
    /// Create a manager over a provisioned medium.
    ///
    /// The boot record is loaded from the data/ota partition. A medium without
    /// a valid record is initialised to boot the first app slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or partition table is invalid for
    /// the medium, the table has no app partition, the persisted record refers
    /// to a slot the table does not have, or the medium fails.
    pub fn new(mut flash: F, table: PartitionTable, config: OtaConfig) -> OtaResult<Self> {
        config.validate()?;
        let block_size = flash.block_size();
        table.validate_for(flash.capacity(), block_size)?;

        let primary = table
            .app(SlotId(0))
            .cloned()
            .ok_or_else(|| OtaError::PartitionTable("no app partition".to_string()))?;
        let record_region = table.boot_record_partition().ok_or_else(|| {
            OtaError::PartitionTable("no data/ota partition for the boot record".to_string())
        })?;
        let mut store = BootRecordStore::new(record_region, block_size);

        let state = match store.load(&mut flash)? {
            Some(state) => {
                for slot in [state.running, state.next_boot, state.previous]
                    .into_iter()
                    .chain(state.override_from)
                {
                    if table.app(slot).is_none() {
                        return Err(OtaError::PartitionTable(format!(
                            "boot record refers to {slot}, which the table does not define"
                        )));
                    }
                }
                state
            }
            None => {
                info!(
                    "No valid boot record found, initialising to '{}'",
                    primary.label
                );
                store.store(&mut flash, &BootState::initial(SlotId(0)), 0)?
            }
        };

        info!(
            running = %state.running,
            next_boot = %state.next_boot,
            pending_verify = state.pending_verify,
            "Partition manager ready"
        );

        Ok(Self {
            table,
            config,
            block_size,
            primary,
            flash: Mutex::new(flash),
            boot: Mutex::new(BootCell { state, store }),
            busy: Mutex::new(HashSet::new()),
        })
    }

    /// The provisioned partition table.
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Active configuration.
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Erase block size of the medium.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Snapshot of the boot state.
    pub fn boot_state(&self) -> BootState {
        self.boot.lock().state
    }

    /// The app partition of a slot.
    pub fn slot_partition(&self, slot: SlotId) -> &Partition {
        self.table.app(slot).unwrap_or(&self.primary)
    }

    /// The slot currently executing.
    pub fn running_partition(&self) -> &Partition {
        self.slot_partition(self.boot_state().running)
    }

    /// The slot the bootloader loads on the next cold boot.
    pub fn next_boot_partition(&self) -> &Partition {
        self.slot_partition(self.boot_state().next_boot)
    }

    /// The first OTA slot after the running one, in table order (wrapping),
    /// that an update writes to. Factory images are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::NoUpdateSlot`] if the table has fewer than two app
    /// partitions or no OTA slot other than the running one.
    pub fn next_update_partition(&self) -> OtaResult<&Partition> {
        let slot = self.next_update_slot()?;
        Ok(self.slot_partition(slot))
    }

    pub(crate) fn next_update_slot(&self) -> OtaResult<SlotId> {
        let count = self.table.app_partitions().count();
        if count < 2 {
            return Err(OtaError::NoUpdateSlot);
        }
        let running = usize::from(self.boot_state().running.0);
        (1..count)
            .map(|step| running.wrapping_add(step) % count)
            .filter_map(|i| u8::try_from(i).ok().map(SlotId))
            .find(|slot| self.table.app(*slot).is_some_and(Partition::is_ota_slot))
            .ok_or(OtaError::NoUpdateSlot)
    }

    /// Whether the platform supports rollback bookkeeping and a second slot
    /// exists. Call this before attempting an update.
    pub fn capability_check(&self) -> bool {
        self.config.rollback_supported && self.next_update_slot().is_ok()
    }

    /// Like [`capability_check`](Self::capability_check), but reports which
    /// capability is missing.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::NotReady`] without rollback support and
    /// [`OtaError::NoUpdateSlot`] without a second app slot.
    pub fn ensure_ready(&self) -> OtaResult<()> {
        if !self.config.rollback_supported {
            return Err(OtaError::NotReady);
        }
        self.next_update_slot().map(|_| ())
    }

    /// Whether the boot state awaits confirmation of a new image.
    pub fn is_pending_verify(&self) -> bool {
        self.boot_state().pending_verify
    }

    /// Slot of an app partition from this table.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::InvalidImage`] if the partition is not one of the
    /// table's app partitions.
    pub fn slot_of(&self, partition: &Partition) -> OtaResult<SlotId> {
        self.table.slot_of(partition).ok_or_else(|| {
            OtaError::InvalidImage(format!("'{}' is not an app partition", partition.label))
        })
    }

    /// Read and check the image header at the start of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::InvalidImage`] if the header is malformed, or a
    /// flash error if it cannot be read.
    pub fn image_header(&self, partition: &Partition) -> OtaResult<ImageHeader> {
        let mut header = [0u8; IMAGE_HEADER_LEN];
        self.flash
            .lock()
            .read(u64::from(partition.offset), &mut header)?;
        ImageHeader::parse(&header)
    }

    /// Point the next cold boot at `partition` and mark it pending
    /// verification.
    ///
    /// The image header is checked before the boot state is touched. The new
    /// state is persisted through the double-buffered record; if that fails
    /// the in-memory state is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::InvalidImage`] if `partition` is not an app
    /// partition or does not start with a bootable image, or a flash error if
    /// the record cannot be written.
    pub fn commit(&self, partition: &Partition, digest: &ImageDigest) -> OtaResult<()> {
        let slot = self.slot_of(partition)?;
        let header = self.image_header(partition)?;

        let state = self.transition(|s| BootState {
            next_boot: slot,
            pending_verify: true,
            previous: s.running,
            override_from: None,
            ..*s
        })?;

        info!(
            partition = %partition.label,
            segments = header.segment_count,
            digest = %digest,
            generation = state.generation,
            "Boot pointer committed, image pending verification"
        );
        Ok(())
    }

    /// Apply a boot-state transition and persist it.
    ///
    /// Transitions that change nothing are not written.
    pub(crate) fn transition(
        &self,
        f: impl FnOnce(&BootState) -> BootState,
    ) -> OtaResult<BootState> {
        let mut cell = self.boot.lock();
        let next = f(&cell.state);
        if next == cell.state {
            return Ok(next);
        }
        let generation = cell.state.generation;
        let mut flash = self.flash.lock();
        let stored = cell.store.store(&mut *flash, &next, generation)?;
        cell.state = stored;
        Ok(stored)
    }

    /// Take exclusive ownership of a partition for a write session.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::Busy`] if another session owns the partition.
    pub fn claim(&self, partition: &Partition) -> OtaResult<PartitionLease<'_, F>> {
        let mut busy = self.busy.lock();
        if !busy.insert(partition.label.clone()) {
            return Err(OtaError::Busy(partition.label.clone()));
        }
        Ok(PartitionLease {
            manager: self,
            label: partition.label.clone(),
        })
    }

    /// Whether a write session owns the partition.
    pub fn is_busy(&self, partition: &Partition) -> bool {
        self.busy.lock().contains(&partition.label)
    }

    /// Run `f` with exclusive access to the flash medium.
    pub fn with_flash<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        f(&mut self.flash.lock())
    }

    /// Emulate a cold boot of the device.
    ///
    /// A pending image gets one trial boot. If it is still unconfirmed on the
    /// following boot the device reverts to the previous slot. A slot without
    /// a bootable image header is never entered. A [`force`] override is
    /// consumed by the boot.
    ///
    /// [`force`]: crate::rollback::RollbackController::force
    ///
    /// # Errors
    ///
    /// Returns a flash error if the medium cannot be read or the record cannot
    /// be written.
    pub fn reboot(&self) -> OtaResult<BootState> {
        let before = self.boot_state();
        let switching = before.next_boot != before.running
            && !(before.pending_verify && before.running == before.next_boot);
        let bootable = !switching || {
            let target = self.slot_partition(before.next_boot);
            match self.image_header(target) {
                Ok(_) => true,
                Err(OtaError::InvalidImage(reason)) => {
                    warn!(
                        partition = %target.label,
                        %reason,
                        "Next boot slot holds no bootable image, staying on the running slot"
                    );
                    false
                }
                Err(e) => return Err(e),
            }
        };

        let after = self.transition(|s| {
            let base = BootState {
                override_from: None,
                ..*s
            };
            if !bootable {
                BootState {
                    next_boot: s.running,
                    pending_verify: false,
                    ..base
                }
            } else if s.pending_verify && s.running == s.next_boot {
                BootState {
                    running: s.previous,
                    next_boot: s.previous,
                    pending_verify: false,
                    ..base
                }
            } else {
                BootState {
                    running: s.next_boot,
                    ..base
                }
            }
        })?;

        if after.running != before.running {
            if before.pending_verify && before.running == before.next_boot {
                warn!(
                    from = %self.slot_partition(before.running).label,
                    to = %self.slot_partition(after.running).label,
                    "Image was never confirmed, rolled back"
                );
            } else {
                info!(
                    partition = %self.slot_partition(after.running).label,
                    pending_verify = after.pending_verify,
                    "Booted into new slot"
                );
            }
        }
        Ok(after)
    }
}

/// Exclusive ownership of a partition, released on drop
#[derive(Debug)]
pub struct PartitionLease<'m, F: FlashDevice> {
    manager: &'m PartitionManager<F>,
    label: String,
}

impl<F: FlashDevice> PartitionLease<'_, F> {
    /// Label of the owned partition.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<F: FlashDevice> Drop for PartitionLease<'_, F> {
    fn drop(&mut self) {
        self.manager.busy.lock().remove(&self.label);
    }
}
