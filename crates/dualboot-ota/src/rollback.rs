//! Post-boot confirmation and manual slot override
//!
//! After a slot switch the new image runs on trial. The application confirms
//! it with [`RollbackController::cancel`]; otherwise the next cold boot
//! reverts to the previous slot. [`force`](RollbackController::force) and
//! [`cancel_force`](RollbackController::cancel_force) switch slots by hand
//! outside the update flow.

use tracing::info;

use crate::boot_state::BootState;
use crate::error::{OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::manager::PartitionManager;

/// Boot-state operations independent of any write session
#[derive(Debug)]
pub struct RollbackController<'m, F: FlashDevice> {
    manager: &'m PartitionManager<F>,
}

impl<'m, F: FlashDevice> RollbackController<'m, F> {
    /// Create a controller over the manager's boot state.
    pub fn new(manager: &'m PartitionManager<F>) -> Self {
        Self { manager }
    }

    fn require_support(&self, op: &str) -> OtaResult<()> {
        if self.manager.config().rollback_supported {
            Ok(())
        } else {
            Err(OtaError::NotSupported(format!(
                "{op}: bootloader has no rollback bookkeeping"
            )))
        }
    }

    /// Whether the running or next image awaits confirmation.
    pub fn is_pending_verify(&self) -> bool {
        self.manager.is_pending_verify()
    }

    /// Mark the current image as good, cancelling the pending rollback.
    ///
    /// Calling it with nothing pending succeeds without writing.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::NotSupported`] without rollback support, or a flash
    /// error if the record cannot be written.
    pub fn cancel(&self) -> OtaResult<()> {
        self.require_support("cancel rollback")?;
        let before = self.manager.boot_state();
        self.manager.transition(|s| BootState {
            pending_verify: false,
            ..*s
        })?;
        if before.pending_verify {
            info!(
                partition = %self.manager.running_partition().label,
                "Image confirmed, rollback cancelled"
            );
        }
        Ok(())
    }

    /// Point the next boot at the slot that is not running, bypassing the
    /// pending-verify bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::NotSupported`] without rollback support,
    /// [`OtaError::NoUpdateSlot`] without a second slot, or a flash error.
    pub fn force(&self) -> OtaResult<()> {
        self.require_support("force boot slot")?;
        let slot = self.manager.next_update_slot()?;
        let state = self.manager.transition(|s| BootState {
            next_boot: slot,
            override_from: Some(s.override_from.unwrap_or(s.next_boot)),
            ..*s
        })?;
        info!(
            partition = %self.manager.slot_partition(state.next_boot).label,
            "Next boot forced"
        );
        Ok(())
    }

    /// Clear a [`force`](Self::force) override, restoring the boot pointer it
    /// replaced. Without an active override the boot pointer is set to the
    /// running slot.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::NotSupported`] without rollback support, or a flash
    /// error.
    pub fn cancel_force(&self) -> OtaResult<()> {
        self.require_support("cancel forced boot")?;
        let state = self.manager.transition(|s| BootState {
            next_boot: s.override_from.unwrap_or(s.running),
            override_from: None,
            ..*s
        })?;
        info!(
            partition = %self.manager.slot_partition(state.next_boot).label,
            "Forced boot cancelled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OtaConfig;
    use crate::flash::MemoryFlash;
    use crate::partition::{PartitionTable, SlotId};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn manager(config: OtaConfig) -> OtaResult<PartitionManager<MemoryFlash>> {
        let flash = MemoryFlash::new(4 * 1024 * 1024, 4096)?;
        PartitionManager::new(flash, PartitionTable::esp32_default(), config)
    }

    #[test]
    fn test_cancel_is_idempotent() -> TestResult {
        let m = manager(OtaConfig::default())?;
        m.transition(|s| BootState {
            pending_verify: true,
            ..*s
        })?;
        let rollback = RollbackController::new(&m);
        assert!(rollback.is_pending_verify());

        rollback.cancel()?;
        assert!(!rollback.is_pending_verify());
        let generation = m.boot_state().generation;

        rollback.cancel()?;
        assert!(!rollback.is_pending_verify());
        assert_eq!(m.boot_state().generation, generation);
        Ok(())
    }

    #[test]
    fn test_force_then_cancel_restores_next_boot() -> TestResult {
        let m = manager(OtaConfig::default())?;
        let rollback = RollbackController::new(&m);
        let before = m.boot_state();

        rollback.force()?;
        assert_eq!(m.boot_state().next_boot, SlotId(1));
        assert_eq!(m.boot_state().override_from, Some(before.next_boot));
        assert_eq!(m.boot_state().pending_verify, before.pending_verify);

        rollback.cancel_force()?;
        assert_eq!(m.boot_state().next_boot, before.next_boot);
        assert_eq!(m.boot_state().override_from, None);
        Ok(())
    }

    #[test]
    fn test_force_twice_keeps_original_override() -> TestResult {
        let m = manager(OtaConfig::default())?;
        let rollback = RollbackController::new(&m);
        let before = m.boot_state().next_boot;
        rollback.force()?;
        rollback.force()?;
        rollback.cancel_force()?;
        assert_eq!(m.boot_state().next_boot, before);
        Ok(())
    }

    #[test]
    fn test_cancel_force_without_override_targets_running() -> TestResult {
        let m = manager(OtaConfig::default())?;
        m.transition(|s| BootState {
            next_boot: SlotId(1),
            ..*s
        })?;
        RollbackController::new(&m).cancel_force()?;
        assert_eq!(m.boot_state().next_boot, m.boot_state().running);
        Ok(())
    }

    #[test]
    fn test_unsupported_platform() -> TestResult {
        let config = OtaConfig::builder().rollback_supported(false).build()?;
        let m = manager(config)?;
        let before = m.boot_state();
        let rollback = RollbackController::new(&m);
        assert!(matches!(rollback.cancel(), Err(OtaError::NotSupported(_))));
        assert!(matches!(rollback.force(), Err(OtaError::NotSupported(_))));
        assert!(matches!(
            rollback.cancel_force(),
            Err(OtaError::NotSupported(_))
        ));
        assert_eq!(m.boot_state(), before);
        Ok(())
    }
}
