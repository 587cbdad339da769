//! Boot-slot commands: confirm, force, cancel-force and an emulated restart

use anyhow::Result;
use dualboot_ota::{OtaConfig, RollbackController};

use super::device::DeviceDir;
use crate::error::CliError;
use crate::output;

/// `otactl confirm`: keep the running image and cancel the pending rollback.
pub fn confirm(device: &DeviceDir, config: OtaConfig, json: bool) -> Result<()> {
    let manager = device.open(config)?;
    let rollback = RollbackController::new(&manager);
    let was_pending = rollback.is_pending_verify();
    rollback.cancel().map_err(CliError::from)?;

    let running = &manager.running_partition().label;
    if was_pending {
        output::print_success(&format!("Image in '{}' confirmed", running), json);
    } else {
        output::print_warning(
            &format!("No image pending verification; '{}' stays active", running),
            json,
        );
    }
    Ok(())
}

/// `otactl force`: boot the other slot on the next restart.
pub fn force(device: &DeviceDir, config: OtaConfig, json: bool) -> Result<()> {
    let manager = device.open(config)?;
    RollbackController::new(&manager)
        .force()
        .map_err(CliError::from)?;
    output::print_success(
        &format!(
            "Next boot forced to partition '{}'",
            manager.next_boot_partition().label
        ),
        json,
    );
    Ok(())
}

/// `otactl cancel-force`: undo a previous `force`.
pub fn cancel_force(device: &DeviceDir, config: OtaConfig, json: bool) -> Result<()> {
    let manager = device.open(config)?;
    RollbackController::new(&manager)
        .cancel_force()
        .map_err(CliError::from)?;
    output::print_success(
        &format!(
            "Next boot restored to partition '{}'",
            manager.next_boot_partition().label
        ),
        json,
    );
    Ok(())
}

/// `otactl reboot`: emulate a cold boot of the device.
pub fn reboot(device: &DeviceDir, config: OtaConfig, json: bool) -> Result<()> {
    let manager = device.open(config)?;
    let before = manager.boot_state();
    let after = manager.reboot().map_err(CliError::from)?;
    let booted = &manager.slot_partition(after.running).label;

    if before.pending_verify && before.running == before.next_boot {
        output::print_warning(
            &format!(
                "Image in '{}' was never confirmed; rolled back to '{}'",
                manager.slot_partition(before.running).label,
                booted
            ),
            json,
        );
    } else if after.pending_verify {
        output::print_success(
            &format!(
                "Booted new image from '{}'; run `otactl confirm` to keep it",
                booted
            ),
            json,
        );
    } else {
        output::print_success(&format!("Booted from partition '{}'", booted), json);
    }
    Ok(())
}
