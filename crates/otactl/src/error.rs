//! Error types for otactl

use std::path::PathBuf;

use dualboot_ota::OtaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Device not initialized: {0} (run `otactl init` first)")]
    DeviceNotFound(PathBuf),

    #[error("Device already initialized: {0} (use --force to overwrite)")]
    DeviceExists(PathBuf),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Ota(#[from] OtaError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::DeviceNotFound(_) | CliError::DeviceExists(_) => 2,
            CliError::ValidationError(_) => 4,
            CliError::Ota(e) => ota_exit_code(e),
            CliError::IoError(_) => 1,
        }
    }
}

/// Exit code for a library error.
///
/// 3: the image failed an integrity check. 4: bad input. 5: the device cannot
/// take updates. 6: another session owns the slot.
pub fn ota_exit_code(error: &OtaError) -> i32 {
    if error.is_integrity_failure() {
        return 3;
    }
    match error {
        OtaError::Descriptor(_)
        | OtaError::UnsupportedLocation(_)
        | OtaError::InvalidConfiguration(_)
        | OtaError::CapacityExceeded { .. } => 4,
        OtaError::NotReady | OtaError::NoUpdateSlot | OtaError::NotSupported(_) => 5,
        OtaError::Busy(_) => 6,
        _ => 1,
    }
}

/// Exit code for any error surfaced by a command.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<CliError>() {
        e.exit_code()
    } else if let Some(e) = error.downcast_ref::<OtaError>() {
        ota_exit_code(e)
    } else {
        1
    }
}
