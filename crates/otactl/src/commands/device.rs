//! Emulated device directory: provisioning, opening and status

use std::path::{Path, PathBuf};

use anyhow::Result;
use dialoguer::Confirm;
use dualboot_ota::{FileFlash, OtaConfig, PartitionManager, PartitionTable, StatusReport};
use tracing::{debug, info};

use crate::error::CliError;
use crate::output;

/// Capacity of a provisioned medium.
pub const FLASH_CAPACITY: u64 = 4 * 1024 * 1024;

/// Erase block size of a provisioned medium.
pub const BLOCK_SIZE: u32 = 4096;

const PARTITIONS_FILE: &str = "partitions.json";
const FLASH_FILE: &str = "flash.bin";

/// A device directory holding `partitions.json` and `flash.bin`
#[derive(Debug, Clone)]
pub struct DeviceDir {
    root: PathBuf,
}

impl DeviceDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partitions_path(&self) -> PathBuf {
        self.root.join(PARTITIONS_FILE)
    }

    pub fn flash_path(&self) -> PathBuf {
        self.root.join(FLASH_FILE)
    }

    pub fn exists(&self) -> bool {
        self.partitions_path().is_file() && self.flash_path().is_file()
    }

    /// Open the device and load its boot state.
    pub fn open(&self, config: OtaConfig) -> Result<PartitionManager<FileFlash>> {
        if !self.exists() {
            return Err(CliError::DeviceNotFound(self.root.clone()).into());
        }
        let table = PartitionTable::load(&self.partitions_path()).map_err(CliError::from)?;
        let flash = FileFlash::open(&self.flash_path(), BLOCK_SIZE)
            .map_err(|e| CliError::Ota(e.into()))?;
        debug!(device = %self.root.display(), "Opening device");
        Ok(PartitionManager::new(flash, table, config).map_err(CliError::from)?)
    }

    /// Write a fresh partition table and an erased medium, then persist the
    /// initial boot record.
    fn provision(&self, config: OtaConfig) -> Result<PartitionManager<FileFlash>> {
        std::fs::create_dir_all(&self.root).map_err(CliError::from)?;
        let table = PartitionTable::esp32_default();
        table
            .save(&self.partitions_path())
            .map_err(CliError::from)?;
        let flash = FileFlash::create(&self.flash_path(), FLASH_CAPACITY, BLOCK_SIZE)
            .map_err(|e| CliError::Ota(e.into()))?;
        info!(device = %self.root.display(), "Provisioned device");
        Ok(PartitionManager::new(flash, table, config).map_err(CliError::from)?)
    }
}

/// `otactl init`
pub fn init(
    device: &DeviceDir,
    config: OtaConfig,
    force: bool,
    yes: bool,
    json: bool,
) -> Result<()> {
    if device.exists() {
        if !force {
            return Err(CliError::DeviceExists(device.root().to_path_buf()).into());
        }
        if !yes
            && !json
            && !Confirm::new()
                .with_prompt("Erase the existing device and all images on it?")
                .default(false)
                .interact()?
        {
            output::print_warning("Initialization cancelled", false);
            return Ok(());
        }
    }

    let manager = device.provision(config)?;
    let running = manager.running_partition().label.clone();
    output::print_success(
        &format!(
            "Initialized device at {} (running '{}')",
            device.root().display(),
            running
        ),
        json,
    );
    Ok(())
}

/// `otactl status`
pub fn status(device: &DeviceDir, config: OtaConfig, json: bool) -> Result<()> {
    let manager = device.open(config)?;
    output::print_status(&StatusReport::collect(&manager), json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_open_missing_device() -> TestResult {
        let dir = tempfile::tempdir()?;
        let device = DeviceDir::new(dir.path().join("dev"));
        let err = match device.open(OtaConfig::default()) {
            Ok(_) => return Err("expected an error".into()),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::DeviceNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_provision_then_open() -> TestResult {
        let dir = tempfile::tempdir()?;
        let device = DeviceDir::new(dir.path().join("dev"));
        drop(device.provision(OtaConfig::default())?);
        assert!(device.exists());
        assert_eq!(std::fs::metadata(device.flash_path())?.len(), FLASH_CAPACITY);

        let manager = device.open(OtaConfig::default())?;
        assert_eq!(manager.running_partition().label, "ota_0");
        assert_eq!(manager.next_update_partition()?.label, "ota_1");
        Ok(())
    }
}
