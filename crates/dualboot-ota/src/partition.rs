//! Partition table types
//!
//! The table is fixed at provisioning time and read-only to the update
//! pipeline. App partitions are the bootable slots; the data partition with
//! the `ota` subtype holds the persisted boot record.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OtaError, OtaResult};

/// App subtype of the factory image.
pub const APP_SUBTYPE_FACTORY: u8 = 0x00;
/// App subtype of the first OTA slot; slot `n` is `APP_SUBTYPE_OTA_MIN + n`.
pub const APP_SUBTYPE_OTA_MIN: u8 = 0x10;
/// First app subtype after the OTA range.
pub const APP_SUBTYPE_OTA_END: u8 = 0x20;
/// Data subtype of the boot record region.
pub const DATA_SUBTYPE_OTA: u8 = 0x00;
/// Data subtype of the RF calibration region.
pub const DATA_SUBTYPE_PHY: u8 = 0x01;
/// Data subtype of the non-volatile key/value store.
pub const DATA_SUBTYPE_NVS: u8 = 0x02;
/// Data subtype of a FAT filesystem.
pub const DATA_SUBTYPE_FAT: u8 = 0x81;

/// Partition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Bootable firmware image
    App,
    /// Non-executable data
    Data,
}

impl std::fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKind::App => write!(f, "app"),
            PartitionKind::Data => write!(f, "data"),
        }
    }
}

/// Immutable flash region descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Partition name
    pub label: String,

    /// Partition type
    pub kind: PartitionKind,

    /// Type-specific subtype
    pub subtype: u8,

    /// Start address on the medium
    pub offset: u32,

    /// Size in bytes
    pub size: u32,
}

impl Partition {
    /// Create a partition descriptor.
    pub fn new(label: impl Into<String>, kind: PartitionKind, subtype: u8, offset: u32, size: u32) -> Self {
        Self {
            label: label.into(),
            kind,
            subtype,
            offset,
            size,
        }
    }

    /// Whether this partition holds a bootable image.
    #[must_use]
    pub fn is_app(&self) -> bool {
        self.kind == PartitionKind::App
    }

    /// Whether this is an OTA app slot. Factory and test images are app
    /// partitions too but never take updates.
    #[must_use]
    pub fn is_ota_slot(&self) -> bool {
        self.is_app() && (APP_SUBTYPE_OTA_MIN..APP_SUBTYPE_OTA_END).contains(&self.subtype)
    }

    /// First address after the partition.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    /// Human-readable subtype name.
    #[must_use]
    pub fn subtype_name(&self) -> String {
        match (self.kind, self.subtype) {
            (PartitionKind::App, APP_SUBTYPE_FACTORY) => "factory".to_string(),
            (PartitionKind::App, n) if (APP_SUBTYPE_OTA_MIN..APP_SUBTYPE_OTA_END).contains(&n) => {
                format!("ota_{}", n - APP_SUBTYPE_OTA_MIN)
            }
            (PartitionKind::Data, DATA_SUBTYPE_OTA) => "ota".to_string(),
            (PartitionKind::Data, DATA_SUBTYPE_PHY) => "phy".to_string(),
            (PartitionKind::Data, DATA_SUBTYPE_NVS) => "nvs".to_string(),
            (PartitionKind::Data, DATA_SUBTYPE_FAT) => "fat".to_string(),
            (_, other) => format!("{other:#04x}"),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Identifier of an app slot: its index among the app partitions, in table
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u8);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Provisioned partition layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Build a table, checking that labels are unique, sizes non-zero and
    /// regions disjoint.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::PartitionTable`] if the layout is inconsistent.
    pub fn new(partitions: Vec<Partition>) -> OtaResult<Self> {
        let table = Self { partitions };
        table.check_layout()?;
        Ok(table)
    }

    /// The default dual-slot layout of a 4 MiB ESP32 module.
    #[must_use]
    pub fn esp32_default() -> Self {
        Self {
            partitions: vec![
                Partition::new("nvs", PartitionKind::Data, DATA_SUBTYPE_NVS, 0x9000, 0x4000),
                Partition::new("otadata", PartitionKind::Data, DATA_SUBTYPE_OTA, 0xd000, 0x2000),
                Partition::new("phy_init", PartitionKind::Data, DATA_SUBTYPE_PHY, 0xf000, 0x1000),
                Partition::new("ota_0", PartitionKind::App, APP_SUBTYPE_OTA_MIN, 0x1_0000, 0x18_0000),
                Partition::new("ota_1", PartitionKind::App, APP_SUBTYPE_OTA_MIN + 1, 0x19_0000, 0x18_0000),
                Partition::new("vfs", PartitionKind::Data, DATA_SUBTYPE_FAT, 0x31_0000, 0xf_0000),
            ],
        }
    }

    /// Load a table from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the layout is
    /// inconsistent.
    pub fn load(path: &Path) -> OtaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let table: Self = serde_json::from_str(&text)?;
        table.check_layout()?;
        Ok(table)
    }

    /// Save the table as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> OtaResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn check_layout(&self) -> OtaResult<()> {
        let mut labels = HashSet::new();
        for p in &self.partitions {
            if p.label.is_empty() {
                return Err(OtaError::PartitionTable("empty partition label".to_string()));
            }
            if !labels.insert(p.label.as_str()) {
                return Err(OtaError::PartitionTable(format!(
                    "duplicate partition label '{}'",
                    p.label
                )));
            }
            if p.size == 0 {
                return Err(OtaError::PartitionTable(format!(
                    "partition '{}' has zero size",
                    p.label
                )));
            }
        }

        let mut sorted: Vec<&Partition> = self.partitions.iter().collect();
        sorted.sort_by_key(|p| p.offset);
        for pair in sorted.windows(2) {
            if let [a, b] = pair
                && a.end() > u64::from(b.offset)
            {
                return Err(OtaError::PartitionTable(format!(
                    "partitions '{}' and '{}' overlap",
                    a.label, b.label
                )));
            }
        }
        Ok(())
    }

    /// Check the table against the geometry of a medium.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::PartitionTable`] if a partition is unaligned or
    /// outside the medium, or there is no boot record region of at least two
    /// blocks.
    pub fn validate_for(&self, capacity: u64, block_size: u32) -> OtaResult<()> {
        for p in &self.partitions {
            if p.offset % block_size != 0 || p.size % block_size != 0 {
                return Err(OtaError::PartitionTable(format!(
                    "partition '{}' is not aligned to {block_size}-byte blocks",
                    p.label
                )));
            }
            if p.end() > capacity {
                return Err(OtaError::PartitionTable(format!(
                    "partition '{}' ends at {:#x}, beyond the medium ({capacity:#x})",
                    p.label,
                    p.end()
                )));
            }
        }
        let record = self.boot_record_partition().ok_or_else(|| {
            OtaError::PartitionTable("no data/ota partition for the boot record".to_string())
        })?;
        if u64::from(record.size) < 2 * u64::from(block_size) {
            return Err(OtaError::PartitionTable(format!(
                "boot record partition '{}' must hold two {block_size}-byte sectors",
                record.label
            )));
        }
        if self.app_partitions().count() > usize::from(u8::MAX) {
            return Err(OtaError::PartitionTable("too many app partitions".to_string()));
        }
        Ok(())
    }

    /// All partitions in table order.
    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// App partitions in table order.
    pub fn app_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.is_app())
    }

    /// The app partition for a slot.
    #[must_use]
    pub fn app(&self, slot: SlotId) -> Option<&Partition> {
        self.app_partitions().nth(usize::from(slot.0))
    }

    /// The slot identifier of an app partition.
    #[must_use]
    pub fn slot_of(&self, partition: &Partition) -> Option<SlotId> {
        self.app_partitions()
            .position(|p| p == partition)
            .and_then(|i| u8::try_from(i).ok())
            .map(SlotId)
    }

    /// Find a partition by label.
    #[must_use]
    pub fn find(&self, label: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.label == label)
    }

    /// The region holding the persisted boot record.
    #[must_use]
    pub fn boot_record_partition(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.kind == PartitionKind::Data && p.subtype == DATA_SUBTYPE_OTA)
    }

    /// Partitions sorted by start address.
    #[must_use]
    pub fn sorted_by_offset(&self) -> Vec<&Partition> {
        let mut sorted: Vec<&Partition> = self.partitions.iter().collect();
        sorted.sort_by_key(|p| p.offset);
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() -> OtaResult<()> {
        let table = PartitionTable::esp32_default();
        table.check_layout()?;
        table.validate_for(4 * 1024 * 1024, 4096)?;
        assert_eq!(table.app_partitions().count(), 2);
        assert_eq!(table.app(SlotId(1)).map(|p| p.label.as_str()), Some("ota_1"));
        assert_eq!(
            table.boot_record_partition().map(|p| p.label.as_str()),
            Some("otadata")
        );
        Ok(())
    }

    #[test]
    fn test_slot_of_round_trips() {
        let table = PartitionTable::esp32_default();
        for p in table.app_partitions() {
            let slot = table.slot_of(p);
            assert!(slot.is_some());
            assert_eq!(slot.and_then(|s| table.app(s)), Some(p));
        }
        let nvs = table.find("nvs").cloned();
        assert!(nvs.is_some_and(|p| table.slot_of(&p).is_none()));
    }

    #[test]
    fn test_overlap_rejected() {
        let result = PartitionTable::new(vec![
            Partition::new("a", PartitionKind::App, 0x10, 0x1_0000, 0x2_0000),
            Partition::new("b", PartitionKind::App, 0x11, 0x2_0000, 0x1_0000),
        ]);
        assert!(matches!(result, Err(OtaError::PartitionTable(_))));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let result = PartitionTable::new(vec![
            Partition::new("a", PartitionKind::App, 0x10, 0x1_0000, 0x1_0000),
            Partition::new("a", PartitionKind::App, 0x11, 0x2_0000, 0x1_0000),
        ]);
        assert!(matches!(result, Err(OtaError::PartitionTable(_))));
    }

    #[test]
    fn test_validate_for_geometry() -> OtaResult<()> {
        let table = PartitionTable::esp32_default();
        assert!(matches!(
            table.validate_for(2 * 1024 * 1024, 4096),
            Err(OtaError::PartitionTable(_))
        ));
        assert!(matches!(
            table.validate_for(4 * 1024 * 1024, 0x4000),
            Err(OtaError::PartitionTable(_))
        ));

        let no_record = PartitionTable::new(vec![Partition::new(
            "factory",
            PartitionKind::App,
            APP_SUBTYPE_FACTORY,
            0x1_0000,
            0x1_0000,
        )])?;
        assert!(matches!(
            no_record.validate_for(0x10_0000, 4096),
            Err(OtaError::PartitionTable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_subtype_names() {
        let table = PartitionTable::esp32_default();
        let names: Vec<String> = table
            .sorted_by_offset()
            .iter()
            .map(|p| p.subtype_name())
            .collect();
        assert_eq!(names, ["nvs", "ota", "phy", "ota_0", "ota_1", "fat"]);
        let odd = Partition::new("x", PartitionKind::Data, 0x99, 0, 0x1000);
        assert_eq!(odd.subtype_name(), "0x99");
    }

    #[test]
    fn test_json_round_trip_through_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partitions.json");
        let table = PartitionTable::esp32_default();
        table.save(&path)?;
        assert_eq!(PartitionTable::load(&path)?, table);
        Ok(())
    }
}
