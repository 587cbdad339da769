//! Read-only status report of boot slots and the partition table

use serde::Serialize;

use crate::flash::FlashDevice;
use crate::manager::PartitionManager;

/// One row of the partition table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionRow {
    /// Partition label
    pub label: String,
    /// `app` or `data`
    pub kind: String,
    /// Subtype name
    pub subtype: String,
    /// Start address
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

/// Snapshot of the update-relevant device state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Partition currently executing
    pub running: String,
    /// Partition the next update writes to, if updates are possible
    pub next_update: Option<String>,
    /// Partition loaded on the next cold boot
    pub next_boot: String,
    /// Whether an image awaits confirmation
    pub pending_verify: bool,
    /// Whether a manual boot override is active
    pub forced: bool,
    /// Whether the device can take updates
    pub ota_ready: bool,
    /// Partitions sorted by address
    pub partitions: Vec<PartitionRow>,
}

impl StatusReport {
    /// Collect the report from a manager.
    pub fn collect<F: FlashDevice>(manager: &PartitionManager<F>) -> Self {
        let state = manager.boot_state();
        let partitions = manager
            .table()
            .sorted_by_offset()
            .into_iter()
            .map(|p| PartitionRow {
                label: p.label.clone(),
                kind: p.kind.to_string(),
                subtype: p.subtype_name(),
                offset: p.offset,
                size: p.size,
            })
            .collect();
        Self {
            running: manager.slot_partition(state.running).label.clone(),
            next_update: manager
                .next_update_partition()
                .ok()
                .map(|p| p.label.clone()),
            next_boot: manager.slot_partition(state.next_boot).label.clone(),
            pending_verify: state.pending_verify,
            forced: state.override_from.is_some(),
            ota_ready: manager.capability_check(),
            partitions,
        }
    }

    /// Human-readable lines.
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Firmware is loading from partition '{}'.",
            self.running
        )];
        match (&self.next_update, self.ota_ready) {
            (Some(next), true) => lines.push(format!("The next OTA partition is '{next}'.")),
            _ => lines.push("The bootloader does not support OTA.".to_string()),
        }
        if self.next_boot != self.running {
            let how = if self.forced { " (forced)" } else { "" };
            lines.push(format!(
                "The next boot loads partition '{}'{how}.",
                self.next_boot
            ));
        }
        if self.pending_verify {
            lines.push("The new image is pending verification; confirm it after boot.".to_string());
        }
        lines.extend(self.partition_table());
        lines
    }

    /// The partition table section of [`render`](Self::render).
    pub fn partition_table(&self) -> Vec<String> {
        let mut lines = vec![
            "Partition table:".to_string(),
            "# Name       Type     SubType      Offset       Size (bytes)".to_string(),
        ];
        lines.extend(self.partitions.iter().map(|p| {
            format!(
                "  {:10} {:8} {:8} {:#10x} {:#10x} {:>10}",
                p.label,
                p.kind,
                p.subtype,
                p.offset,
                p.size,
                group_thousands(u64::from(p.size))
            )
        }));
        lines
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
