//! Power-safe firmware updates for dual-slot (A/B) flash layouts
//!
//! This crate replaces the executable image of a device that keeps two
//! alternating app slots, without ever leaving it unbootable:
//! - Chunked image writes buffered to the erase-block size
//! - Length, SHA-256 and read-back verification before any boot-pointer change
//! - Double-buffered boot record that survives power loss mid-write
//! - Trial boot with automatic rollback unless the new image confirms itself
//! - Manual slot override for operator-driven switching
//!
//! # Architecture
//!
//! - [`partition`]: Partition table and slot identifiers
//! - [`flash`]: Flash medium trait plus memory and file emulators
//! - [`boot_state`]: Persisted boot record
//! - [`manager`]: Boot-slot manager, the single owner of flash and boot state
//! - [`writer`]: Write sessions with verification and commit
//! - [`rollback`]: Post-boot confirmation and manual override
//! - [`restart`]: Cancellable delayed restart
//! - [`stream`]: Byte-stream source capability
//! - [`loader`]: Image descriptor loader for local files
//! - [`status`]: Read-only status report
//! - [`config`]: Pipeline configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use dualboot_ota::prelude::*;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let flash = MemoryFlash::new(4 * 1024 * 1024, 4096)?;
//! let manager = PartitionManager::new(flash, PartitionTable::esp32_default(), OtaConfig::default())?;
//!
//! let image = std::fs::read("firmware.bin")?;
//! let target = manager.next_update_partition()?.clone();
//! let report = FirmwareWriter::scoped(&manager, &target, image.len() as u64, None, |writer| {
//!     for chunk in image.chunks(1500) {
//!         writer.write(chunk)?;
//!     }
//!     Ok(())
//! })?;
//! println!("{} bytes written to '{}'", report.bytes_written, report.partition.label);
//!
//! // After rebooting into the new image and checking it works:
//! RollbackController::new(&manager).cancel()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod boot_state;
pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod loader;
pub mod manager;
pub mod partition;
pub mod prelude;
pub mod restart;
pub mod rollback;
pub mod status;
pub mod stream;
pub mod writer;

pub use boot_state::{BootRecordStore, BootState};
pub use config::{OtaConfig, OtaConfigBuilder};
pub use error::{FlashError, OtaError, OtaResult};
pub use flash::{FaultPlan, FileFlash, FlashDevice, MemoryFlash};
pub use image::{ImageDigest, ImageHeader};
pub use loader::{ImageDescriptor, update_from_descriptor, update_from_stream};
pub use manager::{PartitionLease, PartitionManager};
pub use partition::{Partition, PartitionKind, PartitionTable, SlotId};
pub use restart::{Restart, RestartHandle, RestartScheduler};
pub use rollback::RollbackController;
pub use status::{PartitionRow, StatusReport};
pub use stream::StreamSource;
pub use writer::{FirmwareWriter, WriteReport, WriterState};
