//! Convenience re-exports for common update types

pub use crate::config::OtaConfig;
pub use crate::error::{FlashError, OtaError, OtaResult};
pub use crate::flash::{FaultPlan, FileFlash, FlashDevice, MemoryFlash};
pub use crate::image::ImageDigest;
pub use crate::loader::{ImageDescriptor, update_from_descriptor, update_from_stream};
pub use crate::manager::PartitionManager;
pub use crate::partition::{Partition, PartitionKind, PartitionTable, SlotId};
pub use crate::restart::{RestartHandle, RestartScheduler};
pub use crate::rollback::RollbackController;
pub use crate::status::StatusReport;
pub use crate::stream::StreamSource;
pub use crate::writer::{FirmwareWriter, WriteReport, WriterState};
