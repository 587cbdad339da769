//! Error types for firmware write and boot-slot operations

use thiserror::Error;

/// Errors reported by a flash medium
#[derive(Error, Debug)]
pub enum FlashError {
    /// Access outside the medium
    #[error("Flash access out of bounds: offset {offset:#x} + {len} > capacity {capacity:#x}")]
    OutOfBounds {
        /// Start of the access
        offset: u64,
        /// Length of the access
        len: u64,
        /// Medium capacity in bytes
        capacity: u64,
    },

    /// Erase not aligned to the erase block size
    #[error("Flash erase not aligned to {block_size}-byte blocks: offset {offset:#x}, len {len}")]
    Unaligned {
        /// Start of the erase
        offset: u64,
        /// Length of the erase
        len: u64,
        /// Erase block size
        block_size: u32,
    },

    /// The medium reported a failure
    #[error("Flash hardware error at {offset:#x}: {reason}")]
    Hardware {
        /// Address of the failing operation
        offset: u64,
        /// Reason reported by the medium
        reason: String,
    },

    /// I/O error from a file-backed medium
    #[error("Flash I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during firmware update and rollback operations
#[derive(Error, Debug)]
pub enum OtaError {
    /// The platform lacks boot-slot switching or rollback bookkeeping
    #[error("OTA not ready: platform does not support boot-slot switching and rollback")]
    NotReady,

    /// The partition layout has fewer than two app partitions
    #[error("No update slot: partition table provides fewer than two app partitions")]
    NoUpdateSlot,

    /// Another write session owns the target partition
    #[error("Partition '{0}' is busy: another write session owns it")]
    Busy(String),

    /// The image does not fit into the target partition
    #[error("Capacity exceeded: {attempted} bytes do not fit into partition of {capacity} bytes")]
    CapacityExceeded {
        /// Total bytes the caller tried to place in the partition
        attempted: u64,
        /// Partition size in bytes
        capacity: u64,
    },

    /// Number of bytes written differs from the expected length
    #[error("Length mismatch: received {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// Expected image length
        expected: u64,
        /// Bytes actually written
        actual: u64,
    },

    /// Digest of the written bytes differs from the expected digest
    #[error("SHA-256 mismatch: received {actual}, expected {expected}")]
    HashMismatch {
        /// Expected digest (hex)
        expected: String,
        /// Digest of the received bytes (hex)
        actual: String,
    },

    /// Digest of the bytes read back from flash differs from the written digest
    #[error("Read-back verification failed: written {written}, read {read}")]
    ReadbackMismatch {
        /// Digest computed while writing (hex)
        written: String,
        /// Digest computed from the read-back (hex)
        read: String,
    },

    /// The image header at the start of the partition is not a bootable image
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Flash medium failure
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Rollback operation requested on a platform without rollback support
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Operation not valid in the current session or manager state
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid partition table
    #[error("Partition table error: {0}")]
    PartitionTable(String),

    /// Malformed image descriptor
    #[error("Image descriptor error: {0}")]
    Descriptor(String),

    /// Image location cannot be fetched by the local loader
    #[error("Unsupported image location: {0}")]
    UnsupportedLocation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OtaError {
    /// Whether the error comes from an integrity check on the written image.
    ///
    /// The target partition content is stale after such a failure and is only
    /// reused by the next successful write.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            OtaError::LengthMismatch { .. }
                | OtaError::HashMismatch { .. }
                | OtaError::ReadbackMismatch { .. }
                | OtaError::InvalidImage(_)
        )
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(e: serde_json::Error) -> Self {
        OtaError::Serialization(e.to_string())
    }
}

/// A specialized `Result` type for OTA operations.
pub type OtaResult<T> = std::result::Result<T, OtaError>;
