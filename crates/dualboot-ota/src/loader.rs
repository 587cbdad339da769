//! Image descriptor loader
//!
//! A descriptor is a small JSON document naming an image file, its SHA-256
//! and its length:
//!
//! ```json
//! { "location": "firmware.bin", "sha256": "7920d527…", "length": 1558512 }
//! ```
//!
//! Relative locations are resolved against the descriptor's directory. Only
//! local files are supported; fetching over a network is left to the caller,
//! who can feed any [`StreamSource`] to [`update_from_stream`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::image::ImageDigest;
use crate::manager::PartitionManager;
use crate::stream::StreamSource;
use crate::writer::{FirmwareWriter, WriteReport};

/// Image descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageDescriptor {
    /// Path of the image, relative to the descriptor or absolute
    #[serde(alias = "firmware")]
    pub location: String,

    /// Expected SHA-256 of the image
    pub sha256: ImageDigest,

    /// Expected image length in bytes
    pub length: u64,
}

impl ImageDescriptor {
    /// Parse a descriptor from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::Descriptor`] if the text is not a valid descriptor.
    pub fn from_json(text: &str) -> OtaResult<Self> {
        serde_json::from_str(text).map_err(|e| OtaError::Descriptor(e.to_string()))
    }

    /// Read a descriptor file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`OtaError::Descriptor`] if it is malformed.
    pub fn load(path: &Path) -> OtaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Resolve the image location against the descriptor's own path.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::UnsupportedLocation`] for URLs and
    /// [`OtaError::Descriptor`] for an empty location.
    pub fn resolve_location(&self, descriptor_path: &Path) -> OtaResult<PathBuf> {
        let location = self.location.trim();
        if location.is_empty() {
            return Err(OtaError::Descriptor("empty image location".to_string()));
        }
        if location.contains("://") {
            return Err(OtaError::UnsupportedLocation(location.to_string()));
        }
        let path = Path::new(location);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base = descriptor_path.parent().unwrap_or_else(|| Path::new(""));
        Ok(base.join(path))
    }
}

/// Write an image from any stream source into the next update slot.
///
/// # Errors
///
/// Returns any error from opening, writing or closing the session; the boot
/// state is unchanged on failure.
pub fn update_from_stream<F: FlashDevice, S: StreamSource + ?Sized>(
    manager: &PartitionManager<F>,
    source: &mut S,
    expected_length: u64,
    expected_hash: Option<ImageDigest>,
) -> OtaResult<WriteReport> {
    let target = manager.next_update_partition()?.clone();
    FirmwareWriter::scoped(manager, &target, expected_length, expected_hash, |writer| {
        writer.write_stream(source).map(|_| ())
    })
}

/// Load a descriptor and write the image it names.
///
/// # Errors
///
/// Returns descriptor, I/O or write-session errors.
pub fn update_from_descriptor<F: FlashDevice>(
    manager: &PartitionManager<F>,
    descriptor_path: &Path,
) -> OtaResult<WriteReport> {
    let descriptor = ImageDescriptor::load(descriptor_path)?;
    let image_path = descriptor.resolve_location(descriptor_path)?;
    info!(
        image = %image_path.display(),
        length = descriptor.length,
        sha256 = %descriptor.sha256,
        "Loading image from descriptor"
    );
    let mut source = BufReader::new(File::open(&image_path)?);
    update_from_stream(
        manager,
        &mut source,
        descriptor.length,
        Some(descriptor.sha256),
    )
}
