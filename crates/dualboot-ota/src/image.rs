//! Image digests and executable image header checks

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::OtaError;

/// First byte of a bootable ESP app image.
pub const IMAGE_MAGIC: u8 = 0xE9;
/// Size of the fixed image header (common header plus extended header).
pub const IMAGE_HEADER_LEN: usize = 24;
/// Largest segment count the second-stage loader accepts.
pub const MAX_SEGMENTS: u8 = 16;
/// Largest valid SPI flash mode value (QIO..SLOW_READ).
const MAX_SPI_MODE: u8 = 5;

/// SHA-256 digest of a firmware image
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDigest([u8; 32]);

impl ImageDigest {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of a complete byte sequence.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Finalize an incremental hasher.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ImageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImageDigest({})", self.to_hex())
    }
}

impl FromStr for ImageDigest {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| {
            OtaError::Descriptor(format!("invalid SHA-256 digest '{s}': {e}"))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for ImageDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ImageDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Parsed fields of an app image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Number of loadable segments
    pub segment_count: u8,
    /// SPI flash mode
    pub spi_mode: u8,
    /// Entry point address
    pub entry_addr: u32,
}

impl ImageHeader {
    /// Parse and check the header at the start of an image.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::InvalidImage`] if the bytes are not a well-formed
    /// bootable image header.
    pub fn parse(bytes: &[u8]) -> Result<Self, OtaError> {
        let header = bytes.get(..IMAGE_HEADER_LEN).ok_or_else(|| {
            OtaError::InvalidImage(format!(
                "image shorter than the {IMAGE_HEADER_LEN}-byte header"
            ))
        })?;
        let &[magic, segment_count, spi_mode, _spi_speed_size, e0, e1, e2, e3, ..] = header
        else {
            return Err(OtaError::InvalidImage("truncated header".to_string()));
        };

        if magic != IMAGE_MAGIC {
            return Err(OtaError::InvalidImage(format!(
                "bad magic {magic:#04x}, expected {IMAGE_MAGIC:#04x}"
            )));
        }
        if segment_count == 0 || segment_count > MAX_SEGMENTS {
            return Err(OtaError::InvalidImage(format!(
                "segment count {segment_count} outside 1..={MAX_SEGMENTS}"
            )));
        }
        if spi_mode > MAX_SPI_MODE {
            return Err(OtaError::InvalidImage(format!(
                "unknown SPI flash mode {spi_mode}"
            )));
        }
        Ok(Self {
            segment_count,
            spi_mode,
            entry_addr: u32::from_le_bytes([e0, e1, e2, e3]),
        })
    }
}
