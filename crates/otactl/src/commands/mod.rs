//! Command implementations for otactl

pub mod boot;
pub mod device;
pub mod update;

use std::path::PathBuf;

use clap::Args;
use dualboot_ota::ImageDigest;

/// Arguments of `otactl update`
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Firmware image to write
    #[arg(required_unless_present = "descriptor", conflicts_with = "descriptor")]
    pub image: Option<PathBuf>,

    /// JSON descriptor naming the image, its length and SHA-256
    #[arg(long, conflicts_with_all = ["sha256", "length"])]
    pub descriptor: Option<PathBuf>,

    /// Expected SHA-256 of the image (hex)
    #[arg(long)]
    pub sha256: Option<ImageDigest>,

    /// Expected image length in bytes (defaults to the file size)
    #[arg(long)]
    pub length: Option<u64>,

    /// Skip the read-back verification before commit
    #[arg(long)]
    pub no_verify: bool,

    /// Restart into the new image after the configured delay
    #[arg(long)]
    pub reboot: bool,
}
