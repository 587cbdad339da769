//! otactl - dual-slot firmware update CLI
//!
//! Drives power-safe firmware updates, boot-slot switching and rollback on a
//! file-backed emulated flash device.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use dualboot_ota::OtaConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::UpdateArgs;
use crate::commands::device::DeviceDir;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "otactl")]
#[command(about = "Dual-slot firmware update CLI - write images, switch boot slots, roll back")]
#[command(version)]
#[command(long_about = "
otactl writes firmware images into the inactive slot of an A/B flash layout,
commits the boot pointer only after the image is verified, and manages the
confirm/rollback cycle after restart.

The device is a directory holding partitions.json and flash.bin.
Use --json flag for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(
        long,
        global = true,
        help = "Output in JSON format for machine parsing"
    )]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Device directory
    #[arg(long, global = true, env = "OTACTL_DEVICE", default_value = "device")]
    device: PathBuf,

    /// Update pipeline configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a blank device with the default partition layout
    Init {
        /// Overwrite an existing device
        #[arg(short, long)]
        force: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show boot slots and the partition table
    Status,

    /// Write a firmware image into the next update slot
    Update(UpdateArgs),

    /// Confirm the running image and cancel the pending rollback
    Confirm,

    /// Boot the other slot on the next restart
    Force,

    /// Undo a previous force
    CancelForce,

    /// Emulate a cold boot of the device
    Reboot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("otactl={},dualboot_ota={}", log_level, log_level).into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = execute_command(&cli).await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            std::process::exit(error::exit_code(&e));
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OtaConfig> {
    match path {
        Some(path) => Ok(OtaConfig::load(path).map_err(CliError::from)?),
        None => Ok(OtaConfig::default()),
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let device = DeviceDir::new(&cli.device);

    match &cli.command {
        Commands::Init { force, yes } => {
            commands::device::init(&device, config, *force, *yes, cli.json)
        }
        Commands::Status => commands::device::status(&device, config, cli.json),
        Commands::Update(args) => commands::update::execute(args, &device, config, cli.json).await,
        Commands::Confirm => commands::boot::confirm(&device, config, cli.json),
        Commands::Force => commands::boot::force(&device, config, cli.json),
        Commands::CancelForce => commands::boot::cancel_force(&device, config, cli.json),
        Commands::Reboot => commands::boot::reboot(&device, config, cli.json),
    }
}
