//! `otactl update`: stream an image into the next update slot

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Result;
use colored::*;
use dualboot_ota::{
    FileFlash, ImageDescriptor, ImageDigest, OtaConfig, PartitionManager, RestartScheduler,
    update_from_stream,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use super::UpdateArgs;
use super::device::DeviceDir;
use crate::error::CliError;
use crate::output;

/// Image source resolved from the command line
#[derive(Debug)]
struct ImageSource {
    path: PathBuf,
    length: u64,
    sha256: Option<ImageDigest>,
}

impl ImageSource {
    fn resolve(args: &UpdateArgs) -> Result<Self> {
        if let Some(descriptor_path) = &args.descriptor {
            let descriptor = ImageDescriptor::load(descriptor_path).map_err(CliError::from)?;
            let path = descriptor
                .resolve_location(descriptor_path)
                .map_err(CliError::from)?;
            return Ok(Self {
                path,
                length: descriptor.length,
                sha256: Some(descriptor.sha256),
            });
        }

        let path = args
            .image
            .clone()
            .ok_or_else(|| CliError::ValidationError("no image given".to_string()))?;
        let length = match args.length {
            Some(length) => length,
            None => std::fs::metadata(&path).map_err(CliError::from)?.len(),
        };
        if length == 0 {
            return Err(CliError::ValidationError(format!(
                "image '{}' is empty",
                path.display()
            ))
            .into());
        }
        Ok(Self {
            path,
            length,
            sha256: args.sha256,
        })
    }
}

pub async fn execute(
    args: &UpdateArgs,
    device: &DeviceDir,
    mut config: OtaConfig,
    json: bool,
) -> Result<()> {
    if args.no_verify {
        config.verify = false;
    }
    let source = ImageSource::resolve(args)?;
    let manager = device.open(config)?;
    let target = manager.next_update_partition().map_err(CliError::from)?.clone();

    if !json {
        println!("{}", "Updating Firmware:".bold());
        println!("{}", "─".repeat(60));
        println!("  {}: {}", "Image".dimmed(), source.path.display());
        println!("  {}: {} bytes", "Length".dimmed(), source.length);
        println!("  {}: {}", "Target".dimmed(), target.label);
        println!();
    }

    let pb = if json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(source.length);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("█▓░");
        pb.set_style(style);
        pb
    };
    pb.set_message(format!("Writing to '{}'", target.label));

    let file = File::open(&source.path).map_err(CliError::from)?;
    let mut reader = pb.wrap_read(BufReader::new(file));
    let report = match update_from_stream(&manager, &mut reader, source.length, source.sha256) {
        Ok(report) => {
            pb.finish_with_message(format!("{} Image committed", "✓".green()));
            report
        }
        Err(e) => {
            pb.abandon_with_message(format!("{} Update aborted", "✗".red()));
            return Err(CliError::from(e).into());
        }
    };
    output::print_write_report(&report, json);

    if args.reboot {
        schedule_reboot(&manager, config, json).await?;
    } else if let Some((scheduler, handle)) = RestartScheduler::after_close(&config) {
        run_restart(&manager, scheduler, handle, json).await?;
    }
    Ok(())
}

async fn schedule_reboot(
    manager: &PartitionManager<FileFlash>,
    config: OtaConfig,
    json: bool,
) -> Result<()> {
    let (scheduler, handle) = RestartScheduler::schedule(config.restart_delay());
    run_restart(manager, scheduler, handle, json).await
}

/// Count down to the restart; Ctrl-C cancels it.
async fn run_restart(
    manager: &PartitionManager<FileFlash>,
    scheduler: RestartScheduler,
    handle: dualboot_ota::RestartHandle,
    json: bool,
) -> Result<()> {
    let delay = scheduler.remaining(tokio::time::Instant::now());
    if !json {
        println!(
            "{} Restarting in {:.1}s, press Ctrl-C to cancel",
            "↻".cyan(),
            delay.as_secs_f64()
        );
    }

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    let fired = scheduler.run(|| info!("Restart deadline reached")).await;
    watcher.abort();

    if !fired {
        warn!("Restart cancelled by operator");
        output::print_warning("Restart cancelled; the new image boots on the next restart", json);
        return Ok(());
    }

    let state = manager.reboot().map_err(CliError::from)?;
    let booted = manager.slot_partition(state.running).label.clone();
    output::print_success(&format!("Restarted into partition '{}'", booted), json);
    Ok(())
}
