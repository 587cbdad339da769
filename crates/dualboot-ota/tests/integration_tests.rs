//! Integration tests for the firmware update lifecycle

use std::io::Read;
use std::time::Duration;

use dualboot_ota::image::IMAGE_MAGIC;
use dualboot_ota::prelude::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const FLASH_SIZE: u64 = 4 * 1024 * 1024;
const BLOCK_SIZE: u32 = 4096;
const IMAGE_LEN: usize = 1_558_512;

fn device(config: OtaConfig) -> OtaResult<PartitionManager<MemoryFlash>> {
    let flash = MemoryFlash::new(FLASH_SIZE, BLOCK_SIZE)?;
    PartitionManager::new(flash, PartitionTable::esp32_default(), config)
}

/// Deterministic app image with a valid header.
fn firmware_image(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&[IMAGE_MAGIC, 5, 2, 0x20, 0x18, 0x0a, 0x08, 0x40]);
    while data.len() < len {
        // xorshift32
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    data
}

/// Chunk sizes that never line up with the erase block.
fn ragged_chunks(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let sizes = [1usize, 4095, 4097, 13, 65_536, 7, 1500, 8191];
    let mut offset = 0;
    let mut i = 0;
    std::iter::from_fn(move || {
        if offset >= data.len() {
            return None;
        }
        let size = sizes.get(i % sizes.len()).copied().unwrap_or(1);
        i += 1;
        let end = (offset + size).min(data.len());
        let chunk = data.get(offset..end);
        offset = end;
        chunk
    })
}

/// Reader that hands out at most `max` bytes per call.
struct Trickle<'a> {
    data: &'a [u8],
    max: usize,
}

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.max.min(buf.len()).min(self.data.len());
        let (head, tail) = self.data.split_at(n);
        buf.get_mut(..n)
            .ok_or_else(|| std::io::Error::other("short buffer"))?
            .copy_from_slice(head);
        self.data = tail;
        Ok(n)
    }
}

#[test]
fn test_full_image_commits_boot_pointer() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(IMAGE_LEN, 1);
    let digest = ImageDigest::of(&image);
    let target = m.next_update_partition()?.clone();

    let mut writer = FirmwareWriter::new(&m);
    writer.open(&target, IMAGE_LEN as u64, Some(digest))?;
    for chunk in ragged_chunks(&image) {
        writer.write(chunk)?;
    }
    let report = writer.close()?;

    assert_eq!(report.bytes_written, IMAGE_LEN as u64);
    assert_eq!(report.digest, digest);
    assert_eq!(report.partition, target);

    let state = m.boot_state();
    assert_eq!(m.slot_partition(state.next_boot), &target);
    assert!(state.pending_verify);
    assert_eq!(m.running_partition().label, "ota_0");
    Ok(())
}

#[test]
fn test_wrong_length_leaves_boot_pointer() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(IMAGE_LEN, 1);
    let target = m.next_update_partition()?.clone();
    let running_before = m.running_partition().clone();
    let next_before = m.next_update_partition()?.clone();
    let state_before = m.boot_state();

    let mut writer = FirmwareWriter::new(&m);
    writer.open(&target, 1_558_500, Some(ImageDigest::of(&image)))?;
    for chunk in ragged_chunks(&image) {
        writer.write(chunk)?;
    }
    let result = writer.close();

    assert!(matches!(
        result,
        Err(OtaError::LengthMismatch {
            expected: 1_558_500,
            actual: 1_558_512
        })
    ));
    assert_eq!(writer.state(), WriterState::Aborted);
    assert_eq!(m.running_partition(), &running_before);
    assert_eq!(m.next_update_partition()?, &next_before);
    assert_eq!(m.boot_state(), state_before);
    assert!(!m.is_busy(&target));
    Ok(())
}

#[test]
fn test_wrong_hash_leaves_boot_state() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(50_000, 2);
    let target = m.next_update_partition()?.clone();
    let before = m.boot_state();

    let wrong = ImageDigest::of(b"some other image");
    let result = FirmwareWriter::scoped(&m, &target, image.len() as u64, Some(wrong), |w| {
        w.write(&image)
    });

    match result {
        Err(OtaError::HashMismatch { expected, actual }) => {
            assert_eq!(expected, wrong.to_hex());
            assert_eq!(actual, ImageDigest::of(&image).to_hex());
        }
        other => return Err(format!("expected HashMismatch, got {other:?}").into()),
    }
    assert_eq!(m.boot_state(), before);
    Ok(())
}

#[test]
fn test_second_open_is_busy() -> TestResult {
    let m = device(OtaConfig::default())?;
    let target = m.next_update_partition()?.clone();
    let image = firmware_image(20_000, 3);

    let mut first = FirmwareWriter::new(&m);
    first.open(&target, image.len() as u64, None)?;
    first.write(image.get(..10_000).ok_or("short image")?)?;

    let mut second = FirmwareWriter::new(&m);
    assert!(matches!(
        second.open(&target, 0, None),
        Err(OtaError::Busy(label)) if label == target.label
    ));
    assert_eq!(second.state(), WriterState::Init);

    // The first session is unaffected.
    assert_eq!(first.state(), WriterState::Open);
    assert_eq!(first.bytes_written(), 10_000);
    first.write(image.get(10_000..).ok_or("short image")?)?;
    let report = first.close()?;
    assert_eq!(report.digest, ImageDigest::of(&image));
    Ok(())
}

#[test]
fn test_stream_update_and_confirm() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(300_000, 4);
    let mut source = Trickle {
        data: &image,
        max: 1000,
    };

    let report = update_from_stream(
        &m,
        &mut source,
        image.len() as u64,
        Some(ImageDigest::of(&image)),
    )?;
    assert_eq!(report.partition.label, "ota_1");

    // Trial boot, then confirm.
    m.reboot()?;
    assert_eq!(m.running_partition().label, "ota_1");
    let rollback = RollbackController::new(&m);
    assert!(rollback.is_pending_verify());
    rollback.cancel()?;

    m.reboot()?;
    assert_eq!(m.running_partition().label, "ota_1");
    assert!(!m.is_pending_verify());
    assert_eq!(m.next_update_partition()?.label, "ota_0");
    Ok(())
}

#[test]
fn test_unconfirmed_image_rolls_back() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(100_000, 5);
    let target = m.next_update_partition()?.clone();
    FirmwareWriter::scoped(&m, &target, 0, None, |w| w.write(&image))?;

    m.reboot()?;
    assert_eq!(m.running_partition().label, "ota_1");
    m.reboot()?;
    assert_eq!(m.running_partition().label, "ota_0");
    assert_eq!(m.next_boot_partition().label, "ota_0");
    assert!(!m.is_pending_verify());
    Ok(())
}

#[test]
fn test_boot_state_survives_power_cycle() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(10_000, 6);
    let target = m.next_update_partition()?.clone();
    FirmwareWriter::scoped(&m, &target, 0, None, |w| w.write(&image))?;
    let state = m.boot_state();

    let flash = m.with_flash(|f| f.clone());
    drop(m);
    let reopened = PartitionManager::new(flash, PartitionTable::esp32_default(), OtaConfig::default())?;
    assert_eq!(reopened.boot_state(), state);
    assert_eq!(reopened.next_boot_partition(), &target);
    Ok(())
}

#[test]
fn test_power_cut_during_commit_keeps_old_pointer() -> TestResult {
    let m = device(OtaConfig::default())?;
    let image = firmware_image(8192, 7);
    let target = m.next_update_partition()?.clone();
    let before = m.boot_state();

    let mut writer = FirmwareWriter::new(&m);
    writer.open(&target, 0, None)?;
    writer.write(&image)?;
    // Both image blocks are programmed already; the next mutation is the
    // record erase, and the one after it is the torn record program.
    m.with_flash(|f| {
        f.set_faults(FaultPlan {
            power_cut_after: Some(1),
            ..FaultPlan::default()
        });
    });
    assert!(matches!(writer.close(), Err(OtaError::Flash(_))));
    assert_eq!(m.boot_state(), before);

    let mut flash = m.with_flash(|f| f.clone());
    flash.set_faults(FaultPlan::default());
    let reopened = PartitionManager::new(flash, PartitionTable::esp32_default(), OtaConfig::default())?;
    assert_eq!(reopened.boot_state(), before);
    Ok(())
}

#[test]
fn test_verification_can_be_disabled() -> TestResult {
    let config = OtaConfig::builder().verify(false).build()?;
    let m = device(config)?;
    let image = firmware_image(9000, 8);
    let target = m.next_update_partition()?.clone();
    m.with_flash(|f| {
        f.set_faults(FaultPlan {
            bit_flip_at: Some(u64::from(target.offset) + 6000),
            ..FaultPlan::default()
        });
    });

    // Without read-back the corruption goes unnoticed.
    let report = FirmwareWriter::scoped(&m, &target, 0, None, |w| w.write(&image))?;
    assert_eq!(report.digest, ImageDigest::of(&image));
    assert!(m.is_pending_verify());
    Ok(())
}

#[test]
fn test_force_and_cancel_force_round_trip() -> TestResult {
    let m = device(OtaConfig::default())?;
    // Factory image in the first slot.
    let factory = m.running_partition().offset;
    m.with_flash(|f| f.poke(u64::from(factory), &firmware_image(64, 0)))?;
    let image = firmware_image(10_000, 9);
    let target = m.next_update_partition()?.clone();
    FirmwareWriter::scoped(&m, &target, 0, None, |w| w.write(&image))?;
    m.reboot()?;
    RollbackController::new(&m).cancel()?;

    let rollback = RollbackController::new(&m);
    let before = m.boot_state().next_boot;
    rollback.force()?;
    assert_eq!(m.next_boot_partition().label, "ota_0");
    rollback.cancel_force()?;
    assert_eq!(m.boot_state().next_boot, before);

    // A forced switch to a slot with a valid image takes effect on boot.
    rollback.force()?;
    m.reboot()?;
    assert_eq!(m.running_partition().label, "ota_0");
    assert_eq!(m.boot_state().override_from, None);
    Ok(())
}

#[test]
fn test_not_ready_platform_refuses_updates() -> TestResult {
    let config = OtaConfig::builder().rollback_supported(false).build()?;
    let m = device(config)?;
    let target = m.table().find("ota_1").cloned().ok_or("no ota_1")?;
    let mut writer = FirmwareWriter::new(&m);
    assert!(matches!(
        writer.open(&target, 0, None),
        Err(OtaError::NotReady)
    ));
    assert!(!m.is_busy(&target));
    Ok(())
}

#[test]
fn test_descriptor_update_from_files() -> TestResult {
    let dir = tempfile::tempdir()?;
    let image = firmware_image(40_000, 10);
    std::fs::create_dir(dir.path().join("images"))?;
    std::fs::write(dir.path().join("images/app.bin"), &image)?;
    let descriptor = dir.path().join("latest.json");
    std::fs::write(
        &descriptor,
        format!(
            r#"{{ "firmware": "images/app.bin", "sha256": "{}", "length": {} }}"#,
            ImageDigest::of(&image),
            image.len()
        ),
    )?;

    let flash = FileFlash::create(&dir.path().join("flash.bin"), FLASH_SIZE, BLOCK_SIZE)?;
    let m = PartitionManager::new(flash, PartitionTable::esp32_default(), OtaConfig::default())?;
    let report = update_from_descriptor(&m, &descriptor)?;
    assert_eq!(report.bytes_written, 40_000);
    assert_eq!(m.next_boot_partition().label, "ota_1");
    Ok(())
}

#[test]
fn test_descriptor_with_bad_digest_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let image = firmware_image(5000, 11);
    std::fs::write(dir.path().join("app.bin"), &image)?;
    let descriptor = dir.path().join("latest.json");
    std::fs::write(
        &descriptor,
        format!(
            r#"{{ "location": "app.bin", "sha256": "{}", "length": {} }}"#,
            ImageDigest::of(b"not the image"),
            image.len()
        ),
    )?;

    let m = device(OtaConfig::default())?;
    let before = m.boot_state();
    assert!(matches!(
        update_from_descriptor(&m, &descriptor),
        Err(OtaError::HashMismatch { .. })
    ));
    assert_eq!(m.boot_state(), before);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_close_can_be_cancelled() -> TestResult {
    let config = OtaConfig::builder()
        .restart_on_close(true)
        .restart_delay_ms(10_000)
        .build()?;
    let m = device(config)?;
    let image = firmware_image(4096, 12);
    let target = m.next_update_partition()?.clone();
    FirmwareWriter::scoped(&m, &target, 0, None, |w| w.write(&image))?;

    let (scheduler, handle) =
        RestartScheduler::after_close(m.config()).ok_or("restart not scheduled")?;
    let task = tokio::spawn(scheduler.run(|| {}));
    tokio::time::sleep(Duration::from_secs(4)).await;
    handle.cancel();
    assert!(!task.await?);
    Ok(())
}
