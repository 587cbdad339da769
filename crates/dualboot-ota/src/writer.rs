//! Firmware write sessions
//!
//! A [`FirmwareWriter`] streams one image into an app partition. Caller chunks
//! are buffered to the medium's erase-block size, hashed as they are
//! programmed, and checked at [`close`](FirmwareWriter::close) in this order:
//! length, digest, read-back. Only when every check passes is the boot pointer
//! committed.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, trace, warn};

use crate::boot_state::BootState;
use crate::error::{OtaError, OtaResult};
use crate::flash::{ERASED_BYTE, FlashDevice};
use crate::image::ImageDigest;
use crate::manager::{PartitionLease, PartitionManager};
use crate::partition::Partition;
use crate::stream::StreamSource;

/// Writer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriterState {
    /// Created, no session yet
    Init,
    /// A session owns the target partition
    Open,
    /// The image was verified and committed
    ClosedOk,
    /// The session was discarded; boot state is untouched
    Aborted,
}

/// Outcome of a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Partition that now holds the image
    pub partition: Partition,
    /// Logical image length (padding excluded)
    pub bytes_written: u64,
    /// SHA-256 of the image
    pub digest: ImageDigest,
}

struct WriteSession<'m, F: FlashDevice> {
    _lease: PartitionLease<'m, F>,
    target: Partition,
    bytes_written: u64,
    programmed: u64,
    hasher: Sha256,
    expected_length: Option<u64>,
    expected_hash: Option<ImageDigest>,
    buffer: Vec<u8>,
    overflowed: bool,
}

/// Single-use firmware write session driver
pub struct FirmwareWriter<'m, F: FlashDevice> {
    manager: &'m PartitionManager<F>,
    state: WriterState,
    session: Option<WriteSession<'m, F>>,
}

impl<'m, F: FlashDevice> FirmwareWriter<'m, F> {
    /// Create a writer in the `Init` state.
    pub fn new(manager: &'m PartitionManager<F>) -> Self {
        Self {
            manager,
            state: WriterState::Init,
            session: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Logical bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.bytes_written)
    }

    /// Target partition of the open session.
    pub fn target(&self) -> Option<&Partition> {
        self.session.as_ref().map(|s| &s.target)
    }

    /// Open a session on `target`.
    ///
    /// `expected_length` of 0 means no length check. A running image that is
    /// still on its trial boot is confirmed first, so an update never starts
    /// from an image the platform could roll back. If the boot pointer refers
    /// to `target` it is moved back to the running slot and any forced boot
    /// is cleared before the erase. That change is persisted and survives
    /// [`abort`](Self::abort) or a failed [`close`](Self::close), so a
    /// partially written slot is never the boot target.
    ///
    /// # Errors
    ///
    /// - [`OtaError::NotReady`] / [`OtaError::NoUpdateSlot`] if the platform
    ///   cannot take updates
    /// - [`OtaError::InvalidState`] if the writer was already used or the
    ///   target is not a non-running OTA slot
    /// - [`OtaError::CapacityExceeded`] if `expected_length` does not fit
    /// - [`OtaError::Busy`] if another session owns the target
    /// - a flash error if the erase fails; the writer is then `Aborted`
    pub fn open(
        &mut self,
        target: &Partition,
        expected_length: u64,
        expected_hash: Option<ImageDigest>,
    ) -> OtaResult<()> {
        if self.state != WriterState::Init {
            return Err(OtaError::InvalidState(format!(
                "open requires a fresh writer, state is {:?}",
                self.state
            )));
        }
        self.manager.ensure_ready()?;

        let slot = self
            .manager
            .slot_of(target)
            .map_err(|_e| OtaError::InvalidState(format!("'{}' is not an app partition", target.label)))?;
        if !target.is_ota_slot() {
            return Err(OtaError::InvalidState(format!(
                "'{}' is not an OTA slot",
                target.label
            )));
        }
        let running = self.manager.boot_state().running;
        if slot == running {
            return Err(OtaError::InvalidState(format!(
                "'{}' is the running partition",
                target.label
            )));
        }
        let capacity = u64::from(target.size);
        if expected_length > capacity {
            return Err(OtaError::CapacityExceeded {
                attempted: expected_length,
                capacity,
            });
        }

        let lease = self.manager.claim(target)?;

        let state = self.manager.boot_state();
        if state.pending_verify && state.running == state.next_boot {
            info!(
                partition = %self.manager.running_partition().label,
                "Confirming running image before update"
            );
        }
        let prepared = self.manager.transition(|s| {
            let mut next = *s;
            if s.pending_verify && s.running == s.next_boot {
                next.pending_verify = false;
            }
            if s.next_boot == slot {
                next = BootState {
                    next_boot: s.running,
                    pending_verify: false,
                    override_from: None,
                    ..next
                };
            }
            next
        });
        if let Err(e) = prepared {
            self.state = WriterState::Aborted;
            return Err(e);
        }

        let erased = self
            .manager
            .with_flash(|f| f.erase(u64::from(target.offset), capacity));
        if let Err(e) = erased {
            warn!(partition = %target.label, error = %e, "Erase failed, aborting");
            self.state = WriterState::Aborted;
            return Err(e.into());
        }

        info!(
            partition = %target.label,
            expected_length,
            "Writing new image to OTA partition"
        );
        self.session = Some(WriteSession {
            _lease: lease,
            target: target.clone(),
            bytes_written: 0,
            programmed: 0,
            hasher: Sha256::new(),
            expected_length: (expected_length > 0).then_some(expected_length),
            expected_hash,
            buffer: Vec::with_capacity(self.manager.block_size() as usize),
            overflowed: false,
        });
        self.state = WriterState::Open;
        Ok(())
    }

    fn session_mut(&mut self, op: &str) -> OtaResult<&mut WriteSession<'m, F>> {
        let state = self.state;
        match self.session.as_mut() {
            Some(session) if state == WriterState::Open && !session.overflowed => Ok(session),
            Some(_) => Err(OtaError::InvalidState(format!(
                "{op} rejected after capacity overflow; only abort is allowed"
            ))),
            None => Err(OtaError::InvalidState(format!(
                "{op} requires an open session, state is {state:?}"
            ))),
        }
    }

    /// Append `data` to the image.
    ///
    /// # Errors
    ///
    /// - [`OtaError::CapacityExceeded`] if the data would overflow the
    ///   partition; afterwards only [`abort`](Self::abort) is accepted
    /// - [`OtaError::InvalidState`] if no session is open
    /// - a flash error; the session is aborted
    pub fn write(&mut self, data: &[u8]) -> OtaResult<()> {
        let block_size = self.manager.block_size() as usize;
        let manager = self.manager;
        let session = self.session_mut("write")?;

        let capacity = u64::from(session.target.size);
        let attempted = session.bytes_written.saturating_add(data.len() as u64);
        if attempted > capacity {
            session.overflowed = true;
            warn!(
                partition = %session.target.label,
                attempted,
                capacity,
                "Image exceeds partition capacity"
            );
            return Err(OtaError::CapacityExceeded {
                attempted,
                capacity,
            });
        }

        let mut rest = data;
        while !rest.is_empty() {
            let room = block_size.saturating_sub(session.buffer.len());
            let (head, tail) = rest.split_at(room.min(rest.len()));
            session.buffer.extend_from_slice(head);
            session.bytes_written = session.bytes_written.saturating_add(head.len() as u64);
            rest = tail;
            if session.buffer.len() == block_size
                && let Err(e) = session.flush_block(manager)
            {
                self.fail("write", &e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drain `source` into the image until it reports end of data.
    ///
    /// Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`write`](Self::write), or [`OtaError::Io`] if
    /// the source fails. A source failure leaves the session open.
    pub fn write_stream<S: StreamSource + ?Sized>(&mut self, source: &mut S) -> OtaResult<u64> {
        let mut chunk = vec![0u8; self.manager.block_size() as usize];
        let mut total = 0u64;
        loop {
            let filled = source.fill(&mut chunk)?;
            if filled == 0 {
                break;
            }
            let data = chunk.get(..filled).ok_or_else(|| {
                OtaError::InvalidState(format!("stream reported {filled} bytes for a smaller buffer"))
            })?;
            self.write(data)?;
            total = total.saturating_add(filled as u64);
        }
        Ok(total)
    }

    /// Finish the image: flush, validate and commit.
    ///
    /// # Errors
    ///
    /// [`OtaError::LengthMismatch`], [`OtaError::HashMismatch`],
    /// [`OtaError::ReadbackMismatch`] or an error from
    /// [`PartitionManager::commit`]. Any failure leaves the writer `Aborted`
    /// and the boot state as [`open`](Self::open) left it.
    pub fn close(&mut self) -> OtaResult<WriteReport> {
        self.session_mut("close")?;
        let Some(mut session) = self.session.take() else {
            return Err(OtaError::InvalidState("close requires an open session".to_string()));
        };
        // Every exit from here releases the lease with the session.
        self.state = WriterState::Aborted;

        let result = session.finish(self.manager);
        match &result {
            Ok(report) => {
                self.state = WriterState::ClosedOk;
                info!(
                    partition = %report.partition.label,
                    bytes = report.bytes_written,
                    digest = %report.digest,
                    "OTA partition updated successfully, loaded on next boot"
                );
            }
            Err(e) => {
                warn!(partition = %session.target.label, error = %e, "Close failed, update aborted");
            }
        }
        result
    }

    /// Discard the session without touching the boot state.
    ///
    /// Aborting an already aborted writer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::InvalidState`] if the writer was never opened or
    /// already closed.
    pub fn abort(&mut self) -> OtaResult<()> {
        match self.state {
            WriterState::Open => {
                if let Some(session) = self.session.take() {
                    info!(
                        partition = %session.target.label,
                        bytes = session.bytes_written,
                        "Update aborted"
                    );
                }
                self.state = WriterState::Aborted;
                Ok(())
            }
            WriterState::Aborted => Ok(()),
            state => Err(OtaError::InvalidState(format!(
                "abort requires an open session, state is {state:?}"
            ))),
        }
    }

    fn fail(&mut self, op: &str, error: &OtaError) {
        if let Some(session) = self.session.take() {
            warn!(
                partition = %session.target.label,
                op,
                %error,
                "Flash failure, update aborted"
            );
        }
        self.state = WriterState::Aborted;
    }

    /// Open a session, run `body` against it, then close on success or abort
    /// on error.
    ///
    /// The session is also aborted if `body` unwinds.
    ///
    /// # Errors
    ///
    /// Returns the first error from `open`, `body` or `close`.
    pub fn scoped(
        manager: &'m PartitionManager<F>,
        target: &Partition,
        expected_length: u64,
        expected_hash: Option<ImageDigest>,
        body: impl FnOnce(&mut Self) -> OtaResult<()>,
    ) -> OtaResult<WriteReport> {
        let mut writer = Self::new(manager);
        writer.open(target, expected_length, expected_hash)?;
        match body(&mut writer) {
            Ok(()) => writer.close(),
            Err(e) => {
                writer.abort()?;
                Err(e)
            }
        }
    }
}

impl<F: FlashDevice> Drop for FirmwareWriter<'_, F> {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            warn!("Write session dropped while open, aborting");
            let _aborted = self.abort().is_ok();
        }
    }
}

impl<F: FlashDevice> std::fmt::Debug for FirmwareWriter<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareWriter")
            .field("state", &self.state)
            .field("target", &self.target().map(|p| p.label.as_str()))
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

impl<F: FlashDevice> WriteSession<'_, F> {
    fn offset(&self) -> u64 {
        u64::from(self.target.offset).saturating_add(self.programmed)
    }

    /// Program the full block buffer and fold it into the hash.
    fn flush_block(&mut self, manager: &PartitionManager<F>) -> OtaResult<()> {
        let offset = self.offset();
        manager.with_flash(|f| f.write(offset, &self.buffer))?;
        self.hasher.update(&self.buffer);
        self.programmed = self.programmed.saturating_add(self.buffer.len() as u64);
        trace!(
            partition = %self.target.label,
            block = self.programmed / u64::from(manager.block_size()),
            "Block programmed"
        );
        self.buffer.clear();
        Ok(())
    }

    fn finish(&mut self, manager: &PartitionManager<F>) -> OtaResult<WriteReport> {
        if !self.buffer.is_empty() {
            // Pad bytes are programmed but not hashed.
            self.hasher.update(&self.buffer);
            let logical = self.buffer.len() as u64;
            self.buffer.resize(manager.block_size() as usize, ERASED_BYTE);
            let offset = self.offset();
            manager.with_flash(|f| f.write(offset, &self.buffer))?;
            self.programmed = self.programmed.saturating_add(logical);
            self.buffer.clear();
        }
        let digest = ImageDigest::from_hasher(std::mem::take(&mut self.hasher));

        if let Some(expected) = self.expected_length
            && expected != self.bytes_written
        {
            return Err(OtaError::LengthMismatch {
                expected,
                actual: self.bytes_written,
            });
        }
        if let Some(expected) = self.expected_hash
            && expected != digest
        {
            return Err(OtaError::HashMismatch {
                expected: expected.to_hex(),
                actual: digest.to_hex(),
            });
        }
        if manager.config().verify {
            let read = self.read_back(manager)?;
            if read != digest {
                return Err(OtaError::ReadbackMismatch {
                    written: digest.to_hex(),
                    read: read.to_hex(),
                });
            }
        }

        manager.commit(&self.target, &digest)?;
        Ok(WriteReport {
            partition: self.target.clone(),
            bytes_written: self.bytes_written,
            digest,
        })
    }

    fn read_back(&self, manager: &PartitionManager<F>) -> OtaResult<ImageDigest> {
        let mut hasher = Sha256::new();
        let mut block = vec![0u8; manager.block_size() as usize];
        let start = u64::from(self.target.offset);
        let mut done = 0u64;
        while done < self.bytes_written {
            let len = (self.bytes_written - done).min(block.len() as u64) as usize;
            let buf = block.get_mut(..len).ok_or_else(|| {
                OtaError::InvalidState("read-back chunk exceeds block buffer".to_string())
            })?;
            manager.with_flash(|f| f.read(start.saturating_add(done), buf))?;
            hasher.update(&*buf);
            done = done.saturating_add(len as u64);
        }
        Ok(ImageDigest::from_hasher(hasher))
    }
}
