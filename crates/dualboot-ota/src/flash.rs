//! Flash medium abstraction and host-side emulators
//!
//! The core only talks to flash through [`FlashDevice`]. Two emulators are
//! provided: [`MemoryFlash`] for tests (with fault injection) and [`FileFlash`]
//! for the command-line tool.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

use crate::error::FlashError;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Block-erasable, byte-programmable storage medium.
///
/// `write` programs bytes that were previously erased; programming a byte that
/// was not erased yields the bitwise AND of old and new value, as on NOR flash.
pub trait FlashDevice: Send {
    /// Minimum erase unit in bytes.
    fn block_size(&self) -> u32;

    /// Total size of the medium in bytes.
    fn capacity(&self) -> u64;

    /// Read `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the medium or the medium fails.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the medium or the medium fails.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes starting at `offset`; both must be block aligned.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is unaligned, outside the medium, or the
    /// medium fails.
    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError>;
}

fn check_bounds(offset: u64, len: u64, capacity: u64) -> Result<(), FlashError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(FlashError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

fn check_aligned(offset: u64, len: u64, block_size: u32) -> Result<(), FlashError> {
    let block = u64::from(block_size);
    if offset % block != 0 || len % block != 0 {
        return Err(FlashError::Unaligned {
            offset,
            len,
            block_size,
        });
    }
    Ok(())
}

fn to_range(offset: u64, len: usize, capacity: u64) -> Result<Range<usize>, FlashError> {
    let out_of_bounds = || FlashError::OutOfBounds {
        offset,
        len: len as u64,
        capacity,
    };
    let start = usize::try_from(offset).map_err(|_e| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    Ok(start..end)
}

fn validate_geometry(capacity: u64, block_size: u32) -> Result<(), FlashError> {
    if block_size == 0 || !block_size.is_power_of_two() || capacity % u64::from(block_size) != 0 {
        return Err(FlashError::Unaligned {
            offset: 0,
            len: capacity,
            block_size,
        });
    }
    Ok(())
}

/// Faults injected into a [`MemoryFlash`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Silently flip the lowest bit of the byte at this address the next time
    /// it is programmed. The medium reports success.
    pub bit_flip_at: Option<u64>,

    /// Fail any program operation that covers this address.
    pub fail_write_at: Option<u64>,

    /// Lose power after this many successful mutating operations (erase or
    /// program). The interrupted program operation is torn: only its first
    /// half reaches the medium.
    pub power_cut_after: Option<usize>,
}

/// In-memory NOR flash emulator.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    data: Vec<u8>,
    block_size: u32,
    faults: FaultPlan,
    mutations: usize,
}

impl MemoryFlash {
    /// Create an erased medium.
    ///
    /// # Errors
    ///
    /// Returns an error if `block_size` is not a power of two or `capacity` is
    /// not a multiple of it.
    pub fn new(capacity: u64, block_size: u32) -> Result<Self, FlashError> {
        validate_geometry(capacity, block_size)?;
        let len = usize::try_from(capacity).map_err(|_e| FlashError::OutOfBounds {
            offset: 0,
            len: capacity,
            capacity,
        })?;
        Ok(Self {
            data: vec![ERASED_BYTE; len],
            block_size,
            faults: FaultPlan::default(),
            mutations: 0,
        })
    }

    /// Replace the fault plan and reset the mutation counter.
    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
        self.mutations = 0;
    }

    /// Raw medium content.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite raw medium content, bypassing erase semantics and faults.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the medium.
    pub fn poke(&mut self, offset: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let capacity = self.capacity();
        check_bounds(offset, bytes.len() as u64, capacity)?;
        let range = to_range(offset, bytes.len(), capacity)?;
        self.data
            .get_mut(range)
            .ok_or(FlashError::OutOfBounds {
                offset,
                len: bytes.len() as u64,
                capacity,
            })?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn power_lost(&self) -> bool {
        self.faults
            .power_cut_after
            .is_some_and(|limit| self.mutations >= limit)
    }

    fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8], FlashError> {
        let capacity = self.capacity();
        let range = to_range(offset, len, capacity)?;
        self.data.get_mut(range).ok_or(FlashError::OutOfBounds {
            offset,
            len: len as u64,
            capacity,
        })
    }
}

impl FlashDevice for MemoryFlash {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        let capacity = self.capacity();
        check_bounds(offset, buf.len() as u64, capacity)?;
        let range = to_range(offset, buf.len(), capacity)?;
        let src = self.data.get(range).ok_or(FlashError::OutOfBounds {
            offset,
            len: buf.len() as u64,
            capacity,
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        let len = data.len() as u64;
        check_bounds(offset, len, self.capacity())?;
        let covers = |addr: u64| addr >= offset && addr - offset < len;

        if self.faults.fail_write_at.is_some_and(covers) {
            return Err(FlashError::Hardware {
                offset,
                reason: "program operation failed".to_string(),
            });
        }

        let torn = self.power_lost();
        let programmed = if torn { data.len() / 2 } else { data.len() };
        let src = data.get(..programmed).unwrap_or_default();
        for (dst, byte) in self.slice_mut(offset, programmed)?.iter_mut().zip(src) {
            *dst &= *byte;
        }
        if torn {
            return Err(FlashError::Hardware {
                offset,
                reason: "power lost during program".to_string(),
            });
        }

        if let Some(addr) = self.faults.bit_flip_at.filter(|addr| covers(*addr)) {
            self.faults.bit_flip_at = None;
            if let Some(byte) = self.slice_mut(addr, 1)?.first_mut() {
                *byte ^= 0x01;
            }
        }
        self.mutations = self.mutations.saturating_add(1);
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        check_aligned(offset, len, self.block_size)?;
        check_bounds(offset, len, self.capacity())?;
        if self.power_lost() {
            return Err(FlashError::Hardware {
                offset,
                reason: "power lost during erase".to_string(),
            });
        }
        let len = usize::try_from(len).map_err(|_e| FlashError::OutOfBounds {
            offset,
            len,
            capacity: self.data.len() as u64,
        })?;
        self.slice_mut(offset, len)?.fill(ERASED_BYTE);
        self.mutations = self.mutations.saturating_add(1);
        Ok(())
    }
}

/// File-backed flash emulator.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    capacity: u64,
    block_size: u32,
}

impl FileFlash {
    /// Create (or truncate) a file holding an erased medium of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or the file cannot be written.
    pub fn create(path: &Path, capacity: u64, block_size: u32) -> Result<Self, FlashError> {
        validate_geometry(capacity, block_size)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let block = vec![ERASED_BYTE; block_size as usize];
        for _ in 0..capacity / u64::from(block_size) {
            file.write_all(&block)?;
        }
        file.sync_all()?;
        Ok(Self {
            file,
            capacity,
            block_size,
        })
    }

    /// Open an existing medium; its capacity is the file length.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its length is not a
    /// multiple of `block_size`.
    pub fn open(path: &Path, block_size: u32) -> Result<Self, FlashError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        validate_geometry(capacity, block_size)?;
        Ok(Self {
            file,
            capacity,
            block_size,
        })
    }
}

impl FlashDevice for FileFlash {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        check_bounds(offset, buf.len() as u64, self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let mut current = vec![0u8; data.len()];
        self.read(offset, &mut current)?;
        for (dst, byte) in current.iter_mut().zip(data) {
            *dst &= *byte;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&current)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        check_aligned(offset, len, self.block_size)?;
        check_bounds(offset, len, self.capacity)?;
        let block = vec![ERASED_BYTE; self.block_size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        for _ in 0..len / u64::from(self.block_size) {
            self.file.write_all(&block)?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}
