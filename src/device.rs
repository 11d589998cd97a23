//! Block Device Module
//!
//! The block I/O collaborator the engine reads and writes flash through.
//!
//! ## Responsibilities
//! - Whole-block reads and writes addressed by block number
//! - Durable sync
//!
//! Retries and asynchronous completion belong to whatever sits behind the
//! trait; every call here either completes or returns an error.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StormError};

/// Block-addressed storage
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes
    fn block_size(&self) -> usize;

    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read `buf.len() / block_size` blocks starting at `block`
    fn read_blocks(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / block_size` blocks starting at `block`
    fn write_blocks(&self, block: u64, buf: &[u8]) -> Result<()>;

    /// Make all completed writes durable
    fn sync(&self) -> Result<()>;
}

/// Check that a transfer is whole blocks and inside the device
fn check_transfer(dev: &dyn BlockDevice, block: u64, len: usize) -> Result<()> {
    let bs = dev.block_size();
    if len == 0 || len % bs != 0 {
        return Err(StormError::InvalidArgument(format!(
            "transfer of {} bytes is not a whole number of {}-byte blocks",
            len, bs
        )));
    }
    match block.checked_add((len / bs) as u64) {
        Some(end) if end <= dev.block_count() => Ok(()),
        _ => Err(StormError::AddressOutOfRange {
            address: block,
            limit: dev.block_count(),
        }),
    }
}

// =============================================================================
// In-Memory Device
// =============================================================================

/// Sparse in-memory device
///
/// Blocks that were never written read back as zeros. The engine never relies
/// on that for POT pages, since real flash is not pre-zeroed.
pub struct MemDevice {
    block_size: usize,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl MemDevice {
    /// Create an empty device
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty device behind an `Arc`
    pub fn shared(block_size: usize, block_count: u64) -> Arc<Self> {
        Arc::new(Self::new(block_size, block_count))
    }

    /// Copy the full device state (for simulating a second restart from the same image)
    pub fn snapshot(&self) -> Self {
        Self {
            block_size: self.block_size,
            block_count: self.block_count,
            blocks: Mutex::new(self.blocks.lock().clone()),
        }
    }

    /// Number of blocks that have been written at least once
    pub fn blocks_written(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(self, block, buf.len())?;
        let blocks = self.blocks.lock();
        for (i, chunk) in buf.chunks_mut(self.block_size).enumerate() {
            match blocks.get(&(block + i as u64)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_blocks(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_transfer(self, block, buf.len())?;
        let mut blocks = self.blocks.lock();
        for (i, chunk) in buf.chunks(self.block_size).enumerate() {
            blocks.insert(block + i as u64, chunk.to_vec().into_boxed_slice());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// File-Backed Device
// =============================================================================

/// Device backed by a regular (sparse) file or a block special file
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Open or create a device file large enough for `block_count` blocks
    pub fn open(path: &Path, block_size: usize, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let wanted = block_count * block_size as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }

        tracing::debug!(
            path = %path.display(),
            block_size,
            block_count,
            "opened file device"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(self, block, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_blocks(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_transfer(self, block, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}
