//! Log page encoding
//!
//! A page is one device block: a 32-byte header followed by fixed record
//! slots. A checksum of zero means none was recorded.

use bytes::{Buf, BufMut};

use super::entry::{LogRecord, LOG_RECORD_SIZE};
use crate::checksum;
use crate::error::{Result, StormError};

/// Size of the page header
pub const LOG_PAGE_HEADER_SIZE: usize = 32;

/// Eye-catcher of every log page
pub const LOG_PAGE_MAGIC: [u8; 4] = *b"LOGP";

/// Current page format version
pub const LOG_VERSION: u32 = 1;

/// Record slots in a page of `block_size` bytes
pub fn records_per_page(block_size: usize) -> usize {
    (block_size - LOG_PAGE_HEADER_SIZE) / LOG_RECORD_SIZE
}

/// A page of log records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    pub lsn: u64,
    pub records: Vec<LogRecord>,
}

impl LogPage {
    pub fn new(lsn: u64) -> Self {
        Self {
            lsn,
            records: Vec::new(),
        }
    }

    /// Serialize into one device block
    pub fn encode(&self, block_size: usize, checksums: bool) -> Vec<u8> {
        debug_assert!(self.records.len() <= records_per_page(block_size));
        let mut block = Vec::with_capacity(block_size);
        block.put_u32_le(0);
        block.put_slice(&LOG_PAGE_MAGIC);
        block.put_u64_le(self.lsn);
        block.put_u32_le(LOG_VERSION);
        block.put_bytes(0, LOG_PAGE_HEADER_SIZE - 20);
        for rec in &self.records {
            rec.encode(&mut block);
        }
        block.resize(block_size, 0);

        if checksums {
            let sum = checksum::crc_salted(&block, 0, checksum::lsn_salt(self.lsn));
            block[..4].copy_from_slice(&sum.to_le_bytes());
        }
        block
    }

    /// Parse one device block
    ///
    /// Returns `Ok(None)` at the end of a log: a page with a bad eye-catcher
    /// and no checksum. A bad eye-catcher with a checksum, or a checksum that
    /// does not match, is corruption.
    pub fn decode(block: &[u8], checksums: bool) -> Result<Option<Self>> {
        let mut buf = block;
        let stored = buf.get_u32_le();
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let lsn = buf.get_u64_le();
        let version = buf.get_u32_le();

        if magic != LOG_PAGE_MAGIC {
            if stored == 0 {
                return Ok(None);
            }
            return Err(StormError::Corruption(format!(
                "log page with checksum {:#010x} has eye-catcher {:?}",
                stored, magic
            )));
        }

        if checksums && stored != 0 {
            let computed = checksum::crc_salted(block, 0, checksum::lsn_salt(lsn));
            if computed != stored {
                return Err(StormError::Corruption(format!(
                    "log page LSN {} checksum mismatch: stored {:#010x}, computed {:#010x}",
                    lsn, stored, computed
                )));
            }
        }
        if version != LOG_VERSION {
            return Err(StormError::Corruption(format!(
                "log page LSN {} has version {}",
                lsn, version
            )));
        }

        let records = block[LOG_PAGE_HEADER_SIZE..]
            .chunks_exact(LOG_RECORD_SIZE)
            .map_while(LogRecord::decode)
            .collect();

        Ok(Some(Self { lsn, records }))
    }
}
