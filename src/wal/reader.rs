//! Log Reader
//!
//! Reads the pages of one log in order and enforces LSN continuity.

use super::page::LogPage;
use super::LogId;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::layout::Region;

/// Reads pages from one log
///
/// The first page may carry any LSN; every following page must carry the
/// next one. A page with a lower LSN is left over from an earlier cycle of
/// this log and ends it.
pub struct LogReader<'a> {
    device: &'a dyn BlockDevice,
    region: Region,
    log: LogId,
    checksums: bool,
    page: u64,
    expected: Option<u64>,
    block: Vec<u8>,
    done: bool,
}

impl<'a> LogReader<'a> {
    pub fn new(device: &'a dyn BlockDevice, region: Region, log: LogId, checksums: bool) -> Self {
        Self {
            device,
            region,
            log,
            checksums,
            page: 0,
            expected: None,
            block: vec![0u8; device.block_size()],
            done: false,
        }
    }

    /// LSN of the first page, or `None` for an empty log
    pub fn head_lsn(
        device: &dyn BlockDevice,
        region: Region,
        log: LogId,
        checksums: bool,
    ) -> Result<Option<u64>> {
        LogReader::new(device, region, log, checksums)
            .next()
            .transpose()
            .map(|page| page.map(|p| p.lsn))
    }

    /// Read the next page
    pub fn next_page(&mut self) -> Result<Option<LogPage>> {
        if self.done || self.page >= self.region.blocks {
            return Ok(None);
        }

        let block = self.region.start + self.page;
        self.device.read_blocks(block, &mut self.block)?;

        let page = match LogPage::decode(&self.block, self.checksums) {
            Ok(Some(page)) => page,
            Ok(None) => {
                tracing::trace!(log = %self.log, page = self.page, "end of log");
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(log = %self.log, page = self.page, block, "bad log page: {}", e);
                self.done = true;
                return Err(e);
            }
        };

        if let Some(expected) = self.expected {
            if page.lsn < expected {
                tracing::debug!(
                    log = %self.log,
                    page = self.page,
                    lsn = page.lsn,
                    expected,
                    "stale page ends log"
                );
                self.done = true;
                return Ok(None);
            }
            if page.lsn > expected {
                tracing::error!(
                    log = %self.log,
                    page = self.page,
                    lsn = page.lsn,
                    expected,
                    "log LSN gap"
                );
                self.done = true;
                return Err(StormError::LsnOutOfOrder {
                    log: self.log.index() as u8,
                    page: self.page,
                    expected,
                    found: page.lsn,
                });
            }
        }

        self.expected = Some(page.lsn + 1);
        self.page += 1;
        Ok(Some(page))
    }

    /// Pages consumed so far
    pub fn pages_read(&self) -> u64 {
        self.page
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<LogPage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page().transpose()
    }
}
