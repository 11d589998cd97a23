//! Log Writer
//!
//! Appends records to the current page of the active log. When a log is full
//! (or rolled on request) the writer moves to the other log and asks the
//! updater to merge the one it left.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use super::entry::LogRecord;
use super::page::{records_per_page, LogPage};
use super::recovery::MergeReport;
use super::updater::{request_merge, wait_merge, UpdaterRequest};
use super::LogId;
use crate::config::{Config, WalSyncStrategy};
use crate::device::BlockDevice;
use crate::error::Result;
use crate::layout::{Region, ShardLayout};

/// Writes records to the two alternating logs
pub struct LogWriter {
    device: Arc<dyn BlockDevice>,
    logs: [Region; 2],
    block_size: usize,
    checksums: bool,
    sync_strategy: WalSyncStrategy,
    records_per_page: usize,

    active: LogId,
    /// Page of the active log the current page goes to
    page_index: u64,
    /// LSN the next opened page gets
    next_lsn: u64,
    /// Open page; created on the first append so LSNs never skip
    current: Option<LogPage>,
    /// Records appended since the current page was last written
    unsynced: usize,

    updater: Sender<UpdaterRequest>,
    pending: [Option<Receiver<Result<MergeReport>>>; 2],
}

impl LogWriter {
    /// Writer positioned at page 0 of `start`, numbering pages from `next_lsn`
    pub fn new(
        device: Arc<dyn BlockDevice>,
        layout: &ShardLayout,
        config: &Config,
        start: LogId,
        next_lsn: u64,
        updater: Sender<UpdaterRequest>,
    ) -> Self {
        tracing::debug!(log = %start, next_lsn, "log writer positioned");
        Self {
            device,
            logs: layout.logs,
            block_size: layout.block_size,
            checksums: config.checksums,
            sync_strategy: config.wal_sync_strategy,
            records_per_page: records_per_page(layout.block_size),
            active: start,
            page_index: 0,
            next_lsn: next_lsn.max(1),
            current: None,
            unsynced: 0,
            updater,
            pending: [None, None],
        }
    }

    /// Append a record; returns the LSN of the page holding it
    pub fn append(&mut self, record: LogRecord) -> Result<u64> {
        let next_lsn = self.next_lsn;
        let page = self.current.get_or_insert_with(|| LogPage::new(next_lsn));
        page.records.push(record);
        let lsn = page.lsn;
        let full = page.records.len() >= self.records_per_page;
        self.unsynced += 1;

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        };
        if due {
            self.write_current()?;
        }
        if full {
            self.seal()?;
        }
        Ok(lsn)
    }

    /// Write the current page if it holds unwritten records
    pub fn sync(&mut self) -> Result<()> {
        if self.unsynced > 0 {
            self.write_current()?;
        }
        Ok(())
    }

    fn write_current(&mut self) -> Result<()> {
        let Some(page) = &self.current else {
            return Ok(());
        };
        let block = page.encode(self.block_size, self.checksums);
        let at = self.logs[self.active.index()].start + self.page_index;
        self.device.write_blocks(at, &block).map_err(|e| {
            tracing::error!(log = %self.active, page = self.page_index, lsn = page.lsn, "log write failed: {}", e);
            e
        })?;
        self.device.sync()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Close the current page and move to the next one
    fn seal(&mut self) -> Result<()> {
        self.sync()?;
        let Some(page) = self.current.take() else {
            return Ok(());
        };
        self.next_lsn = page.lsn + 1;
        self.page_index += 1;
        if self.page_index >= self.logs[self.active.index()].blocks {
            self.switch()?;
        }
        Ok(())
    }

    /// Close the active log and hand it to the updater
    ///
    /// Does nothing if the active log has no pages yet.
    pub fn roll(&mut self) -> Result<()> {
        self.seal()?;
        if self.page_index > 0 {
            self.switch()?;
        }
        Ok(())
    }

    fn switch(&mut self) -> Result<()> {
        let old = self.active;
        let new = old.other();

        if let Some(rx) = self.pending[new.index()].take() {
            tracing::debug!(log = %new, "waiting for merge before reuse");
            wait_merge(&rx)?;
        }

        self.active = new;
        self.page_index = 0;
        self.pending[old.index()] = Some(request_merge(&self.updater, old)?);
        tracing::debug!(from = %old, to = %new, next_lsn = self.next_lsn, "log switched");
        Ok(())
    }

    /// Wait for every merge this writer has queued
    pub fn wait_pending(&mut self) -> Result<Vec<MergeReport>> {
        let mut reports = Vec::new();
        for slot in &mut self.pending {
            if let Some(rx) = slot.take() {
                reports.push(wait_merge(&rx)?);
            }
        }
        Ok(reports)
    }

    pub fn active_log(&self) -> LogId {
        self.active
    }

    /// LSN of the open page, or of the page the next append opens
    pub fn current_lsn(&self) -> u64 {
        self.current.as_ref().map_or(self.next_lsn, |p| p.lsn)
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }
}
