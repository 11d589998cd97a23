//! Write-Ahead Log (WAL) Module
//!
//! Provides durability for index mutations between POT merges.
//!
//! ## Responsibilities
//! - Append log records to paged, checksummed logs
//! - Log Sequence Numbers (LSN) for ordering pages
//! - Two alternating logs: one accepts writes while the other is merged
//! - Merge logs into the POT and rebuild the index on startup
//!
//! ## Page Format
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                   │
//! │ ┌─────────┬──────────┬─────────┬─────────┬────────┐ │
//! │ │ CRC (4) │"LOGP"(4) │ LSN (8) │ Ver (4) │ Pad    │ │
//! │ └─────────┴──────────┴─────────┴─────────┴────────┘ │
//! ├─────────────────────────────────────────────────────┤
//! │ Record slot 0 (48 bytes)                            │
//! │ Record slot 1                                       │
//! │ ...                       (all-zero slot = unused)  │
//! └─────────────────────────────────────────────────────┘
//! ```
//! One page is one device block. The CRC is seeded with the page LSN.

mod entry;
mod page;
mod reader;
mod recovery;
mod updater;
mod writer;

pub use entry::{LogRecord, LOG_RECORD_SIZE};
pub use page::{records_per_page, LogPage, LOG_PAGE_HEADER_SIZE, LOG_PAGE_MAGIC, LOG_VERSION};
pub use reader::LogReader;
pub use recovery::{
    apply_log_record, persist, process_log, rebuild_index, MergeReport, RebuildStats,
    RecoveryReport, StartupPlan,
};
pub use updater::{ShardState, Updater, UpdaterHandle, UpdaterRequest};
pub use writer::LogWriter;

/// One of the two alternating logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LogId {
    #[default]
    Log0,
    Log1,
}

impl LogId {
    pub fn index(self) -> usize {
        match self {
            LogId::Log0 => 0,
            LogId::Log1 => 1,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(LogId::Log0),
            1 => Some(LogId::Log1),
            _ => None,
        }
    }

    /// The log that alternates with this one
    pub fn other(self) -> Self {
        match self {
            LogId::Log0 => LogId::Log1,
            LogId::Log1 => LogId::Log0,
        }
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log{}", self.index())
    }
}
