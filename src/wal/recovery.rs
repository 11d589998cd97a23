//! Log merge and recovery
//!
//! Folds logs into the POT and rebuilds the index from it.
//!
//! Startup:
//! 1. Load the slab bitmap, the POT bitmap and the active POT pages
//! 2. Read the head LSN of both logs and pick a [`StartupPlan`]
//! 3. Merge the planned logs in LSN order, skipping pages at or below the
//!    checkpoint
//! 4. Persist POT pages and bitmaps, then advance the checkpoint
//! 5. Rebuild the index and segment usage from the POT

use super::entry::LogRecord;
use super::reader::LogReader;
use super::LogId;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::index::{HashEntry, HashTable, SegmentUsage};
use crate::layout::{Checkpoint, ShardLayout};
use crate::pot::{FlashObject, PersistentBitmap, PotCache, MAX_SEQNO};

// =============================================================================
// Startup Plan
// =============================================================================

/// Which logs recovery has to merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    /// Both logs are empty
    Nothing,
    /// Only this log can hold unmerged pages
    MergeOne(LogId),
    /// Merge `older`, then `newer`
    MergeBoth { older: LogId, newer: LogId },
}

impl StartupPlan {
    /// Decide from the checkpoint and the head LSN of each log
    ///
    /// When the checkpoint was taken in the current cycle of the newer log,
    /// every page of the older log is already in the POT.
    pub fn decide(checkpoint: &Checkpoint, heads: [Option<u64>; 2]) -> Result<Self> {
        let plan = match (checkpoint.lsn == 0, heads[0], heads[1]) {
            (_, None, None) => StartupPlan::Nothing,
            (_, Some(_), None) => StartupPlan::MergeOne(LogId::Log0),
            (_, None, Some(_)) => StartupPlan::MergeOne(LogId::Log1),
            (_, Some(h0), Some(h1)) if h0 == h1 => {
                tracing::error!(lsn = h0, "both logs start with the same LSN");
                return Err(StormError::Corruption(format!(
                    "both logs start with LSN {}",
                    h0
                )));
            }
            (true, Some(h0), Some(h1)) => Self::ordered(h0, h1),
            (false, Some(h0), Some(h1)) => {
                let (newer, newer_head) = if h0 < h1 {
                    (LogId::Log1, h1)
                } else {
                    (LogId::Log0, h0)
                };
                if checkpoint.log == newer && checkpoint.lsn >= newer_head {
                    StartupPlan::MergeOne(newer)
                } else {
                    Self::ordered(h0, h1)
                }
            }
        };
        Ok(plan)
    }

    fn ordered(h0: u64, h1: u64) -> Self {
        if h0 < h1 {
            StartupPlan::MergeBoth {
                older: LogId::Log0,
                newer: LogId::Log1,
            }
        } else {
            StartupPlan::MergeBoth {
                older: LogId::Log1,
                newer: LogId::Log0,
            }
        }
    }

    /// Logs to merge, in order
    pub fn logs(&self) -> Vec<LogId> {
        match *self {
            StartupPlan::Nothing => vec![],
            StartupPlan::MergeOne(log) => vec![log],
            StartupPlan::MergeBoth { older, newer } => vec![older, newer],
        }
    }

    /// Log new records go to after recovery: the older or an empty one
    pub fn writer_start(&self) -> LogId {
        match *self {
            StartupPlan::Nothing => LogId::Log0,
            StartupPlan::MergeOne(log) => log.other(),
            StartupPlan::MergeBoth { older, .. } => older,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of merging one log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub log: LogId,
    pub pages_applied: u64,
    pub pages_skipped: u64,
    pub records_applied: u64,
    /// Highest page LSN seen (applied or skipped)
    pub high_lsn: u64,
    /// Highest sequence number seen in any record
    pub max_seqno: u64,
    /// Checkpoint after the merge was persisted
    pub checkpoint_lsn: u64,
}

/// Outcome of rebuilding the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub objects: u64,
    pub max_seqno: u64,
}

/// Outcome of a full startup recovery
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub plan: StartupPlan,
    pub merges: Vec<MergeReport>,
    pub checkpoint: Checkpoint,
    /// Highest LSN present anywhere (checkpoint or logs)
    pub high_lsn: u64,
    pub objects_rebuilt: u64,
    pub active_pages: usize,
    /// Highest sequence number in the POT or the logs
    pub max_seqno: u64,
    /// Raw object slots in use after the merge
    pub slab: PersistentBitmap,
}

// =============================================================================
// Merge
// =============================================================================

/// Apply every page of `log` above `checkpoint_lsn`
pub fn process_log(
    device: &dyn BlockDevice,
    layout: &ShardLayout,
    log: LogId,
    checkpoint_lsn: u64,
    pot: &mut PotCache,
    slab: &mut PersistentBitmap,
    checksums: bool,
) -> Result<MergeReport> {
    let mut report = MergeReport {
        log,
        checkpoint_lsn,
        ..Default::default()
    };

    for page in LogReader::new(device, layout.log(log), log, checksums) {
        let page = page?;
        report.high_lsn = report.high_lsn.max(page.lsn);
        for rec in &page.records {
            report.max_seqno = report.max_seqno.max(rec.seqno).max(rec.target_seqno);
        }

        if page.lsn <= checkpoint_lsn {
            tracing::trace!(%log, lsn = page.lsn, checkpoint_lsn, "page already merged");
            report.pages_skipped += 1;
            continue;
        }

        for rec in &page.records {
            apply_log_record(rec, pot, slab, layout.raw_object_blocks)?;
        }
        report.records_applied += page.records.len() as u64;
        report.pages_applied += 1;
    }

    tracing::info!(
        %log,
        applied = report.pages_applied,
        skipped = report.pages_skipped,
        records = report.records_applied,
        high_lsn = report.high_lsn,
        "log merged"
    );
    Ok(report)
}

/// Apply one record to the POT cache or the slab bitmap
pub fn apply_log_record(
    rec: &LogRecord,
    pot: &mut PotCache,
    slab: &mut PersistentBitmap,
    raw_object_blocks: u64,
) -> Result<()> {
    if rec.raw {
        let slot = rec.blk_offset / raw_object_blocks;
        if slot >= slab.bit_count() {
            tracing::error!(block = rec.blk_offset, slot, "raw record beyond slab bitmap");
            return Err(StormError::Corruption(format!(
                "raw record for block {} beyond {} slots",
                rec.blk_offset,
                slab.bit_count()
            )));
        }
        if rec.deleted {
            slab.clear(slot);
        } else {
            slab.set(slot);
        }
        return Ok(());
    }

    if rec.deleted {
        return delete_slot(pot, rec.blk_offset, rec.target_seqno);
    }

    if rec.blocks == 0 {
        return Err(StormError::Corruption(format!(
            "create record for block {} has no blocks",
            rec.blk_offset
        )));
    }
    if let Some(old) = rec.old_offset {
        delete_slot(pot, old, rec.target_seqno)?;
    }

    *pot.access(rec.blk_offset)? = FlashObject {
        syndrome: rec.syndrome,
        deleted: false,
        blocks: rec.blocks,
        bucket: rec.bucket,
        cntr_id: rec.cntr_id,
        seqno: rec.seqno & MAX_SEQNO,
    };
    Ok(())
}

/// Clear a POT slot unless it was written after `target_seqno`
fn delete_slot(pot: &mut PotCache, blk: u64, target_seqno: u64) -> Result<()> {
    // Inactive pages hold no objects
    if pot.get(blk).is_none() {
        return Ok(());
    }
    let slot = pot.access(blk)?;
    if slot.seqno <= target_seqno & MAX_SEQNO {
        slot.clear();
    } else {
        tracing::debug!(block = blk, seqno = slot.seqno, target_seqno, "delete skipped newer slot");
    }
    Ok(())
}

/// Make the merged state durable and advance the checkpoint
///
/// Order: POT pages, POT bitmap, slab bitmap, sync, checkpoint.
pub fn persist(
    device: &dyn BlockDevice,
    layout: &ShardLayout,
    pot: &mut PotCache,
    slab: &PersistentBitmap,
    checkpoint: &mut Checkpoint,
    high_lsn: u64,
    log: LogId,
) -> Result<()> {
    pot.save(device)?;
    slab.save(device)?;
    device.sync()?;

    if high_lsn > checkpoint.lsn {
        let next = Checkpoint { lsn: high_lsn, log };
        next.write(device, layout)?;
        tracing::info!(lsn = high_lsn, %log, "checkpoint advanced");
        *checkpoint = next;
    }
    Ok(())
}

// =============================================================================
// Rebuild
// =============================================================================

/// Rebuild the index and segment usage from every occupied POT slot
pub fn rebuild_index(
    pot: &PotCache,
    table: &mut HashTable,
    usage: &mut SegmentUsage,
) -> Result<RebuildStats> {
    let mut stats = RebuildStats::default();
    usage.reset();

    for (blk, obj) in pot.occupied() {
        let entry = HashEntry::from_fragment(obj.syndrome, blk, obj.blocks, obj.cntr_id);
        table.recovery_insert(u64::from(obj.bucket), entry)?;
        usage.record_insert(blk, obj.blocks);
        stats.objects += 1;
        stats.max_seqno = stats.max_seqno.max(obj.seqno);
    }

    tracing::info!(
        objects = stats.objects,
        pages = pot.active_pages(),
        "index rebuilt from POT"
    );
    Ok(stats)
}
