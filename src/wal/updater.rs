//! Background updater
//!
//! A dedicated thread that owns the POT cache and the merged slab bitmap.
//! Requests arrive over a channel and are handled one at a time, so no two
//! merges of a shard ever overlap.
//!
//! ```text
//! Cold ──Recover──► Merging ──► Idle ──Merge──► Merging ──► Idle ...
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;

use super::reader::LogReader;
use super::recovery::{
    persist, process_log, rebuild_index, MergeReport, RecoveryReport, StartupPlan,
};
use super::LogId;
use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::index::{HashTable, SegmentUsage};
use crate::layout::{Checkpoint, ShardLayout};
use crate::pot::{BitmapKind, PersistentBitmap, PotCache};

/// Lifecycle of the shard as seen by the updater
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Nothing loaded yet
    Cold,
    /// Applying a log
    Merging,
    /// Waiting for requests
    Idle,
}

/// Messages accepted by the updater thread
pub enum UpdaterRequest {
    /// Startup recovery; only valid while cold
    Recover {
        reply: Sender<Result<RecoveryReport>>,
    },
    /// Fold a full log into the POT
    Merge {
        log: LogId,
        reply: Sender<Result<MergeReport>>,
    },
    /// Barrier: answered as soon as it is dequeued
    Flush { reply: Sender<()> },
    Shutdown,
}

/// State owned by the updater thread
pub struct Updater {
    device: Arc<dyn BlockDevice>,
    layout: ShardLayout,
    lean_memory: bool,
    checksums: bool,
    table: Arc<RwLock<HashTable>>,
    usage: Arc<RwLock<SegmentUsage>>,
    state: ShardState,
    pot: Option<PotCache>,
    slab: Option<PersistentBitmap>,
    checkpoint: Checkpoint,
}

impl Updater {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        layout: ShardLayout,
        config: &Config,
        table: Arc<RwLock<HashTable>>,
        usage: Arc<RwLock<SegmentUsage>>,
    ) -> Self {
        Self {
            device,
            layout,
            lean_memory: config.lean_memory,
            checksums: config.checksums,
            table,
            usage,
            state: ShardState::Cold,
            pot: None,
            slab: None,
            checkpoint: Checkpoint::default(),
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    /// Load, merge both logs as planned, persist and rebuild the index
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        if self.state != ShardState::Cold {
            return Err(StormError::Updater(format!(
                "recovery requested in state {:?}",
                self.state
            )));
        }

        self.state = ShardState::Merging;
        match self.load_and_merge() {
            Ok(report) => {
                self.state = ShardState::Idle;
                Ok(report)
            }
            Err(e) => {
                tracing::error!("recovery failed: {}", e);
                self.state = ShardState::Cold;
                Err(e)
            }
        }
    }

    fn load_and_merge(&mut self) -> Result<RecoveryReport> {
        let device: &dyn BlockDevice = &*self.device;
        let layout = &self.layout;
        let checksums = self.checksums;

        let mut checkpoint = Checkpoint::read(device, layout)?;
        let mut slab = PersistentBitmap::load(
            device,
            layout.slab_bitmap,
            BitmapKind::Slab,
            layout.raw_slots,
            0,
            checksums,
        )?;
        let mut pot = PotCache::load(device, layout, self.lean_memory, checksums)?;

        let heads = [
            LogReader::head_lsn(device, layout.logs[0], LogId::Log0, checksums)?,
            LogReader::head_lsn(device, layout.logs[1], LogId::Log1, checksums)?,
        ];
        let plan = StartupPlan::decide(&checkpoint, heads)?;
        tracing::info!(
            ?plan,
            checkpoint = checkpoint.lsn,
            head0 = ?heads[0],
            head1 = ?heads[1],
            "recovery plan"
        );

        let mut merges = Vec::new();
        for log in plan.logs() {
            merges.push(process_log(
                device,
                layout,
                log,
                checkpoint.lsn,
                &mut pot,
                &mut slab,
                checksums,
            )?);
        }

        let (high_lsn, high_log) = merges
            .iter()
            .max_by_key(|m| m.high_lsn)
            .map(|m| (m.high_lsn, m.log))
            .unwrap_or((0, checkpoint.log));
        persist(device, layout, &mut pot, &slab, &mut checkpoint, high_lsn, high_log)?;
        for m in &mut merges {
            m.checkpoint_lsn = checkpoint.lsn;
        }
        debug_assert!(pot.check_invariant());

        let stats = {
            let mut table = self.table.write();
            let mut usage = self.usage.write();
            rebuild_index(&pot, &mut table, &mut usage)?
        };
        let merged_seqno = merges.iter().map(|m| m.max_seqno).max().unwrap_or(0);

        let report = RecoveryReport {
            plan,
            checkpoint,
            high_lsn: high_lsn.max(checkpoint.lsn),
            objects_rebuilt: stats.objects,
            active_pages: pot.active_pages(),
            max_seqno: stats.max_seqno.max(merged_seqno),
            slab: slab.clone(),
            merges,
        };

        self.checkpoint = checkpoint;
        self.pot = Some(pot);
        self.slab = Some(slab);
        Ok(report)
    }

    /// Merge one log the writer has left
    pub fn merge(&mut self, log: LogId) -> Result<MergeReport> {
        let (Some(pot), Some(slab)) = (self.pot.as_mut(), self.slab.as_mut()) else {
            return Err(StormError::Updater(format!(
                "merge of {} requested in state {:?}",
                log, self.state
            )));
        };

        self.state = ShardState::Merging;
        let device: &dyn BlockDevice = &*self.device;
        let merged = process_log(
            device,
            &self.layout,
            log,
            self.checkpoint.lsn,
            pot,
            slab,
            self.checksums,
        )
        .and_then(|mut report| {
            persist(
                device,
                &self.layout,
                pot,
                slab,
                &mut self.checkpoint,
                report.high_lsn,
                log,
            )?;
            report.checkpoint_lsn = self.checkpoint.lsn;
            Ok(report)
        });
        self.state = ShardState::Idle;

        if let Err(e) = &merged {
            tracing::error!(%log, "merge failed: {}", e);
        }
        merged
    }

    fn run(mut self, requests: Receiver<UpdaterRequest>) {
        tracing::debug!("updater started");
        for request in requests.iter() {
            match request {
                UpdaterRequest::Recover { reply } => {
                    let _ = reply.send(self.recover());
                }
                UpdaterRequest::Merge { log, reply } => {
                    let _ = reply.send(self.merge(log));
                }
                UpdaterRequest::Flush { reply } => {
                    let _ = reply.send(());
                }
                UpdaterRequest::Shutdown => break,
            }
        }
        tracing::debug!(state = ?self.state, "updater stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Owner side of a running updater thread
pub struct UpdaterHandle {
    requests: Sender<UpdaterRequest>,
    thread: Option<JoinHandle<()>>,
}

impl UpdaterHandle {
    /// Start the updater thread
    pub fn spawn(updater: Updater) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("stormkv-updater".to_string())
            .spawn(move || updater.run(rx))?;

        Ok(Self {
            requests: tx,
            thread: Some(thread),
        })
    }

    /// A sender for components that queue merges themselves
    pub fn sender(&self) -> Sender<UpdaterRequest> {
        self.requests.clone()
    }

    pub fn recover(&self) -> Result<RecoveryReport> {
        let (reply, rx) = channel::bounded(1);
        self.send(UpdaterRequest::Recover { reply })?;
        rx.recv().map_err(|_| gone())?
    }

    /// Queue a merge; the receiver yields its outcome
    pub fn request_merge(&self, log: LogId) -> Result<Receiver<Result<MergeReport>>> {
        request_merge(&self.requests, log)
    }

    /// Wait until every request queued before this one has been handled
    pub fn flush(&self) -> Result<()> {
        let (reply, rx) = channel::bounded(1);
        self.send(UpdaterRequest::Flush { reply })?;
        rx.recv().map_err(|_| gone())
    }

    /// Stop the thread after the queued requests and wait for it
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // The thread may already be gone; joining reports why
        let _ = self.requests.send(UpdaterRequest::Shutdown);
        thread
            .join()
            .map_err(|_| StormError::Updater("updater thread panicked".to_string()))
    }

    fn send(&self, request: UpdaterRequest) -> Result<()> {
        self.requests.send(request).map_err(|_| gone())
    }
}

impl Drop for UpdaterHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("updater shutdown failed: {}", e);
        }
    }
}

/// Queue a merge of `log` on an updater channel
pub(crate) fn request_merge(
    requests: &Sender<UpdaterRequest>,
    log: LogId,
) -> Result<Receiver<Result<MergeReport>>> {
    let (reply, rx) = channel::bounded(1);
    requests
        .send(UpdaterRequest::Merge { log, reply })
        .map_err(|_| gone())?;
    Ok(rx)
}

/// Wait for a queued merge
pub(crate) fn wait_merge(rx: &Receiver<Result<MergeReport>>) -> Result<MergeReport> {
    rx.recv().map_err(|_| gone())?
}

fn gone() -> StormError {
    StormError::Updater("updater thread has exited".to_string())
}
