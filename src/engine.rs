//! Engine Module
//!
//! The shard engine that coordinates all components.
//!
//! ## Responsibilities
//! - Format a device on first use, validate it afterwards
//! - Run recovery through the updater before serving traffic
//! - Live path: index mutation, log append, segment usage
//! - Checkpoint, flush and shutdown

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{CacheMode, Config, MAX_OBJECT_BLOCKS};
use crate::device::{BlockDevice, FileDevice};
use crate::error::{Result, StormError};
use crate::index::{
    syndrome_fragment, EntryLoc, HashEntry, HashTable, IndexAudit, LockKey, SegmentUsage,
    StripeLocks,
};
use crate::layout::{Checkpoint, ShardLayout, Superblock};
use crate::object::{self, DeviceKeyVerifier};
use crate::pot::{BitmapKind, PersistentBitmap};
use crate::wal::{LogId, LogRecord, LogWriter, MergeReport, RecoveryReport, Updater, UpdaterHandle};

/// Where and what an indexed object is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Data-region block address
    pub address: u64,
    pub blocks: u16,
    pub cntr_id: u16,
    /// Syndrome fragment
    pub syndrome: u16,
}

impl From<HashEntry> for ObjectInfo {
    fn from(entry: HashEntry) -> Self {
        Self {
            address: entry.address(),
            blocks: entry.blocks(),
            cntr_id: entry.cntr_id(),
            syndrome: entry.syndrome(),
        }
    }
}

/// One open shard
///
/// ## Concurrency Model: Striped Writers / Shared Index
///
/// - **Index mutations** (put/delete): serialized per stripe
///   - Must acquire: stripe lock → index (write) → log → usage
///   - Different stripes proceed in parallel up to the index write lock
///
/// - **Lookups** (get/read): take the stripe lock and a shared index lock
///   - Slab mode upgrades to a short write lock to mark the entry referenced
///
/// - **POT and bitmaps**: owned by the updater thread, never shared
///
/// Dropping an engine without [`Engine::close`] behaves like a crash: the
/// open log page is not written and no final checkpoint is taken. Merges
/// already queued still run before the updater stops.
pub struct Engine {
    config: Config,
    layout: ShardLayout,
    device: Arc<dyn BlockDevice>,

    /// Object index (rebuilt on every open)
    table: Arc<RwLock<HashTable>>,

    /// One mutex per index stripe
    locks: StripeLocks,

    /// Slab-class occupancy per segment
    usage: Arc<RwLock<SegmentUsage>>,

    /// Log writer (exclusive access needed)
    log: Mutex<LogWriter>,

    /// Live view of raw object slots
    raw_slots: Mutex<PersistentBitmap>,

    /// Next object sequence number
    seqno: AtomicU64,

    recovery: RecoveryReport,

    updater: UpdaterHandle,
}

impl Engine {
    /// Open a shard on `device`
    ///
    /// On startup:
    /// 1. Derive the layout and check the device
    /// 2. Format a blank device or validate its superblock
    /// 3. Build an empty index and start the updater
    /// 4. Recover: merge logs, persist, rebuild the index
    /// 5. Position the log writer past the highest LSN
    pub fn open(config: Config, device: Arc<dyn BlockDevice>) -> Result<Self> {
        // Step 1: Layout
        let layout = ShardLayout::new(&config)?;
        if device.block_size() != layout.block_size {
            return Err(StormError::Config(format!(
                "device block size {} differs from configured {}",
                device.block_size(),
                layout.block_size
            )));
        }
        if device.block_count() < layout.total_blocks() {
            return Err(StormError::Config(format!(
                "device of {} blocks is smaller than the {} block shard",
                device.block_count(),
                layout.total_blocks()
            )));
        }

        // Step 2: Format or validate
        match Superblock::read(&*device, &layout)? {
            Some(sb) => sb.check_matches(&layout)?,
            None => Self::format(&*device, &layout)?,
        }

        // Step 3: Index and updater
        let table = HashTable::from_config(&config)?;
        let locks = StripeLocks::new(table.geometry().num_stripes);
        let table = Arc::new(RwLock::new(table));
        let usage = Arc::new(RwLock::new(SegmentUsage::new(
            layout.segments,
            layout.segment_blocks,
        )));
        let updater = UpdaterHandle::spawn(Updater::new(
            Arc::clone(&device),
            layout.clone(),
            &config,
            Arc::clone(&table),
            Arc::clone(&usage),
        ))?;

        // Step 4: Recovery (dropping the handle stops the updater on error)
        let recovery = updater.recover()?;

        // Step 5: Log writer
        let log = LogWriter::new(
            Arc::clone(&device),
            &layout,
            &config,
            recovery.plan.writer_start(),
            recovery.high_lsn + 1,
            updater.sender(),
        );

        tracing::info!(
            objects = recovery.objects_rebuilt,
            active_pages = recovery.active_pages,
            checkpoint = recovery.checkpoint.lsn,
            high_lsn = recovery.high_lsn,
            "shard open"
        );

        Ok(Self {
            raw_slots: Mutex::new(recovery.slab.clone()),
            seqno: AtomicU64::new(recovery.max_seqno + 1),
            config,
            layout,
            device,
            table,
            locks,
            usage,
            log: Mutex::new(log),
            recovery,
            updater,
        })
    }

    /// Open a shard backed by a file (created if missing)
    pub fn open_path(path: &Path, config: Config) -> Result<Self> {
        let layout = ShardLayout::new(&config)?;
        let device = FileDevice::open(path, layout.block_size, layout.total_blocks())?;
        Self::open(config, Arc::new(device))
    }

    /// Write empty metadata to a blank device
    ///
    /// The superblock goes last so an interrupted format is redone.
    pub fn format(device: &dyn BlockDevice, layout: &ShardLayout) -> Result<()> {
        tracing::info!(
            data_blocks = layout.data_blocks,
            segments = layout.segments,
            total_blocks = layout.total_blocks(),
            "formatting shard"
        );

        const ZERO_CHUNK: u64 = 64;
        let zeros = vec![0u8; ZERO_CHUNK as usize * layout.block_size];
        for region in layout.logs {
            let mut block = region.start;
            while block < region.end() {
                let n = ZERO_CHUNK.min(region.end() - block);
                device.write_blocks(block, &zeros[..n as usize * layout.block_size])?;
                block += n;
            }
        }

        PersistentBitmap::fresh(
            BitmapKind::Pot,
            layout.pot_bitmap,
            layout.segments,
            layout.segments as usize,
        )
        .save(device)?;
        PersistentBitmap::fresh(BitmapKind::Slab, layout.slab_bitmap, layout.raw_slots, 0)
            .save(device)?;
        Checkpoint::default().write(device, layout)?;

        Superblock::for_layout(layout).write(device, layout)?;
        device.sync()
    }

    // =========================================================================
    // Live Path
    // =========================================================================

    /// Syndrome and stripe of a key
    fn locate(&self, key: &[u8], cntr_id: u16) -> (u64, usize) {
        let table = self.table.read();
        let syndrome = table.syndrome(key, cntr_id);
        (syndrome, table.stripe_of(syndrome))
    }

    fn verifier(&self) -> DeviceKeyVerifier<'_> {
        DeviceKeyVerifier::new(&*self.device, self.layout.data.start)
    }

    fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::SeqCst)
    }

    /// Store an object at data block `address`
    ///
    /// Steps:
    /// 1. Acquire the key's stripe lock
    /// 2. Write the object blocks
    /// 3. Relocate an existing entry or insert a new one
    /// 4. Append the log record
    /// 5. Update segment usage
    ///
    /// Space management belongs to the caller, but a put whose blocks
    /// overlap another object is rejected before anything is written.
    pub fn put(&self, key: &[u8], cntr_id: u16, address: u64, payload: &[u8]) -> Result<ObjectInfo> {
        let bs = self.layout.block_size;
        let image = object::encode_object(key, cntr_id, payload, bs)?;
        let blocks = (image.len() / bs) as u64;
        let end = address
            .checked_add(blocks)
            .filter(|&end| end <= self.layout.data_blocks)
            .ok_or(StormError::AddressOutOfRange {
                address,
                limit: self.layout.data_blocks,
            })?;

        // Step 1: Stripe lock
        let (syndrome, stripe) = self.locate(key, cntr_id);
        let _stripe = self.locks.lock(stripe);

        let existing = {
            let table = self.table.read();
            let existing = table.get(key, cntr_id, &self.verifier())?;
            if let Some(other) = overlapping(&table, address, end, existing.map(|(loc, _)| loc)) {
                return Err(StormError::InvalidArgument(format!(
                    "blocks {}..{} overlap the object at block {}",
                    address, end, other
                )));
            }
            existing
        };

        // Step 2: Object data
        self.device
            .write_blocks(self.layout.data.start + address, &image)?;

        // Step 3: Index
        let seqno = self.next_seqno();
        let entry = HashEntry::new(syndrome, address, blocks as u16, cntr_id);
        let record = {
            let mut table = self.table.write();
            let bucket = table.hash_index(syndrome) as u32;
            let record = LogRecord::create(
                syndrome_fragment(syndrome),
                blocks as u16,
                bucket,
                cntr_id,
                address,
                seqno,
            );
            match existing {
                Some((_, old)) => {
                    table.insert_by_addr(old.address(), entry)?;
                    if old.address() == address {
                        record
                    } else {
                        record.relocate(old.address())
                    }
                }
                None => {
                    table.insert_by_key(syndrome, entry)?;
                    record
                }
            }
        };

        // Step 4: Log
        self.log.lock().append(record)?;

        // Step 5: Usage
        {
            let mut usage = self.usage.write();
            if let Some((_, old)) = existing {
                usage.record_delete(old.address(), old.blocks());
            }
            usage.record_insert(address, blocks as u16);
        }

        tracing::trace!(address, blocks, cntr_id, relocated = existing.is_some(), "object stored");
        Ok(ObjectInfo::from(entry))
    }

    /// Look up an object
    pub fn get(&self, key: &[u8], cntr_id: u16) -> Result<Option<ObjectInfo>> {
        let (_, stripe) = self.locate(key, cntr_id);
        let _stripe = self.locks.lock(stripe);

        let found = self.table.read().get(key, cntr_id, &self.verifier())?;
        let Some((loc, entry)) = found else {
            return Ok(None);
        };
        if self.config.mode == CacheMode::Slab {
            self.table.write().mark_referenced(loc);
        }
        Ok(Some(ObjectInfo::from(entry)))
    }

    /// Read an object's payload
    pub fn read(&self, key: &[u8], cntr_id: u16) -> Result<Option<Vec<u8>>> {
        let (_, stripe) = self.locate(key, cntr_id);
        let _stripe = self.locks.lock(stripe);

        let found = self.table.read().get(key, cntr_id, &self.verifier())?;
        let Some((_, entry)) = found else {
            return Ok(None);
        };
        let stored = object::read_object(&*self.device, self.layout.data.start, &entry)?;
        Ok(Some(stored.data))
    }

    /// Remove an object; returns whether it existed
    pub fn delete(&self, key: &[u8], cntr_id: u16) -> Result<bool> {
        let (syndrome, stripe) = self.locate(key, cntr_id);
        let _stripe = self.locks.lock(stripe);

        let found = self.table.read().get(key, cntr_id, &self.verifier())?;
        let Some((loc, entry)) = found else {
            return Ok(false);
        };

        let seqno = self.next_seqno();
        let record = {
            let mut table = self.table.write();
            let hash_idx = table.hash_index(syndrome);
            table.delete(loc, hash_idx)?;
            LogRecord::delete(
                entry.syndrome(),
                entry.blocks(),
                hash_idx as u32,
                cntr_id,
                entry.address(),
                seqno,
            )
        };
        self.log.lock().append(record)?;
        self.usage
            .write()
            .record_delete(entry.address(), entry.blocks());

        Ok(true)
    }

    // =========================================================================
    // Raw Objects
    // =========================================================================

    fn raw_slot(&self, address: u64) -> Result<u64> {
        let per_slot = self.layout.raw_object_blocks;
        if address % per_slot != 0 {
            return Err(StormError::InvalidArgument(format!(
                "raw object address {} is not aligned to {} blocks",
                address, per_slot
            )));
        }
        let slot = address / per_slot;
        if slot >= self.layout.raw_slots {
            return Err(StormError::AddressOutOfRange {
                address,
                limit: self.layout.raw_slots * per_slot,
            });
        }
        Ok(slot)
    }

    /// Record a raw object slot allocation made by the slab allocator
    pub fn allocate_raw(&self, address: u64, blocks: u16) -> Result<()> {
        let slot = self.raw_slot(address)?;
        if blocks == 0 || u64::from(blocks) > self.layout.raw_object_blocks {
            return Err(StormError::InvalidArgument(format!(
                "raw object of {} blocks",
                blocks
            )));
        }

        let mut slots = self.raw_slots.lock();
        if slots.query(slot) {
            return Err(StormError::InvalidArgument(format!(
                "raw slot {} already in use",
                slot
            )));
        }
        self.log
            .lock()
            .append(LogRecord::raw(address, blocks, false, self.next_seqno()))?;
        slots.set(slot);
        Ok(())
    }

    /// Record that a raw object slot was released
    pub fn free_raw(&self, address: u64) -> Result<()> {
        let slot = self.raw_slot(address)?;

        let mut slots = self.raw_slots.lock();
        if !slots.query(slot) {
            return Err(StormError::InvalidArgument(format!(
                "raw slot {} is not in use",
                slot
            )));
        }
        let blocks = self.layout.raw_object_blocks as u16;
        self.log
            .lock()
            .append(LogRecord::raw(address, blocks, true, self.next_seqno()))?;
        slots.clear(slot);
        Ok(())
    }

    pub fn raw_slot_in_use(&self, slot: u64) -> bool {
        self.raw_slots.lock().query(slot)
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Write the open log page
    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync()
    }

    /// Roll the log and wait until it is merged into the POT
    pub fn checkpoint(&self) -> Result<Vec<MergeReport>> {
        let mut log = self.log.lock();
        log.roll()?;
        let reports = log.wait_pending()?;
        if let Some(last) = reports.last() {
            tracing::info!(checkpoint = last.checkpoint_lsn, "checkpoint complete");
        }
        Ok(reports)
    }

    /// Write the open log page and drain the updater queue
    pub fn flush(&self) -> Result<()> {
        self.sync()?;
        self.updater.flush()
    }

    /// Checkpoint and stop the updater
    pub fn close(mut self) -> Result<()> {
        self.checkpoint()?;
        self.updater.shutdown()?;
        tracing::info!("shard closed");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Every indexed object as (address, entry), ordered by address
    pub fn index_snapshot(&self) -> Vec<(u64, HashEntry)> {
        let mut entries: Vec<_> = self
            .table
            .read()
            .iter()
            .map(|(_, e)| (e.address(), e))
            .collect();
        entries.sort_by_key(|(addr, _)| *addr);
        entries
    }

    /// Check the index invariants
    pub fn audit(&self) -> Result<IndexAudit> {
        self.table.read().audit()
    }

    pub fn object_count(&self) -> usize {
        self.table.read().len()
    }

    /// Stripe guarding an owned block address
    pub fn stripe_of_address(&self, address: u64) -> Option<usize> {
        self.table.read().find_lock(LockKey::Address(address))
    }

    pub fn segment_usage(&self) -> SegmentUsage {
        self.usage.read().clone()
    }

    /// What startup recovery found and did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn active_log(&self) -> LogId {
        self.log.lock().active_log()
    }

    pub fn current_lsn(&self) -> u64 {
        self.log.lock().current_lsn()
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// First block of an object other than `own` that overlaps `start..end`
///
/// Objects never overlap, so only the nearest object starting below `start`
/// can reach into the range.
fn overlapping(table: &HashTable, start: u64, end: u64, own: Option<EntryLoc>) -> Option<u64> {
    let other = |block: u64| table.find_by_address(block).filter(|&loc| Some(loc) != own);

    let below = (start.saturating_sub(MAX_OBJECT_BLOCKS - 1)..start)
        .rev()
        .find_map(|block| table.find_by_address(block).map(|loc| (block, loc)));
    if let Some((block, loc)) = below {
        if Some(loc) != own && block + u64::from(table.entry(loc).blocks()) > start {
            return Some(block);
        }
    }

    (start..end).find(|&block| other(block).is_some())
}
