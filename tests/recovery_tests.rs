//! Tests for Log Merge and Recovery
//!
//! These tests verify:
//! - Startup plan selection from the checkpoint and log heads
//! - Record application: creates, sequence-guarded deletes, relocation, raw slots
//! - Pages at or below the checkpoint are never re-applied
//! - Recovering the same image twice gives the same POT and index
//! - The updater thread answers queued merges before a flush returns

use std::sync::Arc;

use parking_lot::RwLock;
use stormkv::config::{Config, WalSyncStrategy};
use stormkv::device::{BlockDevice, MemDevice};
use stormkv::index::{HashTable, SegmentUsage};
use stormkv::layout::{Checkpoint, ShardLayout};
use stormkv::pot::{BitmapKind, FlashObject, PersistentBitmap, PotCache};
use stormkv::wal::{
    apply_log_record, persist, process_log, LogId, LogPage, LogRecord, ShardState, StartupPlan,
    Updater, UpdaterHandle,
};
use stormkv::{Engine, StormError};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(checksums: bool) -> Config {
    Config::builder()
        .total_size(1 << 20)
        .block_size(512)
        .segment_size(16 * 1024)
        .raw_object_size(16 * 1024)
        .log_pages(4)
        .checksums(checksums)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build()
}

fn setup_formatted(config: &Config) -> (ShardLayout, Arc<MemDevice>) {
    let layout = ShardLayout::new(config).unwrap();
    let device = MemDevice::shared(layout.block_size, layout.total_blocks());
    Engine::format(&*device, &layout).unwrap();
    (layout, device)
}

fn load_state(device: &MemDevice, layout: &ShardLayout) -> (PotCache, PersistentBitmap) {
    let pot = PotCache::load(device, layout, true, true).unwrap();
    let slab = PersistentBitmap::load(
        device,
        layout.slab_bitmap,
        BitmapKind::Slab,
        layout.raw_slots,
        0,
        true,
    )
    .unwrap();
    (pot, slab)
}

fn write_page(
    device: &MemDevice,
    layout: &ShardLayout,
    log: LogId,
    position: u64,
    lsn: u64,
    records: &[LogRecord],
    checksums: bool,
) {
    let mut page = LogPage::new(lsn);
    page.records.extend_from_slice(records);
    let block = page.encode(layout.block_size, checksums);
    device
        .write_blocks(layout.log(log).start + position, &block)
        .unwrap();
}

fn new_updater(
    config: &Config,
    layout: &ShardLayout,
    device: Arc<MemDevice>,
) -> (Updater, Arc<RwLock<HashTable>>) {
    let table = Arc::new(RwLock::new(HashTable::from_config(config).unwrap()));
    let usage = Arc::new(RwLock::new(SegmentUsage::new(
        layout.segments,
        layout.segment_blocks,
    )));
    let updater = Updater::new(device, layout.clone(), config, Arc::clone(&table), usage);
    (updater, table)
}

fn checkpoint(lsn: u64, log: LogId) -> Checkpoint {
    Checkpoint { lsn, log }
}

fn read_region(device: &MemDevice, start: u64, blocks: u64) -> Vec<u8> {
    let mut raw = vec![0u8; blocks as usize * device.block_size()];
    device.read_blocks(start, &mut raw).unwrap();
    raw
}

// =============================================================================
// Startup Plan Tests
// =============================================================================

#[test]
fn test_plan_both_logs_empty() {
    let plan = StartupPlan::decide(&checkpoint(0, LogId::Log0), [None, None]).unwrap();
    assert_eq!(plan, StartupPlan::Nothing);
    assert_eq!(plan.writer_start(), LogId::Log0);
    assert!(plan.logs().is_empty());

    let plan = StartupPlan::decide(&checkpoint(12, LogId::Log1), [None, None]).unwrap();
    assert_eq!(plan, StartupPlan::Nothing);
}

#[test]
fn test_plan_single_log() {
    let plan = StartupPlan::decide(&checkpoint(0, LogId::Log0), [Some(1), None]).unwrap();
    assert_eq!(plan, StartupPlan::MergeOne(LogId::Log0));
    assert_eq!(plan.writer_start(), LogId::Log1);

    let plan = StartupPlan::decide(&checkpoint(4, LogId::Log0), [None, Some(5)]).unwrap();
    assert_eq!(plan, StartupPlan::MergeOne(LogId::Log1));
    assert_eq!(plan.writer_start(), LogId::Log0);
}

#[test]
fn test_plan_both_logs_without_checkpoint() {
    let plan = StartupPlan::decide(&checkpoint(0, LogId::Log0), [Some(5), Some(1)]).unwrap();
    assert_eq!(
        plan,
        StartupPlan::MergeBoth {
            older: LogId::Log1,
            newer: LogId::Log0
        }
    );
    assert_eq!(plan.logs(), vec![LogId::Log1, LogId::Log0]);
    assert_eq!(plan.writer_start(), LogId::Log1);
}

#[test]
fn test_plan_checkpoint_in_newer_log() {
    let plan = StartupPlan::decide(&checkpoint(7, LogId::Log1), [Some(1), Some(5)]).unwrap();
    assert_eq!(plan, StartupPlan::MergeOne(LogId::Log1));
    assert_eq!(plan.writer_start(), LogId::Log0);
}

#[test]
fn test_plan_checkpoint_in_older_log() {
    let plan = StartupPlan::decide(&checkpoint(3, LogId::Log0), [Some(1), Some(5)]).unwrap();
    assert_eq!(
        plan,
        StartupPlan::MergeBoth {
            older: LogId::Log0,
            newer: LogId::Log1
        }
    );
    assert_eq!(plan.writer_start(), LogId::Log0);
}

#[test]
fn test_plan_checkpoint_from_previous_cycle() {
    // Log 1 was merged at LSN 4, then refilled from LSN 9
    let plan = StartupPlan::decide(&checkpoint(4, LogId::Log1), [Some(5), Some(9)]).unwrap();
    assert_eq!(
        plan,
        StartupPlan::MergeBoth {
            older: LogId::Log0,
            newer: LogId::Log1
        }
    );
}

#[test]
fn test_plan_equal_heads_is_corruption() {
    let result = StartupPlan::decide(&checkpoint(2, LogId::Log0), [Some(3), Some(3)]);
    assert!(matches!(result, Err(StormError::Corruption(_))));
}

// =============================================================================
// Record Application Tests
// =============================================================================

#[test]
fn test_apply_create_and_guarded_delete() {
    let (layout, device) = setup_formatted(&test_config(true));
    let (mut pot, mut slab) = load_state(&device, &layout);
    let per_slot = layout.raw_object_blocks;

    apply_log_record(&LogRecord::create(9, 2, 40, 1, 40, 5), &mut pot, &mut slab, per_slot).unwrap();
    assert_eq!(pot.get(40).unwrap().seqno, 5);
    assert!(pot.get(40).unwrap().is_occupied());

    // A delete issued before the slot was rewritten leaves it alone
    let mut stale = LogRecord::delete(9, 2, 40, 1, 40, 6);
    stale.target_seqno = 4;
    apply_log_record(&stale, &mut pot, &mut slab, per_slot).unwrap();
    assert!(pot.get(40).unwrap().is_occupied());

    apply_log_record(&LogRecord::delete(9, 2, 40, 1, 40, 6), &mut pot, &mut slab, per_slot).unwrap();
    assert_eq!(pot.get(40), Some(&FlashObject::default()));
}

#[test]
fn test_apply_relocation_clears_old_slot() {
    let (layout, device) = setup_formatted(&test_config(true));
    let (mut pot, mut slab) = load_state(&device, &layout);
    let per_slot = layout.raw_object_blocks;

    apply_log_record(&LogRecord::create(3, 1, 7, 0, 50, 6), &mut pot, &mut slab, per_slot).unwrap();
    let moved = LogRecord::create(3, 1, 7, 0, 60, 7).relocate(50);
    apply_log_record(&moved, &mut pot, &mut slab, per_slot).unwrap();

    assert!(!pot.get(50).unwrap().is_occupied());
    let slot = pot.get(60).unwrap();
    assert_eq!((slot.syndrome, slot.bucket, slot.seqno), (3, 7, 7));
}

#[test]
fn test_apply_delete_on_inactive_page() {
    let (layout, device) = setup_formatted(&test_config(true));
    let (mut pot, mut slab) = load_state(&device, &layout);

    apply_log_record(
        &LogRecord::delete(1, 1, 0, 0, 1000, 3),
        &mut pot,
        &mut slab,
        layout.raw_object_blocks,
    )
    .unwrap();

    assert_eq!(pot.active_pages(), 0);
}

#[test]
fn test_apply_raw_records() {
    let (layout, device) = setup_formatted(&test_config(true));
    let (mut pot, mut slab) = load_state(&device, &layout);
    let per_slot = layout.raw_object_blocks;

    apply_log_record(&LogRecord::raw(64, 32, false, 8), &mut pot, &mut slab, per_slot).unwrap();
    assert!(slab.query(2));
    assert_eq!(pot.active_pages(), 0);

    apply_log_record(&LogRecord::raw(64, 32, true, 9), &mut pot, &mut slab, per_slot).unwrap();
    assert!(!slab.query(2));

    let beyond = LogRecord::raw(layout.data_blocks, 32, false, 10);
    assert!(matches!(
        apply_log_record(&beyond, &mut pot, &mut slab, per_slot),
        Err(StormError::Corruption(_))
    ));
}

#[test]
fn test_apply_create_without_blocks_is_corruption() {
    let (layout, device) = setup_formatted(&test_config(true));
    let (mut pot, mut slab) = load_state(&device, &layout);

    let result = apply_log_record(
        &LogRecord::create(1, 0, 0, 0, 5, 1),
        &mut pot,
        &mut slab,
        layout.raw_object_blocks,
    );
    assert!(matches!(result, Err(StormError::Corruption(_))));
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_pages_below_checkpoint_not_reapplied() {
    let config = test_config(false);
    let (layout, device) = setup_formatted(&config);
    let a = LogRecord::create(0xA, 1, 5, 1, 0, 1);
    let b = LogRecord::create(0xB, 1, 40, 1, 32, 2);
    let c = LogRecord::create(0xC, 1, 100, 1, 64, 3);

    // A and B merged, checkpoint at LSN 2
    write_page(&device, &layout, LogId::Log0, 0, 1, &[a], false);
    write_page(&device, &layout, LogId::Log0, 1, 2, &[b], false);
    {
        let (mut pot, mut slab) = load_state(&device, &layout);
        let merged = process_log(&*device, &layout, LogId::Log0, 0, &mut pot, &mut slab, false).unwrap();
        assert_eq!(merged.pages_applied, 2);
        let mut ckpt = Checkpoint::read(&*device, &layout).unwrap();
        persist(&*device, &layout, &mut pot, &slab, &mut ckpt, merged.high_lsn, LogId::Log0).unwrap();
        assert_eq!(ckpt.lsn, 2);
    }
    write_page(&device, &layout, LogId::Log0, 2, 3, &[c], false);

    // Change A's POT slot behind the log's back; replaying A would undo it
    let mut page0 = read_region(&device, layout.pot.start, 1);
    page0[8..10].copy_from_slice(&99u16.to_le_bytes());
    device.write_blocks(layout.pot.start, &page0).unwrap();

    let (mut updater, table) = new_updater(&config, &layout, Arc::clone(&device));
    let report = updater.recover().unwrap();

    assert_eq!(updater.state(), ShardState::Idle);
    assert_eq!(report.plan, StartupPlan::MergeOne(LogId::Log0));
    assert_eq!(report.merges[0].pages_skipped, 2);
    assert_eq!(report.merges[0].pages_applied, 1);
    assert_eq!(report.merges[0].records_applied, 1);
    assert_eq!(report.checkpoint.lsn, 3);
    assert_eq!(report.objects_rebuilt, 3);
    assert_eq!(report.max_seqno, 3);

    let table = table.read();
    let mut entries: Vec<_> = table
        .iter()
        .map(|(_, e)| (e.address(), e.cntr_id(), e.syndrome()))
        .collect();
    entries.sort();
    assert_eq!(entries, vec![(0, 99, 0xA), (32, 1, 0xB), (64, 1, 0xC)]);
}

#[test]
fn test_recover_twice_is_rejected() {
    let config = test_config(true);
    let (layout, device) = setup_formatted(&config);
    let (mut updater, _) = new_updater(&config, &layout, device);

    updater.recover().unwrap();

    assert!(matches!(updater.recover(), Err(StormError::Updater(_))));
}

#[test]
fn test_merge_before_recovery_is_rejected() {
    let config = test_config(true);
    let (layout, device) = setup_formatted(&config);
    let (mut updater, _) = new_updater(&config, &layout, device);

    assert!(matches!(updater.merge(LogId::Log0), Err(StormError::Updater(_))));
    assert_eq!(updater.state(), ShardState::Cold);
}

#[test]
fn test_corrupt_log_fails_recovery() {
    let config = test_config(true);
    let (layout, device) = setup_formatted(&config);
    write_page(&device, &layout, LogId::Log1, 0, 1, &[LogRecord::create(1, 1, 0, 0, 0, 1)], true);

    let mut block = read_region(&device, layout.logs[1].start, 1);
    block[40] ^= 0x10;
    device.write_blocks(layout.logs[1].start, &block).unwrap();

    let (mut updater, _) = new_updater(&config, &layout, device);
    assert!(matches!(updater.recover(), Err(StormError::Corruption(_))));
    assert_eq!(updater.state(), ShardState::Cold);
}

// =============================================================================
// Updater Thread Tests
// =============================================================================

#[test]
fn test_flush_waits_for_queued_merge() {
    let config = test_config(true);
    let (layout, device) = setup_formatted(&config);
    let (updater, table) = new_updater(&config, &layout, Arc::clone(&device));
    let handle = UpdaterHandle::spawn(updater).unwrap();
    handle.recover().unwrap();

    let records = [
        LogRecord::create(0xA, 1, 5, 1, 0, 1),
        LogRecord::create(0xB, 2, 40, 1, 32, 2),
    ];
    write_page(&device, &layout, LogId::Log0, 0, 1, &records, true);

    let merge = handle.request_merge(LogId::Log0).unwrap();
    handle.flush().unwrap();

    let report = merge
        .try_recv()
        .expect("merge answered before the flush returned")
        .unwrap();
    assert_eq!(report.log, LogId::Log0);
    assert_eq!(report.records_applied, 2);
    assert_eq!(report.checkpoint_lsn, 1);
    assert_eq!(Checkpoint::read(&*device, &layout).unwrap().lsn, 1);

    // The index is only rebuilt at startup
    assert!(table.read().is_empty());
}

#[test]
fn test_flush_on_idle_updater() {
    let config = test_config(true);
    let (layout, device) = setup_formatted(&config);
    let (updater, _) = new_updater(&config, &layout, device);
    let mut handle = UpdaterHandle::spawn(updater).unwrap();

    handle.flush().unwrap();
    handle.shutdown().unwrap();
    // A second shutdown finds the thread already joined
    handle.shutdown().unwrap();
}

// =============================================================================
// Idempotence Tests
// =============================================================================

#[test]
fn test_recovery_of_same_image_is_idempotent() {
    let config = test_config(true);
    let layout = ShardLayout::new(&config).unwrap();
    let device = MemDevice::shared(layout.block_size, layout.total_blocks());
    {
        let engine = Engine::open(config.clone(), device.clone()).unwrap();
        for i in 0..35u64 {
            let key = format!("obj-{}", i);
            engine.put(key.as_bytes(), 0, i * 2, b"payload").unwrap();
        }
        for i in (0..35u64).step_by(3) {
            engine.delete(format!("obj-{}", i).as_bytes(), 0).unwrap();
        }
        engine.allocate_raw(1024, 32).unwrap();
        // Crash: no close
    }

    let first = Arc::new(device.snapshot());
    let second = Arc::new(device.snapshot());
    let (mut up1, table1) = new_updater(&config, &layout, Arc::clone(&first));
    let (mut up2, table2) = new_updater(&config, &layout, Arc::clone(&second));
    let r1 = up1.recover().unwrap();
    let r2 = up2.recover().unwrap();

    assert_eq!(r1.objects_rebuilt, 23);
    assert_eq!(r1.objects_rebuilt, r2.objects_rebuilt);
    assert_eq!(r1.checkpoint, r2.checkpoint);
    assert_eq!(r1.max_seqno, r2.max_seqno);
    assert!(r1.slab.query(1024 / layout.raw_object_blocks));

    let pot_bytes = |d: &MemDevice| read_region(d, layout.pot.start, layout.pot.blocks);
    assert_eq!(pot_bytes(&*first), pot_bytes(&*second));

    let snapshot = |t: &RwLock<HashTable>| {
        let mut v: Vec<_> = t.read().iter().map(|(_, e)| e).collect();
        v.sort_by_key(|e| e.address());
        v
    };
    assert_eq!(snapshot(&*table1), snapshot(&*table2));

    // Recovering the recovered image changes nothing either
    let third = Arc::new(first.snapshot());
    let (mut up3, table3) = new_updater(&config, &layout, Arc::clone(&third));
    let r3 = up3.recover().unwrap();
    assert_eq!(r3.objects_rebuilt, r1.objects_rebuilt);
    assert_eq!(pot_bytes(&*third), pot_bytes(&*first));
    assert_eq!(snapshot(&*table3), snapshot(&*table1));
}
