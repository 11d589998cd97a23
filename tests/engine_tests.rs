//! Tests for Engine
//!
//! These tests verify:
//! - Basic put/get/read/delete operations
//! - Relocation, address conflicts and out-of-range addresses
//! - Crash recovery from the logs
//! - Close/reopen and checkpoint behavior
//! - Raw object slot notifications
//! - Cache modes, lean memory and file-backed devices
//! - Concurrent access from several threads

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use stormkv::config::{CacheMode, Config, WalSyncStrategy};
use stormkv::device::{BlockDevice, MemDevice};
use stormkv::layout::ShardLayout;
use stormkv::wal::{LogId, StartupPlan};
use stormkv::{Engine, StormError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// 2048 data blocks of 512 bytes, 64 segments, 64 raw slots
fn test_config() -> Config {
    Config::builder()
        .total_size(1 << 20)
        .block_size(512)
        .segment_size(16 * 1024)
        .raw_object_size(16 * 1024)
        .log_pages(4)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite) // Sync every write for test reliability
        .build()
}

fn setup_device(config: &Config) -> Arc<MemDevice> {
    let layout = ShardLayout::new(config).unwrap();
    MemDevice::shared(layout.block_size, layout.total_blocks())
}

fn setup_mem_engine() -> (Arc<MemDevice>, Engine) {
    let config = test_config();
    let device = setup_device(&config);
    let engine = Engine::open(config, device.clone()).unwrap();
    (device, engine)
}

fn reopen(device: &Arc<MemDevice>, config: Config) -> Engine {
    Engine::open(config, device.clone()).unwrap()
}

fn read_block(device: &MemDevice, block: u64) -> Vec<u8> {
    let mut buf = vec![0u8; device.block_size()];
    device.read_blocks(block, &mut buf).unwrap();
    buf
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_put_get_read_delete() {
    let (_device, engine) = setup_mem_engine();

    let info = engine.put(b"alpha", 7, 42, b"hello").unwrap();
    assert_eq!(info.address, 42);
    assert_eq!(info.blocks, 1);
    assert_eq!(info.cntr_id, 7);

    assert_eq!(engine.get(b"alpha", 7).unwrap(), Some(info));
    assert_eq!(engine.read(b"alpha", 7).unwrap(), Some(b"hello".to_vec()));
    assert_eq!(engine.object_count(), 1);

    assert!(engine.delete(b"alpha", 7).unwrap());
    assert_eq!(engine.get(b"alpha", 7).unwrap(), None);
    assert!(!engine.delete(b"alpha", 7).unwrap());
    assert_eq!(engine.object_count(), 0);
}

#[test]
fn test_containers_are_separate() {
    let (_device, engine) = setup_mem_engine();

    engine.put(b"key", 1, 10, b"one").unwrap();
    engine.put(b"key", 2, 11, b"two").unwrap();

    assert_eq!(engine.read(b"key", 1).unwrap(), Some(b"one".to_vec()));
    assert_eq!(engine.read(b"key", 2).unwrap(), Some(b"two".to_vec()));
    assert_eq!(engine.get(b"key", 3).unwrap(), None);
}

#[test]
fn test_multi_block_object() {
    let (_device, engine) = setup_mem_engine();
    let payload = vec![0xAB; 1500];

    let info = engine.put(b"big", 0, 100, &payload).unwrap();

    assert_eq!(info.blocks, 3);
    assert_eq!(engine.read(b"big", 0).unwrap(), Some(payload));
    // Three blocks fall into the four-block class
    assert_eq!(engine.segment_usage().segment(3).unwrap().class_blocks, 4);
}

#[test]
fn test_empty_key_rejected() {
    let (_device, engine) = setup_mem_engine();

    let err = engine.put(b"", 0, 1, b"value").unwrap_err();
    assert!(matches!(err, StormError::InvalidArgument(_)));
    assert!(!err.is_fatal());
    assert!(matches!(engine.get(b"", 0), Err(StormError::InvalidArgument(_))));
}

#[test]
fn test_address_beyond_data_area() {
    let (_device, engine) = setup_mem_engine();
    let data_blocks = engine.layout().data_blocks;

    assert!(matches!(
        engine.put(b"k", 0, data_blocks, b"v"),
        Err(StormError::AddressOutOfRange { .. })
    ));
    assert!(matches!(
        engine.put(b"k", 0, data_blocks - 1, &[0u8; 600]),
        Err(StormError::AddressOutOfRange { .. })
    ));
    assert_eq!(engine.object_count(), 0);
}

#[test]
fn test_address_overflow_rejected_before_write() {
    let (device, engine) = setup_mem_engine();
    engine.put(b"logged", 0, 0, b"v").unwrap();
    let log1 = engine.layout().logs[1];
    let log1_last = log1.start + log1.blocks - 1;
    let before = read_block(&device, log1_last);
    let written = device.blocks_written();

    for address in [u64::MAX, u64::MAX - 1, u64::MAX - log1.blocks] {
        let err = engine.put(b"k", 1, address, b"payload").unwrap_err();
        assert!(matches!(err, StormError::AddressOutOfRange { .. }));
        assert!(!err.is_fatal());
    }

    assert_eq!(read_block(&device, log1_last), before);
    assert_eq!(device.blocks_written(), written);
    assert_eq!(engine.object_count(), 1);
    engine.audit().unwrap();
}

#[test]
fn test_device_transfer_overflow_rejected() {
    let device = MemDevice::new(512, 16);

    assert!(matches!(
        device.write_blocks(u64::MAX, &[0u8; 512]),
        Err(StormError::AddressOutOfRange { .. })
    ));
    let mut buf = [0u8; 1024];
    assert!(matches!(
        device.read_blocks(u64::MAX - 1, &mut buf),
        Err(StormError::AddressOutOfRange { .. })
    ));
    assert!(matches!(
        device.write_blocks(15, &[0u8; 1024]),
        Err(StormError::AddressOutOfRange { .. })
    ));
}

// =============================================================================
// Relocation Tests
// =============================================================================

#[test]
fn test_put_existing_key_relocates() {
    let (_device, engine) = setup_mem_engine();
    engine.put(b"mover", 0, 10, b"first").unwrap();

    let info = engine.put(b"mover", 0, 20, b"second").unwrap();

    assert_eq!(info.address, 20);
    assert_eq!(engine.get(b"mover", 0).unwrap().unwrap().address, 20);
    assert_eq!(engine.read(b"mover", 0).unwrap(), Some(b"second".to_vec()));
    assert_eq!(engine.object_count(), 1);
    assert_eq!(engine.stripe_of_address(10), None);
    assert!(engine.stripe_of_address(20).is_some());
    assert_eq!(engine.segment_usage().total_objects(), 1);
    engine.audit().unwrap();
}

#[test]
fn test_put_in_place_overwrites() {
    let (_device, engine) = setup_mem_engine();
    engine.put(b"same", 0, 30, b"old").unwrap();

    engine.put(b"same", 0, 30, b"new").unwrap();

    assert_eq!(engine.read(b"same", 0).unwrap(), Some(b"new".to_vec()));
    assert_eq!(engine.object_count(), 1);
    assert_eq!(engine.segment_usage().total_objects(), 1);
}

#[test]
fn test_occupied_address_rejected() {
    let (_device, engine) = setup_mem_engine();
    engine.put(b"owner", 0, 5, b"mine").unwrap();

    let result = engine.put(b"intruder", 0, 5, b"theirs");

    assert!(matches!(result, Err(StormError::InvalidArgument(_))));
    assert_eq!(engine.read(b"owner", 0).unwrap(), Some(b"mine".to_vec()));
}

#[test]
fn test_overlapping_blocks_rejected() {
    let (_device, engine) = setup_mem_engine();
    let wide = vec![0x5A; 1500];
    assert_eq!(engine.put(b"wide", 0, 10, &wide).unwrap().blocks, 3);

    // Starts inside the wide object
    let inner = engine.put(b"inner", 0, 11, b"v");
    assert!(matches!(inner, Err(StormError::InvalidArgument(_))));
    // Runs into the wide object
    let front = engine.put(b"front", 0, 9, &[1u8; 600]);
    assert!(matches!(front, Err(StormError::InvalidArgument(_))));

    engine.put(b"after", 0, 13, b"v").unwrap();
    // Overlapping only its own old blocks is a relocation
    engine.put(b"wide", 0, 8, &wide).unwrap();

    assert_eq!(engine.read(b"wide", 0).unwrap(), Some(wide));
    assert_eq!(engine.read(b"after", 0).unwrap(), Some(b"v".to_vec()));
    assert_eq!(engine.get(b"inner", 0).unwrap(), None);
    assert_eq!(engine.object_count(), 2);
    engine.audit().unwrap();
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

#[test]
fn test_crash_recovery_across_log_cycles() {
    let config = test_config();
    let device = setup_device(&config);
    let mut model: HashMap<String, (u64, String)> = HashMap::new();
    {
        let engine = reopen(&device, config.clone());
        for i in 0..200u64 {
            let key = format!("key{}", i);
            let value = format!("value{}", i);
            engine.put(key.as_bytes(), 0, i * 3, value.as_bytes()).unwrap();
            model.insert(key, (i * 3, value));
        }
        for i in (0..200u64).step_by(5) {
            let key = format!("key{}", i);
            assert!(engine.delete(key.as_bytes(), 0).unwrap());
            model.remove(&key);
        }
        for i in (1..200u64).step_by(7).filter(|i| i % 5 != 0) {
            let key = format!("key{}", i);
            let value = format!("moved{}", i);
            engine.put(key.as_bytes(), 0, 1000 + i, value.as_bytes()).unwrap();
            model.insert(key, (1000 + i, value));
        }
        // Dropped without close: crash
    }

    let engine = reopen(&device, config);

    assert_eq!(engine.object_count(), model.len());
    assert_eq!(engine.recovery_report().objects_rebuilt, model.len() as u64);
    engine.audit().unwrap();
    for (key, (address, value)) in &model {
        let info = engine.get(key.as_bytes(), 0).unwrap().unwrap();
        assert_eq!(info.address, *address);
        assert_eq!(engine.read(key.as_bytes(), 0).unwrap(), Some(value.clone().into_bytes()));
    }
    for i in (0..200u64).step_by(5) {
        assert_eq!(engine.get(format!("key{}", i).as_bytes(), 0).unwrap(), None);
    }
}

#[test]
fn test_unsynced_records_lost_on_crash() {
    let config = Config {
        wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 64 },
        ..test_config()
    };
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        for i in 0..3u64 {
            engine.put(format!("lost{}", i).as_bytes(), 0, i, b"v").unwrap();
        }
    }
    {
        let engine = reopen(&device, config.clone());
        assert_eq!(engine.object_count(), 0);
        for i in 0..3u64 {
            engine.put(format!("kept{}", i).as_bytes(), 0, i, b"v").unwrap();
        }
        engine.sync().unwrap();
    }

    let engine = reopen(&device, config);
    assert_eq!(engine.object_count(), 3);
    assert!(engine.get(b"kept2", 0).unwrap().is_some());
}

#[test]
fn test_seqno_continues_after_restart() {
    let config = test_config();
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        engine.put(b"a", 0, 0, b"1").unwrap();
        engine.put(b"b", 0, 1, b"2").unwrap();
    }
    {
        let engine = reopen(&device, config.clone());
        assert_eq!(engine.recovery_report().max_seqno, 2);
        // Moving "a" must not be undone by its own older create
        engine.put(b"a", 0, 2, b"3").unwrap();
        assert!(engine.delete(b"b", 0).unwrap());
    }

    let engine = reopen(&device, config);
    assert_eq!(engine.recovery_report().max_seqno, 4);
    assert_eq!(engine.get(b"a", 0).unwrap().unwrap().address, 2);
    assert_eq!(engine.get(b"b", 0).unwrap(), None);
    assert_eq!(engine.object_count(), 1);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_close_and_reopen() {
    let config = test_config();
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        for i in 0..15u64 {
            engine.put(format!("k{}", i).as_bytes(), 0, i, b"data").unwrap();
        }
        engine.close().unwrap();
    }

    let engine = reopen(&device, config);
    let report = engine.recovery_report();

    assert_eq!(report.plan, StartupPlan::MergeOne(LogId::Log0));
    assert_eq!(report.checkpoint.lsn, 2);
    assert_eq!(report.merges[0].records_applied, 0);
    assert_eq!(report.merges[0].pages_skipped, 2);
    assert_eq!(engine.active_log(), LogId::Log1);
    assert_eq!(engine.current_lsn(), 3);
    assert_eq!(engine.object_count(), 15);
    assert_eq!(engine.read(b"k14", 0).unwrap(), Some(b"data".to_vec()));
}

#[test]
fn test_reopen_after_close_then_crash() {
    let config = test_config();
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        engine.put(b"before", 0, 0, b"x").unwrap();
        engine.close().unwrap();
    }
    {
        let engine = reopen(&device, config.clone());
        engine.put(b"after", 0, 1, b"y").unwrap();
    }

    let engine = reopen(&device, config);

    assert_eq!(
        engine.recovery_report().plan,
        StartupPlan::MergeBoth {
            older: LogId::Log0,
            newer: LogId::Log1
        }
    );
    assert!(engine.get(b"before", 0).unwrap().is_some());
    assert!(engine.get(b"after", 0).unwrap().is_some());
}

#[test]
fn test_checkpoint_merges_active_log() {
    let (_device, engine) = setup_mem_engine();
    for i in 0..5u64 {
        engine.put(format!("c{}", i).as_bytes(), 0, i, b"v").unwrap();
    }

    let reports = engine.checkpoint().unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].log, LogId::Log0);
    assert_eq!(reports[0].records_applied, 5);
    assert_eq!(reports[0].checkpoint_lsn, 1);
    assert_eq!(engine.active_log(), LogId::Log1);

    // Nothing new to merge
    assert!(engine.checkpoint().unwrap().is_empty());
    engine.flush().unwrap();
}

#[test]
fn test_fresh_device_is_formatted() {
    let (device, engine) = setup_mem_engine();

    assert_eq!(engine.recovery_report().plan, StartupPlan::Nothing);
    assert_eq!(engine.recovery_report().objects_rebuilt, 0);
    assert_eq!(engine.current_lsn(), 1);
    assert!(device.blocks_written() > 0);
}

#[test]
fn test_geometry_mismatch_rejected() {
    let config = test_config();
    let device = setup_device(&config);
    reopen(&device, config.clone()).close().unwrap();

    let other = Config {
        segment_size: 32 * 1024,
        ..config
    };
    let result = Engine::open(other, device.clone());
    assert!(matches!(result, Err(StormError::Config(_))));
}

#[test]
fn test_max_objects_mismatch_rejected() {
    let config = Config {
        max_objects: 1024,
        ..test_config()
    };
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        for i in 0..64u64 {
            engine.put(format!("obj{}", i).as_bytes(), 0, i, b"v").unwrap();
        }
        engine.close().unwrap();
    }

    // A different object limit changes the hash slots the POT was built with
    let unlimited = Config {
        max_objects: 0,
        ..config.clone()
    };
    let result = Engine::open(unlimited, device.clone());
    assert!(matches!(result, Err(StormError::Config(_))));

    let engine = reopen(&device, config);
    assert_eq!(engine.object_count(), 64);
    assert!(engine.get(b"obj63", 0).unwrap().is_some());
}

#[test]
fn test_device_too_small_rejected() {
    let config = test_config();
    let device = MemDevice::shared(512, 100);

    let result = Engine::open(config, device);
    assert!(matches!(result, Err(StormError::Config(_))));
}

// =============================================================================
// Raw Object Tests
// =============================================================================

#[test]
fn test_raw_slot_allocation() {
    let (_device, engine) = setup_mem_engine();

    engine.allocate_raw(64, 32).unwrap();
    assert!(engine.raw_slot_in_use(2));

    assert!(matches!(engine.allocate_raw(64, 32), Err(StormError::InvalidArgument(_))));
    assert!(matches!(engine.allocate_raw(65, 32), Err(StormError::InvalidArgument(_))));
    assert!(matches!(engine.allocate_raw(96, 33), Err(StormError::InvalidArgument(_))));
    assert!(matches!(
        engine.allocate_raw(2048, 32),
        Err(StormError::AddressOutOfRange { .. })
    ));

    engine.free_raw(64).unwrap();
    assert!(!engine.raw_slot_in_use(2));
    assert!(matches!(engine.free_raw(64), Err(StormError::InvalidArgument(_))));
}

#[test]
fn test_raw_slots_survive_crash() {
    let config = test_config();
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        engine.allocate_raw(64, 32).unwrap();
        engine.allocate_raw(128, 16).unwrap();
        engine.free_raw(64).unwrap();
    }

    let engine = reopen(&device, config);

    assert!(!engine.raw_slot_in_use(2));
    assert!(engine.raw_slot_in_use(4));
    assert_eq!(engine.recovery_report().slab.count_ones(), 1);
}

// =============================================================================
// Mode Tests
// =============================================================================

#[test]
fn test_slab_mode_marks_hits() {
    let config = Config {
        mode: CacheMode::Slab,
        ..test_config()
    };
    let engine = Engine::open(config.clone(), setup_device(&config)).unwrap();
    engine.put(b"hot", 0, 3, b"v").unwrap();
    engine.put(b"cold", 0, 4, b"v").unwrap();

    engine.get(b"hot", 0).unwrap();

    let snapshot = engine.index_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot[0].1.is_referenced());
    assert!(!snapshot[1].1.is_referenced());
}

#[test]
fn test_fifo_mode_leaves_entries_untouched() {
    let (_device, engine) = setup_mem_engine();
    engine.put(b"hot", 0, 3, b"v").unwrap();

    engine.get(b"hot", 0).unwrap();

    assert!(!engine.index_snapshot()[0].1.is_referenced());
}

#[test]
fn test_lean_memory_loads_active_pages_only() {
    let config = test_config();
    let device = setup_device(&config);
    {
        let engine = reopen(&device, config.clone());
        engine.put(b"first", 0, 0, b"v").unwrap();
        engine.put(b"sixth", 0, 5 * 32 + 1, b"v").unwrap();
        engine.close().unwrap();
    }

    let lean = reopen(&device, config.clone());
    assert_eq!(lean.recovery_report().active_pages, 2);
    drop(lean);

    let full = reopen(
        &device,
        Config {
            lean_memory: false,
            ..config
        },
    );
    assert_eq!(full.recovery_report().active_pages, 64);
    assert_eq!(full.object_count(), 2);
}

// =============================================================================
// File Device Tests
// =============================================================================

#[test]
fn test_file_backed_shard() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("shard.img");
    {
        let engine = Engine::open_path(&path, test_config()).unwrap();
        engine.put(b"persisted", 4, 77, b"on disk").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open_path(&path, test_config()).unwrap();

    assert_eq!(engine.read(b"persisted", 4).unwrap(), Some(b"on disk".to_vec()));
    assert_eq!(engine.get(b"persisted", 4).unwrap().unwrap().address, 77);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_puts() {
    let config = test_config();
    let device = setup_device(&config);
    let engine = reopen(&device, config.clone());

    thread::scope(|s| {
        for t in 0..4u64 {
            let engine = &engine;
            s.spawn(move || {
                for i in 0..50u64 {
                    let key = format!("t{}-{}", t, i);
                    engine.put(key.as_bytes(), 0, t * 500 + i * 2, key.as_bytes()).unwrap();
                }
            });
        }
    });

    assert_eq!(engine.object_count(), 200);
    engine.audit().unwrap();
    for t in 0..4u64 {
        for i in 0..50u64 {
            let key = format!("t{}-{}", t, i);
            assert_eq!(engine.read(key.as_bytes(), 0).unwrap(), Some(key.into_bytes()));
        }
    }

    drop(engine);
    let engine = reopen(&device, config);
    assert_eq!(engine.object_count(), 200);
}
