//! Configuration for StormKV
//!
//! Centralized configuration with sensible defaults. One `Config` describes
//! the geometry of a single shard; the derived on-device layout lives in
//! [`crate::layout::ShardLayout`].

use crate::error::{Result, StormError};
use crate::index::BUCKET_GROUP_SIZE;
use crate::pot::POT_ELEMENT_SIZE;
use crate::wal::{LOG_PAGE_HEADER_SIZE, LOG_RECORD_SIZE};

/// Largest object (in device blocks) a 12-bit block count can describe
pub const MAX_OBJECT_BLOCKS: u64 = 0xFFF;

/// Main configuration for a StormKV shard
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------------
    /// Size of the data area of the flash array (in bytes)
    pub total_size: u64,

    /// Device block size (in bytes)
    pub block_size: usize,

    /// Segment size (in bytes); one POT page covers one segment
    pub segment_size: u64,

    /// Nominal size of a raw (large) object slot (in bytes)
    pub raw_object_size: u64,

    /// Upper bound on indexed objects (0 = derive from capacity)
    pub max_objects: u64,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Replacement mode of the cache built on the index
    pub mode: CacheMode,

    /// Preferred number of hash slots guarded by one stripe lock
    pub lock_bucket_size: u64,

    /// Upper bound on the number of stripe locks
    pub max_lock_stripes: u64,

    // -------------------------------------------------------------------------
    // Recovery Configuration
    // -------------------------------------------------------------------------
    /// Cache only active POT pages ("Storm" mode)
    pub lean_memory: bool,

    /// Verify checksums on bitmaps, POT pages and log pages
    pub checksums: bool,

    /// Pages (device blocks) per log; two logs alternate
    pub log_pages: u64,

    /// How often the current log page is written to the device
    pub wal_sync_strategy: WalSyncStrategy,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// Write the current log page after every record (safest, slowest)
    EveryWrite,

    /// Write the current log page after N records (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Replacement mode of the object cache using the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Log-structured FIFO; lookups leave entries untouched
    Fifo,

    /// Slab classes with CLOCK replacement; lookups set the referenced bit
    Slab,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            total_size: 1 << 30,             // 1 GB
            block_size: 8192,                // 8 KB
            segment_size: 32 * 1024 * 1024,  // 32 MB
            raw_object_size: 1024 * 1024,    // 1 MB
            max_objects: 0,
            mode: CacheMode::Fifo,
            lock_bucket_size: 1024,
            max_lock_stripes: 1 << 14,
            lean_memory: true,
            checksums: true,
            log_pages: 256,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 64 },
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Blocks per segment
    pub fn segment_blocks(&self) -> u64 {
        self.segment_size / self.block_size as u64
    }

    /// Blocks per raw object slot
    pub fn raw_object_blocks(&self) -> u64 {
        self.raw_object_size / self.block_size as u64
    }

    /// Check that the geometry is internally consistent
    pub fn validate(&self) -> Result<()> {
        let bs = self.block_size as u64;

        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(StormError::Config(format!(
                "block_size {} must be a power of two >= 512",
                self.block_size
            )));
        }
        if self.block_size < LOG_PAGE_HEADER_SIZE + LOG_RECORD_SIZE {
            return Err(StormError::Config(format!(
                "block_size {} cannot hold a log page",
                self.block_size
            )));
        }
        if self.segment_size == 0 || self.segment_size % bs != 0 {
            return Err(StormError::Config(format!(
                "segment_size {} must be a non-zero multiple of block_size",
                self.segment_size
            )));
        }

        let segment_blocks = self.segment_blocks();
        if !segment_blocks.is_power_of_two() || segment_blocks < BUCKET_GROUP_SIZE {
            return Err(StormError::Config(format!(
                "segment of {} blocks must be a power of two >= {}",
                segment_blocks, BUCKET_GROUP_SIZE
            )));
        }
        if (segment_blocks * POT_ELEMENT_SIZE as u64) % bs != 0 {
            return Err(StormError::Config(format!(
                "POT page of {} elements is not block aligned",
                segment_blocks
            )));
        }
        if self.total_size < self.segment_size {
            return Err(StormError::Config(format!(
                "total_size {} is smaller than one segment",
                self.total_size
            )));
        }

        let raw_blocks = self.raw_object_blocks();
        if self.raw_object_size % bs != 0 || raw_blocks == 0 || raw_blocks > MAX_OBJECT_BLOCKS {
            return Err(StormError::Config(format!(
                "raw_object_size {} must be 1..={} blocks",
                self.raw_object_size, MAX_OBJECT_BLOCKS
            )));
        }

        if self.log_pages < 2 {
            return Err(StormError::Config("log_pages must be at least 2".to_string()));
        }
        if !self.lock_bucket_size.is_power_of_two() || self.lock_bucket_size < BUCKET_GROUP_SIZE {
            return Err(StormError::Config(format!(
                "lock_bucket_size {} must be a power of two >= {}",
                self.lock_bucket_size, BUCKET_GROUP_SIZE
            )));
        }
        if self.max_lock_stripes == 0 {
            return Err(StormError::Config("max_lock_stripes must be non-zero".to_string()));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(StormError::Config("sync count must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data area size (in bytes)
    pub fn total_size(mut self, size: u64) -> Self {
        self.config.total_size = size;
        self
    }

    /// Set the device block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the segment size (in bytes)
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the raw object slot size (in bytes)
    pub fn raw_object_size(mut self, size: u64) -> Self {
        self.config.raw_object_size = size;
        self
    }

    /// Clamp the number of indexed objects
    pub fn max_objects(mut self, count: u64) -> Self {
        self.config.max_objects = count;
        self
    }

    /// Set the cache replacement mode
    pub fn mode(mut self, mode: CacheMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the preferred stripe size (in hash slots)
    pub fn lock_bucket_size(mut self, size: u64) -> Self {
        self.config.lock_bucket_size = size;
        self
    }

    /// Set the maximum number of stripe locks
    pub fn max_lock_stripes(mut self, count: u64) -> Self {
        self.config.max_lock_stripes = count;
        self
    }

    /// Enable or disable lean-memory POT caching
    pub fn lean_memory(mut self, enabled: bool) -> Self {
        self.config.lean_memory = enabled;
        self
    }

    /// Enable or disable checksum verification
    pub fn checksums(mut self, enabled: bool) -> Self {
        self.config.checksums = enabled;
        self
    }

    /// Set the number of pages per log
    pub fn log_pages(mut self, pages: u64) -> Self {
        self.config.log_pages = pages;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
