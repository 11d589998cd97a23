//! Shard layout definitions
//!
//! Shard Layout (in device blocks):
//! ```text
//! +------------------+  Block 0
//! |   Superblock     |  Magic, version, geometry
//! +------------------+  Block 1
//! |   Checkpoint     |  Highest LSN reflected in the POT
//! +------------------+
//! |   POT Region     |  16 bytes per data block, one page per segment
//! +------------------+
//! |   POT Bitmap     |  "POTB": active pages + page checksums
//! +------------------+
//! |   Slab Bitmap    |  "SLBB": raw object slots in use
//! +------------------+
//! |   Log 0          |  log_pages blocks
//! +------------------+
//! |   Log 1          |  log_pages blocks
//! +------------------+
//! |   Data Region    |  Object blocks; addresses are relative to here
//! +------------------+
//! ```

use bytes::{Buf, BufMut};

use crate::checksum;
use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::index::{IndexGeometry, IndexOptions};
use crate::pot::{bitmap_region_bytes, POT_ELEMENT_SIZE};
use crate::wal::LogId;

/// Magic number for the superblock
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"STRM";

/// Magic number for the checkpoint block
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Current shard format version
pub const FORMAT_VERSION: u32 = 1;

/// Offset of the checksum field in both metadata blocks
const META_CHECKSUM_OFFSET: usize = 4;

/// A contiguous run of device blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub blocks: u64,
}

impl Region {
    /// First block past the region
    pub fn end(&self) -> u64 {
        self.start + self.blocks
    }
}

/// Where everything of one shard lives on the device
#[derive(Debug, Clone)]
pub struct ShardLayout {
    pub block_size: usize,
    pub segment_blocks: u64,
    pub segments: u64,
    pub data_blocks: u64,
    pub raw_object_blocks: u64,
    pub raw_slots: u64,
    pub pot_page_blocks: u64,
    pub log_pages: u64,
    /// Hash slots of the index; POT elements record slots modulo this
    pub hash_size: u64,
    pub superblock: Region,
    pub checkpoint: Region,
    pub pot: Region,
    pub pot_bitmap: Region,
    pub slab_bitmap: Region,
    pub logs: [Region; 2],
    pub data: Region,
}

impl ShardLayout {
    /// Derive the layout from a validated config
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let bs = config.block_size as u64;
        let segment_blocks = config.segment_blocks();
        let segments = config.total_size / bs / segment_blocks;
        if segments == 0 {
            return Err(StormError::Config(
                "total_size holds no complete segment".to_string(),
            ));
        }
        let data_blocks = segments * segment_blocks;
        let raw_object_blocks = config.raw_object_blocks();
        let raw_slots = data_blocks / raw_object_blocks;
        let pot_page_blocks = segment_blocks * POT_ELEMENT_SIZE as u64 / bs;
        let hash_size = IndexGeometry::compute(
            config.total_size,
            config.max_objects,
            &IndexOptions::from(config),
        )?
        .hash_size;

        let superblock = Region { start: 0, blocks: 1 };
        let checkpoint = Region { start: 1, blocks: 1 };
        let pot = Region {
            start: checkpoint.end(),
            blocks: segments * pot_page_blocks,
        };
        let pot_bitmap = Region {
            start: pot.end(),
            blocks: (bitmap_region_bytes(segments, segments as usize) as u64).div_ceil(bs),
        };
        let slab_bitmap = Region {
            start: pot_bitmap.end(),
            blocks: (bitmap_region_bytes(raw_slots, 0) as u64).div_ceil(bs),
        };
        let log0 = Region {
            start: slab_bitmap.end(),
            blocks: config.log_pages,
        };
        let log1 = Region {
            start: log0.end(),
            blocks: config.log_pages,
        };
        let data = Region {
            start: log1.end(),
            blocks: data_blocks,
        };

        Ok(Self {
            block_size: config.block_size,
            segment_blocks,
            segments,
            data_blocks,
            raw_object_blocks,
            raw_slots,
            pot_page_blocks,
            log_pages: config.log_pages,
            hash_size,
            superblock,
            checkpoint,
            pot,
            pot_bitmap,
            slab_bitmap,
            logs: [log0, log1],
            data,
        })
    }

    /// Total device blocks the shard occupies
    pub fn total_blocks(&self) -> u64 {
        self.data.end()
    }

    /// Region of one log
    pub fn log(&self, log: LogId) -> Region {
        self.logs[log.index()]
    }

    /// Segment a data block belongs to
    pub fn segment_of(&self, block: u64) -> u64 {
        block / self.segment_blocks
    }

    /// Raw object slot a data block belongs to
    pub fn raw_slot_of(&self, block: u64) -> u64 {
        block / self.raw_object_blocks
    }
}

// =============================================================================
// Superblock
// =============================================================================

/// Geometry stamp written when a shard is formatted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub segment_blocks: u64,
    pub data_blocks: u64,
    pub raw_object_blocks: u64,
    pub log_pages: u64,
    pub hash_size: u64,
}

impl Superblock {
    /// Superblock describing a layout
    pub fn for_layout(layout: &ShardLayout) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size: layout.block_size as u32,
            segment_blocks: layout.segment_blocks,
            data_blocks: layout.data_blocks,
            raw_object_blocks: layout.raw_object_blocks,
            log_pages: layout.log_pages,
            hash_size: layout.hash_size,
        }
    }

    /// Serialize into one device block
    pub fn to_block(&self, block_size: usize) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        {
            let mut buf = &mut block[..];
            buf.put_slice(&SUPERBLOCK_MAGIC);
            buf.put_u32_le(0); // checksum, filled below
            buf.put_u32_le(self.version);
            buf.put_u32_le(self.block_size);
            buf.put_u64_le(self.segment_blocks);
            buf.put_u64_le(self.data_blocks);
            buf.put_u64_le(self.raw_object_blocks);
            buf.put_u64_le(self.log_pages);
            buf.put_u64_le(self.hash_size);
        }
        let sum = checksum::crc_without_field(&block, META_CHECKSUM_OFFSET);
        block[META_CHECKSUM_OFFSET..META_CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
        block
    }

    /// Parse one device block; `Ok(None)` for a never-formatted block
    pub fn from_block(block: &[u8]) -> Result<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let mut buf = block;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SUPERBLOCK_MAGIC {
            return Err(StormError::Corruption(format!(
                "invalid superblock magic {:?}",
                magic
            )));
        }

        let stored = buf.get_u32_le();
        let computed = checksum::crc_without_field(block, META_CHECKSUM_OFFSET);
        if stored != computed {
            return Err(StormError::Corruption(format!(
                "superblock checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        Ok(Some(Self {
            version: buf.get_u32_le(),
            block_size: buf.get_u32_le(),
            segment_blocks: buf.get_u64_le(),
            data_blocks: buf.get_u64_le(),
            raw_object_blocks: buf.get_u64_le(),
            log_pages: buf.get_u64_le(),
            hash_size: buf.get_u64_le(),
        }))
    }

    /// Read the superblock of a shard
    pub fn read(device: &dyn BlockDevice, layout: &ShardLayout) -> Result<Option<Self>> {
        let mut block = vec![0u8; layout.block_size];
        device.read_blocks(layout.superblock.start, &mut block)?;
        Self::from_block(&block)
    }

    /// Write the superblock of a shard
    pub fn write(&self, device: &dyn BlockDevice, layout: &ShardLayout) -> Result<()> {
        device.write_blocks(layout.superblock.start, &self.to_block(layout.block_size))
    }

    /// Reject a device formatted with a different geometry
    pub fn check_matches(&self, layout: &ShardLayout) -> Result<()> {
        let expected = Self::for_layout(layout);
        if *self != expected {
            return Err(StormError::Config(format!(
                "device formatted as {:?}, config describes {:?}",
                self, expected
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Recovery horizon: every log page at or below `lsn` is reflected in the POT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub lsn: u64,
    /// Log that held the page with `lsn` (meaningless while `lsn == 0`)
    pub log: LogId,
}

impl Checkpoint {
    /// Serialize into one device block
    pub fn to_block(&self, block_size: usize) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        {
            let mut buf = &mut block[..];
            buf.put_slice(&CHECKPOINT_MAGIC);
            buf.put_u32_le(0);
            buf.put_u64_le(self.lsn);
            buf.put_u8(self.log.index() as u8);
        }
        let sum = checksum::crc_without_field(&block, META_CHECKSUM_OFFSET);
        block[META_CHECKSUM_OFFSET..META_CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
        block
    }

    /// Parse one device block; an all-zero block is the empty checkpoint
    pub fn from_block(block: &[u8]) -> Result<Self> {
        if block.iter().all(|&b| b == 0) {
            return Ok(Self::default());
        }

        let mut buf = block;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let stored = buf.get_u32_le();
        let computed = checksum::crc_without_field(block, META_CHECKSUM_OFFSET);
        if magic != CHECKPOINT_MAGIC || stored != computed {
            tracing::error!(
                stored,
                computed,
                magic = ?magic,
                "checkpoint block failed validation"
            );
            return Err(StormError::Corruption("invalid checkpoint block".to_string()));
        }

        let lsn = buf.get_u64_le();
        let log = LogId::from_index(buf.get_u8() as usize)
            .ok_or_else(|| StormError::Corruption("checkpoint names unknown log".to_string()))?;
        Ok(Self { lsn, log })
    }

    /// Read the checkpoint of a shard
    pub fn read(device: &dyn BlockDevice, layout: &ShardLayout) -> Result<Self> {
        let mut block = vec![0u8; layout.block_size];
        device.read_blocks(layout.checkpoint.start, &mut block)?;
        Self::from_block(&block)
    }

    /// Write and sync the checkpoint of a shard
    pub fn write(&self, device: &dyn BlockDevice, layout: &ShardLayout) -> Result<()> {
        device.write_blocks(layout.checkpoint.start, &self.to_block(layout.block_size))?;
        device.sync()
    }
}
