//! Persistent bitmaps
//!
//! Fixed-size bit arrays saved to their own device region, validated by an
//! eye-catcher, a bit count and a CRC over the whole region.

use bytes::{Buf, BufMut};

use super::{bitmap_region_bytes, BITMAP_HEADER_SIZE};
use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{Result, StormError};
use crate::layout::Region;

/// Offset of the CRC field in a bitmap region
const CHECKSUM_OFFSET: usize = 4;

/// Which bitmap a region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    /// One bit per POT page; set = page is cached
    Pot,
    /// One bit per raw object slot; set = slot in use
    Slab,
}

impl BitmapKind {
    pub fn eye_catcher(self) -> [u8; 4] {
        match self {
            BitmapKind::Pot => *b"POTB",
            BitmapKind::Slab => *b"SLBB",
        }
    }
}

/// A bitmap backed by a device region
#[derive(Debug, Clone)]
pub struct PersistentBitmap {
    kind: BitmapKind,
    region: Region,
    bit_count: u64,
    words: Vec<u64>,
    trailer: Vec<u32>,
}

impl PersistentBitmap {
    /// An all-clear bitmap that has never been saved
    pub fn fresh(kind: BitmapKind, region: Region, bit_count: u64, trailer_len: usize) -> Self {
        Self {
            kind,
            region,
            bit_count,
            words: vec![0; bit_count.div_ceil(64) as usize],
            trailer: vec![0; trailer_len],
        }
    }

    /// Read and validate a bitmap region
    ///
    /// A region whose eye-catcher is zero must be entirely zero (never saved)
    /// and yields a fresh bitmap. Anything else must carry the right
    /// eye-catcher and bit count, and with `checksums` the stored CRC.
    pub fn load(
        device: &dyn BlockDevice,
        region: Region,
        kind: BitmapKind,
        bit_count: u64,
        trailer_len: usize,
        checksums: bool,
    ) -> Result<Self> {
        let needed = bitmap_region_bytes(bit_count, trailer_len);
        let mut raw = vec![0u8; region.blocks as usize * device.block_size()];
        if raw.len() < needed {
            return Err(StormError::Config(format!(
                "{:?} bitmap region of {} bytes cannot hold {} bytes",
                kind,
                raw.len(),
                needed
            )));
        }
        device.read_blocks(region.start, &mut raw)?;

        if raw[..4] == [0; 4] {
            if let Some(pos) = raw.iter().position(|&b| b != 0) {
                tracing::error!(?kind, offset = pos, "unformatted bitmap region is not empty");
                return Err(StormError::Corruption(format!(
                    "{:?} bitmap has no eye-catcher but non-zero byte at offset {}",
                    kind, pos
                )));
            }
            tracing::debug!(?kind, bit_count, "initializing fresh bitmap");
            return Ok(Self::fresh(kind, region, bit_count, trailer_len));
        }

        let mut buf = &raw[..];
        let mut eye = [0u8; 4];
        buf.copy_to_slice(&mut eye);
        let stored = buf.get_u32_le();
        let stored_bits = buf.get_u64_le();

        if eye != kind.eye_catcher() {
            tracing::error!(?kind, found = ?eye, "bitmap eye-catcher mismatch");
            return Err(StormError::Corruption(format!(
                "{:?} bitmap eye-catcher {:?}",
                kind, eye
            )));
        }
        if stored_bits != bit_count {
            tracing::error!(?kind, stored_bits, bit_count, "bitmap size mismatch");
            return Err(StormError::Corruption(format!(
                "{:?} bitmap holds {} bits, expected {}",
                kind, stored_bits, bit_count
            )));
        }
        if checksums {
            let computed = checksum::crc_without_field(&raw, CHECKSUM_OFFSET);
            if computed != stored {
                tracing::error!(?kind, stored, computed, "bitmap checksum mismatch");
                return Err(StormError::Corruption(format!(
                    "{:?} bitmap checksum mismatch: stored {:#010x}, computed {:#010x}",
                    kind, stored, computed
                )));
            }
        }

        let words = (0..bit_count.div_ceil(64)).map(|_| buf.get_u64_le()).collect();
        let trailer = (0..trailer_len).map(|_| buf.get_u32_le()).collect();

        Ok(Self {
            kind,
            region,
            bit_count,
            words,
            trailer,
        })
    }

    /// Serialize the full region, CRC included
    pub fn to_region_bytes(&self, block_size: usize) -> Vec<u8> {
        let mut raw = vec![0u8; self.region.blocks as usize * block_size];
        {
            let mut buf = &mut raw[..];
            buf.put_slice(&self.kind.eye_catcher());
            buf.put_u32_le(0);
            buf.put_u64_le(self.bit_count);
            for &w in &self.words {
                buf.put_u64_le(w);
            }
            for &t in &self.trailer {
                buf.put_u32_le(t);
            }
        }
        let sum = checksum::crc_without_field(&raw, CHECKSUM_OFFSET);
        raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
        raw
    }

    /// Write the region back
    pub fn save(&self, device: &dyn BlockDevice) -> Result<()> {
        let raw = self.to_region_bytes(device.block_size());
        device.write_blocks(self.region.start, &raw).map_err(|e| {
            tracing::error!(kind = ?self.kind, block = self.region.start, "bitmap save failed: {}", e);
            e
        })
    }

    // =========================================================================
    // Bit Operations
    // =========================================================================

    pub fn set(&mut self, bit: u64) {
        debug_assert!(bit < self.bit_count);
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: u64) {
        debug_assert!(bit < self.bit_count);
        self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
    }

    /// Whether `bit` is set; bits past the end read as clear
    pub fn query(&self, bit: u64) -> bool {
        bit < self.bit_count && self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Set bits in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = w as u64 * 64 + u64::from(bits.trailing_zeros());
                bits &= bits - 1;
                Some(bit)
            })
        })
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn kind(&self) -> BitmapKind {
        self.kind
    }

    pub fn region(&self) -> Region {
        self.region
    }

    // =========================================================================
    // Trailer
    // =========================================================================

    pub fn trailer(&self, idx: usize) -> u32 {
        self.trailer[idx]
    }

    pub fn set_trailer(&mut self, idx: usize, value: u32) {
        self.trailer[idx] = value;
    }

    pub fn trailer_len(&self) -> usize {
        self.trailer.len()
    }
}
