//! Persistent Object Table (POT) Module
//!
//! The durable, recoverable form of the object index.
//!
//! ## Responsibilities
//! - POT element encoding (one element per data block)
//! - Persistent bitmaps: active POT pages and raw object slots
//! - Lean-memory page cache that only holds active POT pages
//!
//! ## Bitmap Region Format
//! ```text
//! ┌──────────────┬─────────┬───────────────┬──────────────┬───────────────┐
//! │ eye-catch(4) │ CRC (4) │ bit count (8) │ bits (u64 LE)│ trailer u32×n │
//! └──────────────┴─────────┴───────────────┴──────────────┴───────────────┘
//! ```
//! The region is zero padded to whole device blocks. The POT bitmap trailer
//! holds one CRC per POT page; the slab bitmap has none.

mod bitmap;
mod cache;
mod object;

pub use bitmap::{BitmapKind, PersistentBitmap};
pub use cache::PotCache;
pub use object::{FlashObject, MAX_SEQNO};

/// Size of one encoded POT element
pub const POT_ELEMENT_SIZE: usize = 16;

/// Bytes before the bit array of a bitmap region
pub const BITMAP_HEADER_SIZE: usize = 16;

/// Unpadded size of a bitmap region holding `bits` bits and `trailer` words
pub fn bitmap_region_bytes(bits: u64, trailer: usize) -> usize {
    BITMAP_HEADER_SIZE + bits.div_ceil(64) as usize * 8 + trailer * 4
}
