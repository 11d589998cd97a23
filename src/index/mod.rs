//! Object Index Module
//!
//! In-memory map from (container, key) to on-flash block addresses.
//!
//! ## Responsibilities
//! - Syndrome computation and bucket-group chains
//! - Reverse address table (block -> owning bucket group)
//! - Lock striping and per-stripe bucket free lists
//! - Per-segment slab-class occupancy
//!
//! The index is never persisted; recovery rebuilds it from the POT.

mod arena;
mod entry;
mod table;
mod usage;

pub use arena::{BucketArena, NULL_BUCKET};
pub use entry::{syndrome_fragment, BucketEntry, HashEntry, MAX_ADDRESS};
pub use table::{
    EntryLoc, HashTable, IndexAudit, IndexGeometry, IndexOptions, KeyVerifier, LockKey,
    StripeLocks,
};
pub use usage::{SegmentClass, SegmentUsage};

/// Entries per bucket record
pub const ENTRIES_PER_BUCKET: usize = 4;

/// Hash slots per bucket group
pub const BUCKET_GROUP_SIZE: u64 = 16;
