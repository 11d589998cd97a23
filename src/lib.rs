//! # StormKV
//!
//! A flash object index with crash-consistent, lean-memory recovery:
//! - Striped, bucket-chained hash index from keys to block addresses
//! - Write-ahead log of index mutations in two alternating logs
//! - Persistent object table (POT) with only active pages cached
//! - Index rebuilt from the POT on every start
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine                                │
//! │          (put / get / delete, raw slot notifications)        │
//! └──────┬──────────────────────┬───────────────────────────────┘
//!        │                      │
//!        ▼                      ▼
//!  ┌─────────────┐       ┌─────────────┐  Merge   ┌─────────────┐
//!  │ Hash Index  │       │ Log Writer  │ ───────► │   Updater   │
//!  │ (stripes)   │       │ (log 0 / 1) │          │  (thread)   │
//!  └──────▲──────┘       └─────────────┘          └──────┬──────┘
//!         │                                              │
//!         │            Rebuild on startup         ┌──────▼──────┐
//!         └────────────────────────────────────── │ POT cache + │
//!                                                 │  bitmaps    │
//!                                                 └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod checksum;

pub mod device;
pub mod layout;
pub mod object;
pub mod index;
pub mod pot;
pub mod wal;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{CacheMode, Config, WalSyncStrategy};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use engine::{Engine, ObjectInfo};
pub use error::{Result, StormError};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StormKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
