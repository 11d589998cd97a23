//! Error types for StormKV
//!
//! Provides a unified error type for all operations. Conditions the engine
//! cannot safely continue from (corruption, exhaustion, I/O failure) are
//! reported as errors like everything else; whether to abort the process is
//! left to the top-level caller, see [`StormError::is_fatal`].

use thiserror::Error;

/// Result type alias using StormError
pub type Result<T> = std::result::Result<T, StormError>;

/// Unified error type for StormKV operations
#[derive(Debug, Error)]
pub enum StormError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Log {log} page {page}: LSN {found} out of order (expected {expected})")]
    LsnOutOfOrder {
        log: u8,
        page: u64,
        expected: u64,
        found: u64,
    },

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("No free bucket entries left for syndrome {syndrome:#018x}")]
    OutOfBuckets { syndrome: u64 },

    #[error("Allocation failed: {0}")]
    OutOfMemory(String),

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Block address {address} out of range (limit {limit})")]
    AddressOutOfRange { address: u64, limit: u64 },

    #[error("Block address {address} is not owned by any bucket group")]
    NotOwned { address: u64 },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Updater Errors
    // -------------------------------------------------------------------------
    #[error("Updater error: {0}")]
    Updater(String),
}

impl StormError {
    /// Whether the shard must be considered unusable after this error.
    ///
    /// Not-found is never an error, and argument errors only reject the
    /// offending call.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StormError::InvalidArgument(_)
                | StormError::AddressOutOfRange { .. }
                | StormError::NotOwned { .. }
                | StormError::Config(_)
        )
    }
}
