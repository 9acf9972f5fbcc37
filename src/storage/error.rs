//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Only recoverable conditions live here. Broken invariants (double lock
/// acquisition, releasing a lock that is not held, freeing an unallocated
/// number) are programming errors and panic instead.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Update touches {blocks} blocks but the log only holds {capacity}")]
    TooLarge { blocks: usize, capacity: u64 },

    #[error("No space left: allocator is exhausted")]
    NoSpace,

    #[error("Storage engine has been shut down")]
    ShutDown,

    #[error("Write-ahead log failed: {0}")]
    LogFailed(String),

    #[error("Invalid block {blkno} (device has {size} blocks)")]
    InvalidBlock { blkno: u64, size: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt on-disk structure: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
