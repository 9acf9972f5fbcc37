//! blockjournal: a crash-consistent journaled block store.
//!
//! Transactions lock sub-block addresses, stage updates privately, and commit
//! them atomically through a circular write-ahead log that background threads
//! make durable and install to home locations.

pub mod alloc;
pub mod concurrency;
pub mod storage;
pub mod transaction;

pub use alloc::Allocator;
pub use storage::{Addr, Disk, FileDisk, MemDisk, StorageError, StorageResult};
pub use transaction::{EngineConfig, Transaction, TxnManager};
