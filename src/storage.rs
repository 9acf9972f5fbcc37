//! Storage layer for blockjournal.
//!
//! Key components:
//!
//! - **Disk**: fixed-size (4KB) blocks, the unit of I/O
//! - **Addr / Buf**: bit ranges inside a block and their staged contents
//! - **Cache**: reference-counted block cache with LRU eviction
//! - **Walog**: write-ahead log that makes multi-block updates atomic

pub mod addr;
pub mod buf;
pub mod cache;
pub mod disk;
pub mod error;
pub mod wal;

pub use addr::Addr;
pub use buf::Buf;
pub use cache::{Cache, SlotGuard};
pub use disk::{Block, Disk, FileDisk, MemDisk, BLOCK_SIZE, NBITBLOCK};
pub use error::{StorageError, StorageResult};
pub use wal::{LogPosition, WalConfig, Walog};
