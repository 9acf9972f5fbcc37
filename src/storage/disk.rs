//! Block devices the journal runs on.
//!
//! A [`Disk`] is an array of fixed-size blocks addressed by block number.
//! Reads of blocks that were never written return zeros. Writes of a single
//! block are assumed atomic; ordering across blocks is only guaranteed by
//! [`Disk::barrier`].

pub mod file_disk;
pub mod mem_disk;

use crate::storage::error::StorageResult;

pub use file_disk::FileDisk;
pub use mem_disk::MemDisk;

/// Size of a block in bytes: the unit of disk I/O and of log storage.
pub const BLOCK_SIZE: usize = 4096;

/// Number of addressable bits in one block.
pub const NBITBLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// Raw content of one block.
pub type Block = [u8; BLOCK_SIZE];

/// Allocates a zero-filled block on the heap.
pub fn zero_block() -> Box<Block> {
    Box::new([0u8; BLOCK_SIZE])
}

pub trait Disk: Send + Sync {
    /// Reads block `blkno`.
    fn read(&self, blkno: u64) -> StorageResult<Box<Block>>;

    /// Overwrites block `blkno`.
    fn write(&self, blkno: u64, data: &Block) -> StorageResult<()>;

    /// Makes every preceding write durable before any following write.
    fn barrier(&self) -> StorageResult<()>;

    /// Number of blocks on the device.
    fn size(&self) -> u64;
}
