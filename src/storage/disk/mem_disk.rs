use crate::storage::disk::{zero_block, Block, Disk};
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::HashMap;

/// An in-memory disk.
///
/// Blocks are materialised on first write. [`MemDisk::crash_image`] captures
/// exactly what a crash at this instant would leave behind, which is how the
/// recovery tests reproduce crash windows.
pub struct MemDisk {
    blocks: Mutex<HashMap<u64, Box<Block>>>,
    size: u64,
}

impl MemDisk {
    pub fn new(nblocks: u64) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            size: nblocks,
        }
    }

    /// Returns an independent copy of the current disk contents.
    pub fn crash_image(&self) -> MemDisk {
        let blocks = self.blocks.lock().clone();
        MemDisk {
            blocks: Mutex::new(blocks),
            size: self.size,
        }
    }

    fn check(&self, blkno: u64) -> StorageResult<()> {
        if blkno >= self.size {
            return Err(StorageError::InvalidBlock {
                blkno,
                size: self.size,
            });
        }
        Ok(())
    }
}

impl Disk for MemDisk {
    fn read(&self, blkno: u64) -> StorageResult<Box<Block>> {
        self.check(blkno)?;
        let blocks = self.blocks.lock();
        Ok(blocks.get(&blkno).cloned().unwrap_or_else(zero_block))
    }

    fn write(&self, blkno: u64, data: &Block) -> StorageResult<()> {
        self.check(blkno)?;
        self.blocks.lock().insert(blkno, Box::new(*data));
        Ok(())
    }

    fn barrier(&self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::BLOCK_SIZE;

    #[test]
    fn test_read_unwritten_is_zero() {
        let disk = MemDisk::new(4);
        assert!(disk.read(1).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_crash_image_is_independent() {
        let disk = MemDisk::new(4);
        disk.write(1, &[1u8; BLOCK_SIZE]).unwrap();

        let image = disk.crash_image();
        disk.write(1, &[2u8; BLOCK_SIZE]).unwrap();

        assert_eq!(image.read(1).unwrap()[0], 1);
        assert_eq!(disk.read(1).unwrap()[0], 2);
    }

    #[test]
    fn test_out_of_range() {
        let disk = MemDisk::new(4);
        assert!(disk.read(4).is_err());
        assert!(disk.write(4, &[0u8; BLOCK_SIZE]).is_err());
    }
}
