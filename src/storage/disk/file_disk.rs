use crate::storage::disk::{zero_block, Block, Disk, BLOCK_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A disk backed by a regular file of `size * BLOCK_SIZE` bytes.
pub struct FileDisk {
    file: Mutex<File>,
    size: u64,
}

impl FileDisk {
    /// Creates (or truncates) a file holding `nblocks` zeroed blocks.
    pub fn create(path: &Path, nblocks: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks * BLOCK_SIZE as u64)?;
        log::debug!("created file disk {:?} with {} blocks", path, nblocks);

        Ok(Self {
            file: Mutex::new(file),
            size: nblocks,
        })
    }

    /// Opens an existing disk file; its length determines the block count.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() / BLOCK_SIZE as u64;

        Ok(Self {
            file: Mutex::new(file),
            size,
        })
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

    fn block_offset(blkno: u64) -> u64 {
        blkno * BLOCK_SIZE as u64
    }
}

impl Disk for FileDisk {
    fn read(&self, blkno: u64) -> StorageResult<Box<Block>> {
        self.check(blkno)?;

        let mut blk = zero_block();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::block_offset(blkno)))?;
        file.read_exact(&mut blk[..])?;
        Ok(blk)
    }

    fn write(&self, blkno: u64, data: &Block) -> StorageResult<()> {
        self.check(blkno)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::block_offset(blkno)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn barrier(&self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.img");

        {
            let disk = FileDisk::create(&file_path, 16)?;
            assert_eq!(disk.size(), 16);
        }

        {
            let disk = FileDisk::open(&file_path)?;
            assert_eq!(disk.size(), 16);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_block() -> Result<()> {
        let dir = tempdir()?;
        let disk = FileDisk::create(&dir.path().join("test.img"), 4)?;

        let mut blk = zero_block();
        blk[0] = 42;
        blk[BLOCK_SIZE - 1] = 24;
        disk.write(3, &blk)?;
        disk.barrier()?;

        let read = disk.read(3)?;
        assert_eq!(read[0], 42);
        assert_eq!(read[BLOCK_SIZE - 1], 24);

        // Untouched blocks read back as zeros
        assert!(disk.read(0)?.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.img");

        {
            let disk = FileDisk::create(&file_path, 8)?;
            let blk = Box::new([7u8; BLOCK_SIZE]);
            disk.write(5, &blk)?;
            disk.barrier()?;
        }

        let disk = FileDisk::open(&file_path)?;
        assert_eq!(disk.read(5)?[100], 7);

        Ok(())
    }

    #[test]
    fn test_out_of_range() -> Result<()> {
        let dir = tempdir()?;
        let disk = FileDisk::create(&dir.path().join("test.img"), 2)?;

        assert!(matches!(
            disk.read(2),
            Err(StorageError::InvalidBlock { blkno: 2, size: 2 })
        ));
        assert!(disk.write(10, &zero_block()).is_err());

        Ok(())
    }

    #[test]
    fn test_open_nonexistent_file() -> Result<()> {
        let dir = tempdir()?;
        let result = FileDisk::open(&dir.path().join("missing.img"));
        assert!(matches!(result, Err(StorageError::Io(_))));

        Ok(())
    }
}
