use std::fmt::Debug;

/// Chooses which unreferenced cache slot to give up when the cache is full.
pub trait Replacer: Send + Sync + Debug {
    /// Select a block to evict. Returns None if no slot can be evicted.
    fn evict(&mut self) -> Option<u64>;

    /// Mark a block as referenced (not evictable).
    fn pin(&mut self, blkno: u64);

    /// Mark a block as unreferenced (evictable).
    fn unpin(&mut self, blkno: u64);

    /// Get the number of evictable blocks.
    fn size(&self) -> usize;
}
