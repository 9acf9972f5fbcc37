//! Fixed-capacity, reference-counted block cache.
//!
//! A slot is created on first lookup of a block and filled lazily by the first
//! holder that finds it empty. Holding a [`SlotGuard`] keeps the slot's
//! reference count above zero, and a slot is only evicted at reference count
//! zero. Eviction picks the least recently released slot.

pub mod lru;
pub mod replacer;

use crate::storage::disk::Block;
use crate::storage::error::StorageResult;
use lru::LruReplacer;
use parking_lot::{Condvar, Mutex};
use replacer::Replacer;
use std::collections::HashMap;
use std::sync::Arc;

type SlotContent = Arc<Mutex<Option<Box<Block>>>>;

struct Entry {
    ref_count: u32,
    content: SlotContent,
}

struct CacheTable {
    entries: HashMap<u64, Entry>,
    replacer: Box<dyn Replacer>,
}

impl CacheTable {
    fn lookup_or_create(&mut self, blkno: u64, capacity: usize) -> Option<SlotContent> {
        if let Some(entry) = self.entries.get_mut(&blkno) {
            entry.ref_count += 1;
            if entry.ref_count == 1 {
                self.replacer.pin(blkno);
            }
            return Some(entry.content.clone());
        }

        if self.entries.len() >= capacity && !self.evict() {
            return None;
        }

        let content: SlotContent = Arc::new(Mutex::new(None));
        self.entries.insert(
            blkno,
            Entry {
                ref_count: 1,
                content: content.clone(),
            },
        );
        Some(content)
    }

    fn evict(&mut self) -> bool {
        let Some(victim) = self.replacer.evict() else {
            return false;
        };
        let entry = self
            .entries
            .remove(&victim)
            .unwrap_or_else(|| panic!("replacer chose block {} which is not cached", victim));
        assert_eq!(
            entry.ref_count, 0,
            "evicting block {} while it is referenced",
            victim
        );
        log::trace!("cache: evict block {}", victim);
        true
    }
}

struct CacheInner {
    table: Mutex<CacheTable>,
    slot_freed: Condvar,
    capacity: usize,
}

impl CacheInner {
    fn release(&self, blkno: u64) {
        let mut table = self.table.lock();
        let entry = table
            .entries
            .get_mut(&blkno)
            .unwrap_or_else(|| panic!("release of uncached block {}", blkno));
        assert!(
            entry.ref_count > 0,
            "release of block {} with no outstanding reference",
            blkno
        );
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            table.replacer.unpin(blkno);
            self.slot_freed.notify_one();
        }
    }
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self::with_replacer(capacity, Box::new(LruReplacer::new(capacity)))
    }

    pub fn with_replacer(capacity: usize, replacer: Box<dyn Replacer>) -> Self {
        assert!(capacity > 0, "cache needs at least one slot");
        Self {
            inner: Arc::new(CacheInner {
                table: Mutex::new(CacheTable {
                    entries: HashMap::with_capacity(capacity),
                    replacer,
                }),
                slot_freed: Condvar::new(),
                capacity,
            }),
        }
    }

    /// References the slot for `blkno`, creating it if needed. Returns None
    /// when the cache is full and every slot is referenced.
    pub fn lookup_or_create(&self, blkno: u64) -> Option<SlotGuard> {
        let content = self
            .inner
            .table
            .lock()
            .lookup_or_create(blkno, self.inner.capacity)?;
        Some(self.guard(blkno, content))
    }

    /// Like [`Cache::lookup_or_create`] but waits for a slot to be released
    /// instead of failing.
    pub fn acquire(&self, blkno: u64) -> SlotGuard {
        let mut table = self.inner.table.lock();
        loop {
            if let Some(content) = table.lookup_or_create(blkno, self.inner.capacity) {
                drop(table);
                return self.guard(blkno, content);
            }
            log::debug!("cache: no free slot for block {}, waiting", blkno);
            self.inner.slot_freed.wait(&mut table);
        }
    }

    /// Replaces the cached content of `blkno`. Skipped when no slot can be
    /// had, since the cache is never the only copy.
    pub fn write(&self, blkno: u64, blk: &Block) {
        if let Some(slot) = self.lookup_or_create(blkno) {
            slot.store(blk);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently allocated.
    pub fn len(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference count of `blkno`'s slot, or None if it is not cached.
    pub fn ref_count(&self, blkno: u64) -> Option<u32> {
        self.inner
            .table
            .lock()
            .entries
            .get(&blkno)
            .map(|entry| entry.ref_count)
    }

    fn guard(&self, blkno: u64, content: SlotContent) -> SlotGuard {
        SlotGuard {
            inner: self.inner.clone(),
            blkno,
            content,
        }
    }
}

/// A counted reference to one cache slot. Dropping it releases the reference.
pub struct SlotGuard {
    inner: Arc<CacheInner>,
    blkno: u64,
    content: SlotContent,
}

impl SlotGuard {
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    pub fn is_loaded(&self) -> bool {
        self.content.lock().is_some()
    }

    /// Runs `f` on the slot content, filling an empty slot with `load` first.
    /// The slot stays locked for the duration, so a concurrent
    /// [`SlotGuard::store`] is ordered entirely before or after.
    pub fn with_block<R>(
        &self,
        load: impl FnOnce() -> StorageResult<Box<Block>>,
        f: impl FnOnce(&Block) -> R,
    ) -> StorageResult<R> {
        let mut content = self.content.lock();
        if content.is_none() {
            *content = Some(load()?);
        }
        match content.as_deref() {
            Some(blk) => Ok(f(blk)),
            None => unreachable!("slot filled above"),
        }
    }

    /// Overwrites the slot content wholesale.
    pub fn store(&self, blk: &Block) {
        let mut content = self.content.lock();
        match content.as_deref_mut() {
            Some(existing) => existing.copy_from_slice(blk),
            None => *content = Some(Box::new(*blk)),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release(self.blkno);
    }
}
