//! Transaction manager and transaction handles.
//!
//! A [`Transaction`] locks addresses, reads them through the block cache, and
//! stages updates in private [`Buf`]s. Commit merges the dirty buffers of
//! each block into a full block image and appends all images to the log as
//! one atomic unit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::TransactionState;
use crate::concurrency::lock::{AddrLockMap, DEFAULT_LOCK_SHARDS};
use crate::storage::addr::Addr;
use crate::storage::buf::Buf;
use crate::storage::cache::Cache;
use crate::storage::disk::{zero_block, Block, Disk};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{BlockData, LogPosition, WalConfig, Walog};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub wal: WalConfig,
    /// Number of block cache slots.
    pub cache_capacity: usize,
    /// Number of address lock shards.
    pub lock_shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            wal: WalConfig::default(),
            cache_capacity: 512,
            lock_shards: DEFAULT_LOCK_SHARDS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> StorageResult<()> {
        self.wal.validate()?;
        if self.cache_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "cache_capacity must be positive".to_string(),
            ));
        }
        if self.lock_shards == 0 {
            return Err(StorageError::InvalidConfig(
                "lock_shards must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bookkeeping deferred until a transaction's outcome is known.
pub trait CommitHook: Send {
    /// The transaction's updates were appended to the log.
    fn on_commit(&self);

    /// The transaction ended without appending anything.
    fn on_abort(&self);
}

/// Shared state of one journaled device.
pub struct TxnManager {
    walog: Walog,
    cache: Cache,
    locks: AddrLockMap,
    ids: TransactionIdGenerator,
    /// Serializes merge, append, and cache update across commits. Holds the
    /// highest position appended so far.
    commit_lock: Mutex<LogPosition>,
    config: EngineConfig,
}

impl TxnManager {
    /// Formats an empty log on `disk` and starts the engine.
    pub fn format(disk: Arc<dyn Disk>, config: EngineConfig) -> StorageResult<Arc<Self>> {
        config.validate()?;
        let walog = Walog::format(disk, config.wal.clone())?;
        Ok(Self::with_walog(walog, config))
    }

    /// Recovers the log on `disk` and starts the engine.
    pub fn open(disk: Arc<dyn Disk>, config: EngineConfig) -> StorageResult<Arc<Self>> {
        config.validate()?;
        let walog = Walog::open(disk, config.wal.clone())?;
        Ok(Self::with_walog(walog, config))
    }

    fn with_walog(walog: Walog, config: EngineConfig) -> Arc<Self> {
        let head = walog.positions().head;
        Arc::new(Self {
            walog,
            cache: Cache::new(config.cache_capacity),
            locks: AddrLockMap::new(config.lock_shards),
            ids: TransactionIdGenerator::new(),
            commit_lock: Mutex::new(head),
            config,
        })
    }

    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = self.ids.next();
        log::trace!("{} begin", id);
        Transaction {
            id,
            manager: Arc::clone(self),
            bufs: BTreeMap::new(),
            held: BTreeSet::new(),
            hooks: Vec::new(),
            state: TransactionState::Active,
        }
    }

    /// Waits until every commit so far is durable.
    pub fn flush(&self) -> StorageResult<()> {
        self.walog.flush(self.last_commit())
    }

    /// Flushes everything, then stops the log's background threads.
    pub fn shutdown(&self) -> StorageResult<()> {
        let flushed = self.walog.flush_all();
        self.walog.shutdown();
        flushed
    }

    pub fn walog(&self) -> &Walog {
        &self.walog
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn locks(&self) -> &AddrLockMap {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// First block collaborators may use.
    pub fn data_start(&self) -> u64 {
        self.walog.data_start()
    }

    /// Highest log position appended by a commit.
    pub fn last_commit(&self) -> LogPosition {
        *self.commit_lock.lock()
    }

    fn load(&self, addr: Addr) -> StorageResult<Buf> {
        let slot = self.cache.acquire(addr.block);
        slot.with_block(|| self.walog.read(addr.block), |blk| Buf::load(addr, blk))
    }

    /// Builds the block image `bufs` produce when applied to `blkno`.
    fn merge(&self, blkno: u64, bufs: &[Buf]) -> StorageResult<Box<Block>> {
        let mut blk = match bufs.iter().find(|b| b.addr().is_whole_block()) {
            Some(whole) => {
                let mut blk = zero_block();
                blk.copy_from_slice(whole.data());
                blk
            }
            None => self.walog.read(blkno)?,
        };
        for buf in bufs.iter().filter(|b| !b.addr().is_whole_block()) {
            buf.install(&mut blk);
        }
        Ok(blk)
    }

    /// Appends the dirty buffers, grouped by block, as one log unit.
    fn append(&self, bufs: Vec<Buf>) -> StorageResult<Option<LogPosition>> {
        let mut by_block: BTreeMap<u64, Vec<Buf>> = BTreeMap::new();
        for buf in bufs.into_iter().filter(Buf::is_dirty) {
            by_block.entry(buf.addr().block).or_default().push(buf);
        }
        if by_block.is_empty() {
            return Ok(None);
        }
        if by_block.len() as u64 > self.walog.capacity() {
            return Err(StorageError::TooLarge {
                blocks: by_block.len(),
                capacity: self.walog.capacity(),
            });
        }

        let mut last = self.commit_lock.lock();
        let mut blocks = Vec::with_capacity(by_block.len());
        for (blkno, bufs) in &by_block {
            blocks.push(BlockData::new(*blkno, self.merge(*blkno, bufs)?));
        }
        let images: Vec<BlockData> = blocks.clone();
        let pos = self.walog.append(blocks)?;
        for image in &images {
            self.cache.write(image.blkno, &image.data);
        }
        *last = (*last).max(pos);
        Ok(Some(pos))
    }
}

/// A transaction handle. Dropping it while active aborts it.
pub struct Transaction {
    id: TransactionId,
    manager: Arc<TxnManager>,
    bufs: BTreeMap<Addr, Buf>,
    /// Flat ids of the locks this transaction holds.
    held: BTreeSet<u64>,
    hooks: Vec<Box<dyn CommitHook>>,
    state: TransactionState,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn manager(&self) -> &Arc<TxnManager> {
        &self.manager
    }

    fn assert_active(&self) {
        assert!(self.state.is_active(), "{} is {}", self.id, self.state);
    }

    /// Whether this transaction holds the lock for `addr`.
    pub fn holds(&self, addr: &Addr) -> bool {
        self.held.contains(&addr.flat_id())
    }

    fn lock(&mut self, addr: &Addr) {
        let flat = addr.flat_id();
        if !self.held.contains(&flat) {
            self.manager.locks.acquire(flat, self.id);
            self.held.insert(flat);
        }
    }

    /// Locks `addr` (waiting if another transaction holds it) and returns its
    /// buffer, loading it on first use.
    ///
    /// A transaction touching several addresses must lock them in ascending
    /// order, or concurrent transactions may deadlock.
    pub fn locked_read(&mut self, addr: Addr) -> StorageResult<&mut Buf> {
        self.assert_active();
        self.lock(&addr);
        let manager = &self.manager;
        match self.bufs.entry(addr) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => Ok(v.insert(manager.load(addr)?)),
        }
    }

    /// Like [`Transaction::locked_read`] but returns None instead of waiting
    /// when another transaction holds the lock.
    pub fn try_locked_read(&mut self, addr: Addr) -> StorageResult<Option<&mut Buf>> {
        self.assert_active();
        let flat = addr.flat_id();
        if !self.held.contains(&flat) {
            if !self.manager.locks.try_acquire(flat, self.id) {
                return Ok(None);
            }
            self.held.insert(flat);
        }
        let manager = &self.manager;
        match self.bufs.entry(addr) {
            Entry::Occupied(e) => Ok(Some(e.into_mut())),
            Entry::Vacant(v) => Ok(Some(v.insert(manager.load(addr)?))),
        }
    }

    /// Copy of the current content of `addr`, as this transaction sees it.
    pub fn read(&mut self, addr: Addr) -> StorageResult<Vec<u8>> {
        Ok(self.locked_read(addr)?.data().to_vec())
    }

    /// Locks `addr` and replaces its content. The old content is not read.
    pub fn overwrite(&mut self, addr: Addr, data: &[u8]) {
        self.assert_active();
        self.lock(&addr);
        match self.bufs.entry(addr) {
            Entry::Occupied(e) => e.into_mut().write(data),
            Entry::Vacant(v) => {
                let mut buf = Buf::new(addr, data.to_vec());
                buf.set_dirty();
                v.insert(buf);
            }
        }
    }

    /// Drops the clean buffer for `addr` and releases its lock early.
    ///
    /// Panics if the buffer is dirty or the lock is not held.
    pub fn release(&mut self, addr: Addr) {
        self.assert_active();
        if let Some(buf) = self.bufs.remove(&addr) {
            assert!(!buf.is_dirty(), "{} releases dirty address {}", self.id, addr);
        }
        let flat = addr.flat_id();
        assert!(
            self.held.remove(&flat),
            "{} releases address {} it does not hold",
            self.id,
            addr
        );
        self.manager.locks.release(flat, self.id);
    }

    /// Mutable access to every buffer this transaction holds.
    pub fn bufs_mut(&mut self) -> impl Iterator<Item = &mut Buf> {
        self.bufs.values_mut()
    }

    pub fn num_dirty(&self) -> usize {
        self.bufs.values().filter(|b| b.is_dirty()).count()
    }

    /// Registers bookkeeping to run when this transaction ends.
    pub fn add_hook(&mut self, hook: Box<dyn CommitHook>) {
        self.assert_active();
        self.hooks.push(hook);
    }

    /// Appends the dirty buffers to the log and releases every lock. With
    /// `wait`, returns only once the commit is durable.
    ///
    /// On error nothing was appended and the transaction is aborted, except
    /// for a failed durability wait, where the commit stands.
    pub fn commit(mut self, wait: bool) -> StorageResult<()> {
        self.assert_active();
        let bufs = std::mem::take(&mut self.bufs).into_values().collect();
        match self.manager.append(bufs) {
            Ok(pos) => {
                log::debug!("{} committed at {:?}", self.id, pos);
                self.finish(TransactionState::Committed);
                match pos {
                    Some(pos) if wait => self.manager.walog.flush(pos),
                    _ => Ok(()),
                }
            }
            Err(e) => {
                log::debug!("{} commit failed: {}", self.id, e);
                self.finish(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    /// Discards the buffers and releases every lock.
    pub fn abort(mut self) {
        self.assert_active();
        log::debug!("{} abort", self.id);
        self.finish(TransactionState::Aborted);
    }

    /// Waits until every commit so far, from any transaction, is durable.
    pub fn flush(&self) -> StorageResult<()> {
        self.manager.flush()
    }

    fn finish(&mut self, outcome: TransactionState) {
        self.state.finish(outcome);
        self.bufs.clear();
        for flat in std::mem::take(&mut self.held) {
            self.manager.locks.release(flat, self.id);
        }
        for hook in std::mem::take(&mut self.hooks) {
            match outcome {
                TransactionState::Committed => hook.on_commit(),
                _ => hook.on_abort(),
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_active() {
            log::trace!("{} dropped while active", self.id);
            self.finish(TransactionState::Aborted);
        }
    }
}
