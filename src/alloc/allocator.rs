//! Number allocator over a bitmap stored through transactions.
//!
//! The bitmap is split into one-byte regions. Allocation scans regions from
//! a shared cursor, locking each with [`Transaction::try_locked_read`] so that
//! concurrent allocators pass over regions another transaction is working on
//! and come back to them only if nothing else is free.
//!
//! The in-memory free count only moves when a transaction ends: numbers
//! freed by a transaction become available once it commits, and numbers
//! allocated by an aborted transaction are returned. Until then a freed
//! number is not handed out again, not even to the transaction that freed it.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;

use super::bitmap::{bitmap_clear, bitmap_count_free, bitmap_get, bitmap_set, first_zero};
use crate::storage::addr::Addr;
use crate::storage::buf::Buf;
use crate::storage::disk::{BLOCK_SIZE, NBITBLOCK};
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::id::TransactionId;
use crate::transaction::manager::{CommitHook, Transaction};

#[derive(Debug)]
struct AllocState {
    /// Next region to try.
    next: u64,
    /// Committed free numbers not reserved by an in-flight allocation.
    nfree: u64,
    /// Numbers freed by transactions that have not ended yet.
    pending_free: HashMap<TransactionId, BTreeSet<u64>>,
}

#[derive(Debug)]
struct AllocInner {
    start: u64,
    nblocks: u64,
    max: u64,
    state: Mutex<AllocState>,
}

impl AllocInner {
    fn credit(&self, n: u64) {
        self.state.lock().nfree += n;
    }

    fn settle_free(&self, txn: TransactionId, number: u64, committed: bool) {
        let mut state = self.state.lock();
        if let Some(freed) = state.pending_free.get_mut(&txn) {
            freed.remove(&number);
            if freed.is_empty() {
                state.pending_free.remove(&txn);
            }
        }
        if committed {
            state.nfree += 1;
        }
    }
}

/// Allocates numbers in `1..max`. Number 0 is never handed out.
#[derive(Debug, Clone)]
pub struct Allocator {
    inner: Arc<AllocInner>,
}

impl Allocator {
    fn new(start: u64, nblocks: u64, max: u64, nfree: u64) -> Self {
        Self {
            inner: Arc::new(AllocInner {
                start,
                nblocks,
                max,
                state: Mutex::new(AllocState {
                    next: 0,
                    nfree,
                    pending_free: HashMap::new(),
                }),
            }),
        }
    }

    fn check_geometry(nblocks: u64, max: u64) {
        assert!(
            max > 1 && max <= nblocks * NBITBLOCK,
            "{} numbers do not fit in {} bitmap blocks",
            max,
            nblocks
        );
    }

    /// Writes an empty bitmap of `nblocks` blocks at `start` through `txn`.
    /// Bit 0 and every bit from `max` on are marked used.
    ///
    /// The transaction must commit before the allocator is used.
    pub fn format(txn: &mut Transaction, start: u64, nblocks: u64, max: u64) -> Self {
        Self::check_geometry(nblocks, max);
        for i in 0..nblocks {
            let mut blk = vec![0u8; BLOCK_SIZE];
            let first = i * NBITBLOCK;
            for n in first..first + NBITBLOCK {
                if n == 0 || n >= max {
                    bitmap_set(&mut blk, n - first);
                }
            }
            txn.overwrite(Addr::block_addr(start + i), &blk);
        }
        log::debug!(
            "alloc: formatted bitmap at {} ({} blocks, max {})",
            start,
            nblocks,
            max
        );
        Self::new(start, nblocks, max, max - 1)
    }

    /// Loads an existing bitmap and counts its free numbers.
    pub fn open(txn: &mut Transaction, start: u64, nblocks: u64, max: u64) -> StorageResult<Self> {
        Self::check_geometry(nblocks, max);
        let mut nfree = 0;
        for i in 0..nblocks {
            let addr = Addr::block_addr(start + i);
            let first = i * NBITBLOCK;
            let count = max.saturating_sub(first).min(NBITBLOCK);
            nfree += bitmap_count_free(&txn.read(addr)?, count);
            txn.release(addr);
        }
        log::debug!("alloc: bitmap at {} has {} free of {}", start, nfree, max);
        Ok(Self::new(start, nblocks, max, nfree))
    }

    pub fn max(&self) -> u64 {
        self.inner.max
    }

    pub fn start(&self) -> u64 {
        self.inner.start
    }

    pub fn nblocks(&self) -> u64 {
        self.inner.nblocks
    }

    /// Free numbers, excluding those reserved by in-flight allocations and
    /// those freed by transactions that have not committed.
    pub fn num_free(&self) -> u64 {
        self.inner.state.lock().nfree
    }

    fn num_regions(&self) -> u64 {
        self.inner.max.div_ceil(8)
    }

    fn region_addr(&self, region: u64) -> Addr {
        Addr::byte_addr(self.inner.start, region * 8)
    }

    /// Region index of `addr`, if it is one of this bitmap's regions.
    fn region_of(&self, addr: &Addr) -> Option<u64> {
        let inner = &self.inner;
        if addr.bit_length != 8
            || addr.bit_offset % 8 != 0
            || addr.block < inner.start
            || addr.block >= inner.start + inner.nblocks
        {
            return None;
        }
        let region = ((addr.block - inner.start) * NBITBLOCK + addr.bit_offset) / 8;
        (region < self.num_regions()).then_some(region)
    }

    /// Sets the lowest clear bit of a region buffer that is not in `freed`.
    /// Returns its number.
    fn take_bit(&self, region: u64, buf: &mut Buf, freed: &BTreeSet<u64>) -> Option<u64> {
        let first = region * 8;
        let unavailable = freed
            .range(first..first + 8)
            .fold(buf.data()[0], |byte, n| byte | (1u8 << (n - first)));
        let bit = first_zero(unavailable)?;
        let number = region * 8 + u64::from(bit);
        if number >= self.inner.max {
            return None;
        }
        bitmap_set(buf.data_mut(), u64::from(bit));
        buf.set_dirty();
        Some(number)
    }

    fn stage(&self, txn: &mut Transaction, number: u64, op: StagedOp) {
        txn.add_hook(Box::new(StagedNumber {
            alloc: self.inner.clone(),
            txn: txn.id(),
            number,
            op,
        }));
    }

    /// Allocates a free number in `txn`. Returns None when there is none.
    ///
    /// When the only free numbers lie in regions other transactions hold,
    /// this waits for one of them to let go. The caller must not hold locks
    /// those transactions are waiting for.
    pub fn allocate(&self, txn: &mut Transaction) -> StorageResult<Option<u64>> {
        {
            let mut state = self.inner.state.lock();
            if state.nfree == 0 {
                return Ok(None);
            }
            state.nfree -= 1;
        }

        match self.find(txn) {
            Ok(Some(number)) => {
                log::trace!("alloc: {} allocated {}", txn.id(), number);
                self.stage(txn, number, StagedOp::Allocated);
                Ok(Some(number))
            }
            Ok(None) => {
                log::debug!("alloc: {} found no free number", txn.id());
                self.inner.credit(1);
                Ok(None)
            }
            Err(e) => {
                self.inner.credit(1);
                Err(e)
            }
        }
    }

    fn find(&self, txn: &mut Transaction) -> StorageResult<Option<u64>> {
        let freed = self
            .inner
            .state
            .lock()
            .pending_free
            .get(&txn.id())
            .cloned()
            .unwrap_or_default();

        // Regions this transaction already locked cost nothing to reuse.
        for buf in txn.bufs_mut() {
            if let Some(region) = self.region_of(&buf.addr()) {
                if let Some(number) = self.take_bit(region, buf, &freed) {
                    return Ok(Some(number));
                }
            }
        }

        let nregions = self.num_regions();
        loop {
            let first = self.inner.state.lock().next;
            let mut contended = false;
            for i in 0..nregions {
                let region = (first + i) % nregions;
                self.inner.state.lock().next = (region + 1) % nregions;
                let addr = self.region_addr(region);
                if txn.holds(&addr) {
                    continue;
                }
                let Some(buf) = txn.try_locked_read(addr)? else {
                    contended = true;
                    continue;
                };
                if let Some(number) = self.take_bit(region, buf, &freed) {
                    return Ok(Some(number));
                }
                txn.release(addr);
            }
            if !contended {
                return Ok(None);
            }
            log::trace!("alloc: {} retrying past locked regions", txn.id());
            thread::yield_now();
        }
    }

    /// Like [`Allocator::allocate`] but reports exhaustion as `NoSpace`.
    pub fn allocate_or_err(&self, txn: &mut Transaction) -> StorageResult<u64> {
        self.allocate(txn)?.ok_or(StorageError::NoSpace)
    }

    /// Frees `number` in `txn`. It becomes allocatable once `txn` commits.
    ///
    /// Panics if `number` is 0, out of range, or not allocated.
    pub fn free(&self, txn: &mut Transaction, number: u64) -> StorageResult<()> {
        assert!(
            number != 0 && number < self.inner.max,
            "free of number {} outside 1..{}",
            number,
            self.inner.max
        );
        let addr = self.region_addr(number / 8);
        let buf = txn.locked_read(addr)?;
        let bit = number % 8;
        assert!(
            bitmap_get(buf.data(), bit),
            "free of unallocated number {}",
            number
        );
        bitmap_clear(buf.data_mut(), bit);
        buf.set_dirty();
        log::trace!("alloc: {} freed {}", txn.id(), number);
        self.inner
            .state
            .lock()
            .pending_free
            .entry(txn.id())
            .or_default()
            .insert(number);
        self.stage(txn, number, StagedOp::Freed);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagedOp {
    Allocated,
    Freed,
}

/// Free-count adjustment applied when the transaction ends.
struct StagedNumber {
    alloc: Arc<AllocInner>,
    txn: TransactionId,
    number: u64,
    op: StagedOp,
}

impl CommitHook for StagedNumber {
    fn on_commit(&self) {
        if self.op == StagedOp::Freed {
            self.alloc.settle_free(self.txn, self.number, true);
        }
    }

    fn on_abort(&self) {
        match self.op {
            StagedOp::Allocated => {
                log::trace!("alloc: returning {}", self.number);
                self.alloc.credit(1);
            }
            StagedOp::Freed => self.alloc.settle_free(self.txn, self.number, false),
        }
    }
}
