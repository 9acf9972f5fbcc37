//! Per-address exclusive locks.
//!
//! Locks are keyed by the flat bit position of an address (see
//! [`Addr::flat_id`](crate::storage::addr::Addr::flat_id)) and spread over a
//! fixed number of shards, each with its own mutex and condition variable.
//!
//! There is no deadlock detection. A transaction that takes several locks must
//! take them in ascending flat-id order.

use crate::transaction::id::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

/// Shard count used when none is configured.
pub const DEFAULT_LOCK_SHARDS: usize = 43;

#[derive(Debug, Default)]
struct Shard {
    holders: Mutex<HashMap<u64, TransactionId>>,
    released: Condvar,
}

/// Sharded map from flat address to the transaction holding it.
#[derive(Debug)]
pub struct AddrLockMap {
    shards: Vec<Shard>,
}

impl AddrLockMap {
    pub fn new(nshards: usize) -> Self {
        assert!(nshards > 0, "lock map needs at least one shard");
        Self {
            shards: (0..nshards).map(|_| Shard::default()).collect(),
        }
    }

    fn shard(&self, flat: u64) -> &Shard {
        &self.shards[(flat % self.shards.len() as u64) as usize]
    }

    /// Blocks until `flat` is free, then records `owner` as its holder.
    ///
    /// Panics if `owner` already holds `flat`.
    pub fn acquire(&self, flat: u64, owner: TransactionId) {
        let shard = self.shard(flat);
        let mut holders = shard.holders.lock();
        loop {
            match holders.get(&flat) {
                None => break,
                Some(&holder) if holder == owner => {
                    panic!("{} acquires lock {} twice", owner, flat)
                }
                Some(&holder) => {
                    log::trace!("{} waits for lock {} held by {}", owner, flat, holder);
                    shard.released.wait(&mut holders);
                }
            }
        }
        holders.insert(flat, owner);
        log::trace!("{} acquired lock {}", owner, flat);
    }

    /// Takes `flat` for `owner` if nobody holds it. Never waits.
    ///
    /// Panics if `owner` already holds `flat`.
    pub fn try_acquire(&self, flat: u64, owner: TransactionId) -> bool {
        let mut holders = self.shard(flat).holders.lock();
        match holders.get(&flat) {
            Some(&holder) if holder == owner => {
                panic!("{} acquires lock {} twice", owner, flat)
            }
            Some(_) => false,
            None => {
                holders.insert(flat, owner);
                log::trace!("{} acquired lock {}", owner, flat);
                true
            }
        }
    }

    /// Releases `flat` and wakes its waiters.
    ///
    /// Panics unless `owner` holds `flat`.
    pub fn release(&self, flat: u64, owner: TransactionId) {
        let shard = self.shard(flat);
        let mut holders = shard.holders.lock();
        match holders.remove(&flat) {
            Some(holder) if holder == owner => {}
            Some(holder) => panic!(
                "{} releases lock {} which is held by {}",
                owner, flat, holder
            ),
            None => panic!("{} releases lock {} which is not held", owner, flat),
        }
        log::trace!("{} released lock {}", owner, flat);
        shard.released.notify_all();
    }

    /// Releases every lock held by `owner`. Returns how many were released.
    ///
    /// Transactions track their own locks and release them one by one. This
    /// is for collaborators that lock addresses on a transaction's behalf,
    /// such as a file layer dropping an inode early, and need to let go of
    /// all of them without keeping a list.
    pub fn release_all(&self, owner: TransactionId) -> usize {
        let mut released = 0;
        for shard in &self.shards {
            let mut holders = shard.holders.lock();
            let before = holders.len();
            holders.retain(|_, holder| *holder != owner);
            let removed = before - holders.len();
            if removed > 0 {
                released += removed;
                shard.released.notify_all();
            }
        }
        if released > 0 {
            log::trace!("{} released {} locks", owner, released);
        }
        released
    }

    pub fn holder(&self, flat: u64) -> Option<TransactionId> {
        self.shard(flat).holders.lock().get(&flat).copied()
    }

    pub fn is_held_by(&self, flat: u64, owner: TransactionId) -> bool {
        self.holder(flat) == Some(owner)
    }

    /// Number of locks currently held, across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.holders.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddrLockMap {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn tid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn test_basic_acquire_release() {
        let locks = AddrLockMap::default();
        locks.acquire(100, tid(1));
        assert!(locks.is_held_by(100, tid(1)));
        assert_eq!(locks.holder(100), Some(tid(1)));

        locks.release(100, tid(1));
        assert_eq!(locks.holder(100), None);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_try_acquire_conflict() {
        let locks = AddrLockMap::new(3);
        assert!(locks.try_acquire(7, tid(1)));
        assert!(!locks.try_acquire(7, tid(2)));
        // Same shard, different address.
        assert!(locks.try_acquire(10, tid(2)));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let locks = Arc::new(AddrLockMap::default());
        locks.acquire(5, tid(1));

        let barrier = Arc::new(Barrier::new(2));
        let locks_clone = Arc::clone(&locks);
        let barrier_clone = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            barrier_clone.wait();
            locks_clone.acquire(5, tid(2));
            locks_clone.holder(5)
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(locks.holder(5), Some(tid(1)));

        locks.release(5, tid(1));
        assert_eq!(handle.join().unwrap(), Some(tid(2)));
    }

    #[test]
    fn test_release_all() {
        let locks = AddrLockMap::new(4);
        for flat in [1, 2, 3, 40, 41] {
            locks.acquire(flat, tid(1));
        }
        locks.acquire(9, tid(2));

        assert_eq!(locks.release_all(tid(1)), 5);
        assert_eq!(locks.len(), 1);
        assert!(locks.is_held_by(9, tid(2)));
        assert_eq!(locks.release_all(tid(1)), 0);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_double_acquire_is_fatal() {
        let locks = AddrLockMap::default();
        locks.acquire(1, tid(1));
        locks.acquire(1, tid(1));
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn test_release_unheld_is_fatal() {
        let locks = AddrLockMap::default();
        locks.release(1, tid(1));
    }

    #[test]
    #[should_panic(expected = "held by")]
    fn test_release_by_other_owner_is_fatal() {
        let locks = AddrLockMap::default();
        locks.acquire(1, tid(1));
        locks.release(1, tid(2));
    }

    /// Runs `nthreads` workers that each take a sorted set of addresses,
    /// bump a per-address occupancy counter, and check nobody else is inside.
    fn run_exclusion_workload(nthreads: usize, plans: Vec<Vec<u64>>, naddrs: usize) {
        let locks = Arc::new(AddrLockMap::new(5));
        let inside: Arc<Vec<AtomicUsize>> =
            Arc::new((0..naddrs).map(|_| AtomicUsize::new(0)).collect());
        let plans = Arc::new(plans);

        let handles: Vec<_> = (0..nthreads)
            .map(|t| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let plans = Arc::clone(&plans);
                thread::spawn(move || {
                    for (round, plan) in plans.iter().enumerate() {
                        let owner = tid((t * 10_000 + round + 1) as u64);
                        let mut addrs = plan.clone();
                        addrs.sort_unstable();
                        addrs.dedup();
                        for &a in &addrs {
                            locks.acquire(a, owner);
                            let prev = inside[a as usize].fetch_add(1, Ordering::SeqCst);
                            assert_eq!(prev, 0, "address {} held twice", a);
                        }
                        thread::yield_now();
                        for &a in addrs.iter().rev() {
                            inside[a as usize].fetch_sub(1, Ordering::SeqCst);
                            locks.release(a, owner);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_randomized_multi_address_no_deadlock() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let plans: Vec<Vec<u64>> = (0..200)
            .map(|_| {
                let n = rng.gen_range(1..5);
                (0..n).map(|_| rng.gen_range(0..16)).collect()
            })
            .collect();
        run_exclusion_workload(6, plans, 16);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_mutual_exclusion(
            plans in prop::collection::vec(prop::collection::vec(0u64..8, 1..4), 1..30)
        ) {
            run_exclusion_workload(4, plans, 8);
        }
    }
}
