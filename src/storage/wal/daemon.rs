//! Logger and installer threads.
//!
//! Both loops hold the state mutex only to pick a batch and to publish its
//! result. Disk I/O happens with the mutex released. An I/O error stops the
//! thread and poisons the log so waiters fail instead of hanging.

use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::manager::{WalShared, WalState};
use super::record::{Header, LogPosition, Marker, HDRADDRS, LOGHDR, LOGHDR2};
use crate::storage::disk::Block;
use crate::storage::error::{StorageError, StorageResult};

pub(super) fn logger_loop(shared: Arc<WalShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown || state.failure.is_some() {
            break;
        }
        if state.logger_paused || state.disk_end >= state.head() {
            shared.logger_cv.wait(&mut state);
            continue;
        }
        if let Err(e) = log_batch(&shared, &mut state) {
            fail(&shared, &mut state, "logger", e);
            break;
        }
    }
    log::debug!("wal: logger stopped");
}

/// Makes `[disk_end, head)` durable.
fn log_batch(shared: &WalShared, state: &mut MutexGuard<'_, WalState>) -> StorageResult<()> {
    let capacity = shared.capacity;
    let tail = state.tail;
    let start = state.disk_end;
    let end = state.head();

    let skip = start.distance_from(tail) as usize;
    let batch: Vec<(LogPosition, Arc<Block>)> = state
        .mem_log
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(i, e)| (tail.advance(i as u64), e.data.clone()))
        .collect();

    let mut addrs = vec![0u64; HDRADDRS as usize];
    for (i, e) in state.mem_log.iter().enumerate() {
        addrs[(tail.advance(i as u64).value() % capacity) as usize] = e.blkno;
    }
    let header = Header { end, addrs }.encode();

    let disk = shared.disk.clone();
    MutexGuard::unlocked(state, || -> StorageResult<()> {
        for (pos, data) in &batch {
            disk.write(pos.slot_block(capacity), data)?;
        }
        disk.barrier()?;
        disk.write(LOGHDR, &header)?;
        disk.barrier()
    })?;

    state.disk_end = end;
    log::debug!("wal: logged {} blocks, disk_end {}", batch.len(), end);
    shared.progress_cv.notify_all();
    shared.installer_cv.notify_one();
    Ok(())
}

pub(super) fn installer_loop(shared: Arc<WalShared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown || state.failure.is_some() {
            break;
        }
        if state.installer_paused || state.tail >= state.disk_end {
            shared.installer_cv.wait(&mut state);
            continue;
        }
        if let Err(e) = install_batch(&shared, &mut state) {
            fail(&shared, &mut state, "installer", e);
            break;
        }
    }
    log::debug!("wal: installer stopped");
}

/// Copies `[tail, disk_end)` to home locations and advances the tail.
fn install_batch(shared: &WalShared, state: &mut MutexGuard<'_, WalState>) -> StorageResult<()> {
    let start = state.tail;
    let end = state.disk_end;
    let n = end.distance_from(start) as usize;

    // Later entries replace earlier ones, so each block is written once with
    // its newest logged image.
    let mut newest: BTreeMap<u64, Arc<Block>> = BTreeMap::new();
    for e in state.mem_log.iter().take(n) {
        newest.insert(e.blkno, e.data.clone());
    }
    let marker = Marker { start: end }.encode();

    let disk = shared.disk.clone();
    MutexGuard::unlocked(state, || -> StorageResult<()> {
        for (blkno, data) in &newest {
            disk.write(*blkno, data)?;
        }
        disk.barrier()?;
        disk.write(LOGHDR2, &marker)?;
        disk.barrier()
    })?;

    state.mem_log.drain(..n);
    state.tail = end;
    log::debug!(
        "wal: installed {} entries ({} blocks), tail {}",
        n,
        newest.len(),
        end
    );
    shared.progress_cv.notify_all();
    Ok(())
}

fn fail(shared: &WalShared, state: &mut WalState, who: &str, err: StorageError) {
    log::error!("wal: {} failed: {}", who, err);
    state.failure = Some(format!("{}: {}", who, err));
    shared.wake_all();
}
