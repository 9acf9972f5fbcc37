//! The write-ahead log.
//!
//! Appended block images first live in an in-memory log covering positions
//! `[tail, head)`. The logger thread writes `[disk_end, head)` into the
//! circular on-disk region and then the header, which makes them durable. The
//! installer thread copies `[tail, disk_end)` to the home blocks, records the
//! new tail in the marker block, and trims the in-memory log.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::daemon;
use super::record::{BlockData, Header, LogPosition, Marker, HDRADDRS, LOGHDR, LOGHDR2, LOGSTART};
use crate::storage::disk::{Block, Disk};
use crate::storage::error::{StorageError, StorageResult};

/// Write-ahead log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Number of circular log slots. Part of the on-disk format.
    pub log_capacity: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            log_capacity: HDRADDRS,
        }
    }
}

impl WalConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if self.log_capacity == 0 || self.log_capacity > HDRADDRS {
            return Err(StorageError::InvalidConfig(format!(
                "log_capacity must be in 1..={}, got {}",
                HDRADDRS, self.log_capacity
            )));
        }
        Ok(())
    }
}

/// A background activity of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemon {
    Logger,
    Installer,
}

/// Snapshot of the log boundaries. Always `tail <= disk_end <= head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPositions {
    pub tail: LogPosition,
    pub disk_end: LogPosition,
    pub head: LogPosition,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WalState {
    /// Entries for positions `[tail, head)`, oldest first.
    pub(crate) mem_log: VecDeque<BlockData>,
    pub(crate) tail: LogPosition,
    pub(crate) disk_end: LogPosition,
    pub(crate) shutdown: bool,
    pub(crate) logger_paused: bool,
    pub(crate) installer_paused: bool,
    pub(crate) failure: Option<String>,
}

impl WalState {
    fn new(tail: LogPosition, disk_end: LogPosition, mem_log: VecDeque<BlockData>) -> Self {
        Self {
            mem_log,
            tail,
            disk_end,
            shutdown: false,
            logger_paused: false,
            installer_paused: false,
            failure: None,
        }
    }

    pub(crate) fn head(&self) -> LogPosition {
        self.tail.advance(self.mem_log.len() as u64)
    }

    pub(crate) fn check(&self) -> StorageResult<()> {
        if let Some(failure) = &self.failure {
            return Err(StorageError::LogFailed(failure.clone()));
        }
        if self.shutdown {
            return Err(StorageError::ShutDown);
        }
        Ok(())
    }

    fn positions(&self) -> LogPositions {
        LogPositions {
            tail: self.tail,
            disk_end: self.disk_end,
            head: self.head(),
        }
    }
}

pub(crate) struct WalShared {
    pub(crate) disk: Arc<dyn Disk>,
    pub(crate) capacity: u64,
    pub(crate) state: Mutex<WalState>,
    /// Wakes the logger when there is something to log.
    pub(crate) logger_cv: Condvar,
    /// Wakes the installer when there is something to install.
    pub(crate) installer_cv: Condvar,
    /// Signalled whenever `disk_end` or `tail` advances, or the log fails.
    pub(crate) progress_cv: Condvar,
}

impl WalShared {
    pub(crate) fn wake_all(&self) {
        self.logger_cv.notify_all();
        self.installer_cv.notify_all();
        self.progress_cv.notify_all();
    }
}

/// Rebuilds the in-memory log from the header and marker on `disk`.
///
/// Only reads the disk, so running it twice yields the same state.
pub(crate) fn recover_state(disk: &dyn Disk, capacity: u64) -> StorageResult<WalState> {
    let header = Header::decode(&*disk.read(LOGHDR)?);
    let marker = Marker::decode(&*disk.read(LOGHDR2)?);
    let (start, end) = (marker.start, header.end);

    if start > end || end.distance_from(start) > capacity {
        return Err(StorageError::Corrupt(format!(
            "log covers {}..{} but holds at most {} entries",
            start, end, capacity
        )));
    }

    let mut mem_log = VecDeque::with_capacity(end.distance_from(start) as usize);
    for pos in start.0..end.0 {
        let pos = LogPosition(pos);
        let blkno = header.addrs[(pos.0 % capacity) as usize];
        let data = disk.read(pos.slot_block(capacity))?;
        mem_log.push_back(BlockData::new(blkno, data));
    }

    log::info!(
        "wal: recovered {} entries at {}..{}",
        mem_log.len(),
        start,
        end
    );
    Ok(WalState::new(start, end, mem_log))
}

/// Handle to a running write-ahead log.
pub struct Walog {
    shared: Arc<WalShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Walog {
    /// Writes an empty log onto `disk` and opens it.
    pub fn format(disk: Arc<dyn Disk>, config: WalConfig) -> StorageResult<Self> {
        Self::check_device(disk.as_ref(), &config)?;
        disk.write(LOGHDR, &Header::empty().encode())?;
        disk.write(
            LOGHDR2,
            &Marker {
                start: LogPosition(0),
            }
            .encode(),
        )?;
        disk.barrier()?;
        log::debug!("wal: formatted with capacity {}", config.log_capacity);
        Self::open(disk, config)
    }

    /// Recovers the log on `disk` and starts the logger and installer.
    pub fn open(disk: Arc<dyn Disk>, config: WalConfig) -> StorageResult<Self> {
        Self::check_device(disk.as_ref(), &config)?;
        let capacity = config.log_capacity;
        let state = recover_state(disk.as_ref(), capacity)?;

        let shared = Arc::new(WalShared {
            disk,
            capacity,
            state: Mutex::new(state),
            logger_cv: Condvar::new(),
            installer_cv: Condvar::new(),
            progress_cv: Condvar::new(),
        });

        let logger = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("walog-logger".to_string())
                .spawn(move || daemon::logger_loop(shared))?
        };
        let installer = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("walog-installer".to_string())
                .spawn(move || daemon::installer_loop(shared))
        };
        let installer = match installer {
            Ok(handle) => handle,
            Err(e) => {
                shared.state.lock().shutdown = true;
                shared.wake_all();
                let _ = logger.join();
                return Err(e.into());
            }
        };

        Ok(Self {
            shared,
            threads: Mutex::new(vec![logger, installer]),
        })
    }

    fn check_device(disk: &dyn Disk, config: &WalConfig) -> StorageResult<()> {
        config.validate()?;
        let needed = LOGSTART + config.log_capacity;
        if disk.size() < needed {
            return Err(StorageError::InvalidConfig(format!(
                "device has {} blocks, log needs {}",
                disk.size(),
                needed
            )));
        }
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// First block available for home locations.
    pub fn data_start(&self) -> u64 {
        LOGSTART + self.shared.capacity
    }

    pub fn disk(&self) -> &Arc<dyn Disk> {
        &self.shared.disk
    }

    pub fn positions(&self) -> LogPositions {
        self.shared.state.lock().positions()
    }

    /// Latest content of `blkno`: the newest logged image if any, otherwise
    /// the home block.
    pub fn read(&self, blkno: u64) -> StorageResult<Box<Block>> {
        {
            let state = self.shared.state.lock();
            if let Some(entry) = state.mem_log.iter().rev().find(|e| e.blkno == blkno) {
                return Ok(Box::new(*entry.data));
            }
        }
        self.shared.disk.read(blkno)
    }

    /// Adds `blocks` to the in-memory log and returns the new head.
    ///
    /// Waits for the installer while the log lacks room. Fails with
    /// `TooLarge` if `blocks` can never fit.
    pub fn append(&self, blocks: Vec<BlockData>) -> StorageResult<LogPosition> {
        let n = blocks.len() as u64;
        if n > self.shared.capacity {
            return Err(StorageError::TooLarge {
                blocks: blocks.len(),
                capacity: self.shared.capacity,
            });
        }
        for b in &blocks {
            assert!(
                b.blkno >= self.data_start(),
                "append of block {} inside the log region",
                b.blkno
            );
            if b.blkno >= self.shared.disk.size() {
                return Err(StorageError::InvalidBlock {
                    blkno: b.blkno,
                    size: self.shared.disk.size(),
                });
            }
        }

        let mut state = self.shared.state.lock();
        loop {
            state.check()?;
            if state.head().distance_from(state.tail) + n <= self.shared.capacity {
                break;
            }
            log::debug!(
                "wal: log full ({} entries), waiting to append {}",
                state.mem_log.len(),
                n
            );
            self.shared.logger_cv.notify_one();
            self.shared.installer_cv.notify_one();
            self.shared.progress_cv.wait(&mut state);
        }

        state.mem_log.extend(blocks);
        let head = state.head();
        if n > 0 {
            log::trace!("wal: appended {} blocks, head {}", n, head);
            self.shared.logger_cv.notify_one();
        }
        Ok(head)
    }

    /// Waits until everything before `pos` is durable.
    pub fn flush(&self, pos: LogPosition) -> StorageResult<()> {
        let mut state = self.shared.state.lock();
        let pos = pos.min(state.head());
        loop {
            if state.disk_end >= pos {
                return Ok(());
            }
            state.check()?;
            self.shared.logger_cv.notify_one();
            self.shared.progress_cv.wait(&mut state);
        }
    }

    /// Waits until everything appended so far is durable.
    pub fn flush_all(&self) -> StorageResult<()> {
        let head = self.shared.state.lock().head();
        self.flush(head)
    }

    /// Suspends or resumes one of the background activities.
    pub fn pause(&self, daemon: Daemon, paused: bool) {
        let mut state = self.shared.state.lock();
        match daemon {
            Daemon::Logger => state.logger_paused = paused,
            Daemon::Installer => state.installer_paused = paused,
        }
        log::debug!("wal: {:?} paused = {}", daemon, paused);
        self.shared.wake_all();
    }

    /// Stops the background activities. Entries not yet durable stay in
    /// memory only. Calling it again has no effect.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.wake_all();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                log::error!("wal: background thread panicked");
            }
        }
        log::debug!("wal: shut down at {:?}", self.positions());
    }
}

impl Drop for Walog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
