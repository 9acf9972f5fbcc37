//! Concurrency control.
//!
//! Transactions get isolation from exclusive per-address locks taken in
//! ascending address order.

pub mod lock;

pub use lock::{AddrLockMap, DEFAULT_LOCK_SHARDS};
