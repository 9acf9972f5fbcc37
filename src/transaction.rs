//! Transactions over the journaled device.
//!
//! - Transaction ids and lifecycle states
//! - Address locking and buffered reads and writes
//! - Atomic commit through the write-ahead log

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{CommitHook, EngineConfig, Transaction, TxnManager};
pub use state::TransactionState;
