//! Transaction identifiers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a transaction as a lock owner. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

/// Thread-safe source of fresh transaction ids.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next_id: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns an id not handed out before. Skips 0 on wraparound.
    pub fn next(&self) -> TransactionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return TransactionId::new(id);
            }
        }
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(format!("{}", TransactionId::new(123)), "Txn123");
    }

    #[test]
    fn test_generator_starts_at_one() {
        let generator = TransactionIdGenerator::new();
        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
    }

    #[test]
    fn test_generator_skips_zero() {
        let generator = TransactionIdGenerator {
            next_id: AtomicU64::new(u64::MAX),
        };
        assert_eq!(generator.next().value(), u64::MAX);
        assert_eq!(generator.next().value(), 1);
    }

    #[test]
    fn test_generator_thread_safety() {
        let generator = Arc::new(TransactionIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|id| id.value())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert!(!all.contains(&0));
    }
}
