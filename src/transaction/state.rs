//! Transaction lifecycle states.

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Still collecting buffers; holds its locks.
    Active,
    /// Appended to the log. Durable once the log is flushed past its position.
    Committed,
    /// Buffers discarded, nothing appended.
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Moves an active state to `next`.
    ///
    /// Panics if the state is already finished or `next` is `Active`.
    pub(crate) fn finish(&mut self, next: TransactionState) {
        assert!(self.is_active(), "transaction already {}", self);
        assert!(next.is_finished(), "cannot reactivate a transaction");
        *self = next;
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}
