// ============================================================================
// Transaction State Management
// ============================================================================
//
// A transaction moves Active -> Committed/Aborted exactly once. While active
// it holds an ordered overlay of buffered changes that reads consult before
// the committed store, which gives read-your-writes inside the transaction
// and leaves nothing visible outside it until commit.
//
// ============================================================================

use super::Change;
use crate::core::{EngineError, Result};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Unique identifier for a transaction within one state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        TransactionId(self.0 + 1)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    changes: BTreeMap<Vec<u8>, Change>,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            changes: BTreeMap::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn changes(&self) -> &BTreeMap<Vec<u8>, Change> {
        &self.changes
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// The buffered change for `key`, if this transaction touched it.
    pub fn lookup(&self, key: &[u8]) -> Option<&Change> {
        self.changes.get(key)
    }

    /// First buffered change at or after `from` (strictly after when `inclusive` is false).
    pub fn seek(&self, from: &[u8], inclusive: bool) -> Option<(&Vec<u8>, &Change)> {
        let lower = if inclusive {
            Bound::Included(from)
        } else {
            Bound::Excluded(from)
        };
        self.changes
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
    }

    /// Buffers a change, replacing any earlier change to the same key.
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn record_change(&mut self, key: Vec<u8>, change: Change) -> Result<()> {
        if !self.state.is_active() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot record change: transaction {} is {}",
                self.id, self.state
            )));
        }
        self.changes.insert(key, change);
        Ok(())
    }

    /// Marks the transaction committed and hands over its changes.
    pub fn commit(&mut self) -> Result<BTreeMap<Vec<u8>, Change>> {
        if !self.state.is_active() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        Ok(std::mem::take(&mut self.changes))
    }

    /// Marks the transaction aborted and discards its changes.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(EngineError::ExecutionError(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.changes.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
