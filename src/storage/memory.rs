// ============================================================================
// Keyed State Store
// ============================================================================
//
// Committed data lives in a persistent ordered map (`im::OrdMap`) keyed by
// the full store key, so read-only views are O(1) clones that never observe
// later commits. Writes are buffered in the active transaction and become
// visible to other readers only when the commit frame has reached the WAL.
//
// ============================================================================

use super::column_family::ColumnFamily;
use super::engine::{RawEntry, StateRead, StateWrite};
use super::persistence::{
    DurabilityMode, PersistenceManager, StateSnapshot, WalEntry, read_snapshot_file,
    write_snapshot_file,
};
use crate::config::StorageConfig;
use crate::core::{EngineError, Result};
use crate::transaction::{Change, Transaction, TransactionId};
use im::OrdMap;
use std::ops::Bound;
use std::path::Path;

type CommittedMap = OrdMap<Vec<u8>, Vec<u8>>;

pub struct StateDb {
    committed: CommittedMap,
    transaction: Option<Transaction>,
    persistence: Option<PersistenceManager>,
    consistency_checks: bool,
    last_txn_id: TransactionId,
}

impl StateDb {
    /// A store without files. Content is lost on drop.
    pub fn in_memory(consistency_checks: bool) -> Self {
        Self {
            committed: OrdMap::new(),
            transaction: None,
            persistence: None,
            consistency_checks,
            last_txn_id: TransactionId(0),
        }
    }

    /// Opens the store in `data_dir`, recovering the snapshot and replaying
    /// every complete WAL frame on top of it.
    pub fn open<P: AsRef<Path>>(data_dir: P, config: &StorageConfig) -> Result<Self> {
        if config.durability == DurabilityMode::None {
            return Ok(Self::in_memory(config.consistency_checks));
        }

        let mut persistence = PersistenceManager::new(data_dir.as_ref(), config.durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(config.snapshot_every_commits.max(1));
        let recovered = persistence.recover()?;

        let mut committed = CommittedMap::new();
        let mut last_txn_id = 0;
        if let Some(snapshot) = recovered.snapshot {
            last_txn_id = snapshot.metadata.last_txn_id;
            for (key, value) in snapshot.entries {
                committed.insert(key, value);
            }
        }
        let replayed = recovered.wal_entries.len();
        for entry in recovered.wal_entries {
            if entry.txn_id <= last_txn_id {
                continue;
            }
            apply_changes(&mut committed, entry.changes);
            last_txn_id = entry.txn_id;
        }

        tracing::debug!(
            data_dir = %data_dir.as_ref().display(),
            entries = committed.len(),
            replayed_commits = replayed,
            "state store opened"
        );

        Ok(Self {
            committed,
            transaction: None,
            persistence: Some(persistence),
            consistency_checks: config.consistency_checks,
            last_txn_id: TransactionId(last_txn_id),
        })
    }

    pub fn set_consistency_checks(&mut self, enabled: bool) {
        self.consistency_checks = enabled;
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn begin_transaction(&mut self) -> Result<TransactionId> {
        if let Some(active) = &self.transaction {
            return Err(EngineError::ExecutionError(format!(
                "Cannot begin a transaction while {} is {}",
                active.id(),
                active.state()
            )));
        }
        let id = self.last_txn_id.next();
        self.transaction = Some(Transaction::new(id));
        Ok(id)
    }

    /// Makes the active transaction's changes durable and visible.
    pub fn commit(&mut self) -> Result<()> {
        let mut transaction = self
            .transaction
            .take()
            .ok_or_else(|| EngineError::ExecutionError("No active transaction to commit".into()))?;
        let id = transaction.id();
        let changes = transaction.commit()?;
        self.last_txn_id = id;
        if changes.is_empty() {
            return Ok(());
        }

        let changes: Vec<(Vec<u8>, Change)> = changes.into_iter().collect();
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.log(&WalEntry {
                txn_id: id.as_u64(),
                changes: changes.clone(),
            })?;
        }
        apply_changes(&mut self.committed, changes);

        if self
            .persistence
            .as_ref()
            .is_some_and(|persistence| persistence.needs_checkpoint())
        {
            self.compact()?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let mut transaction = self
            .transaction
            .take()
            .ok_or_else(|| EngineError::ExecutionError("No active transaction to roll back".into()))?;
        transaction.rollback()
    }

    /// Runs `f` inside a new transaction, committing on success and rolling
    /// back on error.
    pub fn run_in_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    /// Writes the committed content as a snapshot and truncates the WAL.
    pub fn compact(&mut self) -> Result<()> {
        let entries = self.export_entries();
        let last_txn_id = self.last_txn_id.as_u64();
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.checkpoint(entries, last_txn_id)?;
        }
        Ok(())
    }

    /// A view of the committed content that later commits do not affect.
    pub fn read_only(&self) -> ReadOnlyState {
        ReadOnlyState {
            committed: self.committed.clone(),
            consistency_checks: self.consistency_checks,
        }
    }

    pub fn export_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.committed
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn content_digest(&self) -> u64 {
        content_digest(&self.committed)
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Writes the committed content to `path` for a backup.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = StateSnapshot::new(self.export_entries(), self.last_txn_id.as_u64());
        write_snapshot_file(path, &snapshot)
    }

    /// Replaces the whole content with a snapshot written by `write_snapshot`.
    pub fn restore_snapshot(&mut self, path: &Path) -> Result<()> {
        if self.in_transaction() {
            return Err(EngineError::ExecutionError(
                "Cannot restore a snapshot while a transaction is active".into(),
            ));
        }
        let snapshot = read_snapshot_file(path)?;
        let mut committed = CommittedMap::new();
        for (key, value) in snapshot.entries {
            committed.insert(key, value);
        }
        self.committed = committed;
        self.compact()
    }

    fn overlay(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }
}

fn apply_changes(committed: &mut CommittedMap, changes: Vec<(Vec<u8>, Change)>) {
    for (key, change) in changes {
        match change {
            Change::Put(value) => {
                committed.insert(key, value);
            }
            Change::Delete => {
                committed.remove(&key);
            }
        }
    }
}

/// FNV-1a over every entry, length-delimited.
fn content_digest(committed: &CommittedMap) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in (bytes.len() as u64).to_le_bytes().iter().chain(bytes) {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    };
    for (key, value) in committed.iter() {
        feed(key);
        feed(value);
    }
    hash
}

fn strip(cf: ColumnFamily, full_key: &[u8]) -> Vec<u8> {
    full_key[cf.prefix().len()..].to_vec()
}

fn seek_in(
    committed: &CommittedMap,
    overlay: Option<&Transaction>,
    cf: ColumnFamily,
    from: &[u8],
    inclusive: bool,
) -> Option<RawEntry> {
    let prefix = cf.prefix();
    let start = cf.qualify(from);
    let lower = if inclusive {
        Bound::Included(start.clone())
    } else {
        Bound::Excluded(start.clone())
    };

    let from_committed = committed
        .range((lower, Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(&prefix))
        .find(|(key, _)| overlay.is_none_or(|txn| txn.lookup(key).is_none()))
        .map(|(key, value)| (key.clone(), value.clone()));

    let from_overlay = overlay.and_then(|txn| {
        let mut cursor = start.clone();
        let mut cursor_inclusive = inclusive;
        while let Some((key, change)) = txn.seek(&cursor, cursor_inclusive) {
            if !key.starts_with(&prefix) {
                return None;
            }
            if let Some(value) = change.value() {
                return Some((key.clone(), value.to_vec()));
            }
            cursor = key.clone();
            cursor_inclusive = false;
        }
        None
    });

    let winner = match (from_committed, from_overlay) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    winner.map(|(key, value)| (strip(cf, &key), value))
}

impl StateRead for StateDb {
    fn get_raw(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let full_key = cf.qualify(key);
        if let Some(change) = self.overlay().and_then(|txn| txn.lookup(&full_key)) {
            return Ok(change.value().map(|value| value.to_vec()));
        }
        Ok(self.committed.get(&full_key).cloned())
    }

    fn seek(&self, cf: ColumnFamily, from: &[u8], inclusive: bool) -> Result<Option<RawEntry>> {
        Ok(seek_in(&self.committed, self.overlay(), cf, from, inclusive))
    }

    fn consistency_checks(&self) -> bool {
        self.consistency_checks
    }
}

impl StateWrite for StateDb {
    fn put_raw(&mut self, cf: ColumnFamily, key: &[u8], value: Vec<u8>) -> Result<()> {
        let transaction = self.transaction.as_mut().ok_or_else(|| {
            EngineError::ExecutionError(format!("Write to {} outside of a transaction", cf))
        })?;
        transaction.record_change(cf.qualify(key), Change::Put(value))
    }

    fn delete_raw(&mut self, cf: ColumnFamily, key: &[u8]) -> Result<()> {
        let transaction = self.transaction.as_mut().ok_or_else(|| {
            EngineError::ExecutionError(format!("Delete in {} outside of a transaction", cf))
        })?;
        transaction.record_change(cf.qualify(key), Change::Delete)
    }
}

/// Immutable view for observers running beside the processor.
#[derive(Clone)]
pub struct ReadOnlyState {
    committed: CommittedMap,
    consistency_checks: bool,
}

impl ReadOnlyState {
    pub fn content_digest(&self) -> u64 {
        content_digest(&self.committed)
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

impl StateRead for ReadOnlyState {
    fn get_raw(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.committed.get(&cf.qualify(key)).cloned())
    }

    fn seek(&self, cf: ColumnFamily, from: &[u8], inclusive: bool) -> Result<Option<RawEntry>> {
        Ok(seek_in(&self.committed, None, cf, from, inclusive))
    }

    fn consistency_checks(&self) -> bool {
        self.consistency_checks
    }
}

impl StateWrite for ReadOnlyState {
    fn put_raw(&mut self, cf: ColumnFamily, _key: &[u8], _value: Vec<u8>) -> Result<()> {
        Err(EngineError::UnsupportedOperation(format!(
            "Read-only state cannot write to {}",
            cf
        )))
    }

    fn delete_raw(&mut self, cf: ColumnFamily, _key: &[u8]) -> Result<()> {
        Err(EngineError::UnsupportedOperation(format!(
            "Read-only state cannot delete from {}",
            cf
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::handle::ColumnFamilyHandle;

    const NUMBERS: ColumnFamilyHandle<i64, String> = ColumnFamilyHandle::new(ColumnFamily::Default);

    #[test]
    fn test_read_your_writes_and_rollback() {
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        NUMBERS.insert(&mut db, &1, &"one".to_string()).unwrap();
        assert_eq!(NUMBERS.get(&db, &1).unwrap().as_deref(), Some("one"));
        db.rollback().unwrap();
        assert_eq!(NUMBERS.get(&db, &1).unwrap(), None);
    }

    #[test]
    fn test_writes_outside_transaction_are_refused() {
        let mut db = StateDb::in_memory(true);
        assert!(NUMBERS.upsert(&mut db, &1, &"one".to_string()).is_err());
    }

    #[test]
    fn test_iteration_merges_overlay_and_committed() {
        let mut db = StateDb::in_memory(true);
        db.run_in_transaction(|db| {
            for n in [1i64, 3, 5] {
                NUMBERS.insert(db, &n, &n.to_string())?;
            }
            Ok(())
        })
        .unwrap();

        db.begin_transaction().unwrap();
        NUMBERS.insert(&mut db, &2, &"2".to_string()).unwrap();
        NUMBERS.delete_existing(&mut db, &3).unwrap();

        let mut seen = Vec::new();
        NUMBERS
            .for_each(&db, |key, _| {
                seen.push(key);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 5]);
        assert_eq!(NUMBERS.count(&db).unwrap(), 3);
    }

    #[test]
    fn test_read_only_view_is_isolated_and_immutable() {
        let mut db = StateDb::in_memory(true);
        db.run_in_transaction(|db| NUMBERS.insert(db, &1, &"one".to_string()))
            .unwrap();
        let mut view = db.read_only();

        db.run_in_transaction(|db| NUMBERS.delete_existing(db, &1)).unwrap();
        assert!(NUMBERS.exists(&view, &1).unwrap());

        let err = NUMBERS.upsert(&mut view, &2, &"two".to_string()).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_insert_and_update_preconditions() {
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        NUMBERS.insert(&mut db, &1, &"one".to_string()).unwrap();
        assert!(matches!(
            NUMBERS.insert(&mut db, &1, &"again".to_string()),
            Err(EngineError::Consistency(_))
        ));
        assert!(matches!(
            NUMBERS.update(&mut db, &2, &"two".to_string()),
            Err(EngineError::Consistency(_))
        ));
    }
}
