// ============================================================================
// Typed Column Family Handles
// ============================================================================
//
// A handle is a zero-sized description of one column family: its key codec
// and value type. It owns no data; every operation takes the store it should
// run against, so the same handle works on the live store inside a
// transaction and on read-only views.
//
// ============================================================================

use super::column_family::ColumnFamily;
use super::engine::{StateRead, StateWrite};
use super::foreign_key::ForeignKeyChecker;
use super::keys::{DbKey, DbNil, ForeignKeyRef};
use crate::core::{EngineError, Result};
use crate::protocol::{decode_state, encode_state};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// A value stored in a column family.
pub trait DbValue: Serialize + DeserializeOwned {
    /// Keys of other column families this value refers to.
    fn foreign_keys(&self) -> Vec<ForeignKeyRef> {
        Vec::new()
    }
}

impl DbValue for DbNil {}
impl DbValue for i64 {}
impl DbValue for u64 {}
impl DbValue for String {}

pub struct ColumnFamilyHandle<K, V> {
    cf: ColumnFamily,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for ColumnFamilyHandle<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for ColumnFamilyHandle<K, V> {}

impl<K: DbKey, V: DbValue> ColumnFamilyHandle<K, V> {
    pub const fn new(cf: ColumnFamily) -> Self {
        Self {
            cf,
            _marker: PhantomData,
        }
    }

    pub fn column_family(&self) -> ColumnFamily {
        self.cf
    }

    pub fn get<S: StateRead + ?Sized>(&self, db: &S, key: &K) -> Result<Option<V>> {
        match db.get_raw(self.cf, &key.to_bytes())? {
            Some(bytes) => Ok(Some(decode_state(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists<S: StateRead + ?Sized>(&self, db: &S, key: &K) -> Result<bool> {
        db.exists_raw(self.cf, &key.to_bytes())
    }

    /// Writes a new entry. With consistency checks on, the key must be absent.
    pub fn insert<S: StateWrite + ?Sized>(&self, db: &mut S, key: &K, value: &V) -> Result<()> {
        let key_bytes = key.to_bytes();
        if db.consistency_checks() {
            if db.exists_raw(self.cf, &key_bytes)? {
                return Err(EngineError::Consistency(format!(
                    "Insert of key {:?} into {}: key already exists",
                    key_bytes, self.cf
                )));
            }
            self.check_foreign_keys(db, key, value)?;
        }
        db.put_raw(self.cf, &key_bytes, encode_state(value)?)
    }

    /// Overwrites an entry. With consistency checks on, the key must exist.
    pub fn update<S: StateWrite + ?Sized>(&self, db: &mut S, key: &K, value: &V) -> Result<()> {
        let key_bytes = key.to_bytes();
        if db.consistency_checks() {
            if !db.exists_raw(self.cf, &key_bytes)? {
                return Err(EngineError::Consistency(format!(
                    "Update of key {:?} in {}: key does not exist",
                    key_bytes, self.cf
                )));
            }
            self.check_foreign_keys(db, key, value)?;
        }
        db.put_raw(self.cf, &key_bytes, encode_state(value)?)
    }

    pub fn upsert<S: StateWrite + ?Sized>(&self, db: &mut S, key: &K, value: &V) -> Result<()> {
        if db.consistency_checks() {
            self.check_foreign_keys(db, key, value)?;
        }
        db.put_raw(self.cf, &key.to_bytes(), encode_state(value)?)
    }

    /// Deletes an entry. With consistency checks on, the key must exist.
    pub fn delete_existing<S: StateWrite + ?Sized>(&self, db: &mut S, key: &K) -> Result<()> {
        let key_bytes = key.to_bytes();
        if db.consistency_checks() && !db.exists_raw(self.cf, &key_bytes)? {
            return Err(EngineError::Consistency(format!(
                "Delete of key {:?} in {}: key does not exist",
                key_bytes, self.cf
            )));
        }
        db.delete_raw(self.cf, &key_bytes)
    }

    pub fn delete_if_exists<S: StateWrite + ?Sized>(&self, db: &mut S, key: &K) -> Result<()> {
        db.delete_raw(self.cf, &key.to_bytes())
    }

    fn check_foreign_keys<S: StateRead + ?Sized>(&self, db: &S, key: &K, value: &V) -> Result<()> {
        let mut refs = key.foreign_keys();
        refs.extend(value.foreign_keys());
        ForeignKeyChecker::assert_exists(db, self.cf, &refs)
    }

    fn scan<S, F>(&self, db: &S, start: Vec<u8>, prefix: &[u8], mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(K, V) -> Result<bool>,
    {
        let mut cursor = start;
        let mut inclusive = true;
        while let Some((key_bytes, value_bytes)) = db.seek(self.cf, &cursor, inclusive)? {
            if !key_bytes.starts_with(prefix) {
                break;
            }
            let key = K::from_bytes(&key_bytes)?;
            let value: V = decode_state(&value_bytes)?;
            if !visitor(key, value)? {
                break;
            }
            cursor = key_bytes;
            inclusive = false;
        }
        Ok(())
    }

    /// Visits every entry in key order.
    pub fn for_each<S, F>(&self, db: &S, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(K, V) -> Result<()>,
    {
        self.scan(db, Vec::new(), &[], |key, value| {
            visitor(key, value)?;
            Ok(true)
        })
    }

    /// Visits entries in key order until the visitor returns `false`.
    pub fn while_true<S, F>(&self, db: &S, visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(K, V) -> Result<bool>,
    {
        self.scan(db, Vec::new(), &[], visitor)
    }

    /// Like `while_true`, starting at `start` (inclusive).
    pub fn while_true_from<S, F>(&self, db: &S, start: &K, visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(K, V) -> Result<bool>,
    {
        self.scan(db, start.to_bytes(), &[], visitor)
    }

    /// Visits entries whose encoded key starts with the encoding of `prefix`.
    pub fn while_equal_prefix<S, P, F>(&self, db: &S, prefix: &P, visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        P: DbKey,
        F: FnMut(K, V) -> Result<bool>,
    {
        let prefix_bytes = prefix.to_bytes();
        self.scan(db, prefix_bytes.clone(), &prefix_bytes, visitor)
    }

    /// Visits entries with `from <= key <= to` in key order.
    pub fn range<S, F>(&self, db: &S, from: &K, to: &K, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(K, V) -> Result<bool>,
    {
        let upper = to.to_bytes();
        let mut cursor = from.to_bytes();
        let mut inclusive = true;
        while let Some((key_bytes, value_bytes)) = db.seek(self.cf, &cursor, inclusive)? {
            if key_bytes > upper {
                break;
            }
            let key = K::from_bytes(&key_bytes)?;
            let value: V = decode_state(&value_bytes)?;
            if !visitor(key, value)? {
                break;
            }
            cursor = key_bytes;
            inclusive = false;
        }
        Ok(())
    }

    /// Visits entries with `key <= to` while the visitor mutates the store.
    ///
    /// Each step re-seeks past the last visited key, so entries the visitor
    /// removes are never visited.
    pub fn visit_up_to<S, F>(&self, db: &mut S, to: &K, mut visitor: F) -> Result<()>
    where
        S: StateWrite + ?Sized,
        F: FnMut(&mut S, K, V) -> Result<bool>,
    {
        let upper = to.to_bytes();
        let mut cursor = Vec::new();
        let mut inclusive = true;
        loop {
            let Some((key_bytes, value_bytes)) = db.seek(self.cf, &cursor, inclusive)? else {
                break;
            };
            if key_bytes > upper {
                break;
            }
            let key = K::from_bytes(&key_bytes)?;
            let value: V = decode_state(&value_bytes)?;
            if !visitor(db, key, value)? {
                break;
            }
            cursor = key_bytes;
            inclusive = false;
        }
        Ok(())
    }

    pub fn count<S: StateRead + ?Sized>(&self, db: &S) -> Result<usize> {
        let mut count = 0;
        let mut cursor = Vec::new();
        let mut inclusive = true;
        while let Some((key_bytes, _)) = db.seek(self.cf, &cursor, inclusive)? {
            count += 1;
            cursor = key_bytes;
            inclusive = false;
        }
        Ok(count)
    }

    pub fn is_empty<S: StateRead + ?Sized>(&self, db: &S) -> Result<bool> {
        Ok(db.seek(self.cf, &[], true)?.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateDb;

    const NAMES: ColumnFamilyHandle<i64, String> = ColumnFamilyHandle::new(ColumnFamily::Default);

    fn seeded() -> StateDb {
        let mut db = StateDb::in_memory(true);
        db.run_in_transaction(|db| {
            for key in [3, 1, 2, 5] {
                NAMES.insert(db, &key, &format!("n{}", key))?;
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_checked_writes_require_expected_presence() {
        let mut db = seeded();
        assert!(db.run_in_transaction(|db| NAMES.insert(db, &1, &"again".to_string())).is_err());
        assert!(db.run_in_transaction(|db| NAMES.update(db, &9, &"missing".to_string())).is_err());
        assert!(db.run_in_transaction(|db| NAMES.delete_existing(db, &9)).is_err());

        db.run_in_transaction(|db| {
            NAMES.update(db, &1, &"one".to_string())?;
            NAMES.delete_if_exists(db, &9)
        })
        .unwrap();
        assert_eq!(NAMES.get(&db, &1).unwrap().as_deref(), Some("one"));
        assert_eq!(NAMES.count(&db).unwrap(), 4);
    }

    #[test]
    fn test_range_is_inclusive_and_ordered() {
        let db = seeded();
        let mut keys = Vec::new();
        NAMES
            .range(&db, &2, &5, |key, _| {
                keys.push(key);
                Ok(true)
            })
            .unwrap();
        assert_eq!(keys, vec![2, 3, 5]);
    }

    #[test]
    fn test_visit_up_to_skips_removed_entries() {
        let mut db = seeded();
        let mut visited = Vec::new();
        db.run_in_transaction(|db| {
            NAMES.visit_up_to(db, &3, |db, key, _| {
                visited.push(key);
                NAMES.delete_existing(db, &key)?;
                if key == 1 {
                    NAMES.delete_existing(db, &2)?;
                }
                Ok(true)
            })
        })
        .unwrap();
        assert_eq!(visited, vec![1, 3]);
        assert_eq!(NAMES.count(&db).unwrap(), 1);
        assert!(!NAMES.is_empty(&db).unwrap());
    }
}
