// ============================================================================
// Key Generator
// ============================================================================
//
// One persisted counter per partition. Keys carry the partition id in their
// upper bits, so the counter starts at `encode_partition_id(p, 0)` and every
// issued key decodes back to `p`.
//
// ============================================================================

use crate::core::{
    EngineError, Key, NO_KEY, PartitionId, Result, decode_partition_id, encode_partition_id,
};
use crate::storage::{ColumnFamily, ColumnFamilyHandle, DbNil, StateRead, StateWrite};

const CURRENT_KEY: ColumnFamilyHandle<DbNil, i64> = ColumnFamilyHandle::new(ColumnFamily::Key);

pub trait KeyGenerator {
    /// Increments and persists the counter, returning the new key.
    fn next_key(&mut self) -> Result<Key>;

    fn current_key(&self) -> Result<Key>;

    /// Fails when `key` belongs to this partition but lies above the counter.
    fn validate_key(&self, key: Key) -> Result<()>;

    /// Moves the counter up to `key` if it belongs to this partition and is higher.
    fn set_key_if_higher(&mut self, key: Key) -> Result<()>;
}

fn read_current<S: StateRead + ?Sized>(db: &S, partition_id: PartitionId) -> Result<Key> {
    Ok(CURRENT_KEY
        .get(db, &DbNil)?
        .unwrap_or_else(|| encode_partition_id(partition_id, 0)))
}

fn check_key<S: StateRead + ?Sized>(db: &S, partition_id: PartitionId, key: Key) -> Result<()> {
    if key == NO_KEY || decode_partition_id(key) != partition_id {
        return Ok(());
    }
    let current = read_current(db, partition_id)?;
    if key > current {
        return Err(EngineError::Consistency(format!(
            "Key {} of partition {} is above the generated high-water mark {}",
            key, partition_id, current
        )));
    }
    Ok(())
}

/// Key generator writing through the partition's state store.
pub struct DbKeyGenerator<'a, S: ?Sized> {
    db: &'a mut S,
    partition_id: PartitionId,
}

impl<'a, S: StateWrite + ?Sized> DbKeyGenerator<'a, S> {
    pub fn new(db: &'a mut S, partition_id: PartitionId) -> Self {
        Self { db, partition_id }
    }
}

impl<S: StateWrite + ?Sized> KeyGenerator for DbKeyGenerator<'_, S> {
    fn next_key(&mut self) -> Result<Key> {
        let next = read_current(&*self.db, self.partition_id)? + 1;
        CURRENT_KEY.upsert(self.db, &DbNil, &next)?;
        Ok(next)
    }

    fn current_key(&self) -> Result<Key> {
        read_current(&*self.db, self.partition_id)
    }

    fn validate_key(&self, key: Key) -> Result<()> {
        check_key(&*self.db, self.partition_id, key)
    }

    fn set_key_if_higher(&mut self, key: Key) -> Result<()> {
        if key == NO_KEY || decode_partition_id(key) != self.partition_id {
            return Ok(());
        }
        if key > read_current(&*self.db, self.partition_id)? {
            CURRENT_KEY.upsert(self.db, &DbNil, &key)?;
        }
        Ok(())
    }
}

/// Key generator for read-only contexts. Every mutating call fails.
pub struct ImmutableKeyGenerator<'a, S: ?Sized> {
    db: &'a S,
    partition_id: PartitionId,
}

impl<'a, S: StateRead + ?Sized> ImmutableKeyGenerator<'a, S> {
    pub fn new(db: &'a S, partition_id: PartitionId) -> Self {
        Self { db, partition_id }
    }
}

impl<S: StateRead + ?Sized> KeyGenerator for ImmutableKeyGenerator<'_, S> {
    fn next_key(&mut self) -> Result<Key> {
        Err(EngineError::UnsupportedOperation(
            "Cannot generate keys from a read-only context".to_string(),
        ))
    }

    fn current_key(&self) -> Result<Key> {
        read_current(self.db, self.partition_id)
    }

    fn validate_key(&self, key: Key) -> Result<()> {
        check_key(self.db, self.partition_id, key)
    }

    fn set_key_if_higher(&mut self, _key: Key) -> Result<()> {
        Err(EngineError::UnsupportedOperation(
            "Cannot move the key counter from a read-only context".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateDb;

    #[test]
    fn test_first_key_encodes_partition() {
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        let key = DbKeyGenerator::new(&mut db, 2).next_key().unwrap();
        assert_eq!(key, encode_partition_id(2, 1));
        assert_eq!(decode_partition_id(key), 2);
    }

    #[test]
    fn test_set_key_if_higher_ignores_lower_and_foreign_keys() {
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        let mut generator = DbKeyGenerator::new(&mut db, 1);
        generator.set_key_if_higher(encode_partition_id(1, 10)).unwrap();
        generator.set_key_if_higher(encode_partition_id(1, 4)).unwrap();
        generator.set_key_if_higher(encode_partition_id(3, 99)).unwrap();
        assert_eq!(generator.current_key().unwrap(), encode_partition_id(1, 10));
        assert_eq!(generator.next_key().unwrap(), encode_partition_id(1, 11));
    }

    #[test]
    fn test_immutable_generator_refuses_mutation() {
        let db = StateDb::in_memory(true);
        let mut generator = ImmutableKeyGenerator::new(&db, 1);
        assert!(matches!(
            generator.next_key(),
            Err(EngineError::UnsupportedOperation(_))
        ));
        assert_eq!(generator.current_key().unwrap(), encode_partition_id(1, 0));
        generator.validate_key(NO_KEY).unwrap();
    }
}
