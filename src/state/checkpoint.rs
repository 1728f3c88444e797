use crate::core::{Position, Result};
use crate::protocol::CheckpointType;
use crate::storage::{ColumnFamily, ColumnFamilyHandle, DbNil, DbValue, StateRead, StateWrite};
use serde::{Deserialize, Serialize};

const CHECKPOINT: ColumnFamilyHandle<DbNil, CheckpointInfo> =
    ColumnFamilyHandle::new(ColumnFamily::Checkpoint);

/// Id and position are stored as one value so they can only change together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: i64,
    pub checkpoint_position: Position,
    pub checkpoint_type: CheckpointType,
}

impl DbValue for CheckpointInfo {}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointState;

impl CheckpointState {
    /// The stored checkpoint, or id 0 at position 0 when none was taken.
    pub fn get_checkpoint<S: StateRead + ?Sized>(&self, db: &S) -> Result<CheckpointInfo> {
        Ok(CHECKPOINT.get(db, &DbNil)?.unwrap_or_default())
    }

    pub fn get_checkpoint_id<S: StateRead + ?Sized>(&self, db: &S) -> Result<i64> {
        Ok(self.get_checkpoint(db)?.checkpoint_id)
    }

    pub fn get_checkpoint_position<S: StateRead + ?Sized>(&self, db: &S) -> Result<Position> {
        Ok(self.get_checkpoint(db)?.checkpoint_position)
    }

    pub fn get_checkpoint_type<S: StateRead + ?Sized>(&self, db: &S) -> Result<CheckpointType> {
        Ok(self.get_checkpoint(db)?.checkpoint_type)
    }

    pub fn set_checkpoint_info<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        checkpoint_id: i64,
        checkpoint_position: Position,
    ) -> Result<()> {
        self.set_checkpoint(db, checkpoint_id, checkpoint_position, CheckpointType::ManualBackup)
    }

    pub fn set_checkpoint<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        checkpoint_id: i64,
        checkpoint_position: Position,
        checkpoint_type: CheckpointType,
    ) -> Result<()> {
        CHECKPOINT.upsert(
            db,
            &DbNil,
            &CheckpointInfo {
                checkpoint_id,
                checkpoint_position,
                checkpoint_type,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateDb;

    #[test]
    fn test_fresh_store_has_checkpoint_zero() {
        let db = StateDb::in_memory(true);
        assert_eq!(CheckpointState.get_checkpoint_id(&db).unwrap(), 0);
        assert_eq!(CheckpointState.get_checkpoint_position(&db).unwrap(), 0);
    }

    #[test]
    fn test_second_set_overwrites_id_and_position() {
        let mut db = StateDb::in_memory(true);
        let checkpoint = CheckpointState;
        db.run_in_transaction(|db| checkpoint.set_checkpoint_info(db, 1, 10))
            .unwrap();
        db.run_in_transaction(|db| checkpoint.set_checkpoint(db, 2, 25, CheckpointType::Marker))
            .unwrap();

        let info = checkpoint.get_checkpoint(&db).unwrap();
        assert_eq!((info.checkpoint_id, info.checkpoint_position), (2, 25));
        assert_eq!(info.checkpoint_type, CheckpointType::Marker);
    }
}
