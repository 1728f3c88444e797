//! Log positions persisted next to the state they describe: the last command
//! the processor applied and the last record each exporter acknowledged.

use crate::core::{NO_POSITION, Position, Result};
use crate::storage::{ColumnFamily, ColumnFamilyHandle, DbNil, StateRead, StateWrite};
use std::collections::BTreeMap;

const LAST_PROCESSED: ColumnFamilyHandle<DbNil, i64> =
    ColumnFamilyHandle::new(ColumnFamily::LastProcessedPosition);
const EXPORTER_POSITIONS: ColumnFamilyHandle<String, i64> =
    ColumnFamilyHandle::new(ColumnFamily::Exporter);

#[derive(Debug, Clone, Copy, Default)]
pub struct LastProcessedPositionState;

impl LastProcessedPositionState {
    pub fn get<S: StateRead + ?Sized>(&self, db: &S) -> Result<Position> {
        Ok(LAST_PROCESSED.get(db, &DbNil)?.unwrap_or(NO_POSITION))
    }

    pub fn mark_as_processed<S: StateWrite + ?Sized>(&self, db: &mut S, position: Position) -> Result<()> {
        LAST_PROCESSED.upsert(db, &DbNil, &position)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExporterPositionState;

impl ExporterPositionState {
    pub fn get<S: StateRead + ?Sized>(&self, db: &S, exporter_id: &str) -> Result<Position> {
        Ok(EXPORTER_POSITIONS
            .get(db, &exporter_id.to_string())?
            .unwrap_or(NO_POSITION))
    }

    pub fn set<S: StateWrite + ?Sized>(&self, db: &mut S, exporter_id: &str, position: Position) -> Result<()> {
        EXPORTER_POSITIONS.upsert(db, &exporter_id.to_string(), &position)
    }

    pub fn remove<S: StateWrite + ?Sized>(&self, db: &mut S, exporter_id: &str) -> Result<()> {
        EXPORTER_POSITIONS.delete_if_exists(db, &exporter_id.to_string())
    }

    pub fn all<S: StateRead + ?Sized>(&self, db: &S) -> Result<BTreeMap<String, Position>> {
        let mut positions = BTreeMap::new();
        EXPORTER_POSITIONS.for_each(db, |id, position| {
            positions.insert(id, position);
            Ok(())
        })?;
        Ok(positions)
    }

    /// Lowest acknowledged position over all exporters, if any are registered.
    pub fn lowest<S: StateRead + ?Sized>(&self, db: &S) -> Result<Option<Position>> {
        Ok(self.all(db)?.values().copied().min())
    }
}
