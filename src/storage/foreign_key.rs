use super::column_family::ColumnFamily;
use super::engine::StateRead;
use super::keys::ForeignKeyRef;
use crate::core::{EngineError, Result};

/// Verifies that every foreign key written into `source` points at an
/// existing row. Only consulted when consistency checks are enabled.
pub struct ForeignKeyChecker;

impl ForeignKeyChecker {
    pub fn assert_exists<S: StateRead + ?Sized>(
        db: &S,
        source: ColumnFamily,
        foreign_keys: &[ForeignKeyRef],
    ) -> Result<()> {
        for foreign_key in foreign_keys {
            if !db.exists_raw(foreign_key.column_family, &foreign_key.key)? {
                return Err(EngineError::Consistency(format!(
                    "Foreign key {:?} from {} does not exist in {}",
                    foreign_key.key, source, foreign_key.column_family
                )));
            }
        }
        Ok(())
    }
}
