use super::column_family::ColumnFamily;
use crate::core::Result;

/// An encoded entry of one column family: (key bytes without prefix, value bytes).
pub type RawEntry = (Vec<u8>, Vec<u8>);

/// Read access to the keyed state store.
///
/// Iteration is cursor based: callers seek to the first entry at or after a
/// key, visit it, then seek strictly past it. Nothing is borrowed between
/// steps, so a visitor may delete entries (including upcoming ones) and a
/// scan can be restarted from any key.
pub trait StateRead {
    fn get_raw(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// First entry of `cf` at or after `from` (strictly after when `inclusive` is false).
    fn seek(&self, cf: ColumnFamily, from: &[u8], inclusive: bool) -> Result<Option<RawEntry>>;

    /// Whether insert/update preconditions and foreign keys are verified on writes.
    fn consistency_checks(&self) -> bool;

    fn exists_raw(&self, cf: ColumnFamily, key: &[u8]) -> Result<bool> {
        Ok(self.get_raw(cf, key)?.is_some())
    }
}

/// Write access to the keyed state store. Writes are only accepted inside a
/// transaction.
pub trait StateWrite: StateRead {
    fn put_raw(&mut self, cf: ColumnFamily, key: &[u8], value: Vec<u8>) -> Result<()>;

    fn delete_raw(&mut self, cf: ColumnFamily, key: &[u8]) -> Result<()>;
}
