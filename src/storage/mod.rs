pub mod column_family;
pub mod engine;
pub mod foreign_key;
pub mod handle;
pub mod keys;
pub mod memory;
pub mod persistence;

pub use column_family::ColumnFamily;
pub use engine::{RawEntry, StateRead, StateWrite};
pub use foreign_key::ForeignKeyChecker;
pub use handle::{ColumnFamilyHandle, DbValue};
pub use keys::{DbForeignKey, DbKey, DbNil, ForeignKeyRef, ForeignTarget, JobsFamily, MessagesFamily};
pub use memory::{ReadOnlyState, StateDb};
pub use persistence::{DurabilityMode, PersistenceManager};
