pub mod coordinator;
pub mod status;
pub mod store;

pub use coordinator::{
    BackupCoordinator, LOG_SEGMENT_FILE, PendingBackup, RestoredPartition, STATE_SNAPSHOT_FILE,
    restore_partition,
};
pub use status::{
    Backup, BackupDescriptor, BackupIdentifier, BackupStatus, BackupStatusCode, NamedFileSet,
};
pub use store::{BackupStore, FileSystemBackupStore, MANIFEST_FILE_NAME};
