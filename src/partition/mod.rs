pub mod actor;
pub mod engine;
pub mod router;
pub mod status;

pub use actor::{CommandResponse, PartitionActor, PartitionHandle};
pub use engine::{BACKUP_STAGING_DIR, CLIENT_REQUEST_STREAM, Engine};
pub use router::{CommandSender, PartitionRouter};
pub use status::PartitionStatus;
