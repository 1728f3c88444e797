pub mod error;
pub mod types;

pub use error::{EngineError, Result};
pub use types::{
    KEY_BITS, Key, MAX_PARTITION_ID, NO_KEY, NO_POSITION, PARTITION_BITS, PartitionId, Position,
    START_PARTITION_ID, decode_key_in_partition, decode_partition_id, encode_partition_id,
};
