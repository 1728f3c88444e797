//! Identifiers shared by every layer: record keys, log positions and
//! partition ids, plus the partition-in-key encoding.

/// A partition-scoped entity key. The partition id lives in the upper bits.
pub type Key = i64;

/// Position of a record in a partition log. Strictly increasing, never reused.
pub type Position = i64;

pub type PartitionId = u32;

/// Sentinel for commands without an entity.
pub const NO_KEY: Key = -1;

/// Sentinel for records without a causing record.
pub const NO_POSITION: Position = -1;

/// Partition ids start at one.
pub const START_PARTITION_ID: PartitionId = 1;

pub const PARTITION_BITS: u32 = 13;
pub const KEY_BITS: u32 = 51;
/// Highest partition id whose keys stay positive.
pub const MAX_PARTITION_ID: PartitionId = (1 << (63 - KEY_BITS)) - 1;

const KEY_MASK: i64 = (1i64 << KEY_BITS) - 1;

/// Places `partition_id` in the upper bits of `key`.
pub fn encode_partition_id(partition_id: PartitionId, key: i64) -> Key {
    ((partition_id as i64) << KEY_BITS) + key
}

/// Recovers the partition that generated `key`.
pub fn decode_partition_id(key: Key) -> PartitionId {
    (key >> KEY_BITS) as PartitionId
}

/// The partition-local counter part of `key`.
pub fn decode_key_in_partition(key: Key) -> i64 {
    key & KEY_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_round_trip() {
        let key = encode_partition_id(3, 42);
        assert_eq!(decode_partition_id(key), 3);
        assert_eq!(decode_key_in_partition(key), 42);
    }

    #[test]
    fn test_keys_of_higher_partitions_sort_higher() {
        let low = encode_partition_id(1, KEY_MASK);
        let high = encode_partition_id(2, 0);
        assert!(high > low);
        assert_eq!(decode_partition_id(low), 1);
    }

    #[test]
    fn test_max_partition_fits() {
        let key = encode_partition_id(MAX_PARTITION_ID, 1);
        assert!(key > 0);
        assert_eq!(decode_partition_id(key), MAX_PARTITION_ID);
    }
}
