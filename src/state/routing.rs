// ============================================================================
// Routing State
// ============================================================================
//
// The set of partitions messages are routed over, an optional desired set
// while scaling, and the correlation function derived from the current set.
// Scaling is two-phase: the desired set is recorded first and only promoted
// to current once every new partition is up, so message correlation keeps
// using the old partition count until then.
//
// ============================================================================

use crate::core::{EngineError, PartitionId, Result, START_PARTITION_ID};
use crate::storage::{ColumnFamily, ColumnFamilyHandle, DbValue, StateRead, StateWrite};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type PartitionSet = BTreeSet<PartitionId>;

const CURRENT_PARTITIONS: &str = "current_partitions";
const DESIRED_PARTITIONS: &str = "desired_partitions";
const MESSAGE_CORRELATION: &str = "message_correlation";

const PARTITIONS: ColumnFamilyHandle<String, PartitionSet> =
    ColumnFamilyHandle::new(ColumnFamily::Routing);
const CORRELATION: ColumnFamilyHandle<String, MessageCorrelation> =
    ColumnFamilyHandle::new(ColumnFamily::Routing);

impl DbValue for PartitionSet {}
impl DbValue for MessageCorrelation {}

/// Maps a correlation key to the partition that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCorrelation {
    HashMod { partition_count: u32 },
}

impl MessageCorrelation {
    pub fn partition_for(&self, correlation_key: &str) -> PartitionId {
        match self {
            MessageCorrelation::HashMod { partition_count } => {
                hash_mod_partition(correlation_key.as_bytes(), *partition_count)
            }
        }
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            MessageCorrelation::HashMod { partition_count } => *partition_count,
        }
    }
}

/// `h = 31 * h + b` over the bytes as signed values with 32-bit wrapping.
///
/// Other partitions and existing data rely on this exact fold, so it must
/// not be replaced by a different hash.
pub fn correlation_hash(bytes: &[u8]) -> i32 {
    bytes.iter().fold(0i32, |hash, byte| {
        hash.wrapping_mul(31).wrapping_add(*byte as i8 as i32)
    })
}

pub fn hash_mod_partition(bytes: &[u8], partition_count: u32) -> PartitionId {
    let count = partition_count.max(1) as i32;
    let slot = (correlation_hash(bytes) % count).unsigned_abs();
    START_PARTITION_ID + slot
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingState;

impl RoutingState {
    pub fn is_initialized<S: StateRead + ?Sized>(&self, db: &S) -> Result<bool> {
        PARTITIONS.exists(db, &CURRENT_PARTITIONS.to_string())
    }

    /// Sets partitions `1..=partition_count` and hash-mod correlation over
    /// them. Does nothing once routing is initialized.
    pub fn initialize_routing_info<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        partition_count: u32,
    ) -> Result<()> {
        if partition_count == 0 {
            return Err(EngineError::ExecutionError(
                "Routing needs at least one partition".to_string(),
            ));
        }
        if self.is_initialized(db)? {
            return Ok(());
        }
        let partitions: PartitionSet =
            (START_PARTITION_ID..START_PARTITION_ID + partition_count).collect();
        PARTITIONS.upsert(db, &CURRENT_PARTITIONS.to_string(), &partitions)?;
        CORRELATION.upsert(
            db,
            &MESSAGE_CORRELATION.to_string(),
            &MessageCorrelation::HashMod { partition_count },
        )
    }

    /// Current partitions, empty while uninitialized.
    pub fn current_partitions<S: StateRead + ?Sized>(&self, db: &S) -> Result<PartitionSet> {
        Ok(PARTITIONS
            .get(db, &CURRENT_PARTITIONS.to_string())?
            .unwrap_or_default())
    }

    pub fn desired_partitions<S: StateRead + ?Sized>(&self, db: &S) -> Result<Option<PartitionSet>> {
        PARTITIONS.get(db, &DESIRED_PARTITIONS.to_string())
    }

    pub fn message_correlation<S: StateRead + ?Sized>(&self, db: &S) -> Result<Option<MessageCorrelation>> {
        CORRELATION.get(db, &MESSAGE_CORRELATION.to_string())
    }

    /// Records a scaling target. Current partitions and correlation are untouched.
    pub fn set_desired_partitions<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        partitions: &PartitionSet,
    ) -> Result<()> {
        PARTITIONS.upsert(db, &DESIRED_PARTITIONS.to_string(), partitions)
    }

    /// Promotes the desired set to current and recomputes the correlation.
    /// The desired set stays recorded, so repeating the call changes nothing.
    pub fn arrive_at_desired_state<S: StateWrite + ?Sized>(&self, db: &mut S) -> Result<()> {
        let desired = self.desired_partitions(db)?.ok_or_else(|| {
            EngineError::ExecutionError("No desired partitions recorded".to_string())
        })?;
        let partition_count = desired.len() as u32;
        PARTITIONS.upsert(db, &CURRENT_PARTITIONS.to_string(), &desired)?;
        CORRELATION.upsert(
            db,
            &MESSAGE_CORRELATION.to_string(),
            &MessageCorrelation::HashMod { partition_count },
        )
    }

    /// Whether a scale operation has been recorded but not yet completed.
    pub fn is_scaling<S: StateRead + ?Sized>(&self, db: &S) -> Result<bool> {
        Ok(match self.desired_partitions(db)? {
            Some(desired) => desired != self.current_partitions(db)?,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateDb;

    #[test]
    fn test_hash_matches_string_hash_code() {
        assert_eq!(correlation_hash(b""), 0);
        assert_eq!(correlation_hash(b"a"), 97);
        assert_eq!(correlation_hash(b"abc"), 96354);
        // "order-123".hashCode() in the JVM
        assert_eq!(correlation_hash(b"order-123"), -392_797_389);
    }

    #[test]
    fn test_signed_bytes_and_overflow() {
        // 0xC3 0xA9 ('é' in UTF-8) are folded as -61 and -87.
        assert_eq!(correlation_hash("é".as_bytes()), 31 * -61 + -87);
        let long = "a-very-long-correlation-key-that-overflows".as_bytes();
        let partition = hash_mod_partition(long, 7);
        assert!((1..=7).contains(&partition));
    }

    #[test]
    fn test_initialize_routing_info() {
        let mut db = StateDb::in_memory(true);
        let routing = RoutingState;
        assert!(!routing.is_initialized(&db).unwrap());
        assert!(routing.current_partitions(&db).unwrap().is_empty());
        assert_eq!(routing.message_correlation(&db).unwrap(), None);

        db.run_in_transaction(|db| routing.initialize_routing_info(db, 3))
            .unwrap();
        assert!(routing.is_initialized(&db).unwrap());
        assert_eq!(routing.current_partitions(&db).unwrap(), PartitionSet::from([1, 2, 3]));
        assert_eq!(
            routing.message_correlation(&db).unwrap(),
            Some(MessageCorrelation::HashMod { partition_count: 3 })
        );

        // a second initialization changes nothing
        db.run_in_transaction(|db| routing.initialize_routing_info(db, 5))
            .unwrap();
        assert_eq!(routing.current_partitions(&db).unwrap().len(), 3);
    }

    #[test]
    fn test_desired_partitions_apply_on_arrival() {
        let mut db = StateDb::in_memory(true);
        let routing = RoutingState;
        let desired = PartitionSet::from([1, 2, 3, 4]);
        db.run_in_transaction(|db| {
            routing.initialize_routing_info(db, 3)?;
            routing.set_desired_partitions(db, &desired)
        })
        .unwrap();
        assert_eq!(routing.current_partitions(&db).unwrap().len(), 3);
        assert!(routing.is_scaling(&db).unwrap());

        db.run_in_transaction(|db| routing.arrive_at_desired_state(db))
            .unwrap();
        assert_eq!(routing.current_partitions(&db).unwrap(), desired);
        assert_eq!(
            routing.message_correlation(&db).unwrap().map(|c| c.partition_count()),
            Some(4)
        );
        assert!(!routing.is_scaling(&db).unwrap());

        let digest = db.content_digest();
        db.run_in_transaction(|db| routing.arrive_at_desired_state(db))
            .unwrap();
        assert_eq!(db.content_digest(), digest);
    }

    #[test]
    fn test_partition_ids_start_at_one() {
        assert_eq!(hash_mod_partition(b"", 3), 1);
        assert_eq!(hash_mod_partition(b"a", 3), START_PARTITION_ID + 97 % 3);
    }
}
