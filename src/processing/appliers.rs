// ============================================================================
// Event Appliers
// ============================================================================
//
// The only code that mutates entity state. Handlers append events, and the
// processor replays the same events after a crash, so applying an event must
// depend on nothing but the store and the event itself.
//
// ============================================================================

use crate::core::{EngineError, Key, Result};
use crate::protocol::{
    CheckpointIntent, CheckpointRecord, Intent, JobBatchIntent, JobBatchRecord, JobIntent,
    JobRecord, MessageIntent, MessageRecord, RecordEnvelope, RecordValue, RecordValueSchema,
    ScaleIntent, ScaleRecord,
};
use crate::state::{CheckpointState, JobState, MessageState, PartitionSet, RoutingState};
use crate::storage::StateDb;
use std::collections::HashMap;

type ApplyFn = Box<dyn Fn(&mut StateDb, Key, &RecordValue) -> Result<()> + Send + Sync>;

pub struct EventAppliers {
    appliers: HashMap<Intent, ApplyFn>,
}

impl EventAppliers {
    pub fn empty() -> Self {
        Self {
            appliers: HashMap::new(),
        }
    }

    /// Appliers for every event intent that changes state.
    pub fn standard() -> Self {
        let mut appliers = Self::empty();
        register_job_appliers(&mut appliers);
        register_message_appliers(&mut appliers);
        register_checkpoint_appliers(&mut appliers);
        register_scale_appliers(&mut appliers);
        appliers
    }

    pub fn register<V, F>(&mut self, intent: Intent, apply: F)
    where
        V: RecordValueSchema + 'static,
        F: Fn(&mut StateDb, Key, &V) -> Result<()> + Send + Sync + 'static,
    {
        self.appliers.insert(
            intent,
            Box::new(move |db, key, value| {
                let typed = V::from_value(value).ok_or_else(|| {
                    EngineError::Corruption(format!(
                        "Event {} does not carry a {} payload",
                        intent,
                        V::VALUE_TYPE
                    ))
                })?;
                apply(db, key, typed)
            }),
        );
    }

    pub fn has_applier(&self, intent: &Intent) -> bool {
        self.appliers.contains_key(intent)
    }

    /// Applies `event`. Events without a registered applier change nothing.
    pub fn apply(&self, db: &mut StateDb, event: &dyn RecordEnvelope) -> Result<()> {
        match self.appliers.get(&event.intent()) {
            Some(apply) => apply(db, event.key(), event.value()),
            None => Ok(()),
        }
    }
}

impl Default for EventAppliers {
    fn default() -> Self {
        Self::standard()
    }
}

fn register_job_appliers(appliers: &mut EventAppliers) {
    let jobs = JobState;
    appliers.register(Intent::Job(JobIntent::Created), move |db, key, job: &JobRecord| {
        jobs.create(db, key, job)
    });
    appliers.register(Intent::Job(JobIntent::Completed), move |db, key, _: &JobRecord| {
        jobs.complete(db, key)
    });
    appliers.register(Intent::Job(JobIntent::Canceled), move |db, key, _: &JobRecord| {
        jobs.cancel(db, key)
    });
    appliers.register(Intent::Job(JobIntent::Failed), move |db, key, job: &JobRecord| {
        jobs.fail(db, key, job)
    });
    appliers.register(Intent::Job(JobIntent::TimedOut), move |db, key, job: &JobRecord| {
        jobs.timeout(db, key, job)
    });
    appliers.register(Intent::Job(JobIntent::ErrorThrown), move |db, key, job: &JobRecord| {
        jobs.throw_error(db, key, job)
    });
    appliers.register(
        Intent::Job(JobIntent::RetriesUpdated),
        move |db, key, job: &JobRecord| {
            jobs.update_retries(db, key, job.retries)?;
            Ok(())
        },
    );
    appliers.register(
        Intent::Job(JobIntent::RecurredAfterBackoff),
        move |db, key, job: &JobRecord| jobs.recur_after_backoff(db, key, job),
    );
    appliers.register(
        Intent::Job(JobIntent::TimeoutUpdated),
        move |db, key, job: &JobRecord| {
            let old_deadline = jobs.get_job(db, key)?.and_then(|stored| stored.deadline);
            jobs.update_deadline(db, key, job, old_deadline)
        },
    );
    appliers.register(
        Intent::JobBatch(JobBatchIntent::Activated),
        move |db, _, batch: &JobBatchRecord| {
            for (key, job) in batch.job_keys.iter().zip(&batch.jobs) {
                jobs.activate(db, *key, job)?;
            }
            Ok(())
        },
    );
}

fn register_message_appliers(appliers: &mut EventAppliers) {
    let messages = MessageState;
    appliers.register(
        Intent::Message(MessageIntent::Published),
        move |db, key, message: &MessageRecord| messages.put(db, key, message),
    );
    appliers.register(
        Intent::Message(MessageIntent::Expired),
        move |db, key, _: &MessageRecord| messages.remove(db, key),
    );
}

fn register_checkpoint_appliers(appliers: &mut EventAppliers) {
    let checkpoint = CheckpointState;
    appliers.register(
        Intent::Checkpoint(CheckpointIntent::Created),
        move |db, _, record: &CheckpointRecord| {
            checkpoint.set_checkpoint(
                db,
                record.checkpoint_id,
                record.checkpoint_position,
                record.checkpoint_type,
            )
        },
    );
}

fn register_scale_appliers(appliers: &mut EventAppliers) {
    let routing = RoutingState;
    appliers.register(
        Intent::Scale(ScaleIntent::ScalingUp),
        move |db, _, record: &ScaleRecord| {
            let desired: PartitionSet = record.desired_partitions.iter().copied().collect();
            routing.set_desired_partitions(db, &desired)
        },
    );
    appliers.register(
        Intent::Scale(ScaleIntent::ScaledUp),
        move |db, _, _: &ScaleRecord| routing.arrive_at_desired_state(db),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UnwrittenRecord;
    use crate::state::JobStatus;

    fn event(intent: Intent, key: Key, value: impl Into<RecordValue>) -> UnwrittenRecord {
        let mut record = UnwrittenRecord::command(intent, key, value);
        record.record_type = crate::protocol::RecordType::Event;
        record
    }

    #[test]
    fn test_created_event_stores_activatable_job() {
        let appliers = EventAppliers::standard();
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        appliers
            .apply(&mut db, &event(Intent::Job(JobIntent::Created), 7, JobRecord::new("mail", 2)))
            .unwrap();
        db.commit().unwrap();

        assert_eq!(JobState.get_state(&db, 7).unwrap(), JobStatus::Activatable);
    }

    #[test]
    fn test_mismatched_payload_is_corruption() {
        let appliers = EventAppliers::standard();
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        let err = appliers
            .apply(
                &mut db,
                &event(Intent::Job(JobIntent::Created), 7, MessageRecord::new("m", "c", 0)),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }

    #[test]
    fn test_unregistered_event_is_a_no_op() {
        let appliers = EventAppliers::standard();
        assert!(!appliers.has_applier(&Intent::Checkpoint(CheckpointIntent::Ignored)));
        let mut db = StateDb::in_memory(true);
        db.begin_transaction().unwrap();
        appliers
            .apply(
                &mut db,
                &event(
                    Intent::Checkpoint(CheckpointIntent::Ignored),
                    -1,
                    CheckpointRecord::default(),
                ),
            )
            .unwrap();
        db.commit().unwrap();
        assert!(db.is_empty());
    }
}
