// ============================================================================
// Job Lifecycle State
// ============================================================================
//
// Jobs are stored once, keyed by job key. Their lifecycle state and three
// secondary indexes live in separate column families whose keys embed the
// job key as a foreign key into JOBS:
//
//   JOB_STATES       job_key                  -> JobStatus
//   JOB_ACTIVATABLE  (job_type, job_key)      -> nil
//   JOB_DEADLINES    (deadline, job_key)      -> nil
//   JOB_BACKOFF      (recurring_time, job_key)-> nil
//
// Every transition below updates the record, its state and the indexes in
// the caller's transaction so they never disagree once committed.
//
// ============================================================================

use crate::core::{Key, Result};
use crate::protocol::JobRecord;
use crate::storage::{
    ColumnFamily, ColumnFamilyHandle, DbForeignKey, DbNil, DbValue, JobsFamily, StateRead,
    StateWrite,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

type JobRef = DbForeignKey<i64, JobsFamily>;

const JOBS: ColumnFamilyHandle<i64, JobRecord> = ColumnFamilyHandle::new(ColumnFamily::Jobs);
const JOB_STATES: ColumnFamilyHandle<JobRef, JobStatus> =
    ColumnFamilyHandle::new(ColumnFamily::JobStates);
const ACTIVATABLE: ColumnFamilyHandle<(String, JobRef), DbNil> =
    ColumnFamilyHandle::new(ColumnFamily::JobActivatable);
const DEADLINES: ColumnFamilyHandle<(i64, JobRef), DbNil> =
    ColumnFamilyHandle::new(ColumnFamily::JobDeadlines);
const BACKOFF: ColumnFamilyHandle<(i64, JobRef), DbNil> =
    ColumnFamilyHandle::new(ColumnFamily::JobBackoff);

impl DbValue for JobRecord {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Activatable,
    Activated,
    Failed,
    ErrorThrown,
    /// Returned by lookups for keys without a stored job.
    NotFound,
}

impl DbValue for JobStatus {}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Activatable => "ACTIVATABLE",
            JobStatus::Activated => "ACTIVATED",
            JobStatus::Failed => "FAILED",
            JobStatus::ErrorThrown => "ERROR_THROWN",
            JobStatus::NotFound => "NOT_FOUND",
        };
        f.write_str(name)
    }
}

/// Per job type counters for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTypeCounts {
    pub activatable: usize,
    pub activated: usize,
    pub failed: usize,
    pub error_thrown: usize,
}

fn job_ref(key: Key) -> JobRef {
    DbForeignKey::new(key)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobState;

impl JobState {
    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Stores a new job as ACTIVATABLE.
    pub fn create<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        JOBS.insert(db, &key, job)?;
        JOB_STATES.insert(db, &job_ref(key), &JobStatus::Activatable)?;
        ACTIVATABLE.upsert(db, &(job.job_type.clone(), job_ref(key)), &DbNil)
    }

    /// Stores the job as ACTIVATED and indexes its deadline.
    pub fn activate<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        JOBS.upsert(db, &key, job)?;
        JOB_STATES.upsert(db, &job_ref(key), &JobStatus::Activated)?;
        ACTIVATABLE.delete_if_exists(db, &(job.job_type.clone(), job_ref(key)))?;
        if let Some(deadline) = job.deadline {
            DEADLINES.upsert(db, &(deadline, job_ref(key)), &DbNil)?;
        }
        Ok(())
    }

    /// Removes a completed job and every index entry pointing at it.
    pub fn complete<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key) -> Result<()> {
        self.delete(db, key)
    }

    /// Removes a canceled job and every index entry pointing at it.
    pub fn cancel<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key) -> Result<()> {
        self.delete(db, key)
    }

    /// An activated job whose deadline passed becomes activatable again.
    pub fn timeout<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        self.remove_indexes(db, key)?;
        let mut stored = job.clone();
        stored.deadline = None;
        stored.worker.clear();
        self.make_activatable(db, key, &stored)
    }

    /// Failed with retries left and no backoff: ACTIVATABLE. With a backoff:
    /// FAILED and parked in the backoff index. No retries left: FAILED.
    pub fn fail<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        self.remove_indexes(db, key)?;
        let mut stored = job.clone();
        stored.deadline = None;

        if stored.retries > 0 && stored.retry_backoff <= 0 {
            stored.recurring_time = None;
            return self.make_activatable(db, key, &stored);
        }

        JOBS.update(db, &key, &stored)?;
        JOB_STATES.upsert(db, &job_ref(key), &JobStatus::Failed)?;
        if stored.retries > 0 {
            if let Some(recurring_time) = stored.recurring_time {
                BACKOFF.upsert(db, &(recurring_time, job_ref(key)), &DbNil)?;
            }
        }
        Ok(())
    }

    pub fn throw_error<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        self.remove_indexes(db, key)?;
        let mut stored = job.clone();
        stored.deadline = None;
        JOBS.update(db, &key, &stored)?;
        JOB_STATES.upsert(db, &job_ref(key), &JobStatus::ErrorThrown)
    }

    /// Sets the retries; a FAILED job with retries left becomes activatable.
    pub fn update_retries<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        key: Key,
        retries: i32,
    ) -> Result<Option<JobRecord>> {
        let Some(mut job) = JOBS.get(db, &key)? else {
            return Ok(None);
        };
        job.retries = retries;
        if retries > 0 && self.get_state(db, key)? == JobStatus::Failed {
            self.remove_indexes(db, key)?;
            job.recurring_time = None;
            self.make_activatable(db, key, &job)?;
        } else {
            JOBS.update(db, &key, &job)?;
        }
        Ok(Some(job))
    }

    /// Moves the deadline index entry of an activated job.
    pub fn update_deadline<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        key: Key,
        job: &JobRecord,
        old_deadline: Option<i64>,
    ) -> Result<()> {
        if let Some(old) = old_deadline {
            DEADLINES.delete_if_exists(db, &(old, job_ref(key)))?;
        }
        JOBS.update(db, &key, job)?;
        if let Some(deadline) = job.deadline {
            DEADLINES.upsert(db, &(deadline, job_ref(key)), &DbNil)?;
        }
        Ok(())
    }

    /// A backed-off job becomes activatable again.
    pub fn recur_after_backoff<S: StateWrite + ?Sized>(
        &self,
        db: &mut S,
        key: Key,
        job: &JobRecord,
    ) -> Result<()> {
        self.remove_indexes(db, key)?;
        let mut stored = job.clone();
        stored.recurring_time = None;
        self.make_activatable(db, key, &stored)
    }

    fn make_activatable<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, job: &JobRecord) -> Result<()> {
        JOBS.update(db, &key, job)?;
        JOB_STATES.upsert(db, &job_ref(key), &JobStatus::Activatable)?;
        ACTIVATABLE.upsert(db, &(job.job_type.clone(), job_ref(key)), &DbNil)
    }

    /// Drops the deadline, backoff and activatable entries of the stored job.
    fn remove_indexes<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key) -> Result<()> {
        let Some(stored) = JOBS.get(db, &key)? else {
            return Ok(());
        };
        if let Some(deadline) = stored.deadline {
            DEADLINES.delete_if_exists(db, &(deadline, job_ref(key)))?;
        }
        if let Some(recurring_time) = stored.recurring_time {
            BACKOFF.delete_if_exists(db, &(recurring_time, job_ref(key)))?;
        }
        ACTIVATABLE.delete_if_exists(db, &(stored.job_type, job_ref(key)))
    }

    fn delete<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key) -> Result<()> {
        self.remove_indexes(db, key)?;
        JOB_STATES.delete_if_exists(db, &job_ref(key))?;
        JOBS.delete_existing(db, &key)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_job<S: StateRead + ?Sized>(&self, db: &S, key: Key) -> Result<Option<JobRecord>> {
        JOBS.get(db, &key)
    }

    pub fn exists<S: StateRead + ?Sized>(&self, db: &S, key: Key) -> Result<bool> {
        JOBS.exists(db, &key)
    }

    pub fn get_state<S: StateRead + ?Sized>(&self, db: &S, key: Key) -> Result<JobStatus> {
        Ok(JOB_STATES.get(db, &job_ref(key))?.unwrap_or(JobStatus::NotFound))
    }

    pub fn is_in_state<S: StateRead + ?Sized>(&self, db: &S, key: Key, status: JobStatus) -> Result<bool> {
        Ok(self.get_state(db, key)? == status)
    }

    /// Visits activated jobs with `deadline <= now` in deadline order (ties
    /// by job key) until the visitor returns `false`.
    pub fn for_each_timed_out_entry<S, F>(&self, db: &S, now: i64, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(Key, JobRecord) -> Result<bool>,
    {
        DEADLINES.range(
            db,
            &(i64::MIN, job_ref(i64::MIN)),
            &(now, job_ref(i64::MAX)),
            |(_, job_key), _| {
                let key = job_key.into_inner();
                match JOBS.get(db, &key)? {
                    Some(job) => visitor(key, job),
                    None => {
                        tracing::warn!(job_key = key, "deadline entry without job");
                        Ok(true)
                    }
                }
            },
        )
    }

    /// Like `for_each_timed_out_entry`, but the visitor may change the store.
    /// Entries the visitor removes are not visited again.
    pub fn sweep_timed_out_entries<S, F>(&self, db: &mut S, now: i64, mut visitor: F) -> Result<()>
    where
        S: StateWrite + ?Sized,
        F: FnMut(&mut S, Key, JobRecord) -> Result<bool>,
    {
        DEADLINES.visit_up_to(db, &(now, job_ref(i64::MAX)), |db, (_, job_key), _| {
            let key = job_key.into_inner();
            match JOBS.get(db, &key)? {
                Some(job) => visitor(db, key, job),
                None => Ok(true),
            }
        })
    }

    /// Visits backed-off jobs with `recurring_time <= now` in time order.
    pub fn find_backed_off_jobs<S, F>(&self, db: &S, now: i64, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(Key, JobRecord) -> Result<bool>,
    {
        BACKOFF.range(
            db,
            &(i64::MIN, job_ref(i64::MIN)),
            &(now, job_ref(i64::MAX)),
            |(_, job_key), _| {
                let key = job_key.into_inner();
                match JOBS.get(db, &key)? {
                    Some(job) => visitor(key, job),
                    None => Ok(true),
                }
            },
        )
    }

    /// Visits activatable jobs of `job_type` in key order.
    pub fn for_each_activatable_job<S, F>(&self, db: &S, job_type: &str, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(Key, JobRecord) -> Result<bool>,
    {
        ACTIVATABLE.while_equal_prefix(db, &job_type.to_string(), |(_, job_key), _| {
            let key = job_key.into_inner();
            match JOBS.get(db, &key)? {
                Some(job) => visitor(key, job),
                None => Ok(true),
            }
        })
    }

    pub fn job_type_counts<S: StateRead + ?Sized>(&self, db: &S) -> Result<BTreeMap<String, JobTypeCounts>> {
        let mut counts: BTreeMap<String, JobTypeCounts> = BTreeMap::new();
        JOBS.for_each(db, |key, job| {
            let entry = counts.entry(job.job_type).or_default();
            match self.get_state(db, key)? {
                JobStatus::Activatable => entry.activatable += 1,
                JobStatus::Activated => entry.activated += 1,
                JobStatus::Failed => entry.failed += 1,
                JobStatus::ErrorThrown => entry.error_thrown += 1,
                JobStatus::NotFound => {}
            }
            Ok(())
        })?;
        Ok(counts)
    }
}
