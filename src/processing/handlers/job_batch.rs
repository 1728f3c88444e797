use super::{CommandProcessor, deadline_after};
use crate::core::Key;
use crate::processing::context::ProcessingContext;
use crate::processing::outcome::{CommandError, Rejection};
use crate::protocol::{Intent, JobBatchIntent, JobRecord, Record};

/// Hands out activatable jobs of one type, oldest key first.
pub struct JobBatchProcessor;

impl CommandProcessor for JobBatchProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let request = command
            .as_job_batch()
            .ok_or_else(|| CommandError::from(Rejection::invalid_argument("Expected a job batch payload")))?;
        if request.job_type.is_empty() {
            return Err(Rejection::invalid_argument("Expected a job type, but it was empty").into());
        }
        if request.timeout <= 0 {
            return Err(Rejection::invalid_argument(format!(
                "Expected a positive activation timeout, but it was {}",
                request.timeout
            ))
            .into());
        }
        if request.max_jobs_to_activate <= 0 {
            return Err(Rejection::invalid_argument(format!(
                "Expected to activate at least one job, but max jobs was {}",
                request.max_jobs_to_activate
            ))
            .into());
        }

        let limit = (request.max_jobs_to_activate as usize).min(ctx.config().max_jobs_per_batch);
        let deadline = deadline_after(ctx.timestamp(), request.timeout, "the activation timeout")?;
        let mut candidates: Vec<(Key, JobRecord)> = Vec::new();
        let mut truncated = false;
        ctx.state()
            .jobs
            .for_each_activatable_job(ctx.db(), &request.job_type, |key, job| {
                if candidates.len() == limit {
                    truncated = true;
                    return Ok(false);
                }
                candidates.push((key, job));
                Ok(true)
            })?;

        let mut batch = request.clone();
        batch.job_keys.clear();
        batch.jobs.clear();
        for (key, mut job) in candidates {
            job.worker = request.worker.clone();
            job.timeout = request.timeout;
            job.deadline = Some(deadline);
            batch.job_keys.push(key);
            batch.jobs.push(job);
        }
        batch.truncated = truncated;

        let key = ctx.next_key()?;
        ctx.append_response(key, Intent::JobBatch(JobBatchIntent::Activated), batch)?;
        Ok(())
    }
}
