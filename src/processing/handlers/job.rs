use super::{CommandProcessor, deadline_after};
use crate::processing::context::ProcessingContext;
use crate::processing::outcome::{CommandError, Rejection};
use crate::protocol::{Intent, JobIntent, JobRecord, Record};
use crate::state::JobStatus;

pub struct JobProcessor;

fn job_value(command: &Record) -> Result<&JobRecord, CommandError> {
    command
        .as_job()
        .ok_or_else(|| Rejection::invalid_argument("Expected a job payload").into())
}

/// Loads the job and checks it is in one of `expected`.
fn load_job(
    ctx: &ProcessingContext<'_>,
    command: &Record,
    action: &str,
    expected: &[JobStatus],
) -> Result<JobRecord, CommandError> {
    let jobs = ctx.state().jobs;
    let Some(job) = jobs.get_job(ctx.db(), command.key)? else {
        return Err(Rejection::not_found(format!(
            "Expected to {} job with key '{}', but no such job was found",
            action, command.key
        ))
        .into());
    };
    let status = jobs.get_state(ctx.db(), command.key)?;
    if !expected.is_empty() && !expected.contains(&status) {
        return Err(Rejection::invalid_state(format!(
            "Expected to {} job with key '{}', but it is in state '{}'",
            action, command.key, status
        ))
        .into());
    }
    Ok(job)
}

impl JobProcessor {
    fn create(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let job = job_value(command)?;
        if job.job_type.is_empty() {
            return Err(Rejection::invalid_argument("Expected a job type, but it was empty").into());
        }
        if job.retries < 0 {
            return Err(Rejection::invalid_argument(format!(
                "Expected retries to be non-negative, but it was {}",
                job.retries
            ))
            .into());
        }
        let key = ctx.next_key()?;
        let mut created = job.clone();
        created.deadline = None;
        created.recurring_time = None;
        created.worker.clear();
        ctx.append_response(key, Intent::Job(JobIntent::Created), created)?;
        Ok(())
    }

    fn complete(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let mut job = load_job(ctx, command, "complete", &[JobStatus::Activated])?;
        job.variables = job_value(command)?.variables.clone();
        ctx.append_response(command.key, Intent::Job(JobIntent::Completed), job)?;
        Ok(())
    }

    fn fail(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let mut job = load_job(ctx, command, "fail", &[JobStatus::Activated])?;
        let request = job_value(command)?;
        job.retries = request.retries;
        job.error_message = request.error_message.clone();
        job.retry_backoff = request.retry_backoff;
        job.recurring_time = if job.retries > 0 && job.retry_backoff > 0 {
            Some(deadline_after(ctx.timestamp(), job.retry_backoff, "the retry backoff")?)
        } else {
            None
        };
        ctx.append_response(command.key, Intent::Job(JobIntent::Failed), job)?;
        Ok(())
    }

    fn time_out(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let job = load_job(ctx, command, "time out", &[JobStatus::Activated])?;
        if job.deadline.is_some_and(|deadline| deadline > ctx.timestamp()) {
            return Err(Rejection::invalid_state(format!(
                "Expected to time out job with key '{}', but its deadline has not passed",
                command.key
            ))
            .into());
        }
        ctx.append_response(command.key, Intent::Job(JobIntent::TimedOut), job)?;
        Ok(())
    }

    fn update_retries(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let retries = job_value(command)?.retries;
        if retries < 1 {
            return Err(Rejection::invalid_argument(format!(
                "Expected to update retries of job with key '{}' with a positive amount, but it was {}",
                command.key, retries
            ))
            .into());
        }
        let mut job = load_job(ctx, command, "update retries of", &[])?;
        job.retries = retries;
        ctx.append_response(command.key, Intent::Job(JobIntent::RetriesUpdated), job)?;
        Ok(())
    }

    fn cancel(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let job = load_job(ctx, command, "cancel", &[])?;
        ctx.append_response(command.key, Intent::Job(JobIntent::Canceled), job)?;
        Ok(())
    }

    fn throw_error(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let request = job_value(command)?;
        if request.error_code.is_empty() {
            return Err(Rejection::invalid_argument("Expected an error code, but it was empty").into());
        }
        let mut job = load_job(ctx, command, "throw an error for", &[JobStatus::Activated])?;
        job.error_code = request.error_code.clone();
        job.error_message = request.error_message.clone();
        ctx.append_response(command.key, Intent::Job(JobIntent::ErrorThrown), job)?;
        Ok(())
    }

    fn recur_after_backoff(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let job = load_job(ctx, command, "recur", &[JobStatus::Failed])?;
        match job.recurring_time {
            Some(recurring_time) if recurring_time <= ctx.timestamp() => {}
            _ => {
                return Err(Rejection::invalid_state(format!(
                    "Expected job with key '{}' to be backed off until now, but it is not",
                    command.key
                ))
                .into());
            }
        }
        ctx.append_response(command.key, Intent::Job(JobIntent::RecurredAfterBackoff), job)?;
        Ok(())
    }

    fn update_timeout(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let timeout = job_value(command)?.timeout;
        if timeout <= 0 {
            return Err(Rejection::invalid_argument(format!(
                "Expected a positive timeout for job with key '{}', but it was {}",
                command.key, timeout
            ))
            .into());
        }
        let deadline = deadline_after(ctx.timestamp(), timeout, "the job timeout")?;
        let mut job = load_job(ctx, command, "update the timeout of", &[JobStatus::Activated])?;
        job.timeout = timeout;
        job.deadline = Some(deadline);
        ctx.append_response(command.key, Intent::Job(JobIntent::TimeoutUpdated), job)?;
        Ok(())
    }
}

impl CommandProcessor for JobProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        match command.intent {
            Intent::Job(JobIntent::Create) => self.create(command, ctx),
            Intent::Job(JobIntent::Complete) => self.complete(command, ctx),
            Intent::Job(JobIntent::Fail) => self.fail(command, ctx),
            Intent::Job(JobIntent::TimeOut) => self.time_out(command, ctx),
            Intent::Job(JobIntent::UpdateRetries) => self.update_retries(command, ctx),
            Intent::Job(JobIntent::Cancel) => self.cancel(command, ctx),
            Intent::Job(JobIntent::ThrowError) => self.throw_error(command, ctx),
            Intent::Job(JobIntent::RecurAfterBackoff) => self.recur_after_backoff(command, ctx),
            Intent::Job(JobIntent::UpdateTimeout) => self.update_timeout(command, ctx),
            other => Err(Rejection::invalid_argument(format!(
                "Job processor cannot handle {}",
                other
            ))
            .into()),
        }
    }
}
