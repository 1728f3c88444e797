// ============================================================================
// Scheduled Sweeps
// ============================================================================
//
// Periodic checks over committed state that turn due entries into commands.
// They only read; the commands they return go through the same pipeline as
// any client command.
//
// ============================================================================

use crate::core::Result;
use crate::protocol::{Intent, JobIntent, MessageIntent, UnwrittenRecord};
use crate::state::{JobState, MessageState};
use crate::storage::StateRead;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledSweep {
    /// Activated jobs past their deadline -> JOB:TIME_OUT.
    JobTimeouts,
    /// Failed jobs whose retry backoff elapsed -> JOB:RECUR_AFTER_BACKOFF.
    JobBackoff,
    /// Buffered messages past their TTL -> MESSAGE:EXPIRE.
    MessageTtl,
}

impl ScheduledSweep {
    pub const ALL: [ScheduledSweep; 3] = [
        ScheduledSweep::JobTimeouts,
        ScheduledSweep::JobBackoff,
        ScheduledSweep::MessageTtl,
    ];

    /// Commands for at most `limit` entries due at `now`, in due order.
    pub fn collect<S: StateRead + ?Sized>(
        &self,
        db: &S,
        now: i64,
        limit: usize,
    ) -> Result<Vec<UnwrittenRecord>> {
        let mut commands = Vec::new();
        match self {
            ScheduledSweep::JobTimeouts => {
                JobState.for_each_timed_out_entry(db, now, |key, job| {
                    commands.push(UnwrittenRecord::command(Intent::Job(JobIntent::TimeOut), key, job));
                    Ok(commands.len() < limit)
                })?;
            }
            ScheduledSweep::JobBackoff => {
                JobState.find_backed_off_jobs(db, now, |key, job| {
                    commands.push(UnwrittenRecord::command(
                        Intent::Job(JobIntent::RecurAfterBackoff),
                        key,
                        job,
                    ));
                    Ok(commands.len() < limit)
                })?;
            }
            ScheduledSweep::MessageTtl => {
                MessageState.for_each_expired(db, now, |key, message| {
                    commands.push(UnwrittenRecord::command(
                        Intent::Message(MessageIntent::Expire),
                        key,
                        message,
                    ));
                    Ok(commands.len() < limit)
                })?;
            }
        }
        Ok(commands
            .into_iter()
            .map(|command| command.with_timestamp(now))
            .collect())
    }
}

impl fmt::Display for ScheduledSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduledSweep::JobTimeouts => "job-timeouts",
            ScheduledSweep::JobBackoff => "job-backoff",
            ScheduledSweep::MessageTtl => "message-ttl",
        };
        f.write_str(name)
    }
}
