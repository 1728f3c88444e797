// ============================================================================
// Command Handlers
// ============================================================================
//
// One handler per value type, registered for each command intent it accepts.
// Handlers read state, decide, and append events; they never write entity
// state themselves.
//
// ============================================================================

pub mod checkpoint;
pub mod job;
pub mod job_batch;
pub mod message;
pub mod scale;

use super::context::ProcessingContext;
use super::outcome::{CommandError, Rejection};
use crate::protocol::{
    CheckpointIntent, Intent, JobBatchIntent, JobIntent, MessageIntent, Record, ScaleIntent,
};
use std::collections::HashMap;
use std::sync::Arc;

pub use checkpoint::CheckpointProcessor;
pub use job::JobProcessor;
pub use job_batch::JobBatchProcessor;
pub use message::{FORWARDED_REQUEST_STREAM, MessageProcessor};
pub use scale::ScaleProcessor;

/// `timestamp + duration`, rejected when the sum does not fit a timestamp.
pub(crate) fn deadline_after(timestamp: i64, duration: i64, what: &str) -> Result<i64, CommandError> {
    timestamp.checked_add(duration).ok_or_else(|| {
        Rejection::invalid_argument(format!(
            "Expected {} to end at a representable time, but {} + {} overflows",
            what, timestamp, duration
        ))
        .into()
    })
}

pub trait CommandProcessor: Send + Sync {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError>;
}

#[derive(Clone, Default)]
pub struct CommandHandlers {
    handlers: HashMap<Intent, Arc<dyn CommandProcessor>>,
}

impl CommandHandlers {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut handlers = Self::empty();

        let job: Arc<dyn CommandProcessor> = Arc::new(JobProcessor);
        for intent in [
            JobIntent::Create,
            JobIntent::Complete,
            JobIntent::Fail,
            JobIntent::TimeOut,
            JobIntent::UpdateRetries,
            JobIntent::Cancel,
            JobIntent::ThrowError,
            JobIntent::RecurAfterBackoff,
            JobIntent::UpdateTimeout,
        ] {
            handlers.register(Intent::Job(intent), job.clone());
        }

        handlers.register(
            Intent::JobBatch(JobBatchIntent::Activate),
            Arc::new(JobBatchProcessor),
        );

        let message: Arc<dyn CommandProcessor> = Arc::new(MessageProcessor);
        handlers.register(Intent::Message(MessageIntent::Publish), message.clone());
        handlers.register(Intent::Message(MessageIntent::Expire), message);

        handlers.register(
            Intent::Checkpoint(CheckpointIntent::Create),
            Arc::new(CheckpointProcessor),
        );

        let scale: Arc<dyn CommandProcessor> = Arc::new(ScaleProcessor);
        handlers.register(Intent::Scale(ScaleIntent::ScaleUp), scale.clone());
        handlers.register(Intent::Scale(ScaleIntent::MarkScaledUp), scale);

        handlers
    }

    pub fn register(&mut self, intent: Intent, handler: Arc<dyn CommandProcessor>) {
        self.handlers.insert(intent, handler);
    }

    pub fn get(&self, intent: &Intent) -> Option<Arc<dyn CommandProcessor>> {
        self.handlers.get(intent).cloned()
    }
}
