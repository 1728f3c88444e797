use super::CommandProcessor;
use crate::processing::context::ProcessingContext;
use crate::processing::outcome::{CommandError, PostCommitTask, Rejection};
use crate::protocol::{CheckpointIntent, CheckpointRecord, Intent, Record};

/// Creates a checkpoint at the command's own position. Ids must grow; a
/// repeated or older id is answered with IGNORED and changes nothing.
pub struct CheckpointProcessor;

impl CommandProcessor for CheckpointProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let request = command
            .as_checkpoint()
            .ok_or_else(|| CommandError::from(Rejection::invalid_argument("Expected a checkpoint payload")))?;
        let current = ctx.state().checkpoint.get_checkpoint(ctx.db())?;

        if request.checkpoint_id <= current.checkpoint_id {
            let ignored = CheckpointRecord {
                checkpoint_id: current.checkpoint_id,
                checkpoint_position: current.checkpoint_position,
                checkpoint_type: current.checkpoint_type,
            };
            tracing::debug!(
                requested = request.checkpoint_id,
                current = current.checkpoint_id,
                "checkpoint ignored"
            );
            ctx.append_response(command.key, Intent::Checkpoint(CheckpointIntent::Ignored), ignored)?;
            return Ok(());
        }

        let created = CheckpointRecord {
            checkpoint_id: request.checkpoint_id,
            checkpoint_position: command.position,
            checkpoint_type: request.checkpoint_type,
        };
        ctx.append_response(command.key, Intent::Checkpoint(CheckpointIntent::Created), created)?;
        if request.checkpoint_type.takes_backup() {
            ctx.schedule(PostCommitTask::TakeBackup {
                checkpoint_id: request.checkpoint_id,
                checkpoint_position: command.position,
            });
        }
        Ok(())
    }
}
