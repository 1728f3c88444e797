use super::CommandProcessor;
use crate::core::{MAX_PARTITION_ID, START_PARTITION_ID};
use crate::processing::context::ProcessingContext;
use crate::processing::outcome::{CommandError, Rejection};
use crate::protocol::{Intent, Record, ScaleIntent, ScaleRecord};
use crate::state::PartitionSet;

/// Two-phase scale-up: SCALE_UP records the desired partitions, and
/// MARK_SCALED_UP promotes them once the new partitions run.
pub struct ScaleProcessor;

impl ScaleProcessor {
    fn scale_up(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let request = command
            .as_scale()
            .ok_or_else(|| CommandError::from(Rejection::invalid_argument("Expected a scale payload")))?;
        let routing = ctx.state().routing;
        if !routing.is_initialized(ctx.db())? {
            return Err(Rejection::invalid_state("Routing is not initialized on this partition").into());
        }

        let current = routing.current_partitions(ctx.db())?;
        let desired_count = request.desired_partition_count;
        if desired_count as usize <= current.len() {
            return Err(Rejection::invalid_argument(format!(
                "Expected more than {} partitions, but {} were requested",
                current.len(),
                desired_count
            ))
            .into());
        }
        if desired_count > MAX_PARTITION_ID {
            return Err(Rejection::invalid_argument(format!(
                "Expected at most {} partitions, but {} were requested",
                MAX_PARTITION_ID, desired_count
            ))
            .into());
        }

        let desired: PartitionSet = (START_PARTITION_ID..START_PARTITION_ID + desired_count).collect();
        if routing.is_scaling(ctx.db())? {
            let in_flight = routing.desired_partitions(ctx.db())?.unwrap_or_default();
            if in_flight != desired {
                return Err(Rejection::invalid_state(format!(
                    "Expected no scale operation in progress, but scaling to {} partitions is",
                    in_flight.len()
                ))
                .into());
            }
        }

        let record = ScaleRecord {
            desired_partition_count: desired_count,
            current_partitions: current.into_iter().collect(),
            desired_partitions: desired.into_iter().collect(),
        };
        ctx.append_response(command.key, Intent::Scale(ScaleIntent::ScalingUp), record)?;
        Ok(())
    }

    fn mark_scaled_up(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let routing = ctx.state().routing;
        let Some(desired) = routing.desired_partitions(ctx.db())? else {
            return Err(Rejection::invalid_state("Expected a scale operation to complete, but none was started").into());
        };
        let record = ScaleRecord {
            desired_partition_count: desired.len() as u32,
            current_partitions: desired.iter().copied().collect(),
            desired_partitions: desired.into_iter().collect(),
        };
        ctx.append_response(command.key, Intent::Scale(ScaleIntent::ScaledUp), record)?;
        Ok(())
    }
}

impl CommandProcessor for ScaleProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        match command.intent {
            Intent::Scale(ScaleIntent::ScaleUp) => self.scale_up(command, ctx),
            Intent::Scale(ScaleIntent::MarkScaledUp) => self.mark_scaled_up(command, ctx),
            other => Err(Rejection::invalid_argument(format!(
                "Scale processor cannot handle {}",
                other
            ))
            .into()),
        }
    }
}
