use super::{CommandProcessor, deadline_after};
use crate::processing::context::ProcessingContext;
use crate::processing::outcome::{CommandError, Rejection};
use crate::protocol::{Intent, MessageIntent, MessageRecord, Record, UnwrittenRecord};

/// Request stream id stamped on publish commands forwarded between
/// partitions. The receiving partition never forwards them again.
pub const FORWARDED_REQUEST_STREAM: i32 = -2;

pub struct MessageProcessor;

fn message_value(command: &Record) -> Result<&MessageRecord, CommandError> {
    command
        .as_message()
        .ok_or_else(|| Rejection::invalid_argument("Expected a message payload").into())
}

impl MessageProcessor {
    fn publish(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let message = message_value(command)?;
        if message.name.is_empty() {
            return Err(Rejection::invalid_argument("Expected a message name, but it was empty").into());
        }

        if command.request_stream_id != FORWARDED_REQUEST_STREAM {
            let correlation = ctx.state().routing.message_correlation(ctx.db())?;
            if let Some(correlation) = correlation {
                let target = correlation.partition_for(&message.correlation_key);
                if target != ctx.partition_id() {
                    let forwarded = UnwrittenRecord::new_command(
                        Intent::Message(MessageIntent::Publish),
                        message.clone(),
                    )
                    .with_request(FORWARDED_REQUEST_STREAM, command.request_id)
                    .with_timestamp(command.timestamp);
                    ctx.send_command(target, forwarded);
                    return Ok(());
                }
            }
        }

        if !message.message_id.is_empty()
            && ctx.state().messages.exist(
                ctx.db(),
                &message.name,
                &message.correlation_key,
                &message.message_id,
            )?
        {
            return Err(Rejection::already_exists(format!(
                "Expected to publish a new message with id '{}', but a message with that id was already published",
                message.message_id
            ))
            .into());
        }

        let time_to_live = message.time_to_live.max(0);
        let deadline = deadline_after(ctx.timestamp(), time_to_live, "the message time to live")?;
        let key = ctx.next_key()?;
        let mut published = message.clone();
        published.time_to_live = time_to_live;
        published.deadline = Some(deadline);
        ctx.append_response(key, Intent::Message(MessageIntent::Published), published.clone())?;
        if time_to_live == 0 {
            ctx.append_command(key, Intent::Message(MessageIntent::Expire), published);
        }
        Ok(())
    }

    fn expire(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        let Some(message) = ctx.state().messages.get_message(ctx.db(), command.key)? else {
            return Err(Rejection::not_found(format!(
                "Expected to expire message with key '{}', but no such message was found",
                command.key
            ))
            .into());
        };
        ctx.append_response(command.key, Intent::Message(MessageIntent::Expired), message)?;
        Ok(())
    }
}

impl CommandProcessor for MessageProcessor {
    fn process(&self, command: &Record, ctx: &mut ProcessingContext<'_>) -> Result<(), CommandError> {
        match command.intent {
            Intent::Message(MessageIntent::Publish) => self.publish(command, ctx),
            Intent::Message(MessageIntent::Expire) => self.expire(command, ctx),
            other => Err(Rejection::invalid_argument(format!(
                "Message processor cannot handle {}",
                other
            ))
            .into()),
        }
    }
}
