//! Buffered messages, their TTL index and the message-id uniqueness index.

use crate::core::{Key, Result};
use crate::protocol::MessageRecord;
use crate::storage::{
    ColumnFamily, ColumnFamilyHandle, DbForeignKey, DbNil, DbValue, ForeignKeyRef, MessagesFamily,
    StateRead, StateWrite, DbKey,
};
use serde::{Deserialize, Serialize};

type MessageRef = DbForeignKey<i64, MessagesFamily>;

const MESSAGES: ColumnFamilyHandle<i64, MessageRecord> =
    ColumnFamilyHandle::new(ColumnFamily::Messages);
const DEADLINES: ColumnFamilyHandle<(i64, MessageRef), DbNil> =
    ColumnFamilyHandle::new(ColumnFamily::MessageDeadlines);
const MESSAGE_IDS: ColumnFamilyHandle<(String, String, String), MessageIdEntry> =
    ColumnFamilyHandle::new(ColumnFamily::MessageIds);

impl DbValue for MessageRecord {}

/// Points a (name, correlation key, message id) triple at its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdEntry {
    pub message_key: Key,
}

impl DbValue for MessageIdEntry {
    fn foreign_keys(&self) -> Vec<ForeignKeyRef> {
        vec![ForeignKeyRef {
            column_family: ColumnFamily::Messages,
            key: self.message_key.to_bytes(),
        }]
    }
}

fn id_key(message: &MessageRecord) -> (String, String, String) {
    (
        message.name.clone(),
        message.correlation_key.clone(),
        message.message_id.clone(),
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageState;

impl MessageState {
    /// Stores a published message. `message.deadline` must already be set.
    pub fn put<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key, message: &MessageRecord) -> Result<()> {
        MESSAGES.insert(db, &key, message)?;
        if let Some(deadline) = message.deadline {
            DEADLINES.upsert(db, &(deadline, DbForeignKey::new(key)), &DbNil)?;
        }
        if !message.message_id.is_empty() {
            MESSAGE_IDS.insert(db, &id_key(message), &MessageIdEntry { message_key: key })?;
        }
        Ok(())
    }

    pub fn remove<S: StateWrite + ?Sized>(&self, db: &mut S, key: Key) -> Result<()> {
        let Some(message) = MESSAGES.get(db, &key)? else {
            return Ok(());
        };
        if let Some(deadline) = message.deadline {
            DEADLINES.delete_if_exists(db, &(deadline, DbForeignKey::new(key)))?;
        }
        if !message.message_id.is_empty() {
            MESSAGE_IDS.delete_if_exists(db, &id_key(&message))?;
        }
        MESSAGES.delete_existing(db, &key)
    }

    pub fn get_message<S: StateRead + ?Sized>(&self, db: &S, key: Key) -> Result<Option<MessageRecord>> {
        MESSAGES.get(db, &key)
    }

    /// Whether a message with the same name, correlation key and id is buffered.
    pub fn exist<S: StateRead + ?Sized>(
        &self,
        db: &S,
        name: &str,
        correlation_key: &str,
        message_id: &str,
    ) -> Result<bool> {
        MESSAGE_IDS.exists(
            db,
            &(name.to_string(), correlation_key.to_string(), message_id.to_string()),
        )
    }

    /// Visits messages whose deadline is `<= now`, oldest first.
    pub fn for_each_expired<S, F>(&self, db: &S, now: i64, mut visitor: F) -> Result<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(Key, MessageRecord) -> Result<bool>,
    {
        DEADLINES.range(
            db,
            &(i64::MIN, DbForeignKey::new(i64::MIN)),
            &(now, DbForeignKey::new(i64::MAX)),
            |(_, message_key), _| {
                let key = message_key.into_inner();
                match MESSAGES.get(db, &key)? {
                    Some(message) => visitor(key, message),
                    None => Ok(true),
                }
            },
        )
    }

    pub fn count<S: StateRead + ?Sized>(&self, db: &S) -> Result<usize> {
        MESSAGES.count(db)
    }
}
