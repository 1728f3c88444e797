use super::actor::PartitionRequest;
use crate::core::{EngineError, PartitionId, Result};
use crate::protocol::UnwrittenRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Delivers a command to the log of another partition.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, partition_id: PartitionId, command: UnwrittenRecord) -> Result<()>;
}

/// Request channels of the partitions running in this process.
#[derive(Default)]
pub struct PartitionRouter {
    senders: RwLock<HashMap<PartitionId, mpsc::Sender<PartitionRequest>>>,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, partition_id: PartitionId, sender: mpsc::Sender<PartitionRequest>) -> Result<()> {
        self.senders.write()?.insert(partition_id, sender);
        Ok(())
    }

    pub(crate) fn unregister(&self, partition_id: PartitionId) -> Result<()> {
        self.senders.write()?.remove(&partition_id);
        Ok(())
    }

    fn sender(&self, partition_id: PartitionId) -> Result<mpsc::Sender<PartitionRequest>> {
        self.senders
            .read()?
            .get(&partition_id)
            .cloned()
            .ok_or(EngineError::PartitionUnavailable(partition_id))
    }

    pub fn partitions(&self) -> Result<Vec<PartitionId>> {
        let mut partitions: Vec<_> = self.senders.read()?.keys().copied().collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}

#[async_trait]
impl CommandSender for PartitionRouter {
    async fn send_command(&self, partition_id: PartitionId, command: UnwrittenRecord) -> Result<()> {
        let sender = self.sender(partition_id)?;
        sender
            .send(PartitionRequest::Command {
                command,
                reply: None,
            })
            .await
            .map_err(|_| EngineError::PartitionUnavailable(partition_id))
    }
}
