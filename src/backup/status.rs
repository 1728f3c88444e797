use crate::core::{PartitionId, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Names one backup: the checkpoint taken on a partition of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupIdentifier {
    pub node_id: String,
    pub partition_id: PartitionId,
    pub checkpoint_id: i64,
}

impl BackupIdentifier {
    pub fn new(node_id: impl Into<String>, partition_id: PartitionId, checkpoint_id: i64) -> Self {
        Self {
            node_id: node_id.into(),
            partition_id,
            checkpoint_id,
        }
    }
}

impl fmt::Display for BackupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/partition-{}/checkpoint-{}",
            self.node_id, self.partition_id, self.checkpoint_id
        )
    }
}

/// What a backup contains besides its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub snapshot_id: Uuid,
    pub checkpoint_position: Position,
    /// Last log position included in the log copy.
    pub log_position: Position,
    pub partition_count: u32,
}

/// Files of a snapshot, by logical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedFileSet {
    files: BTreeMap<String, PathBuf>,
}

impl NamedFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.insert(name.into(), path.into());
    }

    pub fn get(&self, name: &str) -> Option<&PathBuf> {
        self.files.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PathBuf)> {
        self.files.iter().map(|(name, path)| (name.as_str(), path))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub id: BackupIdentifier,
    pub descriptor: BackupDescriptor,
    pub files: NamedFileSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatusCode {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatusCode::NotStarted => "NOT_STARTED",
            BackupStatusCode::InProgress => "IN_PROGRESS",
            BackupStatusCode::Completed => "COMPLETED",
            BackupStatusCode::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub id: BackupIdentifier,
    pub status: BackupStatusCode,
    pub descriptor: Option<BackupDescriptor>,
    pub failure_reason: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl BackupStatus {
    pub fn not_started(id: BackupIdentifier) -> Self {
        Self {
            id,
            status: BackupStatusCode::NotStarted,
            descriptor: None,
            failure_reason: None,
            created: None,
            last_modified: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BackupStatusCode::Completed
    }
}
