// ============================================================================
// Backup Store
// ============================================================================
//
// File system layout:
//
//   <root>/<node>/partition-<p>/checkpoint-<id>/
//       manifest.json     status, descriptor, timestamps, file names
//       <file>            one copy per named file
//
// The manifest is written IN_PROGRESS before any file is copied and
// rewritten COMPLETED (or FAILED) afterwards, so a crash mid-copy never
// leaves a backup that looks complete.
//
// ============================================================================

use super::status::{Backup, BackupDescriptor, BackupIdentifier, BackupStatus, BackupStatusCode, NamedFileSet};
use crate::core::{EngineError, PartitionId, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn save(&self, backup: &Backup) -> Result<BackupStatus>;

    /// NOT_STARTED when the store has never seen `id`.
    async fn get_status(&self, id: &BackupIdentifier) -> Result<BackupStatus>;

    /// Every backup of `partition_id`, oldest checkpoint first.
    async fn list(&self, partition_id: Option<PartitionId>) -> Result<Vec<BackupStatus>>;

    async fn delete(&self, id: &BackupIdentifier) -> Result<()>;

    /// Copies the files of a completed backup into `target_dir`.
    async fn restore(&self, id: &BackupIdentifier, target_dir: &Path) -> Result<NamedFileSet>;

    async fn mark_failed(&self, id: &BackupIdentifier, reason: &str) -> Result<BackupStatus>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    status: BackupStatus,
    files: Vec<String>,
}

pub struct FileSystemBackupStore {
    root: PathBuf,
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> EngineError {
    EngineError::Backup(format!("Failed to {} {}: {}", action, path.display(), err))
}

impl FileSystemBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn backup_dir(&self, id: &BackupIdentifier) -> PathBuf {
        self.root
            .join(&id.node_id)
            .join(format!("partition-{}", id.partition_id))
            .join(format!("checkpoint-{}", id.checkpoint_id))
    }

    async fn read_manifest(&self, dir: &Path) -> Result<Option<Manifest>> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read", &path, err)),
        };
        let manifest = serde_json::from_slice(&raw).map_err(|e| {
            EngineError::Backup(format!("Invalid backup manifest {}: {}", path.display(), e))
        })?;
        Ok(Some(manifest))
    }

    async fn write_manifest(&self, dir: &Path, manifest: &Manifest) -> Result<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let temp_path = dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let raw = serde_json::to_vec_pretty(manifest)
            .map_err(|e| EngineError::Serialization(format!("Failed to encode manifest: {}", e)))?;
        tokio::fs::write(&temp_path, raw)
            .await
            .map_err(|e| io_error("write", &temp_path, e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error("rename", &temp_path, e))
    }

    async fn copy_files(&self, dir: &Path, files: &NamedFileSet) -> Result<()> {
        for (name, source) in files.iter() {
            let target = dir.join(name);
            tokio::fs::copy(source, &target)
                .await
                .map_err(|e| io_error("copy", source, e))?;
        }
        Ok(())
    }

    async fn list_dir(path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("list", path, err)),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", path, e))?
        {
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl BackupStore for FileSystemBackupStore {
    async fn save(&self, backup: &Backup) -> Result<BackupStatus> {
        let dir = self.backup_dir(&backup.id);
        if let Some(existing) = self.read_manifest(&dir).await? {
            if existing.status.status != BackupStatusCode::Failed {
                return Err(EngineError::Backup(format!(
                    "Backup {} already exists with status {}",
                    backup.id, existing.status.status
                )));
            }
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))?;

        let now = Utc::now();
        let mut manifest = Manifest {
            status: BackupStatus {
                id: backup.id.clone(),
                status: BackupStatusCode::InProgress,
                descriptor: Some(backup.descriptor.clone()),
                failure_reason: None,
                created: Some(now),
                last_modified: Some(now),
            },
            files: backup.files.names().map(str::to_string).collect(),
        };
        self.write_manifest(&dir, &manifest).await?;

        match self.copy_files(&dir, &backup.files).await {
            Ok(()) => {
                manifest.status.status = BackupStatusCode::Completed;
                manifest.status.last_modified = Some(Utc::now());
                self.write_manifest(&dir, &manifest).await?;
                tracing::info!(backup = %backup.id, files = backup.files.len(), "backup completed");
                Ok(manifest.status)
            }
            Err(err) => {
                manifest.status.status = BackupStatusCode::Failed;
                manifest.status.failure_reason = Some(err.to_string());
                manifest.status.last_modified = Some(Utc::now());
                self.write_manifest(&dir, &manifest).await?;
                Err(err)
            }
        }
    }

    async fn get_status(&self, id: &BackupIdentifier) -> Result<BackupStatus> {
        Ok(self
            .read_manifest(&self.backup_dir(id))
            .await?
            .map(|manifest| manifest.status)
            .unwrap_or_else(|| BackupStatus::not_started(id.clone())))
    }

    async fn list(&self, partition_id: Option<PartitionId>) -> Result<Vec<BackupStatus>> {
        let mut statuses = Vec::new();
        for node_dir in Self::list_dir(&self.root).await? {
            for partition_dir in Self::list_dir(&node_dir).await? {
                for backup_dir in Self::list_dir(&partition_dir).await? {
                    if let Some(manifest) = self.read_manifest(&backup_dir).await? {
                        statuses.push(manifest.status);
                    }
                }
            }
        }
        statuses.retain(|status| partition_id.is_none_or(|p| status.id.partition_id == p));
        statuses.sort_by(|a, b| a.id.checkpoint_id.cmp(&b.id.checkpoint_id).then(a.id.cmp(&b.id)));
        Ok(statuses)
    }

    async fn delete(&self, id: &BackupIdentifier) -> Result<()> {
        let dir = self.backup_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("delete", &dir, err)),
        }
    }

    async fn restore(&self, id: &BackupIdentifier, target_dir: &Path) -> Result<NamedFileSet> {
        let dir = self.backup_dir(id);
        let manifest = self
            .read_manifest(&dir)
            .await?
            .ok_or_else(|| EngineError::Backup(format!("Backup {} does not exist", id)))?;
        if !manifest.status.is_completed() {
            return Err(EngineError::Backup(format!(
                "Backup {} is {}, only completed backups can be restored",
                id, manifest.status.status
            )));
        }
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| io_error("create", target_dir, e))?;

        let mut restored = NamedFileSet::new();
        for name in &manifest.files {
            let source = dir.join(name);
            let target = target_dir.join(name);
            tokio::fs::copy(&source, &target)
                .await
                .map_err(|e| io_error("copy", &source, e))?;
            restored.insert(name.clone(), target);
        }
        Ok(restored)
    }

    async fn mark_failed(&self, id: &BackupIdentifier, reason: &str) -> Result<BackupStatus> {
        let dir = self.backup_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))?;
        let now = Utc::now();
        let mut manifest = self.read_manifest(&dir).await?.unwrap_or_else(|| Manifest {
            status: BackupStatus {
                created: Some(now),
                ..BackupStatus::not_started(id.clone())
            },
            files: Vec::new(),
        });
        manifest.status.status = BackupStatusCode::Failed;
        manifest.status.failure_reason = Some(reason.to_string());
        manifest.status.last_modified = Some(now);
        self.write_manifest(&dir, &manifest).await?;
        Ok(manifest.status)
    }
}

/// Descriptor of a completed backup, or an error naming its status.
pub async fn completed_descriptor(store: &dyn BackupStore, id: &BackupIdentifier) -> Result<BackupDescriptor> {
    let status = store.get_status(id).await?;
    match (status.status, status.descriptor) {
        (BackupStatusCode::Completed, Some(descriptor)) => Ok(descriptor),
        (code, _) => Err(EngineError::Backup(format!("Backup {} is {}", id, code))),
    }
}
