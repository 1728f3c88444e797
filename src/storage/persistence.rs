//! Write-ahead log and snapshot files backing the keyed state store.

use crate::core::{EngineError, Result};
use crate::transaction::Change;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const WAL_FILE_NAME: &str = "state.wal";
pub const SNAPSHOT_FILE_NAME: &str = "state.snapshot";

// ============================================================================
// WAL Entry
// ============================================================================

/// One committed transaction. A frame is written per commit, so recovery
/// applies a transaction completely or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub txn_id: u64,
    pub changes: Vec<(Vec<u8>, Change)>,
}

// ============================================================================
// State Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: i64,
    pub entry_count: usize,
    pub last_txn_id: u64,
}

impl StateSnapshot {
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>, last_txn_id: u64) -> Self {
        let entry_count = entries.len();
        Self {
            version: 1,
            entries,
            metadata: SnapshotMetadata {
                created_at: chrono::Utc::now().timestamp_millis(),
                entry_count,
                last_txn_id,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync after every commit.
    Sync,
    /// Flush to the OS after every commit.
    #[default]
    Async,
    /// Keep state in memory only.
    None,
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        let wal_file = if durability_mode != DurabilityMode::None {
            if let Some(parent) = wal_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    EngineError::IoError(format!("Failed to create WAL directory: {}", e))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| EngineError::IoError(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| EngineError::ExecutionError("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry).map_err(|e| {
            EngineError::Serialization(format!("Failed to serialize WAL entry: {}", e))
        })?;
        let mut frame = Vec::with_capacity(4 + serialized.len());
        frame.extend_from_slice(&(serialized.len() as u32).to_le_bytes());
        frame.extend_from_slice(&serialized);
        file.write_all(&frame)
            .map_err(|e| EngineError::IoError(format!("Failed to write WAL: {}", e)))?;
        file.flush()
            .map_err(|e| EngineError::IoError(format!("Failed to flush WAL: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| EngineError::IoError(format!("Failed to sync WAL: {}", e)))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads every complete frame. A torn trailing frame (crash mid-write) is
    /// cut off the file; a complete frame that does not decode is corruption.
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| EngineError::IoError(format!("Failed to open WAL for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| EngineError::IoError(format!("Failed to read WAL: {}", e)))?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let end = offset + 4 + len;
            if end > data.len() {
                break;
            }
            let entry: WalEntry = rmp_serde::from_slice(&data[offset + 4..end]).map_err(|e| {
                EngineError::Corruption(format!("Failed to deserialize WAL entry at {}: {}", offset, e))
            })?;
            entries.push(entry);
            offset = end;
        }

        if offset < data.len() {
            tracing::warn!(
                wal = %self.wal_path.display(),
                torn_bytes = data.len() - offset,
                "dropping torn WAL tail"
            );
            self.truncate_to(offset as u64)?;
        }
        self.entries_since_checkpoint = entries.len();
        Ok(entries)
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.wal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.wal_path)
            .map_err(|e| EngineError::IoError(format!("Failed to open WAL: {}", e)))?;
        file.set_len(len)
            .map_err(|e| EngineError::IoError(format!("Failed to truncate WAL: {}", e)))?;
        file.sync_all()
            .map_err(|e| EngineError::IoError(format!("Failed to sync WAL: {}", e)))?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.wal_path)
            .map_err(|e| EngineError::IoError(format!("Failed to open WAL file: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.truncate_to(0)?;
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes to a temp file, syncs, then renames over the old snapshot.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        write_snapshot_file(&self.snapshot_path, snapshot)
    }

    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        read_snapshot_file(&self.snapshot_path).map(Some)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)
                .map_err(|e| EngineError::IoError(format!("Failed to delete snapshot: {}", e)))?;
        }
        Ok(())
    }
}

pub fn write_snapshot_file(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::IoError(format!("Failed to create snapshot directory: {}", e))
        })?;
    }
    let temp_path = path.with_extension("tmp");
    let temp_file = File::create(&temp_path)
        .map_err(|e| EngineError::IoError(format!("Failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(temp_file);
    let serialized = rmp_serde::to_vec(snapshot)
        .map_err(|e| EngineError::Serialization(format!("Failed to serialize snapshot: {}", e)))?;
    writer
        .write_all(&serialized)
        .map_err(|e| EngineError::IoError(format!("Failed to write snapshot: {}", e)))?;
    writer
        .flush()
        .map_err(|e| EngineError::IoError(format!("Failed to flush snapshot: {}", e)))?;
    writer
        .get_mut()
        .sync_all()
        .map_err(|e| EngineError::IoError(format!("Failed to sync snapshot: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| EngineError::IoError(format!("Failed to rename snapshot: {}", e)))?;
    Ok(())
}

pub fn read_snapshot_file(path: &Path) -> Result<StateSnapshot> {
    let mut file = File::open(path)
        .map_err(|e| EngineError::IoError(format!("Failed to open snapshot: {}", e)))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| EngineError::IoError(format!("Failed to read snapshot: {}", e)))?;
    rmp_serde::from_slice(&data)
        .map_err(|e| EngineError::Corruption(format!("Failed to deserialize snapshot: {}", e)))
}

// ============================================================================
// Persistence Manager
// ============================================================================

/// What recovery found on disk.
pub struct RecoveredState {
    pub snapshot: Option<StateSnapshot>,
    pub wal_entries: Vec<WalEntry>,
}

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE_NAME), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE_NAME));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Persists the full committed content and truncates the WAL.
    pub fn checkpoint(&mut self, entries: Vec<(Vec<u8>, Vec<u8>)>, last_txn_id: u64) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(&StateSnapshot::new(entries, last_txn_id))?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.durability_mode != DurabilityMode::None && self.wal.needs_checkpoint()
    }

    pub fn recover(&mut self) -> Result<RecoveredState> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(RecoveredState {
                snapshot: None,
                wal_entries: Vec::new(),
            });
        }
        let snapshot = self.snapshot.load()?;
        let wal_entries = self.wal.read_all()?;
        Ok(RecoveredState {
            snapshot,
            wal_entries,
        })
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(txn_id: u64, key: u8) -> WalEntry {
        WalEntry {
            txn_id,
            changes: vec![(vec![0, 1, key], Change::Put(vec![key]))],
        }
    }

    #[test]
    fn test_wal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalManager::new(temp_dir.path().join("test.wal"), DurabilityMode::Sync).unwrap();
        wal.append(&entry(1, 1)).unwrap();
        wal.append(&entry(2, 2)).unwrap();
        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].txn_id, 2);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&entry(1, 1)).unwrap();
        let good_len = fs::metadata(&wal_path).unwrap().len();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[50, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), good_len);
    }

    #[test]
    fn test_checkpoint_clears_wal() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();
        persistence.log(&entry(1, 1)).unwrap();
        persistence.log(&entry(2, 2)).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 2);

        persistence.checkpoint(vec![(vec![0, 1, 1], vec![1])], 2).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);

        let recovered = persistence.recover().unwrap();
        assert!(recovered.wal_entries.is_empty());
        let snapshot = recovered.snapshot.unwrap();
        assert_eq!(snapshot.metadata.entry_count, 1);
        assert_eq!(snapshot.metadata.last_txn_id, 2);
    }

    #[test]
    fn test_memory_mode_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::None).unwrap();
        persistence.log(&entry(1, 1)).unwrap();
        assert!(!temp_dir.path().join(WAL_FILE_NAME).exists());
        assert!(persistence.recover().unwrap().wal_entries.is_empty());
    }
}
