// ============================================================================
// Partition Log
// ============================================================================
//
// Append-only sequence of records with contiguous positions starting at 1.
// On disk every appended batch is one frame:
//
//   [u32 LE frame length][u32 LE record count]
//     ([u32 LE record length][encoded record])*
//
// A batch is written with a single write + flush (+ fsync in Sync mode).
// Recovery cuts a torn trailing frame, so the follow-ups of one command are
// either all present or all gone. A complete frame that does not decode is
// corruption.
//
// ============================================================================

use crate::core::{EngineError, NO_POSITION, PartitionId, Position, Result};
use crate::protocol::{Record, UnwrittenRecord, decode_record, encode_record};
use crate::storage::DurabilityMode;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE_NAME: &str = "records.log";

pub struct LogStream {
    partition_id: PartitionId,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    durability: DurabilityMode,
    records: VecDeque<Record>,
    next_position: Position,
}

fn encode_batch<'a, I>(records: I, buf: &mut Vec<u8>) -> Result<()>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut body = Vec::new();
    let mut count: u32 = 0;
    for record in records {
        let bytes = encode_record(record)?;
        body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(&bytes);
        count += 1;
    }
    buf.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> Option<usize> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

fn decode_batch(frame: &[u8], records: &mut Vec<Record>) -> Result<()> {
    let corrupt = || EngineError::Corruption("Log batch frame is malformed".to_string());
    let count = read_u32(frame, 0).ok_or_else(corrupt)?;
    let mut offset = 4;
    for _ in 0..count {
        let len = read_u32(frame, offset).ok_or_else(corrupt)?;
        let bytes = frame.get(offset + 4..offset + 4 + len).ok_or_else(corrupt)?;
        records.push(decode_record(bytes)?);
        offset += 4 + len;
    }
    if offset != frame.len() {
        return Err(corrupt());
    }
    Ok(())
}

/// Decodes every complete batch frame, returning the records and the byte
/// length they cover.
fn decode_frames(data: &[u8]) -> Result<(Vec<Record>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while let Some(len) = read_u32(data, offset) {
        let end = offset + 4 + len;
        if end > data.len() {
            break;
        }
        decode_batch(&data[offset + 4..end], &mut records)?;
        offset = end;
    }
    Ok((records, offset))
}

impl LogStream {
    pub fn in_memory(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            path: None,
            writer: None,
            durability: DurabilityMode::None,
            records: VecDeque::new(),
            next_position: 1,
        }
    }

    pub fn open<P: AsRef<Path>>(
        dir: P,
        partition_id: PartitionId,
        durability: DurabilityMode,
    ) -> Result<Self> {
        if durability == DurabilityMode::None {
            return Ok(Self::in_memory(partition_id));
        }
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::IoError(format!("Failed to create log directory: {}", e)))?;
        let path = dir.join(LOG_FILE_NAME);

        let mut data = Vec::new();
        if path.exists() {
            File::open(&path)
                .and_then(|mut file| file.read_to_end(&mut data))
                .map_err(|e| EngineError::IoError(format!("Failed to read log: {}", e)))?;
        }
        let (records, valid_len) = decode_frames(&data)?;
        if valid_len < data.len() {
            tracing::warn!(
                partition = partition_id,
                torn_bytes = data.len() - valid_len,
                "dropping torn log tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| EngineError::IoError(format!("Failed to open log: {}", e)))?;
            file.set_len(valid_len as u64)
                .map_err(|e| EngineError::IoError(format!("Failed to truncate log: {}", e)))?;
        }

        for pair in records.windows(2) {
            if pair[1].position != pair[0].position + 1 {
                return Err(EngineError::Corruption(format!(
                    "Log positions jump from {} to {}",
                    pair[0].position, pair[1].position
                )));
            }
        }
        let next_position = records.last().map(|r| r.position + 1).unwrap_or(1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::IoError(format!("Failed to open log: {}", e)))?;

        Ok(Self {
            partition_id,
            path: Some(path),
            writer: Some(BufWriter::new(file)),
            durability,
            records: records.into(),
            next_position,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Assigns positions to `batch` and appends it durably.
    pub fn append(&mut self, batch: Vec<UnwrittenRecord>) -> Result<Vec<Record>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut written = Vec::with_capacity(batch.len());
        let mut position = self.next_position;
        for unwritten in batch {
            written.push(unwritten.into_record(position, self.partition_id));
            position += 1;
        }

        if let Some(writer) = self.writer.as_mut() {
            let mut buf = Vec::new();
            encode_batch(&written, &mut buf)?;
            writer
                .write_all(&buf)
                .map_err(|e| EngineError::IoError(format!("Failed to write log: {}", e)))?;
            writer
                .flush()
                .map_err(|e| EngineError::IoError(format!("Failed to flush log: {}", e)))?;
            if self.durability == DurabilityMode::Sync {
                writer
                    .get_mut()
                    .sync_data()
                    .map_err(|e| EngineError::IoError(format!("Failed to sync log: {}", e)))?;
            }
        }

        self.next_position = position;
        self.records.extend(written.iter().cloned());
        Ok(written)
    }

    pub fn get(&self, position: Position) -> Option<&Record> {
        let first = self.first_position()?;
        if position < first {
            return None;
        }
        self.records.get((position - first) as usize)
    }

    /// Records with a position `>= position`, in log order.
    pub fn records_from(&self, position: Position) -> impl Iterator<Item = &Record> {
        let skip = match self.first_position() {
            Some(first) if position > first => (position - first) as usize,
            _ => 0,
        };
        self.records.iter().skip(skip)
    }

    pub fn first_position(&self) -> Option<Position> {
        self.records.front().map(|record| record.position)
    }

    pub fn last_position(&self) -> Position {
        self.records
            .back()
            .map(|record| record.position)
            .unwrap_or(NO_POSITION)
    }

    pub fn next_position(&self) -> Position {
        self.next_position
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops records with a position `<= position`. The newest record is
    /// always kept, since positions are recovered from the log itself.
    pub fn compact_up_to(&mut self, position: Position) -> Result<usize> {
        let bound = position.min(self.last_position() - 1);
        let mut removed = 0;
        while self
            .records
            .front()
            .is_some_and(|record| record.position <= bound)
        {
            self.records.pop_front();
            removed += 1;
        }
        if removed > 0 && self.path.is_some() {
            self.rewrite()?;
        }
        Ok(removed)
    }

    fn rewrite(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.writer = None;
        self.write_segment(&path, Position::MAX)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::IoError(format!("Failed to open log: {}", e)))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Writes records up to and including `up_to` to `path` in log format,
    /// through a temp file that is renamed into place.
    pub fn write_segment(&self, path: &Path, up_to: Position) -> Result<()> {
        let mut buf = Vec::new();
        for record in self.records.iter().take_while(|r| r.position <= up_to) {
            encode_batch([record], &mut buf)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::IoError(format!("Failed to create directory: {}", e)))?;
        }
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| EngineError::IoError(format!("Failed to create log segment: {}", e)))?;
        file.write_all(&buf)
            .and_then(|_| file.sync_all())
            .map_err(|e| EngineError::IoError(format!("Failed to write log segment: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| EngineError::IoError(format!("Failed to rename log segment: {}", e)))?;
        Ok(())
    }
}
