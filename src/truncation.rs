//! Persisted truncation records.
//!
//! One record per truncated table: the truncation timestamp and the shard's
//! low replay mark. Recovery consults these to skip replaying log entries
//! the truncate already made invisible. The store is rewritten whole on
//! every change through a temp file and rename.

use crate::commitlog::ReplayPosition;
use crate::error::StrataError;
use crate::schema::TableId;
use crc32c::crc32c;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const STORE_MAGIC: u32 = 0x5354_5452; // "STTR"
const RECORD_SIZE: usize = 16 + 8 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationRecord {
    pub truncated_at_micros: u64,
    /// Low replay mark captured before the truncating flush. Log entries at
    /// or below this position belong to pre-truncation data.
    pub replay_position: ReplayPosition,
}

pub struct TruncationStore {
    path: PathBuf,
    records: Mutex<HashMap<TableId, TruncationRecord>>,
}

fn encode(records: &HashMap<TableId, TruncationRecord>) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + records.len() * RECORD_SIZE);
    body.extend_from_slice(&(records.len() as u32).to_be_bytes());
    let mut ordered: Vec<_> = records.iter().collect();
    ordered.sort_by_key(|(id, _)| **id);
    for (id, record) in ordered {
        body.extend_from_slice(id.0.as_bytes());
        body.extend_from_slice(&record.truncated_at_micros.to_be_bytes());
        body.extend_from_slice(&record.replay_position.shard.to_be_bytes());
        body.extend_from_slice(&record.replay_position.segment.to_be_bytes());
        body.extend_from_slice(&record.replay_position.offset.to_be_bytes());
    }
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&STORE_MAGIC.to_be_bytes());
    out.extend_from_slice(&crc32c(&body).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn decode(bytes: &[u8]) -> Result<HashMap<TableId, TruncationRecord>, StrataError> {
    if bytes.len() < 12 {
        return Err(StrataError::Corruption("truncation store too short".into()));
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("slice len"));
    if magic != STORE_MAGIC {
        return Err(StrataError::Corruption("invalid truncation store magic".into()));
    }
    let stored_crc = u32::from_be_bytes(bytes[4..8].try_into().expect("slice len"));
    let body = &bytes[8..];
    if stored_crc != crc32c(body) {
        return Err(StrataError::Corruption("truncation store crc mismatch".into()));
    }
    let count = u32::from_be_bytes(body[0..4].try_into().expect("slice len")) as usize;
    let mut records = HashMap::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let end = pos + RECORD_SIZE;
        if end > body.len() {
            return Err(StrataError::Corruption("truncation store truncated".into()));
        }
        let rec = &body[pos..end];
        let id = TableId(Uuid::from_bytes(rec[0..16].try_into().expect("slice len")));
        records.insert(
            id,
            TruncationRecord {
                truncated_at_micros: u64::from_be_bytes(rec[16..24].try_into().expect("slice len")),
                replay_position: ReplayPosition {
                    shard: u32::from_be_bytes(rec[24..28].try_into().expect("slice len")),
                    segment: u64::from_be_bytes(rec[28..36].try_into().expect("slice len")),
                    offset: u64::from_be_bytes(rec[36..44].try_into().expect("slice len")),
                },
            },
        );
        pos = end;
    }
    Ok(records)
}

impl TruncationStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StrataError> {
        let path = path.into();
        let records = if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            decode(&bytes)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn get(&self, table: TableId) -> Option<TruncationRecord> {
        self.records.lock().get(&table).copied()
    }

    /// Record a truncation. A later truncation of the same table replaces
    /// the earlier record; the newest one is the only one recovery needs.
    pub fn record(
        &self,
        table: TableId,
        record: TruncationRecord,
    ) -> Result<(), StrataError> {
        let snapshot = {
            let mut records = self.records.lock();
            records.insert(table, record);
            records.clone()
        };
        debug!(
            table = %table,
            truncated_at = record.truncated_at_micros,
            low_mark = %record.replay_position,
            "persisting truncation record"
        );
        self.rewrite(&snapshot)
    }

    /// Forget a table's record (table dropped).
    pub fn remove(&self, table: TableId) -> Result<(), StrataError> {
        let snapshot = {
            let mut records = self.records.lock();
            if records.remove(&table).is_none() {
                return Ok(());
            }
            records.clone()
        };
        self.rewrite(&snapshot)
    }

    fn rewrite(&self, records: &HashMap<TableId, TruncationRecord>) -> Result<(), StrataError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&encode(records))?;
        file.sync_data()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
