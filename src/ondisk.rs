//! On-disk run storage for flushed memtables.
//!
//! Each flush produces one immutable run file: a fixed header followed by
//! one crc-protected frame per partition, carrying the partition's merged
//! state in mutation form. Runs are written to a temporary name, synced and
//! renamed into place, so a crash mid-flush leaves no half-visible run.

use crate::commitlog::ReplayPosition;
use crate::commitlog::frame::{FrameError, FrameReader, FrameWriter, PAYLOAD_MUTATION};
use crate::error::StrataError;
use crate::memtable::{Memtable, PartitionEntry};
use crate::mutation::{Mutation, PartitionKey};
use crate::schema::TableId;
use im::OrdMap;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const RUN_MAGIC: u32 = 0x5354_524E; // "STRN"
pub const RUN_HEADER_SIZE: usize = 64;
pub const RUN_SUFFIX: &str = ".stratarun";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHeader {
    pub magic: u32,
    pub format_version: u16,
    pub run_id: u64,
    pub replay_position: ReplayPosition,
    pub max_timestamp_micros: u64,
}

impl RunHeader {
    pub fn to_bytes(&self) -> [u8; RUN_HEADER_SIZE] {
        let mut out = [0u8; RUN_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.format_version.to_be_bytes());
        out[8..16].copy_from_slice(&self.run_id.to_be_bytes());
        out[16..20].copy_from_slice(&self.replay_position.shard.to_be_bytes());
        out[24..32].copy_from_slice(&self.replay_position.segment.to_be_bytes());
        out[32..40].copy_from_slice(&self.replay_position.offset.to_be_bytes());
        out[40..48].copy_from_slice(&self.max_timestamp_micros.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; RUN_HEADER_SIZE]) -> Result<Self, StrataError> {
        let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("slice len"));
        if magic != RUN_MAGIC {
            return Err(StrataError::Corruption("invalid run magic".into()));
        }
        Ok(Self {
            magic,
            format_version: u16::from_be_bytes(bytes[4..6].try_into().expect("slice len")),
            run_id: u64::from_be_bytes(bytes[8..16].try_into().expect("slice len")),
            replay_position: ReplayPosition {
                shard: u32::from_be_bytes(bytes[16..20].try_into().expect("slice len")),
                segment: u64::from_be_bytes(bytes[24..32].try_into().expect("slice len")),
                offset: u64::from_be_bytes(bytes[32..40].try_into().expect("slice len")),
            },
            max_timestamp_micros: u64::from_be_bytes(bytes[40..48].try_into().expect("slice len")),
        })
    }
}

/// One immutable flushed run. The partition map is kept resident; the file
/// is the durable form and the recovery source.
#[derive(Debug)]
pub struct Run {
    pub id: u64,
    pub path: PathBuf,
    pub partitions: OrdMap<PartitionKey, PartitionEntry>,
    /// Highest commit-log position covered by this run's data.
    pub replay_position: ReplayPosition,
    pub max_timestamp_micros: u64,
    pub size_bytes: u64,
}

struct SetInner {
    runs: Vec<Arc<Run>>,
    next_run_id: u64,
    compaction_paused: u32,
}

/// The set of flushed runs for one table.
pub struct OnDiskSet {
    dir: PathBuf,
    table: TableId,
    inner: Mutex<SetInner>,
}

fn run_path(dir: &Path, run_id: u64) -> PathBuf {
    dir.join(format!("run_{run_id:016}{RUN_SUFFIX}"))
}

fn load_run(path: &Path) -> Result<Run, StrataError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header_bytes = [0u8; RUN_HEADER_SIZE];
    reader.read_exact(&mut header_bytes).map_err(|_| {
        StrataError::Corruption(format!("run {} shorter than header", path.display()))
    })?;
    let header = RunHeader::from_bytes(&header_bytes)?;

    let mut partitions = OrdMap::new();
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.next_frame() {
            Ok(Some(frame)) => {
                let mutation = Mutation::decode(&frame.payload)?;
                let mut entry = PartitionEntry::default();
                entry.apply(&mutation);
                partitions.insert(mutation.key.clone(), entry);
            }
            Ok(None) => break,
            Err(FrameError::Io(e)) => return Err(StrataError::Io(std::io::Error::other(e))),
            Err(_) => {
                return Err(StrataError::Corruption(format!(
                    "corrupt frame in run {}",
                    path.display()
                )));
            }
        }
    }

    Ok(Run {
        id: header.run_id,
        path: path.to_path_buf(),
        partitions,
        replay_position: header.replay_position,
        max_timestamp_micros: header.max_timestamp_micros,
        size_bytes: fs::metadata(path)?.len(),
    })
}

fn write_run_file(
    dir: &Path,
    table: TableId,
    run_id: u64,
    partitions: &OrdMap<PartitionKey, PartitionEntry>,
    replay_position: ReplayPosition,
) -> Result<Run, StrataError> {
    fs::create_dir_all(dir)?;
    let final_path = run_path(dir, run_id);
    let tmp_path = final_path.with_extension("tmp");

    let max_timestamp_micros = partitions
        .values()
        .map(|e| e.max_timestamp_micros())
        .max()
        .unwrap_or(0);
    let header = RunHeader {
        magic: RUN_MAGIC,
        format_version: 1,
        run_id,
        replay_position,
        max_timestamp_micros,
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.to_bytes())?;
    let mut frames = FrameWriter::new(&mut writer);
    for (key, entry) in partitions {
        let payload = entry.to_mutation(key).encode();
        frames
            .append(
                *table.0.as_bytes(),
                entry.max_timestamp_micros(),
                PAYLOAD_MUTATION,
                &payload,
            )
            .map_err(|e| StrataError::Io(std::io::Error::other(e.to_string())))?;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;
    drop(writer);
    fs::rename(&tmp_path, &final_path)?;

    Ok(Run {
        id: run_id,
        path: final_path.clone(),
        partitions: partitions.clone(),
        replay_position,
        max_timestamp_micros,
        size_bytes: fs::metadata(&final_path)?.len(),
    })
}

impl OnDiskSet {
    /// Open the run set, loading any runs a previous process left behind.
    /// Stray `.tmp` files are incomplete flushes and are removed.
    pub fn open(dir: impl Into<PathBuf>, table: TableId) -> Result<Self, StrataError> {
        let dir = dir.into();
        let mut runs = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".tmp") {
                    warn!(path = %entry.path().display(), "removing incomplete run file");
                    fs::remove_file(entry.path())?;
                    continue;
                }
                if name.starts_with("run_") && name.ends_with(RUN_SUFFIX) {
                    runs.push(Arc::new(load_run(&entry.path())?));
                }
            }
        }
        runs.sort_by_key(|r| r.id);
        let next_run_id = runs.last().map_or(1, |r| r.id + 1);
        Ok(Self {
            dir,
            table,
            inner: Mutex::new(SetInner {
                runs,
                next_run_id,
                compaction_paused: 0,
            }),
        })
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().runs.iter().map(|r| r.size_bytes).sum()
    }

    /// Highest commit-log position durably covered by any run.
    pub fn highest_replay_position(&self) -> ReplayPosition {
        self.inner
            .lock()
            .runs
            .iter()
            .map(|r| r.replay_position)
            .max()
            .unwrap_or_default()
    }

    /// Persist a sealed memtable as a new run.
    pub fn write_run(&self, memtable: &Memtable) -> Result<Arc<Run>, StrataError> {
        let run_id = {
            let mut inner = self.inner.lock();
            let id = inner.next_run_id;
            inner.next_run_id += 1;
            id
        };
        let rp = memtable.replay_position_range().1;
        let run = Arc::new(write_run_file(
            &self.dir,
            self.table,
            run_id,
            memtable.partitions(),
            rp,
        )?);
        debug!(
            table = %self.table,
            run = run.id,
            partitions = run.partitions.len(),
            bytes = run.size_bytes,
            "wrote run"
        );
        self.inner.lock().runs.push(Arc::clone(&run));
        Ok(run)
    }

    /// Merged view of one partition across all runs, oldest first so newer
    /// runs win ties the same way memtable merging does.
    pub fn lookup(&self, key: &PartitionKey) -> Option<PartitionEntry> {
        let runs = self.inner.lock().runs.clone();
        let mut merged: Option<PartitionEntry> = None;
        for run in &runs {
            if let Some(entry) = run.partitions.get(key) {
                let acc = merged.get_or_insert_with(PartitionEntry::default);
                acc.apply(&entry.to_mutation(key));
            }
        }
        merged
    }

    /// Snapshot of the current run list for a range read.
    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.inner.lock().runs.clone()
    }

    /// Drop every run whose data is entirely at or below the cutoff
    /// timestamp. Returns the highest replay position among removed runs so
    /// the caller can account what the log may now discard.
    pub fn discard_runs(&self, truncated_at_micros: u64) -> Result<ReplayPosition, StrataError> {
        let removed = {
            let mut inner = self.inner.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = inner
                .runs
                .drain(..)
                .partition(|r| r.max_timestamp_micros <= truncated_at_micros);
            inner.runs = kept;
            removed
        };
        let mut high = ReplayPosition::default();
        for run in removed {
            high = high.max(run.replay_position);
            debug!(table = %self.table, run = run.id, "discarding run");
            fs::remove_file(&run.path)?;
        }
        Ok(high)
    }

    /// While paused, `maybe_compact` is a no-op. Pauses nest.
    pub fn pause_compaction(&self) {
        self.inner.lock().compaction_paused += 1;
    }

    pub fn resume_compaction(&self) {
        let mut inner = self.inner.lock();
        if inner.compaction_paused == 0 {
            panic!("compaction pause counter underflow");
        }
        inner.compaction_paused -= 1;
    }

    pub fn compaction_paused(&self) -> bool {
        self.inner.lock().compaction_paused > 0
    }

    /// Merge all runs into one when the set has grown past `max_runs`.
    /// Returns whether a compaction happened.
    pub fn maybe_compact(&self, max_runs: usize) -> Result<bool, StrataError> {
        let (runs, run_id) = {
            let mut inner = self.inner.lock();
            if inner.compaction_paused > 0 || inner.runs.len() <= max_runs {
                return Ok(false);
            }
            let id = inner.next_run_id;
            inner.next_run_id += 1;
            (inner.runs.clone(), id)
        };

        let mut merged: OrdMap<PartitionKey, PartitionEntry> = OrdMap::new();
        let mut rp = ReplayPosition::default();
        for run in &runs {
            rp = rp.max(run.replay_position);
            for (key, entry) in &run.partitions {
                let mut acc = merged.get(key).cloned().unwrap_or_default();
                acc.apply(&entry.to_mutation(key));
                merged.insert(key.clone(), acc);
            }
        }
        let compacted = Arc::new(write_run_file(&self.dir, self.table, run_id, &merged, rp)?);

        {
            let mut inner = self.inner.lock();
            inner
                .runs
                .retain(|r| !runs.iter().any(|old| Arc::ptr_eq(r, old)));
            inner.runs.push(Arc::clone(&compacted));
            inner.runs.sort_by_key(|r| r.id);
        }
        for run in &runs {
            fs::remove_file(&run.path)?;
        }
        debug!(table = %self.table, run = compacted.id, inputs = runs.len(), "compacted runs");
        Ok(true)
    }

    /// Hard-link every current run into `snapshots/<tag>/`, falling back to
    /// a copy on filesystems without link support.
    pub fn snapshot(&self, tag: &str) -> Result<PathBuf, StrataError> {
        let snap_dir = self.dir.join("snapshots").join(tag);
        fs::create_dir_all(&snap_dir)?;
        let runs = self.inner.lock().runs.clone();
        for run in &runs {
            let name = run
                .path
                .file_name()
                .ok_or_else(|| StrataError::internal("run path without file name"))?;
            let dest = snap_dir.join(name);
            if fs::hard_link(&run.path, &dest).is_err() {
                fs::copy(&run.path, &dest)?;
            }
        }
        Ok(snap_dir)
    }

    /// Remove every run file and the table directory. The set must not be
    /// used afterwards.
    pub fn destroy(&self) -> Result<(), StrataError> {
        let runs = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.runs)
        };
        for run in runs {
            if run.path.exists() {
                fs::remove_file(&run.path)?;
            }
        }
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
