//! Durable commit log.
//!
//! Append-only, per-shard, one instance per domain. Every append yields a
//! [`ReplayPosition`]; positions are strictly increasing per shard and
//! domain. Segment files are only discarded once every table bound to the
//! log has reported durable persistence up to a covering position — the log
//! never assumes a table is caught up on its own.

pub mod frame;
pub mod segment;

use crate::error::StrataError;
use crate::schema::{ShardId, TableId};
use frame::{FrameError, FrameReader, PAYLOAD_MUTATION};
use parking_lot::Mutex;
use segment::{SEGMENT_SUFFIX, SegmentConfig, SegmentError, SegmentManager};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Two log domains exist per shard: table data and schema-bearing internal
/// tables. A single atomic batch append must target one domain only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogDomain {
    Data,
    Schema,
}

/// Totally ordered marker for a point in one shard's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReplayPosition {
    pub shard: ShardId,
    pub segment: u64,
    pub offset: u64,
}

impl ReplayPosition {
    pub fn is_default(&self) -> bool {
        *self == ReplayPosition::default()
    }
}

impl std::fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.shard, self.segment, self.offset)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: u64,
    pub frames: u64,
    pub bytes: u64,
}

struct LogInner {
    segments: SegmentManager,
}

pub struct CommitLog {
    shard: ShardId,
    domain: LogDomain,
    dir: PathBuf,
    inner: Mutex<LogInner>,
    /// Flushed-up-to positions reported per bound table. A bound table that
    /// has reported nothing pins every segment.
    flushed: Mutex<HashMap<TableId, ReplayPosition>>,
    fail_appends: AtomicU32,
    sync_every_append: bool,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn existing_segment_seqs(dir: &Path) -> Result<Vec<u64>, StrataError> {
    let mut seqs = Vec::new();
    if !dir.exists() {
        return Ok(seqs);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = name
            .strip_prefix("segment_")
            .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(seq) = stem.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

impl From<SegmentError> for StrataError {
    fn from(value: SegmentError) -> Self {
        match value {
            SegmentError::Io(e) => StrataError::Io(e),
            SegmentError::InvalidMagic => StrataError::Corruption("invalid segment magic".into()),
            SegmentError::NotOpen => StrataError::internal("commit log segment not open"),
        }
    }
}

impl CommitLog {
    pub fn open(
        dir: impl Into<PathBuf>,
        shard: ShardId,
        domain: LogDomain,
        config: SegmentConfig,
        sync_every_append: bool,
    ) -> Result<Self, StrataError> {
        let dir = dir.into();
        let next_seq = existing_segment_seqs(&dir)?.last().map_or(1, |s| s + 1);
        let mut segments = SegmentManager::new(&dir, config, shard);
        segments.open_active(next_seq)?;
        Ok(Self {
            shard,
            domain,
            dir,
            inner: Mutex::new(LogInner { segments }),
            flushed: Mutex::new(HashMap::new()),
            fail_appends: AtomicU32::new(0),
            sync_every_append,
        })
    }

    pub fn domain(&self) -> LogDomain {
        self.domain
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Position the next append will land at or after.
    pub fn current_position(&self) -> Result<ReplayPosition, StrataError> {
        let inner = self.inner.lock();
        let (segment, offset) = inner.segments.active_position()?;
        Ok(ReplayPosition {
            shard: self.shard,
            segment,
            offset,
        })
    }

    /// Test hook: fail the next `n` appends with an io error.
    pub fn inject_append_failures(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    pub fn append(&self, table: TableId, payload: &[u8]) -> Result<ReplayPosition, StrataError> {
        if self.take_injected_failure() {
            return Err(StrataError::Io(std::io::Error::other(
                "injected append failure",
            )));
        }
        let mut inner = self.inner.lock();
        if inner.segments.should_rotate().is_some() {
            inner.segments.rotate()?;
        }
        let (segment, offset) = inner.segments.append_frame(
            *table.0.as_bytes(),
            now_micros(),
            PAYLOAD_MUTATION,
            payload,
            self.sync_every_append,
        )?;
        Ok(ReplayPosition {
            shard: self.shard,
            segment,
            offset,
        })
    }

    /// Atomic multi-entry append: all frames land in one segment write burst
    /// followed by a single sync, so either the whole batch is recoverable
    /// or a crash truncates it at a frame boundary.
    pub fn append_batch(
        &self,
        entries: &[(TableId, Vec<u8>)],
    ) -> Result<Vec<ReplayPosition>, StrataError> {
        if self.take_injected_failure() {
            return Err(StrataError::Io(std::io::Error::other(
                "injected append failure",
            )));
        }
        let mut inner = self.inner.lock();
        if inner.segments.should_rotate().is_some() {
            inner.segments.rotate()?;
        }
        let ts = now_micros();
        let mut positions = Vec::with_capacity(entries.len());
        for (table, payload) in entries {
            let (segment, offset) = inner.segments.append_frame(
                *table.0.as_bytes(),
                ts,
                PAYLOAD_MUTATION,
                payload,
                false,
            )?;
            positions.push(ReplayPosition {
                shard: self.shard,
                segment,
                offset,
            });
        }
        if self.sync_every_append {
            inner.segments.sync_active()?;
        }
        Ok(positions)
    }

    /// Bind a table to this log. Until the table reports a flushed position,
    /// no segment it may have written to can be discarded.
    pub fn add_table(&self, table: TableId) {
        self.flushed.lock().entry(table).or_default();
    }

    pub fn remove_table(&self, table: TableId) {
        self.flushed.lock().remove(&table);
    }

    /// A table reports everything up to `up_to` is durably persisted outside
    /// the log. Closed segments wholly covered by every bound table's report
    /// are deleted.
    pub fn discard_completed_segments(
        &self,
        table: TableId,
        up_to: ReplayPosition,
    ) -> Result<(), StrataError> {
        {
            let mut flushed = self.flushed.lock();
            let entry = flushed.entry(table).or_default();
            if up_to > *entry {
                *entry = up_to;
            }
        }
        self.reclaim_segments()
    }

    fn reclaim_segments(&self) -> Result<(), StrataError> {
        let min_flushed_segment = {
            let flushed = self.flushed.lock();
            match flushed.values().map(|rp| rp.segment).min() {
                Some(seg) => seg,
                None => return Ok(()),
            }
        };
        let active_seq = {
            let inner = self.inner.lock();
            inner.segments.active_position()?.0
        };
        for seq in existing_segment_seqs(&self.dir)? {
            if seq < min_flushed_segment && seq < active_seq {
                let path = SegmentManager::segment_path(&self.dir, seq);
                debug!(segment = seq, path = %path.display(), "discarding commit log segment");
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Replay every surviving frame in segment order. The visitor receives
    /// the owning table, the frame's replay position and the raw payload.
    /// A truncated tail in the newest segment is tolerated (crash mid-write);
    /// anything else is corruption.
    pub fn replay<F>(&self, mut visit: F) -> Result<ReplayStats, StrataError>
    where
        F: FnMut(TableId, ReplayPosition, &[u8]) -> Result<(), StrataError>,
    {
        let seqs = existing_segment_seqs(&self.dir)?;
        let last_seq = seqs.last().copied();
        let mut stats = ReplayStats::default();
        for seq in seqs {
            let path = SegmentManager::segment_path(&self.dir, seq);
            let mut buf_reader = BufReader::new(File::open(&path)?);
            let mut header = [0u8; segment::SEGMENT_HEADER_SIZE];
            {
                use std::io::Read;
                buf_reader.read_exact(&mut header).map_err(|_| {
                    StrataError::Corruption(format!("segment {seq} shorter than header"))
                })?;
            }
            segment::SegmentHeader::from_bytes(&header)?;
            let mut reader = FrameReader::new(buf_reader);

            let mut offset = segment::SEGMENT_HEADER_SIZE as u64;
            loop {
                match reader.next_frame() {
                    Ok(Some(f)) => {
                        let rp = ReplayPosition {
                            shard: self.shard,
                            segment: seq,
                            offset,
                        };
                        let frame_bytes = 4 + f.frame_length as u64;
                        visit(TableId(Uuid::from_bytes(f.table_id)), rp, &f.payload)?;
                        offset += frame_bytes;
                        stats.frames += 1;
                        stats.bytes += frame_bytes;
                    }
                    Ok(None) => break,
                    Err(FrameError::Truncation) if Some(seq) == last_seq => {
                        warn!(segment = seq, "truncated tail in newest segment, stopping replay");
                        break;
                    }
                    Err(FrameError::Truncation) => {
                        return Err(StrataError::Corruption(format!(
                            "segment {seq} truncated mid-stream"
                        )));
                    }
                    Err(FrameError::Corruption) => {
                        return Err(StrataError::Corruption(format!(
                            "segment {seq} has a corrupt frame at offset {offset}"
                        )));
                    }
                    Err(FrameError::Io(e)) => {
                        return Err(StrataError::Io(std::io::Error::other(e)));
                    }
                }
            }
            stats.segments += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitLog, LogDomain, ReplayPosition};
    use crate::schema::TableId;
    use tempfile::tempdir;

    fn open_log(dir: &std::path::Path) -> CommitLog {
        CommitLog::open(dir, 0, LogDomain::Data, Default::default(), true).expect("open log")
    }

    #[test]
    fn append_positions_strictly_increase() {
        let dir = tempdir().expect("temp dir");
        let log = open_log(dir.path());
        let table = TableId::new();
        let mut last = ReplayPosition::default();
        for i in 0..100u8 {
            let rp = log.append(table, &[i; 24]).expect("append");
            assert!(rp > last);
            last = rp;
        }
    }

    #[test]
    fn injected_failures_fail_exactly_n_appends() {
        let dir = tempdir().expect("temp dir");
        let log = open_log(dir.path());
        let table = TableId::new();
        log.inject_append_failures(2);
        assert!(log.append(table, b"a").is_err());
        assert!(log.append(table, b"b").is_err());
        log.append(table, b"c").expect("third append succeeds");
    }

    #[test]
    fn replay_returns_appended_payloads_in_order() {
        let dir = tempdir().expect("temp dir");
        let table = TableId::new();
        let mut appended = Vec::new();
        {
            let log = open_log(dir.path());
            for i in 0..10u8 {
                let rp = log.append(table, &[i; 8]).expect("append");
                appended.push((rp, vec![i; 8]));
            }
        }
        let log = open_log(dir.path());
        let mut seen = Vec::new();
        log.replay(|tid, rp, payload| {
            assert_eq!(tid, table);
            seen.push((rp, payload.to_vec()));
            Ok(())
        })
        .expect("replay");
        assert_eq!(seen, appended);
    }

    #[test]
    fn discard_waits_for_every_bound_table() {
        let dir = tempdir().expect("temp dir");
        let log = CommitLog::open(
            dir.path(),
            0,
            LogDomain::Data,
            super::SegmentConfig {
                max_segment_bytes: 256,
                max_segment_age: std::time::Duration::from_secs(3600),
            },
            true,
        )
        .expect("open log");
        let fast = TableId::new();
        let slow = TableId::new();
        log.add_table(fast);
        log.add_table(slow);

        let mut last = ReplayPosition::default();
        for i in 0..20u8 {
            last = log.append(fast, &[i; 64]).expect("append");
        }
        let before = super::existing_segment_seqs(dir.path()).expect("seqs").len();
        assert!(before > 1);

        // The fast table is caught up but the slow one pins everything.
        log.discard_completed_segments(fast, last).expect("discard");
        assert_eq!(
            super::existing_segment_seqs(dir.path()).expect("seqs").len(),
            before
        );

        log.discard_completed_segments(slow, last).expect("discard");
        let after = super::existing_segment_seqs(dir.path()).expect("seqs");
        assert!(after.len() < before);
        assert!(after.iter().all(|&s| s >= last.segment));
    }

    #[test]
    fn batch_append_is_contiguous() {
        let dir = tempdir().expect("temp dir");
        let log = open_log(dir.path());
        let t = TableId::new();
        let entries = vec![(t, vec![1u8; 16]), (t, vec![2u8; 16]), (t, vec![3u8; 16])];
        let rps = log.append_batch(&entries).expect("batch");
        assert_eq!(rps.len(), 3);
        assert!(rps.windows(2).all(|w| w[0] < w[1]));
        assert!(rps.iter().all(|rp| rp.segment == rps[0].segment));
    }
}
