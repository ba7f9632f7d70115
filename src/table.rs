//! One table on one shard: memtables, flushed runs, commit-log binding and
//! the write path's ordering rules.

use crate::commitlog::{CommitLog, LogDomain, ReplayPosition};
use crate::dirty_memory::{DirtyMemoryManager, FlushController};
use crate::error::StrataError;
use crate::memtable::{Memtable, MemtableList, PartitionEntry};
use crate::mutation::{Mutation, PartitionKey};
use crate::ondisk::OnDiskSet;
use crate::rate_limiter::{CanProceed, PerPartitionRateLimiter, RateLimitMode, RateLimiterLabel};
use crate::read::KeyRange;
use crate::schema::{ExecutionContext, OperationType, Schema, WorkloadClass};
use crate::stats::ShardStats;
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, OwnedMutexGuard, watch};
use tracing::{debug, info};

/// Compaction trigger: merge once a table accumulates more runs than this.
const MAX_RUNS_BEFORE_COMPACTION: usize = 8;

const ROW_LOCK_CLEANUP_THRESHOLD: usize = 1024;

/// Closes a table to new operations and waits out in-flight ones.
pub struct OpsGate {
    closed: AtomicBool,
    inflight: AtomicUsize,
    idle: Notify,
}

pub struct OpsGateGuard<'a> {
    gate: &'a OpsGate,
}

impl OpsGate {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn enter(&self) -> Result<OpsGateGuard<'_>, StrataError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::Unavailable {
                message: "table is shutting down".into(),
            });
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            self.exit();
            return Err(StrataError::Unavailable {
                message: "table is shutting down".into(),
            });
        }
        Ok(OpsGateGuard { gate: self })
    }

    fn exit(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Reject new operations and wait until in-flight ones finish.
    pub async fn close_and_drain(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let notified = self.idle.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for OpsGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OpsGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

/// Per-partition write serialization for tables with views. The replica
/// state a view update reads must not change between the read and the base
/// write becoming visible.
struct RowLocker {
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RowLocker {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, token: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > ROW_LOCK_CLEANUP_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(token).or_default())
        };
        lock.lock_owned().await
    }
}

type FlushOutcome = Option<Result<(), String>>;

pub struct Table {
    schema: RwLock<Arc<Schema>>,
    memtables: Mutex<MemtableList>,
    ondisk: OnDiskSet,
    log: Option<Arc<CommitLog>>,
    dirty: Arc<DirtyMemoryManager>,
    flush_controller: Arc<FlushController>,
    rate_limiter: Arc<PerPartitionRateLimiter>,
    write_label: RateLimiterLabel,
    read_label: RateLimiterLabel,
    row_locker: RowLocker,
    stats: Arc<ShardStats>,
    /// Timestamp at or below which data has been truncated away.
    truncated_at_micros: AtomicU64,
    highest_flushed_rp: Mutex<ReplayPosition>,
    flush_join: Mutex<Option<watch::Receiver<FlushOutcome>>>,
    flush_scheduled: AtomicBool,
    ops_gate: OpsGate,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Arc<Schema>,
        data_dir: impl Into<PathBuf>,
        log: Option<Arc<CommitLog>>,
        dirty: Arc<DirtyMemoryManager>,
        flush_controller: Arc<FlushController>,
        rate_limiter: Arc<PerPartitionRateLimiter>,
        stats: Arc<ShardStats>,
    ) -> Result<Self, StrataError> {
        let ondisk = OnDiskSet::open(data_dir, schema.id)?;
        let highest_flushed_rp = ondisk.highest_replay_position();
        if let Some(log) = &log {
            log.add_table(schema.id);
        }
        Ok(Self {
            schema: RwLock::new(schema),
            memtables: Mutex::new(MemtableList::new()),
            ondisk,
            log,
            dirty,
            flush_controller,
            rate_limiter,
            write_label: RateLimiterLabel::new(),
            read_label: RateLimiterLabel::new(),
            row_locker: RowLocker::new(),
            stats,
            truncated_at_micros: AtomicU64::new(0),
            highest_flushed_rp: Mutex::new(highest_flushed_rp),
            flush_join: Mutex::new(None),
            flush_scheduled: AtomicBool::new(false),
            ops_gate: OpsGate::new(),
        })
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read())
    }

    pub fn set_schema(&self, schema: Arc<Schema>) {
        *self.schema.write() = schema;
    }

    pub fn truncated_at_micros(&self) -> u64 {
        self.truncated_at_micros.load(Ordering::Acquire)
    }

    pub fn highest_flushed_replay_position(&self) -> ReplayPosition {
        *self.highest_flushed_rp.lock()
    }

    pub fn memtable_generation(&self) -> u64 {
        self.memtables.lock().generation()
    }

    /// Which log this table's durable writes land in, if any.
    pub fn log_domain(&self) -> Option<LogDomain> {
        self.log.as_ref().map(|log| log.domain())
    }

    /// Rate-limit check used by the batch path before any entry is logged.
    pub(crate) fn admit_write(
        &self,
        key: &PartitionKey,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
    ) -> CanProceed {
        self.account_write(key, ctx, mode)
    }

    pub(crate) fn enter_ops(&self) -> Result<OpsGateGuard<'_>, StrataError> {
        self.ops_gate.enter()
    }

    pub fn dirty_bytes_buffered(&self) -> u64 {
        let memtables = self.memtables.lock();
        memtables.active().occupancy_bytes()
            + memtables
                .sealed()
                .iter()
                .map(|m| m.occupancy_bytes())
                .sum::<u64>()
    }

    pub fn write_label(&self) -> &RateLimiterLabel {
        &self.write_label
    }

    pub fn read_label(&self) -> &RateLimiterLabel {
        &self.read_label
    }

    pub fn run_count(&self) -> usize {
        self.ondisk.run_count()
    }

    /// Account a read against the per-partition limit. Only user workloads
    /// are limited.
    pub fn account_read(
        &self,
        key: &PartitionKey,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
    ) -> CanProceed {
        if ctx.workload != WorkloadClass::User {
            return CanProceed::Yes;
        }
        let schema = self.schema();
        match schema.rate_limits.max_ops_per_second(OperationType::Read) {
            Some(limit) => {
                self.rate_limiter
                    .account_operation(&self.read_label, key.token(), limit, mode)
            }
            None => CanProceed::Yes,
        }
    }

    fn account_write(
        &self,
        key: &PartitionKey,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
    ) -> CanProceed {
        if ctx.workload != WorkloadClass::User {
            return CanProceed::Yes;
        }
        let schema = self.schema();
        match schema.rate_limits.max_ops_per_second(OperationType::Write) {
            Some(limit) => {
                self.rate_limiter
                    .account_operation(&self.write_label, key.token(), limit, mode)
            }
            None => CanProceed::Yes,
        }
    }

    fn deadline_expired(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Apply one mutation.
    ///
    /// Ordering is fixed: deadline check, rate limit, view row lock,
    /// generation capture, commit-log append, then memtable insert. A
    /// truncate that slid in between the log append and the insert bumps the
    /// generation; the write is then dropped without becoming visible, since
    /// the caller asked for its data to be gone.
    pub async fn apply(
        self: &Arc<Self>,
        mutation: Mutation,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        let _gate = self.ops_gate.enter()?;
        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.do_apply(mutation, ctx, mode, deadline)
            .await
            .inspect_err(|e| {
                self.stats.total_writes_failed.fetch_add(1, Ordering::Relaxed);
                if e.is_timeout() {
                    self.stats
                        .total_writes_timedout
                        .fetch_add(1, Ordering::Relaxed);
                }
            })
    }

    async fn do_apply(
        self: &Arc<Self>,
        mutation: Mutation,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        if Self::deadline_expired(deadline) {
            return Err(StrataError::Timeout);
        }
        if !self.schema().registered {
            return Err(StrataError::internal("write against an unregistered schema"));
        }
        if self.account_write(&mutation.key, ctx, mode) == CanProceed::No {
            self.stats
                .total_writes_rate_limited
                .fetch_add(1, Ordering::Relaxed);
            return Err(StrataError::RateLimited);
        }

        // Writes stall at the hard dirty limit until a flush frees budget.
        // When another table dominates the budget the registry flushes it;
        // this loop only drains what this table itself holds.
        while self.dirty.over_hard_limit() && self.dirty_bytes_buffered() > 0 {
            self.flush().await?;
            if Self::deadline_expired(deadline) {
                return Err(StrataError::Timeout);
            }
        }

        let schema = self.schema();
        let _row_lock = if schema.views.is_empty() {
            None
        } else {
            Some(self.row_locker.lock(mutation.key.token()).await)
        };

        let generation = self.memtables.lock().generation();

        let rp = if schema.durable_writes {
            match &self.log {
                Some(log) => {
                    log.append(schema.id, &mutation.encode())
                        .map_err(|e| StrataError::Durability {
                            keyspace: schema.keyspace_name.to_string(),
                            table: schema.table_name.to_string(),
                            key: mutation.key.hex(),
                            source: Box::new(e),
                        })?
                }
                None => ReplayPosition::default(),
            }
        } else {
            ReplayPosition::default()
        };

        // Logged but past the deadline: the entry stays durable and would
        // resurface on replay, which is harmless; the caller sees a timeout
        // and must not assume the write is absent.
        if Self::deadline_expired(deadline) {
            return Err(StrataError::Timeout);
        }

        self.apply_at_generation(mutation, rp, generation);
        Ok(())
    }

    /// Insert a logged mutation, unless a truncate advanced the generation
    /// since it was captured. Returns whether the write became visible.
    pub(crate) fn apply_at_generation(
        self: &Arc<Self>,
        mutation: Mutation,
        rp: ReplayPosition,
        generation: u64,
    ) -> bool {
        let footprint = mutation.footprint();
        {
            let mut memtables = self.memtables.lock();
            if memtables.generation() != generation {
                drop(memtables);
                debug!(
                    table = %self.schema().qualified_name(),
                    key = %mutation.key.hex(),
                    "write raced a truncate, dropping"
                );
                self.stats
                    .stale_writes_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
            memtables.active_mut().apply(&mutation, rp);
        }
        self.dirty.account(footprint);
        self.flush_controller.adjust(&self.dirty);

        if self.dirty.over_soft_limit() {
            self.schedule_background_flush();
        }
        true
    }

    /// Replay-time apply: the entry is already durable, so it goes straight
    /// into the memtable.
    pub fn apply_replayed(&self, mutation: Mutation, rp: ReplayPosition) {
        let footprint = mutation.footprint();
        self.memtables.lock().active_mut().apply(&mutation, rp);
        self.dirty.account(footprint);
    }

    fn schedule_background_flush(self: &Arc<Self>) {
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let table = Arc::clone(self);
        tokio::spawn(async move {
            // Holding the gate keeps destroy from racing this flush.
            let Ok(_gate) = table.ops_gate.enter() else {
                return;
            };
            if let Err(e) = table.flush().await {
                debug!(error = %e, "background flush failed");
            }
        });
    }

    /// Wait for any in-flight flush without starting a new one.
    async fn join_in_flight_flush(&self) {
        let rx = self.flush_join.lock().clone();
        let Some(mut rx) = rx else {
            return;
        };
        while rx.borrow_and_update().is_none() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Flush buffered writes to disk. Concurrent callers join the running
    /// flush instead of starting another.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StrataError> {
        enum Role {
            Leader(watch::Sender<FlushOutcome>),
            Follower(watch::Receiver<FlushOutcome>),
        }
        let role = {
            let mut slot = self.flush_join.lock();
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };
        match role {
            Role::Leader(tx) => {
                self.flush_scheduled.store(false, Ordering::Release);
                let result = self.do_flush().await;
                *self.flush_join.lock() = None;
                let _ = tx.send(Some(
                    result
                        .as_ref()
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                ));
                result
            }
            Role::Follower(mut rx) => loop {
                let outcome = rx.borrow_and_update().clone();
                if let Some(outcome) = outcome {
                    return outcome.map_err(|message| {
                        StrataError::internal(format!("joined flush failed: {message}"))
                    });
                }
                if rx.changed().await.is_err() {
                    return Err(StrataError::internal("flush leader went away"));
                }
            },
        }
    }

    async fn do_flush(&self) -> Result<(), StrataError> {
        let sealed = {
            let mut memtables = self.memtables.lock();
            memtables.seal_active();
            memtables.sealed().to_vec()
        };
        if sealed.is_empty() {
            return Ok(());
        }

        // A flush below the soft limit was requested, not backlog-driven;
        // it runs at the elevated extraneous-flush priority floor.
        let extraneous = !self.dirty.over_soft_limit();
        if extraneous {
            self.dirty.start_extraneous_flush();
            self.flush_controller.adjust(&self.dirty);
        }
        let result = self.write_out_sealed(&sealed);
        if extraneous {
            self.dirty.finish_extraneous_flush();
            self.flush_controller.adjust(&self.dirty);
        }
        result
    }

    fn write_out_sealed(&self, sealed: &[Arc<Memtable>]) -> Result<(), StrataError> {
        let schema = self.schema();
        let mut flushed_rp = self.highest_flushed_replay_position();
        for memtable in sealed {
            let run = self.ondisk.write_run(memtable)?;
            flushed_rp = flushed_rp.max(run.replay_position);
            {
                let mut memtables = self.memtables.lock();
                memtables.retire_sealed(std::slice::from_ref(memtable));
            }
            self.dirty.release(memtable.occupancy_bytes());
            self.flush_controller.adjust(&self.dirty);
        }
        {
            let mut high = self.highest_flushed_rp.lock();
            *high = (*high).max(flushed_rp);
        }
        self.stats.memtable_flushes.fetch_add(1, Ordering::Relaxed);
        info!(
            table = %schema.qualified_name(),
            memtables = sealed.len(),
            up_to = %flushed_rp,
            "flushed memtables"
        );

        if let Some(log) = &self.log {
            if !flushed_rp.is_default() {
                log.discard_completed_segments(schema.id, flushed_rp)?;
            }
        }
        self.ondisk.maybe_compact(MAX_RUNS_BEFORE_COMPACTION)?;
        Ok(())
    }

    /// Merged view of one partition across runs and memtables, newest data
    /// winning. `None` when the partition has no live cells.
    pub fn read_partition(&self, key: &PartitionKey) -> Option<PartitionEntry> {
        let mut merged = self.ondisk.lookup(key);
        {
            let memtables = self.memtables.lock();
            for memtable in memtables.snapshots() {
                if let Some(entry) = memtable.get(key) {
                    merged
                        .get_or_insert_with(PartitionEntry::default)
                        .apply(&entry.to_mutation(key));
                }
            }
        }
        merged.filter(|e| !e.cells.is_empty())
    }

    /// Merge runs then memtables, oldest data first, restricted to `range`.
    fn merged_range(&self, range: &KeyRange) -> OrdMap<PartitionKey, PartitionEntry> {
        let mut acc: OrdMap<PartitionKey, PartitionEntry> = OrdMap::new();
        let mut merge = |key: &PartitionKey, entry: &PartitionEntry| {
            if !range.contains(key) {
                return;
            }
            let mut current = acc.get(key).cloned().unwrap_or_default();
            current.apply(&entry.to_mutation(key));
            acc.insert(key.clone(), current);
        };
        for run in self.ondisk.runs() {
            for (key, entry) in &run.partitions {
                merge(key, entry);
            }
        }
        {
            let memtables = self.memtables.lock();
            for memtable in memtables.snapshots() {
                for (key, entry) in memtable.partitions() {
                    merge(key, entry);
                }
            }
        }
        acc
    }

    /// Ordered merged scan of a key range. Partitions with no live cells
    /// are omitted.
    pub fn scan(&self, range: &KeyRange) -> Vec<(PartitionKey, PartitionEntry)> {
        self.merged_range(range)
            .into_iter()
            .filter(|(_, entry)| !entry.cells.is_empty())
            .collect()
    }

    /// Like [`scan`](Self::scan), but keeps tombstone-only partitions so
    /// reconciling consumers see deletions.
    pub fn scan_with_tombstones(&self, range: &KeyRange) -> Vec<(PartitionKey, PartitionEntry)> {
        self.merged_range(range)
            .into_iter()
            .filter(|(_, entry)| !entry.is_empty())
            .collect()
    }

    pub fn enter_read(&self) -> Result<OpsGateGuard<'_>, StrataError> {
        self.ops_gate.enter()
    }

    // Truncation protocol pieces, driven by the cross-shard coordinator.

    /// Low replay mark: the log position before the truncating flush. On a
    /// non-durable table there is no log position to speak of.
    pub fn capture_low_replay_mark(&self) -> Result<ReplayPosition, StrataError> {
        match &self.log {
            Some(log) => log.current_position(),
            None => Ok(ReplayPosition::default()),
        }
    }

    pub fn pause_compaction(&self) {
        self.ondisk.pause_compaction();
    }

    pub fn resume_compaction(&self) {
        self.ondisk.resume_compaction();
    }

    /// Invalidate writes that are mid-flight across a truncate: anything
    /// that captured its generation before this call drops at insert.
    pub fn interrupt_in_flight_writes(&self) {
        self.memtables.lock().bump_generation();
    }

    /// Discard buffered writes wholesale instead of flushing them. Bumps
    /// the memtable generation so in-flight writes notice the truncate.
    ///
    /// An in-flight flush holds sealed memtables this clear would also
    /// release; it must finish first or the same bytes settle twice.
    pub async fn clear_memtables_for_truncate(&self) {
        self.join_in_flight_flush().await;
        let released = self.memtables.lock().clear();
        if released > 0 {
            self.dirty.release(released);
            self.flush_controller.adjust(&self.dirty);
        }
    }

    /// Drop all on-disk data at or below the cutoff and record it.
    pub fn discard_data_up_to(&self, truncated_at_micros: u64) -> Result<ReplayPosition, StrataError> {
        let high = self.ondisk.discard_runs(truncated_at_micros)?;
        self.truncated_at_micros
            .fetch_max(truncated_at_micros, Ordering::AcqRel);
        Ok(high)
    }

    pub fn snapshot(&self, tag: &str) -> Result<PathBuf, StrataError> {
        self.ondisk.snapshot(tag)
    }

    /// Newest timestamp present anywhere in this table's data.
    pub fn max_timestamp_micros(&self) -> u64 {
        let memtable_max = {
            let memtables = self.memtables.lock();
            memtables
                .snapshots()
                .iter()
                .map(|m| m.max_timestamp_micros())
                .max()
                .unwrap_or(0)
        };
        let run_max = self
            .ondisk
            .runs()
            .iter()
            .map(|r| r.max_timestamp_micros)
            .max()
            .unwrap_or(0);
        memtable_max.max(run_max)
    }

    /// Close the table to new operations, drain in-flight ones and delete
    /// all data.
    pub async fn shut_down_and_destroy(&self) -> Result<(), StrataError> {
        self.ops_gate.close_and_drain().await;
        self.join_in_flight_flush().await;
        let released = self.memtables.lock().clear();
        if released > 0 {
            self.dirty.release(released);
        }
        if let Some(log) = &self.log {
            log.remove_table(self.schema().id);
        }
        self.ondisk.destroy()
    }

    /// Detach from the commit log without deleting data (shutdown path).
    pub async fn shut_down(&self) {
        self.ops_gate.close_and_drain().await;
        if let Some(log) = &self.log {
            log.remove_table(self.schema().id);
        }
    }
}
