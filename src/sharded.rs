//! Shard workers and cross-shard coordination.
//!
//! Each shard owns a [`Database`] and a worker task draining an inbox of
//! closures; shards never touch each other's state directly. Cross-shard
//! operations (truncate, drop, flush-all) run as phased barriers: a phase is
//! submitted to every shard and the coordinator waits for all of them before
//! starting the next.

use crate::config::StrataConfig;
use crate::database::{Database, KeyspaceOptions};
use crate::error::StrataError;
use crate::mutation::{Mutation, PartitionKey};
use crate::read::{QueryResult, ReadCommand};
use crate::schema::{ExecutionContext, Schema, ShardId, TableId};
use crate::stats::ShardStatsSnapshot;
use crate::truncation::TruncationRecord;
use compact_str::CompactString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SHARD_INBOX_DEPTH: usize = 1024;

type ShardTask = Box<dyn FnOnce(Arc<Database>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct ShardHandle {
    db: Arc<Database>,
    inbox: mpsc::Sender<ShardTask>,
    worker: JoinHandle<()>,
}

#[derive(Debug, Clone, Default)]
pub struct TruncateOptions {
    /// Flush before discarding so the cutoff survives restart. `None`
    /// follows the table's effective durability.
    pub durable: Option<bool>,
    /// Snapshot tag to capture the table's runs under before discarding.
    pub snapshot_tag: Option<CompactString>,
    /// Cutoff timestamp to truncate at. `None` uses the current time.
    pub truncated_at: Option<u64>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

pub struct ShardedDatabase {
    handles: Vec<ShardHandle>,
    config: Arc<StrataConfig>,
}

impl ShardedDatabase {
    pub fn open(
        base_dir: impl Into<PathBuf>,
        config: StrataConfig,
    ) -> Result<Self, StrataError> {
        config.validate()?;
        let config = Arc::new(config);
        let base_dir = base_dir.into();
        let mut handles = Vec::with_capacity(config.shard_count as usize);
        for shard in 0..config.shard_count {
            let db = Arc::new(Database::open(
                base_dir.join(format!("shard-{shard}")),
                shard,
                Arc::clone(&config),
            )?);
            let (inbox, mut rx) = mpsc::channel::<ShardTask>(SHARD_INBOX_DEPTH);
            let worker_db = Arc::clone(&db);
            let worker = tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    task(Arc::clone(&worker_db)).await;
                }
            });
            handles.push(ShardHandle { db, inbox, worker });
        }
        info!(shards = handles.len(), "sharded database open");
        Ok(Self { handles, config })
    }

    pub fn shard_count(&self) -> u32 {
        self.handles.len() as u32
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Owning shard for a partition key.
    pub fn shard_of(&self, key: &PartitionKey) -> ShardId {
        (key.token() % self.handles.len() as u64) as ShardId
    }

    /// Direct handle to one shard's database, for shard-local reads of
    /// state (stats, registries). Mutating operations go through
    /// [`submit_to`](Self::submit_to).
    pub fn shard(&self, shard: ShardId) -> &Arc<Database> {
        &self.handles[shard as usize].db
    }

    /// Run a closure on a shard's worker and wait for its result.
    pub async fn submit_to<F, Fut, T>(&self, shard: ShardId, f: F) -> Result<T, StrataError>
    where
        F: FnOnce(Arc<Database>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self
            .handles
            .get(shard as usize)
            .ok_or_else(|| StrataError::internal(format!("no such shard {shard}")))?;
        let (tx, rx) = oneshot::channel();
        let task: ShardTask = Box::new(move |db| {
            Box::pin(async move {
                let _ = tx.send(f(db).await);
            })
        });
        handle
            .inbox
            .send(task)
            .await
            .map_err(|_| StrataError::internal(format!("shard {shard} worker is gone")))?;
        rx.await
            .map_err(|_| StrataError::internal(format!("shard {shard} dropped the task")))
    }

    /// Barrier: run the closure on every shard, fail on the first error.
    async fn on_all_shards<F, Fut>(&self, f: F) -> Result<(), StrataError>
    where
        F: Fn(Arc<Database>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), StrataError>> + Send + 'static,
    {
        for shard in 0..self.shard_count() {
            self.submit_to(shard, f.clone()).await??;
        }
        Ok(())
    }

    pub async fn create_keyspace(
        &self,
        name: impl Into<CompactString>,
        options: KeyspaceOptions,
    ) -> Result<(), StrataError> {
        let name = name.into();
        self.on_all_shards(move |db| {
            let name = name.clone();
            async move { db.create_keyspace(name, options) }
        })
        .await
    }

    /// Create a table on every shard. All shards share the schema (and the
    /// table id) so cross-shard operations can address it uniformly.
    pub async fn create_table(&self, schema: Schema) -> Result<Arc<Schema>, StrataError> {
        let registered = self
            .submit_to(0, {
                let schema = schema.clone();
                move |db| async move { db.create_table(schema) }
            })
            .await??;
        for shard in 1..self.shard_count() {
            let schema = schema.clone();
            self.submit_to(shard, move |db| async move { db.create_table(schema) })
                .await??;
        }
        Ok(registered)
    }

    /// Apply one write on its owning shard.
    pub async fn apply(
        &self,
        keyspace: impl Into<CompactString>,
        table: impl Into<CompactString>,
        mutation: Mutation,
        ctx: ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        let shard = self.shard_of(&mutation.key);
        let keyspace = keyspace.into();
        let table = table.into();
        self.submit_to(shard, move |db| async move {
            db.apply(&keyspace, &table, mutation, &ctx, deadline).await
        })
        .await?
    }

    /// Run a read on an explicit shard. Single-partition commands can be
    /// routed with [`shard_of`](Self::shard_of); range scans visit shards
    /// one at a time under the caller's control.
    pub async fn query_on_shard(
        &self,
        shard: ShardId,
        cmd: ReadCommand,
        ctx: ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, StrataError> {
        self.submit_to(shard, move |db| async move {
            db.query(cmd, &ctx, deadline).await
        })
        .await?
    }

    pub async fn flush_table(&self, id: TableId) -> Result<(), StrataError> {
        self.on_all_shards(move |db| async move {
            db.table_by_id(id)?.flush().await
        })
        .await
    }

    pub async fn flush_all(&self) -> Result<(), StrataError> {
        self.on_all_shards(|db| async move { db.flush_all_tables().await })
            .await
    }

    pub async fn snapshot_table(&self, id: TableId, tag: &str) -> Result<(), StrataError> {
        let tag = CompactString::new(tag);
        self.on_all_shards(move |db| {
            let tag = tag.clone();
            async move {
                db.table_by_id(id)?.snapshot(&tag)?;
                Ok(())
            }
        })
        .await
    }

    /// Truncate a table on every shard.
    ///
    /// Phases, each a barrier across all shards: pause compaction; capture
    /// low replay marks; flush (durable) or clear (non-durable) and discard
    /// on-disk data; persist truncation records; resume compaction.
    /// Compaction is re-enabled even when a middle phase fails.
    pub async fn truncate_table(
        &self,
        keyspace: &str,
        table: &str,
        options: TruncateOptions,
    ) -> Result<(), StrataError> {
        let id = self.shard(0).find_table(keyspace, table)?.schema().id;
        let truncated_at = options.truncated_at.unwrap_or_else(now_micros);
        info!(table = %format!("{keyspace}.{table}"), truncated_at, "truncating table");

        self.on_all_shards(move |db| async move {
            db.table_by_id(id)?.pause_compaction();
            Ok(())
        })
        .await?;

        let result = self
            .truncate_phases(id, truncated_at, options)
            .await;

        // Unconditional: compaction must come back even on failure.
        let resumed = self
            .on_all_shards(move |db| async move {
                db.table_by_id(id)?.resume_compaction();
                Ok(())
            })
            .await;
        if let Err(e) = &resumed {
            error!(error = %e, "failed to re-enable compaction after truncate");
        }
        result.and(resumed)
    }

    async fn truncate_phases(
        &self,
        id: TableId,
        truncated_at: u64,
        options: TruncateOptions,
    ) -> Result<(), StrataError> {
        let mut low_marks = Vec::with_capacity(self.handles.len());
        for shard in 0..self.shard_count() {
            let low_mark = self
                .submit_to(shard, move |db| async move {
                    db.table_by_id(id)?.capture_low_replay_mark()
                })
                .await??;
            low_marks.push(low_mark);
        }

        for shard in 0..self.shard_count() {
            let low_mark = low_marks[shard as usize];
            let options = options.clone();
            self.submit_to(shard, move |db| async move {
                let table = db.table_by_id(id)?;
                let durable = options
                    .durable
                    .unwrap_or_else(|| table.schema().durable_writes);
                let mut low_mark = low_mark;
                if durable {
                    table.flush().await?;
                    // Writes that landed between mark capture and the flush
                    // advanced the flushed position; the mark is raised to
                    // cover them, never lowered.
                    low_mark = low_mark.max(table.highest_flushed_replay_position());
                    // Writes still between their log append and memtable
                    // insert raced the truncate; advancing the generation
                    // drops them at insert.
                    table.interrupt_in_flight_writes();
                } else {
                    table.clear_memtables_for_truncate().await;
                }
                if let Some(tag) = &options.snapshot_tag {
                    table.snapshot(tag)?;
                }
                let removed_rp = table.discard_data_up_to(truncated_at)?;
                // The record goes down first: data is already gone, so even
                // a low-mark violation must leave the cutoff on disk.
                db.record_truncation(
                    id,
                    TruncationRecord {
                        truncated_at_micros: truncated_at,
                        replay_position: low_mark.max(removed_rp),
                    },
                )?;
                if durable && !removed_rp.is_default() && removed_rp > low_mark {
                    return Err(StrataError::internal(format!(
                        "truncate discarded data past the low mark ({removed_rp} > {low_mark})"
                    )));
                }
                Ok(())
            })
            .await??;
        }
        Ok(())
    }

    /// Drop a table everywhere: truncate semantics for readers, then detach,
    /// drain in-flight operations and delete the data.
    pub async fn drop_table(&self, keyspace: &str, table: &str) -> Result<(), StrataError> {
        let id = self.shard(0).find_table(keyspace, table)?.schema().id;
        info!(table = %format!("{keyspace}.{table}"), "dropping table");
        self.on_all_shards(move |db| async move {
            let table = db.detach_table(id)?;
            table.shut_down_and_destroy().await?;
            db.truncation_store().remove(id)
        })
        .await
    }

    /// Replay commit logs on every shard. Call once after open, before
    /// serving traffic.
    pub async fn recover(&self) -> Result<(), StrataError> {
        self.on_all_shards(|db| async move { db.recover().map(|_| ()) })
            .await
    }

    /// Sum of all shards' counters.
    pub fn aggregate_stats(&self) -> ShardStatsSnapshot {
        let mut total = ShardStatsSnapshot::default();
        for handle in &self.handles {
            let s = handle.db.stats().snapshot();
            total.total_writes += s.total_writes;
            total.total_writes_failed += s.total_writes_failed;
            total.total_writes_timedout += s.total_writes_timedout;
            total.total_writes_rate_limited += s.total_writes_rate_limited;
            total.total_reads += s.total_reads;
            total.total_reads_failed += s.total_reads_failed;
            total.total_reads_rate_limited += s.total_reads_rate_limited;
            total.stale_writes_dropped += s.stale_writes_dropped;
            total.short_data_queries += s.short_data_queries;
            total.short_mutation_queries += s.short_mutation_queries;
            total.memtable_flushes += s.memtable_flushes;
        }
        total
    }

    /// Stop the shard workers. Queued tasks finish first.
    pub async fn shutdown(self) {
        for handle in self.handles {
            drop(handle.inbox);
            if let Err(e) = handle.worker.await {
                warn!(error = %e, "shard worker ended abnormally");
            }
        }
    }
}
