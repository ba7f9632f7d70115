//! Per-shard database: keyspace and table registry, write/read execution,
//! and recovery from the commit logs.

use crate::commitlog::{CommitLog, LogDomain, ReplayPosition, ReplayStats};
use crate::config::StrataConfig;
use crate::dirty_memory::{DirtyMemoryManager, FlushController};
use crate::error::{ResourceType, StrataError};
use crate::mutation::{Mutation, PartitionKey};
use crate::querier_cache::{Querier, QuerierCache};
use crate::rate_limiter::{CanProceed, PerPartitionRateLimiter, RateLimitMode};
use crate::read::{
    CacheTemperature, QueryResult, ReadCommand, ReconcilableResult, ResultMemoryLimiter, Row,
};
use crate::reader_concurrency::{ReaderConcurrencyGroup, ReaderPermit, ReaderResources};
use crate::schema::{ExecutionContext, Schema, ShardId, TableId};
use crate::stats::ShardStats;
use crate::table::Table;
use crate::truncation::{TruncationRecord, TruncationStore};
use compact_str::CompactString;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct KeyspaceOptions {
    pub durable_writes: bool,
    /// System keyspaces draw on the system dirty-memory budget and log to
    /// the schema domain, so user pressure cannot starve them.
    pub system: bool,
}

impl Default for KeyspaceOptions {
    fn default() -> Self {
        Self {
            durable_writes: true,
            system: false,
        }
    }
}

pub struct Database {
    shard: ShardId,
    config: Arc<StrataConfig>,
    base_dir: PathBuf,
    data_log: Arc<CommitLog>,
    schema_log: Arc<CommitLog>,
    user_dirty: Arc<DirtyMemoryManager>,
    system_dirty: Arc<DirtyMemoryManager>,
    flush_controller: Arc<FlushController>,
    rate_limiter: Arc<PerPartitionRateLimiter>,
    reader_concurrency: ReaderConcurrencyGroup,
    querier_cache: QuerierCache,
    result_memory: ResultMemoryLimiter,
    truncation_store: TruncationStore,
    stats: Arc<ShardStats>,
    tables: RwLock<HashMap<TableId, Arc<Table>>>,
    names: RwLock<HashMap<(CompactString, CompactString), TableId>>,
    keyspaces: RwLock<HashMap<CompactString, KeyspaceOptions>>,
}

impl Database {
    pub fn open(
        base_dir: impl Into<PathBuf>,
        shard: ShardId,
        config: Arc<StrataConfig>,
    ) -> Result<Self, StrataError> {
        config.validate()?;
        let base_dir = base_dir.into();
        let segment_config = config.segment_config();
        let data_log = Arc::new(CommitLog::open(
            base_dir.join("data_log"),
            shard,
            LogDomain::Data,
            segment_config.clone(),
            config.sync_every_append,
        )?);
        let schema_log = Arc::new(CommitLog::open(
            base_dir.join("schema_log"),
            shard,
            LogDomain::Schema,
            segment_config,
            config.sync_every_append,
        )?);
        let flush_controller = Arc::new(FlushController::new(
            config.flush_control_points.iter().copied(),
            config.flush_static_shares,
            config.extraneous_flush_shares,
        ));
        Ok(Self {
            shard,
            data_log,
            schema_log,
            user_dirty: Arc::new(DirtyMemoryManager::new(
                config.dirty_soft_limit_bytes,
                config.dirty_hard_limit_bytes,
            )),
            system_dirty: Arc::new(DirtyMemoryManager::new(
                config.system_dirty_soft_limit_bytes,
                config.system_dirty_hard_limit_bytes,
            )),
            flush_controller,
            rate_limiter: Arc::new(PerPartitionRateLimiter::new(Duration::from_millis(
                config.rate_limit_window_ms,
            ))),
            reader_concurrency: ReaderConcurrencyGroup::new(
                ReaderResources::new(config.user_read_count, config.user_read_memory_bytes),
                ReaderResources::new(config.system_read_count, config.system_read_memory_bytes),
                ReaderResources::new(
                    config.maintenance_read_count,
                    config.maintenance_read_memory_bytes,
                ),
            ),
            querier_cache: QuerierCache::new(
                config.querier_cache_capacity,
                Duration::from_millis(config.querier_cache_ttl_ms),
            ),
            result_memory: ResultMemoryLimiter::new(config.result_memory_limit_bytes),
            truncation_store: TruncationStore::open(base_dir.join("truncations"))?,
            stats: Arc::new(ShardStats::default()),
            tables: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            keyspaces: RwLock::new(HashMap::new()),
            config,
            base_dir,
        })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn stats(&self) -> &ShardStats {
        &self.stats
    }

    pub fn querier_cache(&self) -> &QuerierCache {
        &self.querier_cache
    }

    pub fn truncation_store(&self) -> &TruncationStore {
        &self.truncation_store
    }

    pub fn user_dirty(&self) -> &DirtyMemoryManager {
        &self.user_dirty
    }

    pub fn flush_controller(&self) -> &FlushController {
        &self.flush_controller
    }

    pub fn create_keyspace(
        &self,
        name: impl Into<CompactString>,
        options: KeyspaceOptions,
    ) -> Result<(), StrataError> {
        let name = name.into();
        let mut keyspaces = self.keyspaces.write();
        if keyspaces.contains_key(&name) {
            return Err(StrataError::AlreadyExists {
                resource_type: ResourceType::Keyspace,
                resource_id: name.to_string(),
            });
        }
        info!(shard = self.shard, keyspace = %name, "created keyspace");
        keyspaces.insert(name, options);
        Ok(())
    }

    pub fn keyspace_exists(&self, name: &str) -> bool {
        self.keyspaces.read().contains_key(name)
    }

    /// Register a table. The stored schema gets `registered` set and its
    /// effective durability is the AND of the table's and the keyspace's.
    pub fn create_table(&self, schema: Schema) -> Result<Arc<Schema>, StrataError> {
        let ks_options = {
            let keyspaces = self.keyspaces.read();
            *keyspaces
                .get(schema.keyspace_name.as_str())
                .ok_or_else(|| StrataError::NotFound {
                    resource_type: ResourceType::Keyspace,
                    resource_id: schema.keyspace_name.to_string(),
                })?
        };
        let name_key = (schema.keyspace_name.clone(), schema.table_name.clone());
        if self.names.read().contains_key(&name_key) {
            return Err(StrataError::AlreadyExists {
                resource_type: ResourceType::Table,
                resource_id: schema.qualified_name(),
            });
        }

        let durable = schema.durable_writes && ks_options.durable_writes;
        let mut schema = schema;
        schema.durable_writes = durable;
        schema.registered = true;
        let schema = Arc::new(schema);

        let log = if durable {
            Some(if ks_options.system {
                Arc::clone(&self.schema_log)
            } else {
                Arc::clone(&self.data_log)
            })
        } else {
            None
        };
        let dirty = if ks_options.system {
            Arc::clone(&self.system_dirty)
        } else {
            Arc::clone(&self.user_dirty)
        };
        let table = Arc::new(Table::new(
            Arc::clone(&schema),
            self.base_dir.join("tables").join(schema.id.to_string()),
            log,
            dirty,
            Arc::clone(&self.flush_controller),
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.stats),
        )?);

        // A table that was truncated in a previous life keeps its cutoff.
        if let Some(record) = self.truncation_store.get(schema.id) {
            table.discard_data_up_to(record.truncated_at_micros)?;
        }

        self.tables.write().insert(schema.id, Arc::clone(&table));
        self.names.write().insert(name_key, schema.id);
        info!(shard = self.shard, table = %schema.qualified_name(), id = %schema.id, "created table");
        Ok(schema)
    }

    pub fn find_table(&self, keyspace: &str, table: &str) -> Result<Arc<Table>, StrataError> {
        let id = self
            .names
            .read()
            .get(&(CompactString::new(keyspace), CompactString::new(table)))
            .copied()
            .ok_or_else(|| StrataError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: format!("{keyspace}.{table}"),
            })?;
        self.table_by_id(id)
    }

    pub fn table_by_id(&self, id: TableId) -> Result<Arc<Table>, StrataError> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: id.to_string(),
            })
    }

    pub fn table_exists(&self, keyspace: &str, table: &str) -> bool {
        self.names
            .read()
            .contains_key(&(CompactString::new(keyspace), CompactString::new(table)))
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.read().keys().copied().collect()
    }

    /// Flush the table holding the most dirty bytes when the shard is over
    /// its hard budget.
    async fn relieve_dirty_pressure(&self) -> Result<(), StrataError> {
        if !self.user_dirty.over_hard_limit() && !self.system_dirty.over_hard_limit() {
            return Ok(());
        }
        let victim = {
            let tables = self.tables.read();
            tables
                .values()
                .max_by_key(|t| t.dirty_bytes_buffered())
                .cloned()
        };
        if let Some(table) = victim {
            table.flush().await?;
        }
        Ok(())
    }

    pub async fn apply(
        &self,
        keyspace: &str,
        table: &str,
        mutation: Mutation,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        self.apply_with_mode(keyspace, table, mutation, ctx, RateLimitMode::Enforce, deadline)
            .await
    }

    pub async fn apply_with_mode(
        &self,
        keyspace: &str,
        table: &str,
        mutation: Mutation,
        ctx: &ExecutionContext,
        mode: RateLimitMode,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        let table = self.find_table(keyspace, table)?;
        self.relieve_dirty_pressure().await?;
        table.apply(mutation, ctx, mode, deadline).await
    }

    /// Atomically log a batch of writes spanning tables.
    ///
    /// Atomicity comes from a single contiguous log append, so every
    /// durable table in the batch must log to the same domain; mixing data
    /// and schema tables is a caller bug.
    pub async fn apply_many(
        &self,
        writes: Vec<(CompactString, CompactString, Mutation)>,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        if writes.is_empty() {
            return Ok(());
        }
        self.stats
            .total_writes
            .fetch_add(writes.len() as u64, Ordering::Relaxed);
        let result = self.do_apply_many(writes, ctx, deadline).await;
        if let Err(e) = &result {
            self.stats.total_writes_failed.fetch_add(1, Ordering::Relaxed);
            if e.is_timeout() {
                self.stats
                    .total_writes_timedout
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn do_apply_many(
        &self,
        writes: Vec<(CompactString, CompactString, Mutation)>,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<(), StrataError> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StrataError::Timeout);
        }
        self.relieve_dirty_pressure().await?;

        let mut entries = Vec::with_capacity(writes.len());
        let mut domain: Option<LogDomain> = None;
        for (keyspace, table_name, mutation) in writes {
            let table = self.find_table(&keyspace, &table_name)?;
            if let Some(table_domain) = table.log_domain() {
                match domain {
                    None => domain = Some(table_domain),
                    Some(d) if d != table_domain => {
                        return Err(StrataError::internal(
                            "batch write spans commit log domains",
                        ));
                    }
                    Some(_) => {}
                }
            }
            entries.push((table, mutation));
        }

        for (table, mutation) in &entries {
            let _gate = table.enter_ops()?;
            if table.admit_write(&mutation.key, ctx, RateLimitMode::Enforce) == CanProceed::No {
                self.stats
                    .total_writes_rate_limited
                    .fetch_add(1, Ordering::Relaxed);
                return Err(StrataError::RateLimited);
            }
        }

        // Generations are captured before the log append; a truncate between
        // here and the memtable insert drops that entry.
        let generations: Vec<u64> = entries
            .iter()
            .map(|(table, _)| table.memtable_generation())
            .collect();

        let durable: Vec<(TableId, Vec<u8>)> = entries
            .iter()
            .filter(|(table, _)| table.log_domain().is_some() && table.schema().durable_writes)
            .map(|(table, mutation)| (table.schema().id, mutation.encode()))
            .collect();
        let mut positions: HashMap<TableId, Vec<ReplayPosition>> = HashMap::new();
        if !durable.is_empty() {
            let log = match domain {
                Some(LogDomain::Schema) => &self.schema_log,
                _ => &self.data_log,
            };
            let rps = log.append_batch(&durable)?;
            for ((id, _), rp) in durable.iter().zip(rps) {
                positions.entry(*id).or_default().push(rp);
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StrataError::Timeout);
        }

        for ((table, mutation), generation) in entries.into_iter().zip(generations) {
            let rp = if table.log_domain().is_some() && table.schema().durable_writes {
                positions
                    .get_mut(&table.schema().id)
                    .and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                    .unwrap_or_default()
            } else {
                ReplayPosition::default()
            };
            table.apply_at_generation(mutation, rp, generation);
        }
        Ok(())
    }

    pub async fn query(
        &self,
        cmd: ReadCommand,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, StrataError> {
        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        let result = self.do_query(cmd, ctx, deadline).await;
        if let Err(e) = &result {
            self.stats.total_reads_failed.fetch_add(1, Ordering::Relaxed);
            if matches!(e, StrataError::RateLimited) {
                self.stats
                    .total_reads_rate_limited
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn do_query(
        &self,
        cmd: ReadCommand,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, StrataError> {
        let table = self.table_by_id(cmd.table)?;
        if cmd.schema_version != table.schema().version {
            return Err(StrataError::internal("read with a stale schema version"));
        }
        let _gate = table.enter_read()?;
        self.admit_single_partition(&table, &cmd, ctx)?;

        let (permit, resume_after) = self.admit_read(&cmd, ctx, deadline).await?;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StrataError::Timeout);
        }

        let max_size = cmd
            .max_result_size_bytes
            .unwrap_or(self.config.max_result_size_bytes);
        let _result_memory = self.result_memory.reserve(max_size).await?;

        let mut rows = Vec::new();
        let mut size_bytes = 0u64;
        let mut short_read = false;
        let mut last_key: Option<PartitionKey> = None;
        for (key, entry) in table.scan(&cmd.range) {
            if resume_after.as_ref().is_some_and(|resume| key <= *resume) {
                continue;
            }
            let cells: Vec<_> = entry
                .cells
                .values()
                .filter(|c| cmd.slice.selects(&c.column))
                .cloned()
                .collect();
            if cells.is_empty() {
                continue;
            }
            let row = Row {
                key: key.clone(),
                cells,
            };
            let row_size = row.size_bytes();
            if rows.len() as u64 >= cmd.partition_limit as u64
                || (!rows.is_empty() && size_bytes + row_size > max_size)
            {
                short_read = true;
                break;
            }
            size_bytes += row_size;
            last_key = Some(key);
            rows.push(row);
        }

        self.finish_paged_read(&cmd, ctx, permit, short_read, last_key);
        if short_read {
            self.stats.short_data_queries.fetch_add(1, Ordering::Relaxed);
        }
        Ok(QueryResult {
            rows,
            short_read,
            size_bytes,
            cache_temperature: self.cache_temperature(),
        })
    }

    /// Mutation-form read for reconciling consumers. Follows the same
    /// admission and paging rules as `query`, but returns full partition
    /// state including tombstones.
    pub async fn query_mutations(
        &self,
        cmd: ReadCommand,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<ReconcilableResult, StrataError> {
        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        let table = self.table_by_id(cmd.table)?;
        if cmd.schema_version != table.schema().version {
            return Err(StrataError::internal("read with a stale schema version"));
        }
        let _gate = table.enter_read()?;
        self.admit_single_partition(&table, &cmd, ctx)?;

        let (permit, resume_after) = self.admit_read(&cmd, ctx, deadline).await?;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StrataError::Timeout);
        }
        let max_size = cmd
            .max_result_size_bytes
            .unwrap_or(self.config.max_result_size_bytes);
        let _result_memory = self.result_memory.reserve(max_size).await?;

        let mut mutations = Vec::new();
        let mut size_bytes = 0u64;
        let mut short_read = false;
        let mut last_key: Option<PartitionKey> = None;
        for (key, entry) in table.scan_with_tombstones(&cmd.range) {
            if resume_after.as_ref().is_some_and(|resume| key <= *resume) {
                continue;
            }
            let mutation = entry.to_mutation(&key);
            let size = mutation.footprint();
            if mutations.len() as u64 >= cmd.partition_limit as u64
                || (!mutations.is_empty() && size_bytes + size > max_size)
            {
                short_read = true;
                break;
            }
            size_bytes += size;
            last_key = Some(key);
            mutations.push(mutation);
        }

        self.finish_paged_read(&cmd, ctx, permit, short_read, last_key);
        if short_read {
            self.stats
                .short_mutation_queries
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(ReconcilableResult {
            mutations,
            short_read,
        })
    }

    fn admit_single_partition(
        &self,
        table: &Table,
        cmd: &ReadCommand,
        ctx: &ExecutionContext,
    ) -> Result<(), StrataError> {
        if let (Some(start), Some(end)) = (&cmd.range.start, &cmd.range.end) {
            if start == end
                && table.account_read(start, ctx, RateLimitMode::Enforce) == CanProceed::No
            {
                return Err(StrataError::RateLimited);
            }
        }
        Ok(())
    }

    /// Reuse the cached querier for a continuation page, or go through
    /// admission. Under pressure, one cached querier from the same pool is
    /// evicted first to make room.
    async fn admit_read(
        &self,
        cmd: &ReadCommand,
        ctx: &ExecutionContext,
        deadline: Option<Instant>,
    ) -> Result<(ReaderPermit, Option<PartitionKey>), StrataError> {
        if let Some(id) = cmd.query_uuid {
            if !cmd.is_first_page {
                if let Some(querier) = self.querier_cache.lookup(id, cmd, ctx.workload) {
                    return Ok((querier.permit, querier.resume_after));
                }
            }
        }
        let semaphore = self.reader_concurrency.semaphore_for(ctx);
        let need = ReaderResources::new(1, self.config.read_memory_estimate_bytes);
        if semaphore.would_block(need) {
            self.querier_cache.evict_one_for_pressure(semaphore.name());
        }
        let permit = semaphore.obtain(need, deadline).await?;
        Ok((permit, None))
    }

    fn finish_paged_read(
        &self,
        cmd: &ReadCommand,
        ctx: &ExecutionContext,
        permit: ReaderPermit,
        short_read: bool,
        last_key: Option<PartitionKey>,
    ) {
        if let (Some(id), true) = (cmd.query_uuid, short_read) {
            self.querier_cache.insert(
                id,
                Querier {
                    table: cmd.table,
                    schema_version: cmd.schema_version,
                    range: cmd.range.clone(),
                    slice: cmd.slice.clone(),
                    workload: ctx.workload,
                    resume_after: last_key,
                    permit,
                },
            );
        }
        // Otherwise the permit drops here and its resources free up.
    }

    fn cache_temperature(&self) -> CacheTemperature {
        let stats = self.querier_cache.stats();
        let lookups = stats.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return CacheTemperature::cold();
        }
        let misses = stats.misses.load(Ordering::Relaxed);
        CacheTemperature((lookups - misses) as f32 / lookups as f32)
    }

    pub async fn flush_all_tables(&self) -> Result<(), StrataError> {
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        for table in tables {
            table.flush().await?;
        }
        Ok(())
    }

    /// Detach a table from the registry: name lookups and new operations
    /// stop finding it, cached queriers are dropped. The caller still holds
    /// the Arc and decides what happens to the data.
    pub fn detach_table(&self, id: TableId) -> Result<Arc<Table>, StrataError> {
        let table = self
            .tables
            .write()
            .remove(&id)
            .ok_or_else(|| StrataError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: id.to_string(),
            })?;
        let schema = table.schema();
        self.names
            .write()
            .remove(&(schema.keyspace_name.clone(), schema.table_name.clone()));
        self.querier_cache.evict_table(id);
        Ok(table)
    }

    /// Record a truncation and drop cached queriers for the table.
    pub fn record_truncation(
        &self,
        id: TableId,
        record: TruncationRecord,
    ) -> Result<(), StrataError> {
        self.querier_cache.evict_table(id);
        self.truncation_store.record(id, record)
    }

    /// Replay both commit logs into the registered tables. Entries covered
    /// by a truncation record's low mark are skipped; entries for unknown
    /// tables are ignored with a warning (the table was dropped).
    pub fn recover(&self) -> Result<ReplayStats, StrataError> {
        let mut total = ReplayStats::default();
        for log in [&self.data_log, &self.schema_log] {
            let stats = log.replay(|table_id, rp, payload| {
                let Ok(table) = self.table_by_id(table_id) else {
                    warn!(shard = self.shard, table = %table_id, "replay entry for unknown table, skipping");
                    return Ok(());
                };
                if rp <= table.highest_flushed_replay_position() {
                    return Ok(());
                }
                let mutation = Mutation::decode(payload)?;
                if let Some(record) = self.truncation_store.get(table_id) {
                    // Below the low mark, or logged during the truncate
                    // window with a pre-cutoff timestamp: truncated away.
                    if rp <= record.replay_position
                        || mutation.max_timestamp_micros() <= record.truncated_at_micros
                    {
                        return Ok(());
                    }
                }
                table.apply_replayed(mutation, rp);
                Ok(())
            })?;
            total.segments += stats.segments;
            total.frames += stats.frames;
            total.bytes += stats.bytes;
        }
        self.flush_controller.adjust(&self.user_dirty);
        info!(
            shard = self.shard,
            segments = total.segments,
            frames = total.frames,
            "commit log replay finished"
        );
        Ok(total)
    }

    pub fn reader_concurrency(&self) -> &ReaderConcurrencyGroup {
        &self.reader_concurrency
    }
}
