//! Cache of suspended queriers between pages of a paged read.
//!
//! A querier keeps its reader permit while cached, so cached entries hold
//! real admission resources. Entries are dropped on lookup mismatch (the
//! next page asked for something else), on TTL expiry, by LRU capacity, and
//! on demand when a semaphore under pressure needs its resources back.

use crate::mutation::PartitionKey;
use crate::read::{ColumnSlice, KeyRange, ReadCommand};
use crate::reader_concurrency::ReaderPermit;
use crate::schema::{SchemaVersion, TableId, WorkloadClass};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

/// A suspended read, parked between pages.
#[derive(Debug)]
pub struct Querier {
    pub table: TableId,
    pub schema_version: SchemaVersion,
    pub range: KeyRange,
    pub slice: ColumnSlice,
    pub workload: WorkloadClass,
    /// Key the last page ended at; the next page resumes strictly after it.
    pub resume_after: Option<PartitionKey>,
    pub permit: ReaderPermit,
}

impl Querier {
    fn matches(&self, cmd: &ReadCommand, workload: WorkloadClass) -> QuerierMatch {
        if self.workload != workload {
            return QuerierMatch::WrongWorkload;
        }
        if self.table != cmd.table
            || self.schema_version != cmd.schema_version
            || self.range != cmd.range
            || self.slice != cmd.slice
        {
            return QuerierMatch::WrongShape;
        }
        QuerierMatch::Ok
    }
}

enum QuerierMatch {
    Ok,
    WrongShape,
    WrongWorkload,
}

struct CachedQuerier {
    querier: Querier,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
pub struct QuerierCacheStats {
    pub lookups: AtomicU64,
    pub misses: AtomicU64,
    /// Entries dropped because the next page's command didn't match.
    pub drops: AtomicU64,
    /// Mismatch specifically on workload class.
    pub scheduling_group_mismatches: AtomicU64,
    pub time_based_evictions: AtomicU64,
    pub resource_based_evictions: AtomicU64,
    pub memory_based_evictions: AtomicU64,
}

pub struct QuerierCache {
    entries: Mutex<LruCache<Uuid, CachedQuerier>>,
    ttl: Duration,
    stats: QuerierCacheStats,
}

impl QuerierCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            stats: QuerierCacheStats::default(),
        }
    }

    pub fn stats(&self) -> &QuerierCacheStats {
        &self.stats
    }

    pub fn population(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn insert(&self, id: Uuid, querier: Querier) {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() == entries.cap().get() && !entries.contains(&id) {
                entries.pop_lru()
            } else {
                None
            };
            entries.put(
                id,
                CachedQuerier {
                    querier,
                    inserted_at: Instant::now(),
                },
            );
            evicted
        };
        if evicted.is_some() {
            self.stats
                .memory_based_evictions
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Look up the querier for the next page. A present entry that doesn't
    /// match the command is dropped, not returned: its permit goes back to
    /// the pool and the caller starts a fresh read.
    pub fn lookup(
        &self,
        id: Uuid,
        cmd: &ReadCommand,
        workload: WorkloadClass,
    ) -> Option<Querier> {
        self.lookup_at(id, cmd, workload, Instant::now())
    }

    fn lookup_at(
        &self,
        id: Uuid,
        cmd: &ReadCommand,
        workload: WorkloadClass,
        now: Instant,
    ) -> Option<Querier> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let cached = {
            let mut entries = self.entries.lock();
            entries.pop(&id)
        };
        let Some(cached) = cached else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if now.duration_since(cached.inserted_at) >= self.ttl {
            self.stats.time_based_evictions.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match cached.querier.matches(cmd, workload) {
            QuerierMatch::Ok => Some(cached.querier),
            QuerierMatch::WrongWorkload => {
                trace!(query = %id, "cached querier dropped: workload class changed");
                self.stats
                    .scheduling_group_mismatches
                    .fetch_add(1, Ordering::Relaxed);
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            QuerierMatch::WrongShape => {
                trace!(query = %id, "cached querier dropped: command shape changed");
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop entries older than the TTL.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, c)| now.duration_since(c.inserted_at) >= self.ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.pop(id);
        }
        self.stats
            .time_based_evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Reclaim the least-recently-used entry whose permit came from `pool`,
    /// freeing its admission resources. Used when a semaphore would block.
    pub fn evict_one_for_pressure(&self, pool: &str) -> bool {
        let victim = {
            let mut entries = self.entries.lock();
            let id = entries
                .iter()
                .rev()
                .find(|(_, c)| c.querier.permit.pool_name() == pool)
                .map(|(id, _)| *id);
            id.and_then(|id| entries.pop(&id))
        };
        if victim.is_some() {
            self.stats
                .resource_based_evictions
                .fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Drop every cached querier for a table (truncate, drop).
    pub fn evict_table(&self, table: TableId) -> usize {
        let mut entries = self.entries.lock();
        let ids: Vec<Uuid> = entries
            .iter()
            .filter(|(_, c)| c.querier.table == table)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            entries.pop(id);
        }
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Querier, QuerierCache};
    use crate::read::{ColumnSlice, KeyRange, ReadCommand};
    use crate::reader_concurrency::{ReaderConcurrencySemaphore, ReaderResources};
    use crate::schema::{SchemaVersion, TableId, WorkloadClass};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn pool() -> ReaderConcurrencySemaphore {
        ReaderConcurrencySemaphore::new("user", ReaderResources::new(10, 1000))
    }

    fn querier(sem: &ReaderConcurrencySemaphore, cmd: &ReadCommand) -> Querier {
        Querier {
            table: cmd.table,
            schema_version: cmd.schema_version,
            range: cmd.range.clone(),
            slice: cmd.slice.clone(),
            workload: WorkloadClass::User,
            resume_after: None,
            permit: sem.try_obtain(ReaderResources::new(1, 100)).expect("permit"),
        }
    }

    fn cache() -> QuerierCache {
        QuerierCache::new(4, Duration::from_secs(10))
    }

    #[test]
    fn matching_lookup_returns_the_querier() {
        let cache = cache();
        let sem = pool();
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let id = Uuid::new_v4();
        cache.insert(id, querier(&sem, &cmd));
        assert_eq!(cache.population(), 1);

        let found = cache.lookup(id, &cmd, WorkloadClass::User).expect("hit");
        assert_eq!(found.table, cmd.table);
        assert_eq!(cache.population(), 0);
        assert_eq!(cache.stats().lookups.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mismatched_command_drops_entry_and_frees_permit() {
        let cache = cache();
        let sem = pool();
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let id = Uuid::new_v4();
        cache.insert(id, querier(&sem, &cmd));
        assert_eq!(sem.available(), ReaderResources::new(9, 900));

        let different = ReadCommand {
            slice: ColumnSlice::of(["name"]),
            ..cmd.clone()
        };
        assert!(cache.lookup(id, &different, WorkloadClass::User).is_none());
        assert_eq!(cache.stats().drops.load(Ordering::Relaxed), 1);
        // The dropped querier's permit went back to the pool.
        assert_eq!(sem.available(), ReaderResources::new(10, 1000));
    }

    #[test]
    fn workload_change_counts_as_scheduling_group_mismatch() {
        let cache = cache();
        let sem = pool();
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let id = Uuid::new_v4();
        cache.insert(id, querier(&sem, &cmd));

        assert!(cache.lookup(id, &cmd, WorkloadClass::Maintenance).is_none());
        assert_eq!(
            cache
                .stats()
                .scheduling_group_mismatches
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn stale_entries_are_evicted_by_ttl() {
        let cache = QuerierCache::new(4, Duration::from_millis(100));
        let sem = pool();
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let id = Uuid::new_v4();
        cache.insert(id, querier(&sem, &cmd));

        let later = Instant::now() + Duration::from_millis(200);
        assert!(cache.lookup_at(id, &cmd, WorkloadClass::User, later).is_none());
        assert_eq!(cache.stats().time_based_evictions.load(Ordering::Relaxed), 1);

        cache.insert(Uuid::new_v4(), querier(&sem, &cmd));
        assert_eq!(cache.evict_expired_at(later), 1);
        assert_eq!(cache.population(), 0);
    }

    #[test]
    fn capacity_eviction_drops_the_lru_entry() {
        let cache = QuerierCache::new(2, Duration::from_secs(10));
        let sem = pool();
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let first = Uuid::new_v4();
        cache.insert(first, querier(&sem, &cmd));
        cache.insert(Uuid::new_v4(), querier(&sem, &cmd));
        cache.insert(Uuid::new_v4(), querier(&sem, &cmd));

        assert_eq!(cache.population(), 2);
        assert_eq!(cache.stats().memory_based_evictions.load(Ordering::Relaxed), 1);
        assert!(cache.lookup(first, &cmd, WorkloadClass::User).is_none());
    }

    #[test]
    fn pressure_eviction_targets_the_named_pool() {
        let cache = cache();
        let user = pool();
        let other = ReaderConcurrencySemaphore::new("batch", ReaderResources::new(10, 1000));
        let cmd = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        cache.insert(Uuid::new_v4(), querier(&user, &cmd));
        cache.insert(Uuid::new_v4(), querier(&other, &cmd));

        assert!(cache.evict_one_for_pressure("batch"));
        assert_eq!(other.available(), ReaderResources::new(10, 1000));
        assert_eq!(user.available(), ReaderResources::new(9, 900));
        assert!(!cache.evict_one_for_pressure("batch"));
        assert_eq!(
            cache.stats().resource_based_evictions.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn table_eviction_clears_only_that_table() {
        let cache = cache();
        let sem = pool();
        let cmd_a = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        let cmd_b = ReadCommand::full_scan(TableId::new(), SchemaVersion(1));
        cache.insert(Uuid::new_v4(), querier(&sem, &cmd_a));
        cache.insert(Uuid::new_v4(), querier(&sem, &cmd_a));
        cache.insert(Uuid::new_v4(), querier(&sem, &cmd_b));

        assert_eq!(cache.evict_table(cmd_a.table), 2);
        assert_eq!(cache.population(), 1);
    }
}
