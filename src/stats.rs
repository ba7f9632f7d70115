//! Per-shard operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ShardStats {
    pub total_writes: AtomicU64,
    pub total_writes_failed: AtomicU64,
    pub total_writes_timedout: AtomicU64,
    pub total_writes_rate_limited: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_reads_failed: AtomicU64,
    pub total_reads_rate_limited: AtomicU64,
    /// Writes silently dropped because they raced a truncate.
    pub stale_writes_dropped: AtomicU64,
    /// Data-form reads that stopped early at a limit.
    pub short_data_queries: AtomicU64,
    /// Mutation-form reads that stopped early at a limit.
    pub short_mutation_queries: AtomicU64,
    pub memtable_flushes: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardStatsSnapshot {
    pub total_writes: u64,
    pub total_writes_failed: u64,
    pub total_writes_timedout: u64,
    pub total_writes_rate_limited: u64,
    pub total_reads: u64,
    pub total_reads_failed: u64,
    pub total_reads_rate_limited: u64,
    pub stale_writes_dropped: u64,
    pub short_data_queries: u64,
    pub short_mutation_queries: u64,
    pub memtable_flushes: u64,
}

impl ShardStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ShardStatsSnapshot {
        ShardStatsSnapshot {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_writes_failed: self.total_writes_failed.load(Ordering::Relaxed),
            total_writes_timedout: self.total_writes_timedout.load(Ordering::Relaxed),
            total_writes_rate_limited: self.total_writes_rate_limited.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_reads_failed: self.total_reads_failed.load(Ordering::Relaxed),
            total_reads_rate_limited: self.total_reads_rate_limited.load(Ordering::Relaxed),
            stale_writes_dropped: self.stale_writes_dropped.load(Ordering::Relaxed),
            short_data_queries: self.short_data_queries.load(Ordering::Relaxed),
            short_mutation_queries: self.short_mutation_queries.load(Ordering::Relaxed),
            memtable_flushes: self.memtable_flushes.load(Ordering::Relaxed),
        }
    }
}
