//! Read command and result types, plus the per-shard result memory limiter.

use crate::error::StrataError;
use crate::mutation::{Cell, Mutation, PartitionKey};
use crate::schema::{SchemaVersion, TableId};
use compact_str::CompactString;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Inclusive partition key range. `None` bounds are open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    pub start: Option<PartitionKey>,
    pub end: Option<PartitionKey>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn single(key: PartitionKey) -> Self {
        Self {
            start: Some(key.clone()),
            end: Some(key),
        }
    }

    pub fn starting_at(key: PartitionKey) -> Self {
        Self {
            start: Some(key),
            end: None,
        }
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        if let Some(start) = &self.start {
            if key < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key > end {
                return false;
            }
        }
        true
    }
}

/// Column projection. `None` selects every column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnSlice {
    pub columns: Option<Vec<CompactString>>,
}

impl ColumnSlice {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of(columns: impl IntoIterator<Item = impl Into<CompactString>>) -> Self {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
        }
    }

    pub fn selects(&self, column: &str) -> bool {
        match &self.columns {
            None => true,
            Some(cols) => cols.iter().any(|c| *c == column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCommand {
    pub table: TableId,
    pub schema_version: SchemaVersion,
    pub range: KeyRange,
    pub slice: ColumnSlice,
    pub partition_limit: u32,
    /// Per-read result ceiling; falls back to the per-class default.
    pub max_result_size_bytes: Option<u64>,
    /// Paging identity. Set on every page of a paged read; pages after the
    /// first look the querier up in the cache under this id.
    pub query_uuid: Option<Uuid>,
    pub is_first_page: bool,
}

impl ReadCommand {
    pub fn full_scan(table: TableId, schema_version: SchemaVersion) -> Self {
        Self {
            table,
            schema_version,
            range: KeyRange::full(),
            slice: ColumnSlice::all(),
            partition_limit: u32::MAX,
            max_result_size_bytes: None,
            query_uuid: None,
            is_first_page: true,
        }
    }

    pub fn single_partition(
        table: TableId,
        schema_version: SchemaVersion,
        key: PartitionKey,
    ) -> Self {
        Self {
            range: KeyRange::single(key),
            ..Self::full_scan(table, schema_version)
        }
    }

    pub fn with_limit(mut self, partition_limit: u32) -> Self {
        self.partition_limit = partition_limit;
        self
    }

    pub fn with_slice(mut self, slice: ColumnSlice) -> Self {
        self.slice = slice;
        self
    }

    pub fn paged(mut self, query_uuid: Uuid, is_first_page: bool) -> Self {
        self.query_uuid = Some(query_uuid);
        self.is_first_page = is_first_page;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: PartitionKey,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn size_bytes(&self) -> u64 {
        let mut bytes = self.key.len() as u64;
        for cell in &self.cells {
            bytes += cell.column.len() as u64 + 8 + cell.value.len() as u64;
        }
        bytes
    }
}

/// How warm the read path was for this query, reported back to callers so
/// coordinators can weigh replicas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheTemperature(pub f32);

impl CacheTemperature {
    pub fn cold() -> Self {
        CacheTemperature(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// The read stopped early (partition limit or size ceiling); a pager
    /// should come back for more.
    pub short_read: bool,
    pub size_bytes: u64,
    pub cache_temperature: CacheTemperature,
}

/// Read result in mutation form, for consumers that reconcile rather than
/// present (repair, view building).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilableResult {
    pub mutations: Vec<Mutation>,
    pub short_read: bool,
}

const PERMIT_BYTES: u64 = 1024;

/// Guard for memory reserved against the shard-wide result budget.
#[derive(Debug)]
pub struct ResultMemoryGuard {
    _permit: OwnedSemaphorePermit,
    pub bytes: u64,
}

/// Bounds the total size of in-flight query results on one shard. One
/// permit covers 1 KiB; requests larger than the whole budget are clamped
/// so they serialize instead of deadlocking.
#[derive(Clone)]
pub struct ResultMemoryLimiter {
    sem: Arc<Semaphore>,
    total_permits: u32,
}

impl ResultMemoryLimiter {
    pub fn new(limit_bytes: u64) -> Self {
        let total_permits = (limit_bytes / PERMIT_BYTES).clamp(1, Semaphore::MAX_PERMITS as u64);
        Self {
            sem: Arc::new(Semaphore::new(total_permits as usize)),
            total_permits: total_permits as u32,
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.sem.available_permits() as u64 * PERMIT_BYTES
    }

    pub async fn reserve(&self, bytes: u64) -> Result<ResultMemoryGuard, StrataError> {
        let permits = (bytes.div_ceil(PERMIT_BYTES).max(1)).min(self.total_permits as u64) as u32;
        let permit = Arc::clone(&self.sem)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| StrataError::internal("result memory semaphore closed"))?;
        Ok(ResultMemoryGuard {
            _permit: permit,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnSlice, KeyRange, ResultMemoryLimiter};
    use crate::mutation::PartitionKey;

    #[test]
    fn key_range_bounds_are_inclusive() {
        let range = KeyRange {
            start: Some(PartitionKey::new(b"b")),
            end: Some(PartitionKey::new(b"d")),
        };
        assert!(!range.contains(&PartitionKey::new(b"a")));
        assert!(range.contains(&PartitionKey::new(b"b")));
        assert!(range.contains(&PartitionKey::new(b"c")));
        assert!(range.contains(&PartitionKey::new(b"d")));
        assert!(!range.contains(&PartitionKey::new(b"e")));

        assert!(KeyRange::full().contains(&PartitionKey::new(b"anything")));
        let single = KeyRange::single(PartitionKey::new(b"k"));
        assert!(single.contains(&PartitionKey::new(b"k")));
        assert!(!single.contains(&PartitionKey::new(b"k2")));
    }

    #[test]
    fn column_slice_projection() {
        assert!(ColumnSlice::all().selects("anything"));
        let slice = ColumnSlice::of(["name", "age"]);
        assert!(slice.selects("name"));
        assert!(!slice.selects("email"));
    }

    #[tokio::test]
    async fn result_memory_limiter_blocks_when_exhausted() {
        let limiter = ResultMemoryLimiter::new(4 * 1024);
        let guard = limiter.reserve(3 * 1024).await.expect("reserve");
        assert_eq!(limiter.available_bytes(), 1024);

        // 2 KiB cannot fit; the reserve parks until the first guard drops.
        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.reserve(2 * 1024).await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        drop(guard);
        let guard2 = second.await.expect("join").expect("reserve");
        assert_eq!(guard2.bytes, 2 * 1024);
    }

    #[tokio::test]
    async fn oversized_reserve_is_clamped_to_the_budget() {
        let limiter = ResultMemoryLimiter::new(2 * 1024);
        // Larger than the whole budget: clamped, so it completes alone.
        let guard = limiter.reserve(10 * 1024).await.expect("reserve");
        assert_eq!(limiter.available_bytes(), 0);
        drop(guard);
        assert_eq!(limiter.available_bytes(), 2 * 1024);
    }
}
