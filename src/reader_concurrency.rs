//! Reader admission control.
//!
//! A semaphore over two resources at once, reader slots and estimated
//! memory; a read is admitted only when both fit. Waiters are strictly
//! FIFO: a small read arriving behind a large blocked one queues behind it
//! rather than barging past, which keeps the large read from starving.

use crate::error::StrataError;
use crate::schema::{ExecutionContext, WorkloadClass};
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderResources {
    pub count: usize,
    pub memory: u64,
}

impl ReaderResources {
    pub fn new(count: usize, memory: u64) -> Self {
        Self { count, memory }
    }
}

struct Waiter {
    id: u64,
    need: ReaderResources,
    tx: oneshot::Sender<ReaderPermit>,
}

struct SemState {
    count_available: usize,
    memory_available: u64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug, Default)]
pub struct SemaphoreStats {
    pub reads_admitted: AtomicU64,
    pub reads_queued: AtomicU64,
    pub reads_shed_due_to_timeout: AtomicU64,
}

struct SemInner {
    name: CompactString,
    total: ReaderResources,
    state: Mutex<SemState>,
    stats: SemaphoreStats,
}

impl SemInner {
    fn release(self: &Arc<Self>, resources: ReaderResources) {
        let reclaimed = {
            let mut state = self.state.lock();
            state.count_available += resources.count;
            state.memory_available = state.memory_available.saturating_add(resources.memory);
            self.grant_waiters(&mut state)
        };
        // Dropped outside the lock: each reclaimed permit re-enters release.
        drop(reclaimed);
    }

    /// Hand permits to queued waiters in order while resources last. Permits
    /// whose waiter has gone away (timed out) are returned to the caller for
    /// reclamation after the lock is released.
    fn grant_waiters(self: &Arc<Self>, state: &mut SemState) -> Vec<ReaderPermit> {
        let mut orphaned = Vec::new();
        loop {
            let fits = state.waiters.front().is_some_and(|w| {
                w.need.count <= state.count_available && w.need.memory <= state.memory_available
            });
            if !fits {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.count_available -= waiter.need.count;
            state.memory_available -= waiter.need.memory;
            let permit = ReaderPermit {
                inner: Arc::clone(self),
                resources: waiter.need,
            };
            if let Err(permit) = waiter.tx.send(permit) {
                orphaned.push(permit);
            } else {
                self.stats.reads_admitted.fetch_add(1, Ordering::Relaxed);
            }
        }
        orphaned
    }
}

/// An admitted read. Resources return to the pool on drop.
pub struct ReaderPermit {
    inner: Arc<SemInner>,
    resources: ReaderResources,
}

impl ReaderPermit {
    pub fn resources(&self) -> ReaderResources {
        self.resources
    }

    pub fn pool_name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for ReaderPermit {
    fn drop(&mut self) {
        self.inner.release(self.resources);
    }
}

impl std::fmt::Debug for ReaderPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderPermit")
            .field("pool", &self.inner.name.as_str())
            .field("resources", &self.resources)
            .finish()
    }
}

#[derive(Clone)]
pub struct ReaderConcurrencySemaphore {
    inner: Arc<SemInner>,
}

impl ReaderConcurrencySemaphore {
    pub fn new(name: impl Into<CompactString>, total: ReaderResources) -> Self {
        Self {
            inner: Arc::new(SemInner {
                name: name.into(),
                total,
                state: Mutex::new(SemState {
                    count_available: total.count,
                    memory_available: total.memory,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                }),
                stats: SemaphoreStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn total(&self) -> ReaderResources {
        self.inner.total
    }

    pub fn available(&self) -> ReaderResources {
        let state = self.inner.state.lock();
        ReaderResources::new(state.count_available, state.memory_available)
    }

    pub fn inflight_reads(&self) -> usize {
        self.inner.total.count - self.inner.state.lock().count_available
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub fn reads_admitted(&self) -> u64 {
        self.inner.stats.reads_admitted.load(Ordering::Relaxed)
    }

    pub fn reads_queued(&self) -> u64 {
        self.inner.stats.reads_queued.load(Ordering::Relaxed)
    }

    pub fn reads_shed_due_to_timeout(&self) -> u64 {
        self.inner
            .stats
            .reads_shed_due_to_timeout
            .load(Ordering::Relaxed)
    }

    /// Whether an obtain call for `need` would have to queue right now.
    pub fn would_block(&self, need: ReaderResources) -> bool {
        let state = self.inner.state.lock();
        !state.waiters.is_empty()
            || need.count > state.count_available
            || need.memory > state.memory_available
    }

    /// Admit immediately or fail; never queues.
    pub fn try_obtain(&self, need: ReaderResources) -> Option<ReaderPermit> {
        let mut state = self.inner.state.lock();
        if !state.waiters.is_empty()
            || need.count > state.count_available
            || need.memory > state.memory_available
        {
            return None;
        }
        state.count_available -= need.count;
        state.memory_available -= need.memory;
        self.inner.stats.reads_admitted.fetch_add(1, Ordering::Relaxed);
        Some(ReaderPermit {
            inner: Arc::clone(&self.inner),
            resources: need,
        })
    }

    /// Admit, queueing FIFO behind earlier waiters if resources are short.
    /// Fails with `Timeout` once the deadline passes.
    pub async fn obtain(
        &self,
        need: ReaderResources,
        deadline: Option<Instant>,
    ) -> Result<ReaderPermit, StrataError> {
        if need.count > self.inner.total.count || need.memory > self.inner.total.memory {
            return Err(StrataError::internal(format!(
                "read needs {need:?} but pool '{}' holds at most {:?}",
                self.inner.name, self.inner.total
            )));
        }

        let (waiter_id, rx) = {
            let mut state = self.inner.state.lock();
            if state.waiters.is_empty()
                && need.count <= state.count_available
                && need.memory <= state.memory_available
            {
                state.count_available -= need.count;
                state.memory_available -= need.memory;
                self.inner.stats.reads_admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(ReaderPermit {
                    inner: Arc::clone(&self.inner),
                    resources: need,
                });
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, need, tx });
            self.inner.stats.reads_queued.fetch_add(1, Ordering::Relaxed);
            (id, rx)
        };
        trace!(pool = %self.inner.name, waiter = waiter_id, "read queued for admission");

        let granted = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
                    Ok(result) => result.ok(),
                    Err(_) => None,
                }
            }
            None => rx.await.ok(),
        };
        if let Some(permit) = granted {
            return Ok(permit);
        }

        // Timed out. Remove our queue entry; a grant may have raced the
        // timeout, in which case the permit is reclaimed by grant_waiters
        // when its send fails, so plain removal here is enough.
        {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|w| w.id != waiter_id);
        }
        self.inner
            .stats
            .reads_shed_due_to_timeout
            .fetch_add(1, Ordering::Relaxed);
        Err(StrataError::Timeout)
    }
}

/// Per-workload-class semaphore pools. System and maintenance work get
/// dedicated pools; user reads get one pool per service level, created on
/// first use.
pub struct ReaderConcurrencyGroup {
    user_total: ReaderResources,
    user_pools: Mutex<HashMap<CompactString, ReaderConcurrencySemaphore>>,
    system: ReaderConcurrencySemaphore,
    maintenance: ReaderConcurrencySemaphore,
}

impl ReaderConcurrencyGroup {
    pub fn new(
        user_total: ReaderResources,
        system_total: ReaderResources,
        maintenance_total: ReaderResources,
    ) -> Self {
        Self {
            user_total,
            user_pools: Mutex::new(HashMap::new()),
            system: ReaderConcurrencySemaphore::new("system", system_total),
            maintenance: ReaderConcurrencySemaphore::new("maintenance", maintenance_total),
        }
    }

    pub fn semaphore_for(&self, ctx: &ExecutionContext) -> ReaderConcurrencySemaphore {
        match ctx.workload {
            WorkloadClass::System => self.system.clone(),
            WorkloadClass::Maintenance => self.maintenance.clone(),
            WorkloadClass::User => {
                let mut pools = self.user_pools.lock();
                pools
                    .entry(ctx.service_level.clone())
                    .or_insert_with(|| {
                        ReaderConcurrencySemaphore::new(
                            ctx.service_level.clone(),
                            self.user_total,
                        )
                    })
                    .clone()
            }
        }
    }

    pub fn user_pool_count(&self) -> usize {
        self.user_pools.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReaderConcurrencyGroup, ReaderConcurrencySemaphore, ReaderResources};
    use crate::schema::ExecutionContext;
    use std::time::{Duration, Instant};

    fn res(count: usize, memory: u64) -> ReaderResources {
        ReaderResources::new(count, memory)
    }

    #[tokio::test]
    async fn admits_up_to_both_limits() {
        let sem = ReaderConcurrencySemaphore::new("test", res(2, 100));
        let a = sem.obtain(res(1, 40), None).await.expect("first");
        let _b = sem.obtain(res(1, 40), None).await.expect("second");
        assert_eq!(sem.available(), res(0, 20));
        assert!(sem.would_block(res(1, 10)));

        drop(a);
        assert_eq!(sem.available(), res(1, 60));
        assert!(!sem.would_block(res(1, 10)));
    }

    #[tokio::test]
    async fn memory_limit_blocks_even_with_free_slots() {
        let sem = ReaderConcurrencySemaphore::new("test", res(10, 100));
        let _big = sem.obtain(res(1, 90), None).await.expect("big");
        assert!(sem.would_block(res(1, 20)));
        assert!(sem.try_obtain(res(1, 20)).is_none());
        assert!(sem.try_obtain(res(1, 5)).is_some());
    }

    #[tokio::test]
    async fn waiters_are_served_fifo_without_barging() {
        let sem = ReaderConcurrencySemaphore::new("test", res(1, 100));
        let held = sem.obtain(res(1, 50), None).await.expect("held");

        let sem2 = sem.clone();
        let first = tokio::spawn(async move { sem2.obtain(res(1, 80), None).await });
        while sem.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        // A small read behind a queued larger one must also queue.
        assert!(sem.would_block(res(1, 1)));
        assert!(sem.try_obtain(res(1, 1)).is_none());

        drop(held);
        let permit = first.await.expect("join").expect("granted");
        assert_eq!(permit.resources(), res(1, 80));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_is_shed_and_resources_intact() {
        let sem = ReaderConcurrencySemaphore::new("test", res(1, 100));
        let held = sem.obtain(res(1, 100), None).await.expect("held");

        let err = sem
            .obtain(res(1, 10), Some(Instant::now() + Duration::from_millis(50)))
            .await
            .expect_err("must time out");
        assert!(err.is_timeout());
        assert_eq!(sem.reads_shed_due_to_timeout(), 1);
        assert_eq!(sem.waiter_count(), 0);

        drop(held);
        assert_eq!(sem.available(), res(1, 100));
    }

    #[tokio::test]
    async fn oversized_request_is_an_internal_error() {
        let sem = ReaderConcurrencySemaphore::new("test", res(1, 100));
        let err = sem.obtain(res(2, 10), None).await.expect_err("oversized");
        assert!(!err.is_timeout());
    }

    #[test]
    fn group_separates_pools_by_class_and_service_level() {
        let group = ReaderConcurrencyGroup::new(res(2, 100), res(10, 1000), res(10, 1000));
        let web = group.semaphore_for(&ExecutionContext::user("web"));
        let batch = group.semaphore_for(&ExecutionContext::user("batch"));
        let web_again = group.semaphore_for(&ExecutionContext::user("web"));
        assert_eq!(group.user_pool_count(), 2);
        assert_eq!(web.name(), "web");
        assert_eq!(batch.name(), "batch");

        // Same pool: taking from one is visible through the other handle.
        let permit = web.try_obtain(res(1, 10)).expect("permit");
        assert_eq!(web_again.available(), res(1, 90));
        drop(permit);

        let system = group.semaphore_for(&ExecutionContext::system());
        assert_eq!(system.name(), "system");
        assert_eq!(system.total(), res(10, 1000));
    }
}
