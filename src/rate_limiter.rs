//! Per-partition operation rate limiting.
//!
//! Counting is windowed: each (label, partition token) pair gets a bucket
//! that resets at window boundaries. Accounting always happens; whether an
//! over-limit operation is actually rejected depends on the mode, so a
//! coordinator that already made the admission decision elsewhere can still
//! keep the local counters honest.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket maps are bounded; when one overflows, buckets from past windows
/// are evicted first.
const MAX_TRACKED_TOKENS: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Count and reject over-limit operations.
    Enforce,
    /// Count only; the admission decision was made by the caller.
    AccountOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanProceed {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window: u64,
    ops: u32,
}

/// One counting domain: a (table, operation type) pair owns one label for
/// its whole lifetime.
#[derive(Debug, Default)]
pub struct RateLimiterLabel {
    buckets: Mutex<HashMap<u64, Bucket>>,
    accounted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiterLabel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations_accounted(&self) -> u64 {
        self.accounted.load(Ordering::Relaxed)
    }

    pub fn operations_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

pub struct PerPartitionRateLimiter {
    window: Duration,
    epoch: Instant,
}

impl PerPartitionRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            epoch: Instant::now(),
        }
    }

    fn current_window(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64) / (self.window.as_millis().max(1) as u64)
    }

    /// Account one operation on `token` under `label`, with at most `limit`
    /// operations allowed per window.
    pub fn account_operation(
        &self,
        label: &RateLimiterLabel,
        token: u64,
        limit: u32,
        mode: RateLimitMode,
    ) -> CanProceed {
        self.account_in_window(label, token, limit, mode, self.current_window())
    }

    fn account_in_window(
        &self,
        label: &RateLimiterLabel,
        token: u64,
        limit: u32,
        mode: RateLimitMode,
        window: u64,
    ) -> CanProceed {
        label.accounted.fetch_add(1, Ordering::Relaxed);
        let mut buckets = label.buckets.lock();
        if buckets.len() >= MAX_TRACKED_TOKENS && !buckets.contains_key(&token) {
            buckets.retain(|_, b| b.window == window);
        }
        let bucket = buckets.entry(token).or_insert(Bucket { window, ops: 0 });
        if bucket.window != window {
            bucket.window = window;
            bucket.ops = 0;
        }
        bucket.ops = bucket.ops.saturating_add(1);
        if bucket.ops > limit && mode == RateLimitMode::Enforce {
            label.rejected.fetch_add(1, Ordering::Relaxed);
            return CanProceed::No;
        }
        CanProceed::Yes
    }
}

#[cfg(test)]
mod tests {
    use super::{CanProceed, PerPartitionRateLimiter, RateLimitMode, RateLimiterLabel};
    use std::time::Duration;

    fn limiter() -> PerPartitionRateLimiter {
        PerPartitionRateLimiter::new(Duration::from_secs(1))
    }

    #[test]
    fn operations_beyond_the_limit_are_rejected() {
        let limiter = limiter();
        let label = RateLimiterLabel::new();
        let mut allowed = 0;
        let mut rejected = 0;
        for _ in 0..20 {
            match limiter.account_in_window(&label, 42, 10, RateLimitMode::Enforce, 0) {
                CanProceed::Yes => allowed += 1,
                CanProceed::No => rejected += 1,
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(rejected, 10);
        assert_eq!(label.operations_rejected(), 10);
        assert_eq!(label.operations_accounted(), 20);
    }

    #[test]
    fn tokens_are_limited_independently() {
        let limiter = limiter();
        let label = RateLimiterLabel::new();
        for _ in 0..5 {
            assert_eq!(
                limiter.account_in_window(&label, 1, 5, RateLimitMode::Enforce, 0),
                CanProceed::Yes
            );
        }
        // Token 1 is exhausted; token 2 is untouched.
        assert_eq!(
            limiter.account_in_window(&label, 1, 5, RateLimitMode::Enforce, 0),
            CanProceed::No
        );
        assert_eq!(
            limiter.account_in_window(&label, 2, 5, RateLimitMode::Enforce, 0),
            CanProceed::Yes
        );
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let limiter = limiter();
        let label = RateLimiterLabel::new();
        for _ in 0..6 {
            limiter.account_in_window(&label, 7, 5, RateLimitMode::Enforce, 0);
        }
        assert_eq!(
            limiter.account_in_window(&label, 7, 5, RateLimitMode::Enforce, 0),
            CanProceed::No
        );
        assert_eq!(
            limiter.account_in_window(&label, 7, 5, RateLimitMode::Enforce, 1),
            CanProceed::Yes
        );
    }

    #[test]
    fn account_only_mode_never_rejects() {
        let limiter = limiter();
        let label = RateLimiterLabel::new();
        for _ in 0..20 {
            assert_eq!(
                limiter.account_in_window(&label, 9, 5, RateLimitMode::AccountOnly, 0),
                CanProceed::Yes
            );
        }
        assert_eq!(label.operations_rejected(), 0);
        assert_eq!(label.operations_accounted(), 20);

        // Counters carry over: enforcement right after sees the full window.
        assert_eq!(
            limiter.account_in_window(&label, 9, 5, RateLimitMode::Enforce, 0),
            CanProceed::No
        );
    }
}
