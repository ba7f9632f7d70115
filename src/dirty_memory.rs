//! Dirty-memory accounting and the backlog-driven flush controller.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks bytes held by not-yet-flushed memtables against a budget.
///
/// Accounting is exactly-once per buffered write and released exactly once
/// when the owning memtable finishes flushing; an over-release indicates a
/// defect and aborts the process rather than silently corrupting the
/// backpressure signal.
#[derive(Debug)]
pub struct DirtyMemoryManager {
    soft_limit: u64,
    hard_limit: u64,
    current: AtomicU64,
    extraneous_flushes: AtomicU64,
}

impl DirtyMemoryManager {
    pub fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
            current: AtomicU64::new(0),
            extraneous_flushes: AtomicU64::new(0),
        }
    }

    pub fn account(&self, bytes: u64) {
        self.current.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        let prev = self.current.fetch_sub(bytes, Ordering::Relaxed);
        if prev < bytes {
            panic!("dirty memory accounting mismatch: released {bytes} with only {prev} held");
        }
    }

    pub fn current_bytes(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    /// Fraction of the soft budget consumed, clamped to [0, 1].
    pub fn backlog(&self) -> f64 {
        if self.soft_limit == 0 {
            return 1.0;
        }
        (self.current_bytes() as f64 / self.soft_limit as f64).clamp(0.0, 1.0)
    }

    pub fn over_soft_limit(&self) -> bool {
        self.current_bytes() >= self.soft_limit
    }

    pub fn over_hard_limit(&self) -> bool {
        self.current_bytes() >= self.hard_limit
    }

    /// An explicit flush outside normal backlog-driven flushing is pending;
    /// the controller gives such flushes a fixed elevated priority floor.
    pub fn start_extraneous_flush(&self) {
        self.extraneous_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_extraneous_flush(&self) {
        let prev = self.extraneous_flushes.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            panic!("extraneous flush counter underflow");
        }
    }

    pub fn has_extraneous_flushes(&self) -> bool {
        self.extraneous_flushes.load(Ordering::Relaxed) > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub input: f64,
    pub output: f64,
}

/// Piecewise-linear backlog → flush-priority mapping.
///
/// Pure interpolation over an ordered list of control points; no hidden
/// state, so the mapping is independently testable. A non-zero
/// `static_shares` disables the controller and pins priority.
#[derive(Debug)]
pub struct FlushController {
    control_points: Vec<ControlPoint>,
    static_shares: f64,
    extraneous_flush_shares: f64,
    current_shares: Mutex<f64>,
}

impl FlushController {
    pub fn new(
        points: impl IntoIterator<Item = (f64, f64)>,
        static_shares: f64,
        extraneous_flush_shares: f64,
    ) -> Self {
        let control_points = points
            .into_iter()
            .map(|(input, output)| ControlPoint { input, output })
            .collect::<Vec<_>>();
        let initial = if static_shares > 0.0 {
            static_shares
        } else {
            control_points.first().map_or(0.0, |cp| cp.output)
        };
        Self {
            control_points,
            static_shares,
            extraneous_flush_shares,
            current_shares: Mutex::new(initial),
        }
    }

    pub fn controller_disabled(&self) -> bool {
        self.static_shares > 0.0
    }

    pub fn current_shares(&self) -> f64 {
        *self.current_shares.lock()
    }

    /// Recompute priority from the manager's backlog. When extraneous
    /// flushes are pending the effective backlog is raised to at least the
    /// backlog that maps to the configured elevated share level.
    pub fn adjust(&self, dirty: &DirtyMemoryManager) -> f64 {
        let mut backlog = dirty.backlog();
        if dirty.has_extraneous_flushes() {
            backlog = backlog.max(self.backlog_of_shares(self.extraneous_flush_shares));
        }
        let shares = self.shares_for_backlog(backlog);
        *self.current_shares.lock() = shares;
        shares
    }

    pub fn shares_for_backlog(&self, backlog: f64) -> f64 {
        if self.controller_disabled() {
            return self.static_shares;
        }
        let points = &self.control_points;
        let last = points[points.len() - 1];
        if backlog >= last.input {
            return last.output;
        }
        let mut idx = 1;
        while idx < points.len() - 1 && points[idx].input < backlog {
            idx += 1;
        }
        let cp = points[idx];
        let prev = points[idx - 1];
        prev.output + (backlog - prev.input) * (cp.output - prev.output) / (cp.input - prev.input)
    }

    /// Inverse mapping: the backlog that would produce `shares`.
    pub fn backlog_of_shares(&self, shares: f64) -> f64 {
        if self.controller_disabled() || self.control_points.is_empty() {
            return 1.0;
        }
        let points = &self.control_points;
        let mut idx = 1;
        while idx < points.len() - 1 && points[idx].output < shares {
            idx += 1;
        }
        let cp = points[idx];
        let prev = points[idx - 1];
        prev.input + (shares - prev.output) * (cp.input - prev.input) / (cp.output - prev.output)
    }
}
