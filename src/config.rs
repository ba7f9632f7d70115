/// Runtime configuration for one engine instance.
///
/// Everything that used to be ambient process state in older designs (a
/// default dirty-memory manager, a global write-isolation setting) is an
/// explicit field here and is threaded through component constructors.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    pub shard_count: u32,

    // Dirty memory budgets. The regular manager backs user tables; the
    // system manager backs internal tables so user pressure cannot starve
    // them.
    pub dirty_soft_limit_bytes: u64,
    pub dirty_hard_limit_bytes: u64,
    pub system_dirty_soft_limit_bytes: u64,
    pub system_dirty_hard_limit_bytes: u64,

    // Flush controller: ordered (backlog fraction, priority shares) control
    // points. `flush_static_shares > 0` disables the controller and pins
    // priority to that value.
    pub flush_control_points: Vec<(f64, f64)>,
    pub flush_static_shares: f64,
    pub extraneous_flush_shares: f64,

    // Commit log segment rotation.
    pub max_segment_bytes: u64,
    pub max_segment_age_secs: u64,
    pub sync_every_append: bool,

    // Reader admission pools. User pools are created per service level with
    // these limits; system and maintenance pools are deliberately generous.
    pub user_read_count: usize,
    pub user_read_memory_bytes: u64,
    pub system_read_count: usize,
    pub system_read_memory_bytes: u64,
    pub maintenance_read_count: usize,
    pub maintenance_read_memory_bytes: u64,
    pub read_memory_estimate_bytes: u64,

    // Paging querier cache.
    pub querier_cache_capacity: usize,
    pub querier_cache_ttl_ms: u64,

    // Per-partition rate limiting.
    pub rate_limit_window_ms: u64,

    // Result sizing. `max_result_size_bytes` bounds a single user read;
    // `result_memory_limit_bytes` bounds all in-flight results per shard.
    pub max_result_size_bytes: u64,
    pub result_memory_limit_bytes: u64,

    pub default_durable_writes: bool,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            shard_count: 2,
            dirty_soft_limit_bytes: 64 * 1024 * 1024,
            dirty_hard_limit_bytes: 128 * 1024 * 1024,
            system_dirty_soft_limit_bytes: 10 * 1024 * 1024,
            system_dirty_hard_limit_bytes: 20 * 1024 * 1024,
            flush_control_points: vec![(0.0, 50.0), (0.5, 200.0), (1.0, 1000.0)],
            flush_static_shares: 0.0,
            extraneous_flush_shares: 200.0,
            max_segment_bytes: 32 * 1024 * 1024,
            max_segment_age_secs: 3600,
            sync_every_append: true,
            user_read_count: 100,
            user_read_memory_bytes: 64 * 1024 * 1024,
            system_read_count: 10_000,
            system_read_memory_bytes: 1024 * 1024 * 1024,
            maintenance_read_count: 10_000,
            maintenance_read_memory_bytes: 1024 * 1024 * 1024,
            read_memory_estimate_bytes: 128 * 1024,
            querier_cache_capacity: 256,
            querier_cache_ttl_ms: 10_000,
            rate_limit_window_ms: 1_000,
            max_result_size_bytes: 1024 * 1024,
            result_memory_limit_bytes: 256 * 1024 * 1024,
            default_durable_writes: true,
        }
    }
}

impl StrataConfig {
    /// Small limits, buffered log writes. Meant for local iteration only.
    pub fn development() -> Self {
        Self {
            dirty_soft_limit_bytes: 4 * 1024 * 1024,
            dirty_hard_limit_bytes: 8 * 1024 * 1024,
            max_segment_bytes: 1024 * 1024,
            sync_every_append: false,
            ..Self::default()
        }
    }

    pub fn segment_config(&self) -> crate::commitlog::segment::SegmentConfig {
        crate::commitlog::segment::SegmentConfig {
            max_segment_bytes: self.max_segment_bytes,
            max_segment_age: std::time::Duration::from_secs(self.max_segment_age_secs),
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::StrataError> {
        if self.shard_count == 0 {
            return Err(crate::error::StrataError::InvalidConfig {
                message: "shard_count must be at least 1".into(),
            });
        }
        if self.dirty_hard_limit_bytes < self.dirty_soft_limit_bytes {
            return Err(crate::error::StrataError::InvalidConfig {
                message: "dirty hard limit below soft limit".into(),
            });
        }
        if self.flush_static_shares == 0.0 && self.flush_control_points.len() < 2 {
            return Err(crate::error::StrataError::InvalidConfig {
                message: "flush controller needs at least two control points".into(),
            });
        }
        let mut prev: Option<(f64, f64)> = None;
        for &(input, output) in &self.flush_control_points {
            if let Some((pi, po)) = prev {
                if input <= pi || output < po {
                    return Err(crate::error::StrataError::InvalidConfig {
                        message: "flush control points must be strictly increasing".into(),
                    });
                }
            }
            prev = Some((input, output));
        }
        Ok(())
    }
}
