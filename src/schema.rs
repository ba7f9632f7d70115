use compact_str::CompactString;
use uuid::Uuid;

pub type ShardId = u32;

/// Stable table identity. Survives schema version changes; a table is only
/// ever addressed by this id inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub Uuid);

impl TableId {
    pub fn new() -> Self {
        TableId(Uuid::new_v4())
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Read,
    Write,
}

/// Per-partition throughput ceilings, per operation type. `None` means no
/// limit is configured for that operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitOptions {
    pub max_writes_per_second: Option<u32>,
    pub max_reads_per_second: Option<u32>,
}

impl RateLimitOptions {
    pub fn max_ops_per_second(&self, op: OperationType) -> Option<u32> {
        match op {
            OperationType::Read => self.max_reads_per_second,
            OperationType::Write => self.max_writes_per_second,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadClass {
    User,
    System,
    Maintenance,
}

/// Caller execution context: selects resource pools and decides whether
/// per-partition rate limiting applies (user class only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub workload: WorkloadClass,
    /// Service level name, used to pick the user reader pool. Ignored for
    /// system and maintenance work.
    pub service_level: CompactString,
}

impl ExecutionContext {
    pub fn user(service_level: impl Into<CompactString>) -> Self {
        Self {
            workload: WorkloadClass::User,
            service_level: service_level.into(),
        }
    }

    pub fn system() -> Self {
        Self {
            workload: WorkloadClass::System,
            service_level: CompactString::new_inline("system"),
        }
    }

    pub fn maintenance() -> Self {
        Self {
            workload: WorkloadClass::Maintenance,
            service_level: CompactString::new_inline("maintenance"),
        }
    }
}

/// Immutable table schema snapshot handed around as `Arc<Schema>`.
///
/// `registered` is set by the registry when the schema becomes current;
/// applying with an unregistered or stale schema is an internal error, not
/// a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub id: TableId,
    pub version: SchemaVersion,
    pub keyspace_name: CompactString,
    pub table_name: CompactString,
    pub durable_writes: bool,
    pub rate_limits: RateLimitOptions,
    /// Ids of secondary views whose replica updates this table drives.
    /// Non-owning: views are resolved through the registry on demand.
    pub views: Vec<TableId>,
    pub registered: bool,
}

impl Schema {
    pub fn new(
        keyspace_name: impl Into<CompactString>,
        table_name: impl Into<CompactString>,
    ) -> Self {
        Self {
            id: TableId::new(),
            version: SchemaVersion(1),
            keyspace_name: keyspace_name.into(),
            table_name: table_name.into(),
            durable_writes: true,
            rate_limits: RateLimitOptions::default(),
            views: Vec::new(),
            registered: false,
        }
    }

    pub fn with_rate_limits(mut self, limits: RateLimitOptions) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn with_durable_writes(mut self, durable: bool) -> Self {
        self.durable_writes = durable;
        self
    }

    pub fn with_views(mut self, views: Vec<TableId>) -> Self {
        self.views = views;
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.keyspace_name, self.table_name)
    }
}
