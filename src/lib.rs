//! Per-shard storage engine with commit-log durability.
//!
//! Data is partitioned across shards; each shard owns its tables' memtables,
//! on-disk runs and commit logs, and a worker task serializes its work.
//! [`ShardedDatabase`] is the multi-shard front: it routes writes to the
//! owning shard and coordinates the cross-shard operations (truncate, drop,
//! flush-all) as phased barriers.
//!
//! Write ordering is fixed: rate limit, view row lock, commit-log append,
//! memtable insert. A write is never visible before it is durable, and a
//! failed log append leaves no trace. Buffered writes are accounted against
//! a dirty-memory budget whose backlog drives flush priority through a
//! piecewise-linear controller; reads go through per-workload-class
//! admission semaphores, with paged reads parking their state (and their
//! admission permit) in a querier cache between pages.

pub mod commitlog;
pub mod config;
pub mod database;
pub mod dirty_memory;
pub mod error;
pub mod memtable;
pub mod mutation;
pub mod ondisk;
pub mod querier_cache;
pub mod rate_limiter;
pub mod read;
pub mod reader_concurrency;
pub mod schema;
pub mod sharded;
pub mod stats;
pub mod table;
pub mod truncation;

pub use crate::commitlog::{LogDomain, ReplayPosition};
pub use crate::config::StrataConfig;
pub use crate::database::{Database, KeyspaceOptions};
pub use crate::error::{StrataError, StrataErrorCode};
pub use crate::mutation::{Cell, Mutation, PartitionKey};
pub use crate::read::{ColumnSlice, KeyRange, QueryResult, ReadCommand};
pub use crate::schema::{ExecutionContext, RateLimitOptions, Schema, TableId, WorkloadClass};
pub use crate::sharded::{ShardedDatabase, TruncateOptions};
pub use crate::table::Table;
