use stratadb::database::KeyspaceOptions;
use stratadb::reader_concurrency::ReaderResources;
use stratadb::{
    Cell, ExecutionContext, Mutation, PartitionKey, ReadCommand, Schema, ShardedDatabase,
    StrataConfig,
};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use uuid::Uuid;

fn one_reader_config() -> StrataConfig {
    StrataConfig {
        shard_count: 1,
        user_read_count: 1,
        user_read_memory_bytes: 1024 * 1024,
        read_memory_estimate_bytes: 64 * 1024,
        ..StrataConfig::development()
    }
}

async fn open_populated(dir: &std::path::Path) -> (ShardedDatabase, Schema) {
    let db = ShardedDatabase::open(dir, one_reader_config()).expect("open");
    db.create_keyspace("app", KeyspaceOptions::default())
        .await
        .expect("keyspace");
    let schema = Schema::new("app", "events");
    db.create_table(schema.clone()).await.expect("table");
    for i in 0..10u64 {
        db.apply(
            "app",
            "events",
            Mutation::upsert(
                PartitionKey::new(format!("k{i}").as_bytes()),
                vec![Cell {
                    column: "v".into(),
                    timestamp_micros: i,
                    value: vec![i as u8],
                }],
            ),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("apply");
    }
    (db, schema)
}

/// A cached querier holds the pool's only permit; a fresh read must evict
/// it rather than queue behind it forever.
#[tokio::test]
async fn pressure_evicts_a_cached_querier() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path()).await;

    let paged = ReadCommand::full_scan(schema.id, schema.version)
        .with_limit(2)
        .paged(Uuid::new_v4(), true);
    let first = db
        .query_on_shard(0, paged, ExecutionContext::user("web"), None)
        .await
        .expect("first page");
    assert!(first.short_read);
    assert_eq!(db.shard(0).querier_cache().population(), 1);

    // Unrelated read on the same pool: the parked querier gets reclaimed.
    let other = db
        .query_on_shard(
            0,
            ReadCommand::single_partition(schema.id, schema.version, PartitionKey::new(b"k3")),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("read under pressure");
    assert_eq!(other.rows.len(), 1);
    assert_eq!(db.shard(0).querier_cache().population(), 0);
    assert_eq!(
        db.shard(0)
            .querier_cache()
            .stats()
            .resource_based_evictions
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn blocked_read_times_out_and_is_shed() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path()).await;

    let sem = db
        .shard(0)
        .reader_concurrency()
        .semaphore_for(&ExecutionContext::user("web"));
    let held = sem
        .try_obtain(ReaderResources::new(1, 64 * 1024))
        .expect("hold the only slot");

    let err = db
        .query_on_shard(
            0,
            ReadCommand::single_partition(schema.id, schema.version, PartitionKey::new(b"k1")),
            ExecutionContext::user("web"),
            Some(Instant::now() + Duration::from_millis(50)),
        )
        .await
        .expect_err("must time out waiting for admission");
    assert!(err.is_timeout());
    assert_eq!(sem.reads_shed_due_to_timeout(), 1);
    assert_eq!(sem.waiter_count(), 0);

    drop(held);
    db.query_on_shard(
        0,
        ReadCommand::single_partition(schema.id, schema.version, PartitionKey::new(b"k1")),
        ExecutionContext::user("web"),
        None,
    )
    .await
    .expect("read after release");
}

/// A reader whose deadline lapsed by admission time must not proceed; the
/// mutation-form path re-checks the deadline after obtaining its permit.
#[tokio::test]
async fn expired_deadline_stops_a_mutation_read_after_admission() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path()).await;

    let err = db
        .shard(0)
        .query_mutations(
            ReadCommand::single_partition(schema.id, schema.version, PartitionKey::new(b"k1")),
            &ExecutionContext::user("web"),
            Some(Instant::now() - Duration::from_millis(1)),
        )
        .await
        .expect_err("expired deadline must not read");
    assert!(err.is_timeout());
}

/// System reads are admitted from their own pool and never contend with a
/// saturated user pool.
#[tokio::test]
async fn system_reads_bypass_user_pool_pressure() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path()).await;

    let sem = db
        .shard(0)
        .reader_concurrency()
        .semaphore_for(&ExecutionContext::user("web"));
    let _held = sem
        .try_obtain(ReaderResources::new(1, 64 * 1024))
        .expect("hold the only user slot");

    let result = db
        .query_on_shard(
            0,
            ReadCommand::single_partition(schema.id, schema.version, PartitionKey::new(b"k2")),
            ExecutionContext::system(),
            None,
        )
        .await
        .expect("system read");
    assert_eq!(result.rows.len(), 1);
}
