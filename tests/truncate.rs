use stratadb::database::KeyspaceOptions;
use stratadb::{
    Cell, ExecutionContext, Mutation, PartitionKey, ReadCommand, Schema, ShardedDatabase,
    StrataConfig, StrataErrorCode, TruncateOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::tempdir;

fn config(shards: u32) -> StrataConfig {
    StrataConfig {
        shard_count: shards,
        ..StrataConfig::development()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_micros() as u64
}

fn write_at(key: &[u8], value: &[u8], ts: u64) -> Mutation {
    Mutation::upsert(
        PartitionKey::new(key),
        vec![Cell {
            column: "v".into(),
            timestamp_micros: ts,
            value: value.to_vec(),
        }],
    )
}

async fn open_with_table(dir: &std::path::Path, shards: u32) -> (ShardedDatabase, Schema) {
    let db = ShardedDatabase::open(dir, config(shards)).expect("open");
    db.create_keyspace("app", KeyspaceOptions::default())
        .await
        .expect("keyspace");
    let schema = Schema::new("app", "events");
    db.create_table(schema.clone()).await.expect("table");
    (db, schema)
}

async fn populate(db: &ShardedDatabase, n: u64) {
    for i in 0..n {
        db.apply(
            "app",
            "events",
            write_at(format!("k{i}").as_bytes(), b"x", now_micros()),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("apply");
    }
}

async fn count_rows(db: &ShardedDatabase, schema: &Schema) -> usize {
    let mut total = 0;
    for shard in 0..db.shard_count() {
        let result = db
            .query_on_shard(
                shard,
                ReadCommand::full_scan(schema.id, schema.version),
                ExecutionContext::user("web"),
                None,
            )
            .await
            .expect("query");
        total += result.rows.len();
    }
    total
}

#[tokio::test]
async fn truncate_empties_every_shard() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 2).await;
    populate(&db, 32).await;
    // Part of the data on disk, part still buffered.
    db.flush_all().await.expect("flush");
    populate(&db, 8).await;
    assert_eq!(count_rows(&db, &schema).await, 32);

    db.truncate_table("app", "events", TruncateOptions::default())
        .await
        .expect("truncate");
    assert_eq!(count_rows(&db, &schema).await, 0);

    // A persisted record exists on every shard.
    for shard in 0..db.shard_count() {
        assert!(db.shard(shard).truncation_store().get(schema.id).is_some());
    }
}

/// Writes racing a durable truncate either make the flush (and get
/// discarded with the rest) or drop at their memtable insert; either way
/// the truncate itself must succeed and leave a record behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_succeeds_under_concurrent_writes() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 1).await;
    let db = Arc::new(db);
    populate(&db, 8).await;

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = db
                    .apply(
                        "app",
                        "events",
                        write_at(format!("w{i}").as_bytes(), b"x", i),
                        ExecutionContext::user("web"),
                        None,
                    )
                    .await;
                i += 1;
            }
        })
    };

    for _ in 0..5 {
        db.truncate_table(
            "app",
            "events",
            TruncateOptions {
                durable: Some(true),
                ..TruncateOptions::default()
            },
        )
        .await
        .expect("truncate under write load");
    }
    stop.store(true, Ordering::Relaxed);
    writer.await.expect("writer task");

    assert!(db.shard(0).truncation_store().get(schema.id).is_some());
}

#[tokio::test]
async fn table_accepts_writes_after_truncate() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 2).await;
    populate(&db, 8).await;
    db.truncate_table("app", "events", TruncateOptions::default())
        .await
        .expect("truncate");

    populate(&db, 4).await;
    assert_eq!(count_rows(&db, &schema).await, 4);
}

#[tokio::test]
async fn durable_truncate_holds_across_restart() {
    let dir = tempdir().expect("temp dir");
    let schema;
    {
        let (db, s) = open_with_table(dir.path(), 2).await;
        schema = s;
        populate(&db, 16).await;
        db.truncate_table(
            "app",
            "events",
            TruncateOptions {
                durable: Some(true),
                ..TruncateOptions::default()
            },
        )
        .await
        .expect("truncate");
        // Post-truncate writes must come back after the restart.
        populate(&db, 3).await;
        db.shutdown().await;
    }

    let db = ShardedDatabase::open(dir.path(), config(2)).expect("reopen");
    db.create_keyspace("app", KeyspaceOptions::default())
        .await
        .expect("keyspace");
    db.create_table(schema.clone()).await.expect("table");
    db.recover().await.expect("recover");
    assert_eq!(count_rows(&db, &schema).await, 3);
}

#[tokio::test]
async fn non_durable_truncate_discards_buffered_writes() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 1).await;
    populate(&db, 8).await;

    db.truncate_table(
        "app",
        "events",
        TruncateOptions {
            durable: Some(false),
            ..TruncateOptions::default()
        },
    )
    .await
    .expect("truncate");
    assert_eq!(count_rows(&db, &schema).await, 0);
}

#[tokio::test]
async fn truncate_with_snapshot_keeps_a_copy() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 1).await;
    populate(&db, 8).await;
    db.flush_all().await.expect("flush");

    db.truncate_table(
        "app",
        "events",
        TruncateOptions {
            durable: Some(true),
            snapshot_tag: Some("pre-truncate".into()),
            ..TruncateOptions::default()
        },
    )
    .await
    .expect("truncate");

    assert_eq!(count_rows(&db, &schema).await, 0);
    let snapshot_dir = dir
        .path()
        .join("shard-0")
        .join("tables")
        .join(schema.id.to_string())
        .join("snapshots")
        .join("pre-truncate");
    assert!(snapshot_dir.is_dir());
}

#[tokio::test]
async fn dropped_table_is_gone_for_good() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_with_table(dir.path(), 2).await;
    populate(&db, 8).await;
    db.flush_all().await.expect("flush");

    db.drop_table("app", "events").await.expect("drop");
    for shard in 0..db.shard_count() {
        assert!(!db.shard(shard).table_exists("app", "events"));
        assert!(db.shard(shard).truncation_store().get(schema.id).is_none());
    }
    let err = db
        .apply(
            "app",
            "events",
            write_at(b"k", b"x", 1),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect_err("dropped table");
    assert_eq!(err.code(), StrataErrorCode::TableNotFound);

    let data_dir = dir
        .path()
        .join("shard-0")
        .join("tables")
        .join(schema.id.to_string());
    assert!(!data_dir.exists());
}
