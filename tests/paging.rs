use stratadb::database::KeyspaceOptions;
use stratadb::schema::SchemaVersion;
use stratadb::{
    Cell, ColumnSlice, ExecutionContext, Mutation, PartitionKey, ReadCommand, Schema,
    ShardedDatabase, StrataConfig, StrataErrorCode,
};
use std::sync::atomic::Ordering;
use tempfile::tempdir;
use uuid::Uuid;

fn single_shard_config() -> StrataConfig {
    StrataConfig {
        shard_count: 1,
        ..StrataConfig::development()
    }
}

async fn open_populated(dir: &std::path::Path, n: u64) -> (ShardedDatabase, Schema) {
    let db = ShardedDatabase::open(dir, single_shard_config()).expect("open");
    db.create_keyspace("app", KeyspaceOptions::default())
        .await
        .expect("keyspace");
    let schema = Schema::new("app", "events");
    db.create_table(schema.clone()).await.expect("table");
    for i in 0..n {
        db.apply(
            "app",
            "events",
            Mutation::upsert(
                PartitionKey::new(format!("k{i:03}").as_bytes()),
                vec![
                    Cell {
                        column: "v".into(),
                        timestamp_micros: i,
                        value: vec![i as u8],
                    },
                    Cell {
                        column: "w".into(),
                        timestamp_micros: i,
                        value: vec![0],
                    },
                ],
            ),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("apply");
    }
    (db, schema)
}

#[tokio::test]
async fn paged_scan_visits_every_partition_exactly_once() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path(), 10).await;
    let query_id = Uuid::new_v4();

    let mut keys = Vec::new();
    let mut first_page = true;
    loop {
        let cmd = ReadCommand::full_scan(schema.id, schema.version)
            .with_limit(3)
            .paged(query_id, first_page);
        let page = db
            .query_on_shard(0, cmd, ExecutionContext::user("web"), None)
            .await
            .expect("page");
        for row in &page.rows {
            keys.push(row.key.clone());
        }
        if !page.short_read {
            break;
        }
        assert_eq!(page.rows.len(), 3);
        first_page = false;
    }

    assert_eq!(keys.len(), 10);
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(keys, sorted, "pages must be ordered and disjoint");

    // The final page released the querier instead of re-caching it.
    assert_eq!(db.shard(0).querier_cache().population(), 0);
}

#[tokio::test]
async fn continuation_pages_hit_the_cache() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path(), 9).await;
    let query_id = Uuid::new_v4();

    let cmd = ReadCommand::full_scan(schema.id, schema.version).with_limit(4);
    db.query_on_shard(
        0,
        cmd.clone().paged(query_id, true),
        ExecutionContext::user("web"),
        None,
    )
    .await
    .expect("first page");
    db.query_on_shard(
        0,
        cmd.paged(query_id, false),
        ExecutionContext::user("web"),
        None,
    )
    .await
    .expect("second page");

    let stats = db.shard(0).querier_cache().stats();
    assert_eq!(stats.lookups.load(Ordering::Relaxed), 1);
    assert_eq!(stats.misses.load(Ordering::Relaxed), 0);
}

/// A continuation page with a different projection must not resume the old
/// scan: the cached querier is dropped and the scan starts over.
#[tokio::test]
async fn changed_slice_drops_the_cached_querier() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path(), 8).await;
    let query_id = Uuid::new_v4();

    let first = db
        .query_on_shard(
            0,
            ReadCommand::full_scan(schema.id, schema.version)
                .with_limit(3)
                .paged(query_id, true),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("first page");
    assert!(first.short_read);
    let first_key = first.rows[0].key.clone();

    let narrowed = db
        .query_on_shard(
            0,
            ReadCommand::full_scan(schema.id, schema.version)
                .with_limit(3)
                .with_slice(ColumnSlice::of(["v"]))
                .paged(query_id, false),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect("restarted page");

    let stats = db.shard(0).querier_cache().stats();
    assert_eq!(stats.drops.load(Ordering::Relaxed), 1);
    // Restarted from the top, with only the requested column.
    assert_eq!(narrowed.rows[0].key, first_key);
    assert!(narrowed.rows.iter().all(|r| r.cells.len() == 1));
}

#[tokio::test]
async fn read_with_a_stale_schema_version_fails() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path(), 4).await;

    let err = db
        .query_on_shard(
            0,
            ReadCommand::full_scan(schema.id, SchemaVersion(schema.version.0 + 1)),
            ExecutionContext::user("web"),
            None,
        )
        .await
        .expect_err("stale version must be rejected");
    assert_eq!(err.code(), StrataErrorCode::Internal);
}

#[tokio::test]
async fn workload_class_change_counts_as_scheduling_mismatch() {
    let dir = tempdir().expect("temp dir");
    let (db, schema) = open_populated(dir.path(), 8).await;
    let query_id = Uuid::new_v4();

    let cmd = ReadCommand::full_scan(schema.id, schema.version).with_limit(3);
    db.query_on_shard(
        0,
        cmd.clone().paged(query_id, true),
        ExecutionContext::user("web"),
        None,
    )
    .await
    .expect("first page");

    db.query_on_shard(
        0,
        cmd.paged(query_id, false),
        ExecutionContext::system(),
        None,
    )
    .await
    .expect("page under a different class");

    let stats = db.shard(0).querier_cache().stats();
    assert_eq!(stats.scheduling_group_mismatches.load(Ordering::Relaxed), 1);
}
