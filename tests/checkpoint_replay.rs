use std::sync::Arc;

use tempfile::TempDir;
use tidemark::catalog::schema::{ColumnDef, ColumnType, TableSchema};
use tidemark::storage::handler::{StorageRequest, StorageResponse};
use tidemark::storage::{Row, Value};
use tidemark::{Store, StoreConfig, Timestamp};

fn store_in(dir: &TempDir, uuid: &str) -> Arc<Store> {
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    };
    Store::open(uuid, config).expect("open store")
}

fn events_schema() -> TableSchema {
    let mut schema = TableSchema::new("events");
    schema
        .add_column(ColumnDef::new("id", ColumnType::UInt64).primary())
        .expect("id");
    schema
        .add_column(ColumnDef::new("body", ColumnType::Varchar))
        .expect("body");
    schema.finalize().expect("finalize");
    schema
}

async fn snapshot_rows(
    store: &Arc<Store>,
    table_id: u64,
    at: Timestamp,
    ids: impl Iterator<Item = u64>,
) -> Vec<Option<String>> {
    let reader = store.begin(Some(at)).expect("reader");
    let mut out = Vec::new();
    for id in ids {
        let resp = store
            .read(
                &reader,
                1,
                StorageRequest::Read {
                    table_id,
                    keys: vec![vec![Value::UInt64(id)]],
                },
            )
            .await
            .expect("read");
        match resp {
            StorageResponse::Rows { rows } => out.push(rows.first().map(|r| match &r.values[1] {
                Value::Str(s) => s.clone(),
                other => panic!("unexpected value: {other:?}"),
            })),
            other => panic!("unexpected response: {other:?}"),
        }
    }
    out
}

#[tokio::test]
async fn restart_after_checkpoint_restores_identical_state() {
    let dir = TempDir::new().expect("tempdir");
    let table_id;
    let snapshot_ts;
    let expected;
    {
        let store = store_in(&dir, "store-a");
        store.create_replica(1, 1).expect("replica");

        let setup = store.begin(None).expect("begin");
        let db_id = match store
            .write(
                &setup,
                1,
                StorageRequest::CreateDatabase {
                    tenant_id: 0,
                    name: "audit".into(),
                },
            )
            .await
            .expect("db")
        {
            StorageResponse::DatabaseCreated { db_id } => db_id,
            other => panic!("unexpected response: {other:?}"),
        };
        table_id = match store
            .write(
                &setup,
                1,
                StorageRequest::CreateRelation {
                    db_id,
                    schema: events_schema(),
                },
            )
            .await
            .expect("table")
        {
            StorageResponse::RelationCreated { table_id } => table_id,
            other => panic!("unexpected response: {other:?}"),
        };
        store.commit(&setup).await.expect("commit setup");

        // A few hundred committed records across several transactions.
        for batch in 0..10u64 {
            let txn = store.begin(None).expect("begin batch");
            let rows = (0..100u64)
                .map(|i| {
                    let id = batch * 100 + i;
                    Row::new(vec![Value::UInt64(id), Value::Str(format!("event-{id}"))])
                })
                .collect();
            store
                .write(&txn, 1, StorageRequest::Write { table_id, rows })
                .await
                .expect("write batch");
            store.commit(&txn).await.expect("commit batch");
        }

        let checkpointer = store.checkpointer(1).expect("checkpointer");
        let entry = checkpointer
            .run_once()
            .expect("checkpoint")
            .expect("entry");
        snapshot_ts = entry.max_ts;

        // The log was truncated up to the checkpoint record.
        let replica = store.replica(1).expect("replica");
        assert_eq!(replica.log().truncated_lsn(), entry.lsn - 1);

        expected = snapshot_rows(&store, table_id, snapshot_ts, 0..1000).await;
        assert!(expected.iter().all(|b| b.is_some()));
    }

    // Restart: a fresh store on the same data directory replays the
    // checkpoint (and nothing else) into an identical catalog.
    let store = store_in(&dir, "store-a");
    store.create_replica(1, 1).expect("replica after restart");

    let restored = snapshot_rows(&store, table_id, snapshot_ts, 0..1000).await;
    assert_eq!(restored, expected);

    // Schema survived too.
    let reader = store.begin(Some(snapshot_ts)).expect("reader");
    let resp = store
        .read(&reader, 1, StorageRequest::GetTableDefs { table_id })
        .await
        .expect("defs");
    match resp {
        StorageResponse::TableDefs { schema } => {
            assert_eq!(schema.name, "events");
            assert!(schema.column("body").is_some());
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn records_after_checkpoint_replay_on_top_of_snapshot() {
    let dir = TempDir::new().expect("tempdir");
    let table_id;
    let final_ts;
    {
        let store = store_in(&dir, "store-a");
        store.create_replica(1, 1).expect("replica");

        let setup = store.begin(None).expect("begin");
        let db_id = match store
            .write(
                &setup,
                1,
                StorageRequest::CreateDatabase {
                    tenant_id: 0,
                    name: "audit".into(),
                },
            )
            .await
            .expect("db")
        {
            StorageResponse::DatabaseCreated { db_id } => db_id,
            other => panic!("unexpected response: {other:?}"),
        };
        table_id = match store
            .write(
                &setup,
                1,
                StorageRequest::CreateRelation {
                    db_id,
                    schema: events_schema(),
                },
            )
            .await
            .expect("table")
        {
            StorageResponse::RelationCreated { table_id } => table_id,
            other => panic!("unexpected response: {other:?}"),
        };
        store.commit(&setup).await.expect("commit setup");

        let before = store.begin(None).expect("before");
        store
            .write(
                &before,
                1,
                StorageRequest::Write {
                    table_id,
                    rows: vec![Row::new(vec![
                        Value::UInt64(1),
                        Value::Str("pre-checkpoint".into()),
                    ])],
                },
            )
            .await
            .expect("write");
        store.commit(&before).await.expect("commit");

        store
            .checkpointer(1)
            .expect("checkpointer")
            .run_once()
            .expect("checkpoint")
            .expect("entry");

        // This one only exists as a WAL record past the checkpoint.
        let after = store.begin(None).expect("after");
        store
            .write(
                &after,
                1,
                StorageRequest::Write {
                    table_id,
                    rows: vec![Row::new(vec![
                        Value::UInt64(2),
                        Value::Str("post-checkpoint".into()),
                    ])],
                },
            )
            .await
            .expect("write");
        final_ts = store.commit(&after).await.expect("commit");
    }

    let store = store_in(&dir, "store-a");
    store.create_replica(1, 1).expect("replica after restart");

    let rows = snapshot_rows(&store, table_id, final_ts.next(), 1..3).await;
    assert_eq!(
        rows,
        vec![
            Some("pre-checkpoint".to_string()),
            Some("post-checkpoint".to_string())
        ]
    );
}
