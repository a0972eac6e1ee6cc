use std::sync::Arc;

use tempfile::TempDir;
use tidemark::catalog::schema::{ColumnDef, ColumnType, TableSchema};
use tidemark::storage::handler::{StorageRequest, StorageResponse};
use tidemark::storage::{Row, Value};
use tidemark::{Store, StoreConfig, TxnState};

fn store_in(dir: &TempDir) -> Arc<Store> {
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    };
    Store::open("store-a", config).expect("open store")
}

fn users_schema() -> TableSchema {
    let mut schema = TableSchema::new("users");
    schema
        .add_column(ColumnDef::new("id", ColumnType::UInt64).primary())
        .expect("id");
    schema
        .add_column(ColumnDef::new("name", ColumnType::Varchar))
        .expect("name");
    schema.finalize().expect("finalize");
    schema
}

#[tokio::test]
async fn write_then_read_across_transactions() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_in(&dir);
    store.create_replica(1, 1).expect("replica");

    let txn = store.begin(None).expect("begin");
    store
        .write(
            &txn,
            1,
            StorageRequest::CreateDatabase {
                tenant_id: 0,
                name: "d".into(),
            },
        )
        .await
        .expect("create database");
    let commit_ts = store.commit(&txn).await.expect("commit");
    assert!(commit_ts > txn.start_ts());
    assert_eq!(txn.state(false), TxnState::Committed);

    let reader = store.begin(None).expect("begin reader");
    assert!(reader.start_ts() > commit_ts);
    let resp = store
        .read(&reader, 1, StorageRequest::GetDatabases { tenant_id: 0 })
        .await
        .expect("list databases");
    assert_eq!(
        resp,
        StorageResponse::Databases {
            names: vec!["d".into(), "mo_catalog".into()]
        }
    );
}

#[tokio::test]
async fn rolled_back_writes_are_never_visible() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_in(&dir);
    store.create_replica(1, 1).expect("replica");

    let setup = store.begin(None).expect("begin");
    let db_id = match store
        .write(
            &setup,
            1,
            StorageRequest::CreateDatabase {
                tenant_id: 0,
                name: "app".into(),
            },
        )
        .await
        .expect("db")
    {
        StorageResponse::DatabaseCreated { db_id } => db_id,
        other => panic!("unexpected response: {other:?}"),
    };
    let table_id = match store
        .write(
            &setup,
            1,
            StorageRequest::CreateRelation {
                db_id,
                schema: users_schema(),
            },
        )
        .await
        .expect("table")
    {
        StorageResponse::RelationCreated { table_id } => table_id,
        other => panic!("unexpected response: {other:?}"),
    };
    store.commit(&setup).await.expect("commit setup");

    let doomed = store.begin(None).expect("begin doomed");
    store
        .write(
            &doomed,
            1,
            StorageRequest::Write {
                table_id,
                rows: vec![Row::new(vec![Value::UInt64(1), Value::Str("ghost".into())])],
            },
        )
        .await
        .expect("stage write");
    store.rollback(&doomed).await.expect("rollback");
    assert_eq!(doomed.state(false), TxnState::Rollbacked);

    let reader = store.begin(None).expect("reader");
    let resp = store
        .read(
            &reader,
            1,
            StorageRequest::Read {
                table_id,
                keys: vec![vec![Value::UInt64(1)]],
            },
        )
        .await
        .expect("read");
    assert_eq!(resp, StorageResponse::Rows { rows: vec![] });
}

#[tokio::test]
async fn committed_rows_read_back_at_later_snapshots() {
    let dir = TempDir::new().expect("tempdir");
    let store = store_in(&dir);
    store.create_replica(1, 1).expect("replica");

    let setup = store.begin(None).expect("begin");
    let db_id = match store
        .write(
            &setup,
            1,
            StorageRequest::CreateDatabase {
                tenant_id: 0,
                name: "app".into(),
            },
        )
        .await
        .expect("db")
    {
        StorageResponse::DatabaseCreated { db_id } => db_id,
        other => panic!("unexpected response: {other:?}"),
    };
    let table_id = match store
        .write(
            &setup,
            1,
            StorageRequest::CreateRelation {
                db_id,
                schema: users_schema(),
            },
        )
        .await
        .expect("table")
    {
        StorageResponse::RelationCreated { table_id } => table_id,
        other => panic!("unexpected response: {other:?}"),
    };
    store.commit(&setup).await.expect("commit setup");

    let writer = store.begin(None).expect("writer");
    store
        .write(
            &writer,
            1,
            StorageRequest::Write {
                table_id,
                rows: vec![Row::new(vec![Value::UInt64(7), Value::Str("ada".into())])],
            },
        )
        .await
        .expect("row");
    let commit_ts = store.commit(&writer).await.expect("commit row");

    // A snapshot from before the commit sees nothing.
    let historical = store.begin(Some(commit_ts.prev())).expect("historical");
    let resp = store
        .read(
            &historical,
            1,
            StorageRequest::Read {
                table_id,
                keys: vec![vec![Value::UInt64(7)]],
            },
        )
        .await
        .expect("read old");
    assert_eq!(resp, StorageResponse::Rows { rows: vec![] });

    let current = store.begin(None).expect("current");
    let resp = store
        .read(
            &current,
            1,
            StorageRequest::Read {
                table_id,
                keys: vec![vec![Value::UInt64(7)]],
            },
        )
        .await
        .expect("read new");
    match resp {
        StorageResponse::Rows { rows } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].values[1], Value::Str("ada".into()));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}
