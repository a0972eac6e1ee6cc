use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::tempdir;
use tidemark::catalog::chain::TxnReader;
use tidemark::catalog::schema::{ColumnDef, ColumnType, TableSchema};
use tidemark::clock::{HybridClock, Timestamp};
use tidemark::logservice::client::LogClient;
use tidemark::logservice::LogService;
use tidemark::storage::{row_key, Row, TupleTable, Value, WriteKind};
use tidemark::txn::{TxnCtx, TxnId};

const SEEDED_ROWS: u64 = 10_000;

fn accounts_schema() -> TableSchema {
    let mut schema = TableSchema::new("accounts");
    schema
        .add_column(ColumnDef::new("id", ColumnType::UInt64).primary())
        .expect("id");
    schema
        .add_column(ColumnDef::new("balance", ColumnType::Int64))
        .expect("balance");
    schema.finalize().expect("finalize");
    schema
}

fn seeded_table(clock: &HybridClock) -> (TupleTable, TableSchema) {
    let table = TupleTable::new(1);
    let schema = accounts_schema();
    let txn = Arc::new(TxnCtx::new(TxnId::generate(), clock.now(), Vec::new()));
    let mut keys = Vec::with_capacity(SEEDED_ROWS as usize);
    for id in 0..SEEDED_ROWS {
        let row = Row::new(vec![Value::UInt64(id), Value::Int64(id as i64)]);
        let key = row_key(&schema, &row).expect("key");
        table
            .stage(&txn, WriteKind::Insert, key.clone(), row)
            .expect("stage");
        keys.push(key);
    }
    let commit_ts = clock.now();
    txn.to_committing(commit_ts).expect("committing");
    table.commit(&txn, &keys, commit_ts).expect("commit");
    txn.to_committed().expect("committed");
    (table, schema)
}

fn bench_clock(c: &mut Criterion) {
    let clock = HybridClock::new();
    c.bench_function("hlc_now", |b| {
        b.iter(|| black_box(clock.now()));
    });
    c.bench_function("hlc_update_remote", |b| {
        let remote = Timestamp::new(1, 0);
        b.iter(|| black_box(clock.update(black_box(remote))));
    });
}

fn bench_tuple_reads(c: &mut Criterion) {
    let clock = HybridClock::new();
    let (table, schema) = seeded_table(&clock);
    let reader = TxnReader::snapshot(clock.now());
    let probe = row_key(
        &schema,
        &Row::new(vec![Value::UInt64(SEEDED_ROWS / 2), Value::Int64(0)]),
    )
    .expect("key");

    c.bench_function("tuple_point_read", |b| {
        b.iter(|| black_box(table.get(&reader, &probe)));
    });
    c.bench_function("tuple_scan_4096", |b| {
        b.iter(|| black_box(table.scan(&reader, None, 4096)));
    });
}

fn bench_tuple_writes(c: &mut Criterion) {
    let clock = HybridClock::new();
    let (table, schema) = seeded_table(&clock);

    c.bench_function("tuple_update_commit", |b| {
        let mut balance = 0i64;
        b.iter(|| {
            balance += 1;
            let txn = Arc::new(TxnCtx::new(TxnId::generate(), clock.now(), Vec::new()));
            let row = Row::new(vec![Value::UInt64(7), Value::Int64(balance)]);
            let key = row_key(&schema, &row).expect("key");
            table
                .stage(&txn, WriteKind::Update, key.clone(), row)
                .expect("stage");
            let commit_ts = clock.now();
            txn.to_committing(commit_ts).expect("committing");
            table
                .commit(&txn, std::slice::from_ref(&key), commit_ts)
                .expect("commit");
            txn.to_committed().expect("committed");
        });
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = tempdir().expect("temp");
    let service = LogService::open(dir.path()).expect("service");
    let client = LogClient::connect(&service, 1, 7).expect("client");
    let payload = vec![0xABu8; 256];

    c.bench_function("log_append_256b", |b| {
        b.iter(|| black_box(client.append(payload.clone()).expect("append")));
    });
}

criterion_group!(
    benches,
    bench_clock,
    bench_tuple_reads,
    bench_tuple_writes,
    bench_log_append
);
criterion_main!(benches);
