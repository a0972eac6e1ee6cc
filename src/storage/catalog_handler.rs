use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::chain::TxnReader;
use crate::catalog::entry::EntityId;
use crate::catalog::schema::ColumnType;
use crate::catalog::{
    is_system_table_id, CatalogTree, SYSTEM_DB_ID, SYSTEM_TABLE_COLUMNS_ID,
    SYSTEM_TABLE_DATABASES_ID, SYSTEM_TABLE_TABLES_ID,
};
use crate::error::StoreError;
use crate::storage::handler::{MemHandler, StorageRequest, StorageResponse, Workspace};
use crate::storage::{key_from_values, Row, Value};
use crate::txn::TxnCtx;

/// Iterator ids handed out by the catalog handler live above this bound
/// so they never collide with upstream tuple iterators.
const CATALOG_ITER_BASE: u64 = 1 << 48;

struct CatalogIter {
    rows: Vec<Row>,
    pos: usize,
}

/// Intercepts reads over the three virtual system relations and
/// synthesizes their rows from catalog state at the reader's snapshot;
/// rejects writes against them without consulting the upstream handler.
/// Everything else proxies through.
pub struct CatalogHandler {
    upstream: Arc<MemHandler>,
    iters: Mutex<HashMap<u64, CatalogIter>>,
    next_iter: AtomicU64,
}

impl CatalogHandler {
    pub fn new(upstream: Arc<MemHandler>) -> Self {
        Self {
            upstream,
            iters: Mutex::new(HashMap::new()),
            next_iter: AtomicU64::new(CATALOG_ITER_BASE),
        }
    }

    pub fn upstream(&self) -> &Arc<MemHandler> {
        &self.upstream
    }

    pub fn handle(
        &self,
        txn: &Arc<TxnCtx>,
        ws: &mut Workspace,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        match &req {
            // Writes against system relations stop here; the upstream call
            // is skipped once the request is classified read-only.
            StorageRequest::Write { table_id, .. }
            | StorageRequest::Update { table_id, .. }
            | StorageRequest::Delete { table_id, .. }
                if is_system_table_id(*table_id) =>
            {
                Err(StoreError::NotPermitted(format!(
                    "relation {table_id} is read-only"
                )))
            }
            StorageRequest::Truncate { db_id, .. }
            | StorageRequest::AddTableDef { db_id, .. }
            | StorageRequest::DelTableDef { db_id, .. }
            | StorageRequest::CreateRelation { db_id, .. }
            | StorageRequest::DropRelation { db_id, .. }
                if *db_id == SYSTEM_DB_ID =>
            {
                Err(StoreError::NotPermitted(
                    "system catalog is read-only".into(),
                ))
            }
            StorageRequest::Read { table_id, keys } if is_system_table_id(*table_id) => {
                let all = self.synthesize(&reader, *table_id);
                let mut rows = Vec::new();
                for pk in keys {
                    let wanted = key_from_values(pk);
                    for row in &all {
                        if system_row_key(*table_id, row) == wanted {
                            rows.push(row.clone());
                        }
                    }
                }
                Ok(StorageResponse::Rows { rows })
            }
            StorageRequest::NewTableIter { table_id } if is_system_table_id(*table_id) => {
                let rows = self.synthesize(&reader, *table_id);
                let attr_index = self.system_attr_index(*table_id)?;
                let iter_id = self.next_iter.fetch_add(1, Ordering::AcqRel);
                self.iters.lock().insert(iter_id, CatalogIter { rows, pos: 0 });
                Ok(StorageResponse::IterOpened { iter_id, attr_index })
            }
            StorageRequest::IterNext { iter_id, limit } if *iter_id >= CATALOG_ITER_BASE => {
                let mut iters = self.iters.lock();
                let iter = iters.get_mut(iter_id).ok_or_else(|| {
                    StoreError::InvalidRequest(format!("unknown iterator {iter_id}"))
                })?;
                let end = (iter.pos + (*limit).max(1)).min(iter.rows.len());
                let batch = iter.rows[iter.pos..end].to_vec();
                iter.pos = end;
                Ok(StorageResponse::IterBatch {
                    rows: batch,
                    done: iter.pos >= iter.rows.len(),
                })
            }
            StorageRequest::CloseTableIter { iter_id } if *iter_id >= CATALOG_ITER_BASE => {
                self.iters.lock().remove(iter_id);
                Ok(StorageResponse::Unit)
            }
            _ => self.upstream.handle(txn, ws, req),
        }
    }

    fn system_attr_index(
        &self,
        table_id: EntityId,
    ) -> Result<HashMap<String, usize>, StoreError> {
        let catalog = self.upstream.catalog();
        let table = catalog
            .table_by_id(SYSTEM_DB_ID, table_id)
            .ok_or_else(|| StoreError::Internal(format!("system table {table_id} missing")))?;
        let reader = TxnReader::snapshot(crate::clock::Timestamp::MAX.prev());
        let schema = table
            .schema_at(&reader)
            .ok_or_else(|| StoreError::Internal(format!("system table {table_id} schema")))?;
        Ok(schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect())
    }

    fn synthesize(&self, reader: &TxnReader, table_id: EntityId) -> Vec<Row> {
        let catalog = self.upstream.catalog();
        match table_id {
            SYSTEM_TABLE_DATABASES_ID => synthesize_databases(catalog, reader),
            SYSTEM_TABLE_TABLES_ID => synthesize_tables(catalog, reader),
            SYSTEM_TABLE_COLUMNS_ID => synthesize_columns(catalog, reader),
            _ => Vec::new(),
        }
    }
}

fn system_row_key(table_id: EntityId, row: &Row) -> Vec<u8> {
    let pk_width = if table_id == SYSTEM_TABLE_COLUMNS_ID { 2 } else { 1 };
    key_from_values(&row.values[..pk_width])
}

fn type_name(col_type: ColumnType) -> &'static str {
    match col_type {
        ColumnType::Bool => "bool",
        ColumnType::Int32 => "int32",
        ColumnType::Int64 => "int64",
        ColumnType::UInt32 => "uint32",
        ColumnType::UInt64 => "uint64",
        ColumnType::Float64 => "float64",
        ColumnType::Decimal128 => "decimal128",
        ColumnType::Varchar => "varchar",
        ColumnType::Blob => "blob",
        ColumnType::Timestamp => "timestamp",
        ColumnType::Json => "json",
    }
}

fn synthesize_databases(catalog: &Arc<CatalogTree>, reader: &TxnReader) -> Vec<Row> {
    catalog
        .databases(reader)
        .into_iter()
        .map(|db| {
            let created = db
                .chain
                .read()
                .nodes()
                .last()
                .map(|n| n.end_ts)
                .unwrap_or_default();
            Row::new(vec![
                Value::UInt64(db.id),
                Value::Str(db.name.clone()),
                Value::UInt32(db.tenant_id),
                Value::Ts(created),
            ])
        })
        .collect()
}

fn synthesize_tables(catalog: &Arc<CatalogTree>, reader: &TxnReader) -> Vec<Row> {
    let mut rows = Vec::new();
    for db in catalog.databases(reader) {
        for table in db.tables() {
            if !table.chain.can_get(reader).0 {
                continue;
            }
            let comment = table
                .schema_at(reader)
                .map(|s| s.comment)
                .unwrap_or_default();
            let created = table
                .chain
                .read()
                .nodes()
                .last()
                .map(|n| n.end_ts)
                .unwrap_or_default();
            rows.push(Row::new(vec![
                Value::UInt64(table.id),
                Value::Str(table.name.clone()),
                Value::UInt64(db.id),
                Value::Str(comment),
                Value::Ts(created),
            ]));
        }
    }
    rows
}

fn synthesize_columns(catalog: &Arc<CatalogTree>, reader: &TxnReader) -> Vec<Row> {
    let mut rows = Vec::new();
    for db in catalog.databases(reader) {
        for table in db.tables() {
            let Some(schema) = table.schema_at(reader) else {
                continue;
            };
            for (ordinal, col) in schema.visible_columns().enumerate() {
                rows.push(Row::new(vec![
                    Value::UInt64(table.id),
                    Value::Str(col.name.clone()),
                    Value::Str(type_name(col.col_type).to_string()),
                    Value::Bool(!col.nullable),
                    Value::Bool(col.primary),
                    Value::UInt32(ordinal as u32),
                ]));
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::CatalogHandler;
    use crate::catalog::{CatalogTree, SYSTEM_TABLE_DATABASES_ID, SYSTEM_TABLE_TABLES_ID};
    use crate::clock::Timestamp;
    use crate::error::StoreErrorCode;
    use crate::storage::handler::{MemHandler, StorageRequest, StorageResponse, Workspace};
    use crate::storage::{Row, Value};
    use crate::txn::{TxnCtx, TxnId};

    fn txn_at(physical: u64) -> Arc<TxnCtx> {
        Arc::new(TxnCtx::new(
            TxnId::generate(),
            Timestamp::new(physical, 0),
            Vec::new(),
        ))
    }

    fn handler() -> CatalogHandler {
        CatalogHandler::new(Arc::new(MemHandler::new(Arc::new(CatalogTree::new()), 4096)))
    }

    #[test]
    fn system_table_scan_lists_seeded_relations() {
        let handler = handler();
        let txn = txn_at(10);
        let mut ws = Workspace::default();
        let iter_id = match handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::NewTableIter {
                    table_id: SYSTEM_TABLE_TABLES_ID,
                },
            )
            .expect("iter")
        {
            StorageResponse::IterOpened { iter_id, attr_index } => {
                assert!(attr_index.contains_key("relname"));
                iter_id
            }
            other => panic!("unexpected response: {other:?}"),
        };
        let rows = match handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::IterNext {
                    iter_id,
                    limit: 100,
                },
            )
            .expect("next")
        {
            StorageResponse::IterBatch { rows, done } => {
                assert!(done);
                rows
            }
            other => panic!("unexpected response: {other:?}"),
        };
        let names: Vec<&Value> = rows.iter().map(|r| &r.values[1]).collect();
        assert!(names.contains(&&Value::Str("mo_database".into())));
        assert!(names.contains(&&Value::Str("mo_tables".into())));
        assert!(names.contains(&&Value::Str("mo_columns".into())));
    }

    #[test]
    fn system_table_point_read_resolves_by_primary_key() {
        let handler = handler();
        let t1 = txn_at(10);
        let mut ws = Workspace::default();
        let db_id = match handler
            .handle(
                &t1,
                &mut ws,
                StorageRequest::CreateDatabase {
                    tenant_id: 0,
                    name: "app".into(),
                },
            )
            .expect("db")
        {
            StorageResponse::DatabaseCreated { db_id } => db_id,
            other => panic!("unexpected response: {other:?}"),
        };
        let commit_ts = Timestamp::new(11, 0);
        t1.to_committing(commit_ts).expect("committing");
        for entity in ws.entities() {
            entity
                .chain()
                .write()
                .commit(t1.start_ts(), commit_ts)
                .expect("commit");
        }
        t1.to_committed().expect("committed");

        let t2 = txn_at(20);
        let mut ws2 = Workspace::default();
        let resp = handler
            .handle(
                &t2,
                &mut ws2,
                StorageRequest::Read {
                    table_id: SYSTEM_TABLE_DATABASES_ID,
                    keys: vec![vec![Value::UInt64(db_id)]],
                },
            )
            .expect("read");
        match resp {
            StorageResponse::Rows { rows } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].values[1], Value::Str("app".into()));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn writes_to_system_relations_are_rejected_without_upstream_effects() {
        let handler = handler();
        let txn = txn_at(10);
        let mut ws = Workspace::default();
        let err = handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::Delete {
                    table_id: SYSTEM_TABLE_DATABASES_ID,
                    keys: vec![vec![Value::UInt64(1)]],
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::NotPermitted);
        assert!(ws.is_empty());

        let err = handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::CreateRelation {
                    db_id: crate::catalog::SYSTEM_DB_ID,
                    schema: crate::catalog::schema::TableSchema::new("x"),
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::NotPermitted);

        // A plain row write against a user relation still proxies upstream.
        let err = handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::Write {
                    table_id: 999_999,
                    rows: vec![Row::new(vec![Value::UInt64(1)])],
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::NotFound);
    }
}
