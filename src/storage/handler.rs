use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::catalog::chain::TxnReader;
use crate::catalog::entry::{EntityId, EntityRef};
use crate::catalog::schema::{ColumnDef, TableSchema};
use crate::catalog::{CatalogTree, TableAlteration, SYSTEM_DB_ID};
use crate::error::{EntityKind, StoreError};
use crate::storage::{key_from_values, row_key, Row, TupleTable, Value, WriteKind};
use crate::txn::TxnCtx;

/// Private write set of one transaction on one shard: touched catalog
/// entities, staged row keys per table, and pending row-count deltas.
/// The replica walks this at prepare/commit/rollback time.
#[derive(Debug, Default)]
pub struct Workspace {
    entities: Vec<EntityRef>,
    row_keys: HashMap<EntityId, Vec<Vec<u8>>>,
    row_count_deltas: HashMap<EntityId, i64>,
}

impl Workspace {
    pub fn record_entity(&mut self, entity: EntityRef) {
        let key = (entity.entity_type(), entity.id());
        if self
            .entities
            .iter()
            .any(|e| (e.entity_type(), e.id()) == key)
        {
            return;
        }
        self.entities.push(entity);
    }

    pub fn record_row(&mut self, table_id: EntityId, key: Vec<u8>, delta: i64) {
        let keys = self.row_keys.entry(table_id).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
        *self.row_count_deltas.entry(table_id).or_default() += delta;
    }

    pub fn entities(&self) -> &[EntityRef] {
        &self.entities
    }

    pub fn row_keys(&self) -> &HashMap<EntityId, Vec<Vec<u8>>> {
        &self.row_keys
    }

    pub fn row_count_deltas(&self) -> &HashMap<EntityId, i64> {
        &self.row_count_deltas
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.row_keys.is_empty()
    }
}

/// Storage operation requests, one variant per opcode. The tagged union
/// keeps RPC dispatch exhaustive; unknown payload bytes fail decode as
/// `InvalidRequest` before reaching a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageRequest {
    CreateDatabase { tenant_id: u32, name: String },
    DropDatabase { tenant_id: u32, name: String },
    GetDatabases { tenant_id: u32 },
    OpenRelation { tenant_id: u32, db_name: String, name: String },
    CreateRelation { db_id: EntityId, schema: TableSchema },
    DropRelation { db_id: EntityId, name: String },
    Truncate { db_id: EntityId, name: String },
    AddTableDef { db_id: EntityId, name: String, change: TableAlteration },
    DelTableDef { db_id: EntityId, name: String, change: TableAlteration },
    GetTableDefs { table_id: EntityId },
    GetPrimaryKeys { table_id: EntityId },
    GetRelations { db_id: EntityId },
    Write { table_id: EntityId, rows: Vec<Row> },
    Update { table_id: EntityId, rows: Vec<Row> },
    Delete { table_id: EntityId, keys: Vec<Vec<Value>> },
    Read { table_id: EntityId, keys: Vec<Vec<Value>> },
    NewTableIter { table_id: EntityId },
    IterNext { iter_id: u64, limit: usize },
    CloseTableIter { iter_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageResponse {
    Unit,
    DatabaseCreated { db_id: EntityId },
    Databases { names: Vec<String> },
    RelationOpened { db_id: EntityId, table_id: EntityId },
    RelationCreated { table_id: EntityId },
    Truncated { new_table_id: EntityId },
    TableDefs { schema: TableSchema },
    PrimaryKeys { columns: Vec<ColumnDef> },
    Relations { names: Vec<String> },
    RowsWritten { count: usize },
    Rows { rows: Vec<Row> },
    IterOpened { iter_id: u64, attr_index: HashMap<String, usize> },
    IterBatch { rows: Vec<Row>, done: bool },
}

struct TableIter {
    table_id: EntityId,
    reader: TxnReader,
    cursor: Option<Vec<u8>>,
    done: bool,
}

/// The in-memory storage handler backing one shard: catalog DDL plus
/// per-table tuple storage, addressed by opcode.
pub struct MemHandler {
    catalog: Arc<CatalogTree>,
    tables: RwLock<HashMap<EntityId, Arc<TupleTable>>>,
    iters: Mutex<HashMap<u64, TableIter>>,
    next_iter: AtomicU64,
    max_batch: usize,
}

impl MemHandler {
    pub fn new(catalog: Arc<CatalogTree>, max_batch: usize) -> Self {
        Self {
            catalog,
            tables: RwLock::new(HashMap::new()),
            iters: Mutex::new(HashMap::new()),
            next_iter: AtomicU64::new(1),
            max_batch,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogTree> {
        &self.catalog
    }

    pub fn tuple_table(&self, table_id: EntityId) -> Option<Arc<TupleTable>> {
        self.tables.read().get(&table_id).cloned()
    }

    pub fn tuple_tables(&self) -> Vec<Arc<TupleTable>> {
        self.tables.read().values().cloned().collect()
    }

    pub fn get_or_create_tuple_table(&self, table_id: EntityId) -> Arc<TupleTable> {
        if let Some(table) = self.tables.read().get(&table_id) {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write();
        Arc::clone(
            tables
                .entry(table_id)
                .or_insert_with(|| Arc::new(TupleTable::new(table_id))),
        )
    }

    fn writable_table(
        &self,
        reader: &TxnReader,
        table_id: EntityId,
    ) -> Result<(TableSchema, Arc<TupleTable>, EntityRef), StoreError> {
        if crate::catalog::is_system_table_id(table_id) {
            return Err(StoreError::NotPermitted(format!(
                "relation {table_id} is read-only"
            )));
        }
        let (db, table) = self
            .catalog
            .find_table(table_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: table_id.to_string(),
            })?;
        if db.id == SYSTEM_DB_ID {
            return Err(StoreError::NotPermitted(format!(
                "relation {table_id} is read-only"
            )));
        }
        if !db.is_visible(reader) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Database,
                name: db.id.to_string(),
            });
        }
        let schema = table.schema_at(reader).ok_or_else(|| StoreError::NotFound {
            entity: EntityKind::Table,
            name: table_id.to_string(),
        })?;
        Ok((
            schema,
            self.get_or_create_tuple_table(table_id),
            EntityRef::Table(table),
        ))
    }

    fn readable_schema(
        &self,
        reader: &TxnReader,
        table_id: EntityId,
    ) -> Result<TableSchema, StoreError> {
        let (db, table) = self
            .catalog
            .find_table(table_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: table_id.to_string(),
            })?;
        if !db.is_visible(reader) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Table,
                name: table_id.to_string(),
            });
        }
        table.schema_at(reader).ok_or_else(|| StoreError::NotFound {
            entity: EntityKind::Table,
            name: table_id.to_string(),
        })
    }

    pub fn handle(
        &self,
        txn: &Arc<TxnCtx>,
        ws: &mut Workspace,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        match req {
            StorageRequest::CreateDatabase { tenant_id, name } => {
                let db = self.catalog.create_database(txn, tenant_id, &name)?;
                ws.record_entity(EntityRef::Database(Arc::clone(&db)));
                Ok(StorageResponse::DatabaseCreated { db_id: db.id })
            }
            StorageRequest::DropDatabase { tenant_id, name } => {
                let db = self.catalog.drop_database(txn, tenant_id, &name)?;
                ws.record_entity(EntityRef::Database(db));
                Ok(StorageResponse::Unit)
            }
            StorageRequest::GetDatabases { tenant_id } => {
                let mut names: Vec<String> = self
                    .catalog
                    .databases(&reader)
                    .into_iter()
                    .filter(|db| db.tenant_id == tenant_id || db.id == SYSTEM_DB_ID)
                    .map(|db| db.name.clone())
                    .collect();
                names.sort();
                Ok(StorageResponse::Databases { names })
            }
            StorageRequest::OpenRelation {
                tenant_id,
                db_name,
                name,
            } => {
                let table = self
                    .catalog
                    .get_table(&reader, tenant_id, &db_name, &name)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: EntityKind::Table,
                        name: format!("{db_name}.{name}"),
                    })?;
                Ok(StorageResponse::RelationOpened {
                    db_id: table.db_id,
                    table_id: table.id,
                })
            }
            StorageRequest::CreateRelation { db_id, schema } => {
                let table = self.catalog.create_table(txn, db_id, schema)?;
                self.get_or_create_tuple_table(table.id);
                ws.record_entity(EntityRef::Table(Arc::clone(&table)));
                Ok(StorageResponse::RelationCreated { table_id: table.id })
            }
            StorageRequest::DropRelation { db_id, name } => {
                let table = self.catalog.drop_table(txn, db_id, &name)?;
                ws.record_entity(EntityRef::Table(table));
                Ok(StorageResponse::Unit)
            }
            StorageRequest::Truncate { db_id, name } => {
                let (old, fresh) = self.catalog.truncate_table(txn, db_id, &name)?;
                self.get_or_create_tuple_table(fresh.id);
                ws.record_entity(EntityRef::Table(old));
                ws.record_entity(EntityRef::Table(Arc::clone(&fresh)));
                Ok(StorageResponse::Truncated {
                    new_table_id: fresh.id,
                })
            }
            StorageRequest::AddTableDef { db_id, name, change } => {
                match change {
                    TableAlteration::AddColumn(_)
                    | TableAlteration::AddIndex(_)
                    | TableAlteration::AlterComment(_)
                    | TableAlteration::SetPrimaryKey(_) => {}
                    _ => {
                        return Err(StoreError::InvalidRequest(
                            "AddTableDef carries a removal change".into(),
                        ))
                    }
                }
                let table = self.catalog.alter_table(txn, db_id, &name, change)?;
                ws.record_entity(EntityRef::Table(table));
                Ok(StorageResponse::Unit)
            }
            StorageRequest::DelTableDef { db_id, name, change } => {
                match change {
                    TableAlteration::DropColumn(_) | TableAlteration::DropIndex(_) => {}
                    _ => {
                        return Err(StoreError::InvalidRequest(
                            "DelTableDef carries an addition change".into(),
                        ))
                    }
                }
                let table = self.catalog.alter_table(txn, db_id, &name, change)?;
                ws.record_entity(EntityRef::Table(table));
                Ok(StorageResponse::Unit)
            }
            StorageRequest::GetTableDefs { table_id } => {
                let schema = self.readable_schema(&reader, table_id)?;
                Ok(StorageResponse::TableDefs { schema })
            }
            StorageRequest::GetPrimaryKeys { table_id } => {
                let schema = self.readable_schema(&reader, table_id)?;
                let columns = schema
                    .primary_key_columns()
                    .into_iter()
                    .cloned()
                    .collect();
                Ok(StorageResponse::PrimaryKeys { columns })
            }
            StorageRequest::GetRelations { db_id } => {
                let db = self
                    .catalog
                    .database_by_id(db_id)
                    .filter(|db| db.is_visible(&reader))
                    .ok_or_else(|| StoreError::NotFound {
                        entity: EntityKind::Database,
                        name: db_id.to_string(),
                    })?;
                let mut names: Vec<String> = db
                    .tables()
                    .into_iter()
                    .filter(|t| t.chain.can_get(&reader).0)
                    .map(|t| t.name.clone())
                    .collect();
                names.sort();
                Ok(StorageResponse::Relations { names })
            }
            StorageRequest::Write { table_id, rows } => {
                let (schema, tuples, entity) = self.writable_table(&reader, table_id)?;
                let count = rows.len();
                for row in rows {
                    let key = row_key(&schema, &row)?;
                    tuples.stage(txn, WriteKind::Insert, key.clone(), row)?;
                    ws.record_row(table_id, key, 1);
                }
                ws.record_entity(entity);
                Ok(StorageResponse::RowsWritten { count })
            }
            StorageRequest::Update { table_id, rows } => {
                let (schema, tuples, entity) = self.writable_table(&reader, table_id)?;
                let count = rows.len();
                for row in rows {
                    let key = row_key(&schema, &row)?;
                    tuples.stage(txn, WriteKind::Update, key.clone(), row)?;
                    ws.record_row(table_id, key, 0);
                }
                ws.record_entity(entity);
                Ok(StorageResponse::RowsWritten { count })
            }
            StorageRequest::Delete { table_id, keys } => {
                let (_schema, tuples, entity) = self.writable_table(&reader, table_id)?;
                let count = keys.len();
                for pk in keys {
                    let key = key_from_values(&pk);
                    let existing =
                        tuples
                            .get(&reader, &key)
                            .ok_or_else(|| StoreError::NotFound {
                                entity: EntityKind::Row,
                                name: format!("table {table_id} key {pk:?}"),
                            })?;
                    tuples.stage(txn, WriteKind::Delete, key.clone(), existing)?;
                    ws.record_row(table_id, key, -1);
                }
                ws.record_entity(entity);
                Ok(StorageResponse::RowsWritten { count })
            }
            StorageRequest::Read { table_id, keys } => {
                let _ = self.readable_schema(&reader, table_id)?;
                if keys.len() > self.max_batch {
                    return Err(StoreError::InvalidRequest(format!(
                        "read batch {} exceeds {}",
                        keys.len(),
                        self.max_batch
                    )));
                }
                let tuples = self.get_or_create_tuple_table(table_id);
                let mut rows = Vec::new();
                for pk in keys {
                    if let Some(row) = tuples.get(&reader, &key_from_values(&pk)) {
                        rows.push(row);
                    }
                }
                Ok(StorageResponse::Rows { rows })
            }
            StorageRequest::NewTableIter { table_id } => {
                let schema = self.readable_schema(&reader, table_id)?;
                let attr_index = schema
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name.clone(), i))
                    .collect();
                let iter_id = self.next_iter.fetch_add(1, Ordering::AcqRel);
                self.iters.lock().insert(
                    iter_id,
                    TableIter {
                        table_id,
                        reader,
                        cursor: None,
                        done: false,
                    },
                );
                Ok(StorageResponse::IterOpened { iter_id, attr_index })
            }
            StorageRequest::IterNext { iter_id, limit } => {
                let limit = limit.clamp(1, self.max_batch);
                let mut iters = self.iters.lock();
                let iter = iters
                    .get_mut(&iter_id)
                    .ok_or_else(|| StoreError::InvalidRequest(format!(
                        "unknown iterator {iter_id}"
                    )))?;
                if iter.done {
                    return Ok(StorageResponse::IterBatch {
                        rows: Vec::new(),
                        done: true,
                    });
                }
                let tuples = self.get_or_create_tuple_table(iter.table_id);
                let reader = iter.reader;
                let cursor = iter.cursor.clone();
                // Chain visibility may block on a committing writer; the
                // iterator map lock is ours alone, per-connection.
                let (batch, last_key) = tuples.scan(&reader, cursor.as_deref(), limit);
                match last_key {
                    Some(key) => iter.cursor = Some(key),
                    None => iter.done = true,
                }
                let done = iter.done || batch.len() < limit;
                Ok(StorageResponse::IterBatch {
                    rows: batch.into_iter().map(|(_, row)| row).collect(),
                    done,
                })
            }
            StorageRequest::CloseTableIter { iter_id } => {
                self.iters.lock().remove(&iter_id);
                Ok(StorageResponse::Unit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{MemHandler, StorageRequest, StorageResponse, Workspace};
    use crate::catalog::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::catalog::{CatalogTree, SYSTEM_TABLE_TABLES_ID};
    use crate::clock::Timestamp;
    use crate::error::StoreErrorCode;
    use crate::storage::{Row, Value};
    use crate::txn::{TxnCtx, TxnId};

    fn txn_at(physical: u64) -> Arc<TxnCtx> {
        Arc::new(TxnCtx::new(
            TxnId::generate(),
            Timestamp::new(physical, 0),
            Vec::new(),
        ))
    }

    fn handler() -> MemHandler {
        MemHandler::new(Arc::new(CatalogTree::new()), 4096)
    }

    fn commit_workspace(handler: &MemHandler, txn: &Arc<TxnCtx>, ws: &Workspace, physical: u64) {
        let commit_ts = Timestamp::new(physical, 0);
        txn.to_committing(commit_ts).expect("committing");
        for entity in ws.entities() {
            let mut chain = entity.chain().write();
            if chain.has_pending(txn.id()) {
                chain.commit(txn.start_ts(), commit_ts).expect("entity");
            }
        }
        for (table_id, keys) in ws.row_keys() {
            let tuples = handler.get_or_create_tuple_table(*table_id);
            tuples.commit(txn, keys, commit_ts).expect("rows");
        }
        txn.to_committed().expect("committed");
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

    #[test]
    fn create_database_lists_alongside_system_catalog() {
        let handler = handler();
        let txn = txn_at(10);
        let mut ws = Workspace::default();
        handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::CreateDatabase {
                    tenant_id: 0,
                    name: "d".into(),
                },
            )
            .expect("create");
        commit_workspace(&handler, &txn, &ws, 12);

        let reader_txn = txn_at(20);
        let mut ws2 = Workspace::default();
        let resp = handler
            .handle(
                &reader_txn,
                &mut ws2,
                StorageRequest::GetDatabases { tenant_id: 0 },
            )
            .expect("list");
        assert_eq!(
            resp,
            StorageResponse::Databases {
                names: vec!["d".into(), "mo_catalog".into()]
            }
        );
    }

    #[test]
    fn write_then_read_through_opcodes() {
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
        let table_id = match handler
            .handle(
                &t1,
                &mut ws,
                StorageRequest::CreateRelation {
                    db_id,
                    schema: users_schema(),
                },
            )
            .expect("table")
        {
            StorageResponse::RelationCreated { table_id } => table_id,
            other => panic!("unexpected response: {other:?}"),
        };
        commit_workspace(&handler, &t1, &ws, 11);

        let t2 = txn_at(20);
        let mut ws2 = Workspace::default();
        handler
            .handle(
                &t2,
                &mut ws2,
                StorageRequest::Write {
                    table_id,
                    rows: vec![Row::new(vec![Value::UInt64(1), Value::Str("ada".into())])],
                },
            )
            .expect("write");
        commit_workspace(&handler, &t2, &ws2, 21);

        let t3 = txn_at(30);
        let mut ws3 = Workspace::default();
        let resp = handler
            .handle(
                &t3,
                &mut ws3,
                StorageRequest::Read {
                    table_id,
                    keys: vec![vec![Value::UInt64(1)]],
                },
            )
            .expect("read");
        match resp {
            StorageResponse::Rows { rows } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].values[1], Value::Str("ada".into()));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn system_relation_writes_are_read_only() {
        let handler = handler();
        let txn = txn_at(10);
        let mut ws = Workspace::default();
        let err = handler
            .handle(
                &txn,
                &mut ws,
                StorageRequest::Write {
                    table_id: SYSTEM_TABLE_TABLES_ID,
                    rows: vec![Row::new(vec![Value::UInt64(1)])],
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::NotPermitted);
        assert!(ws.is_empty());
    }

    #[test]
    fn iterator_pages_through_rows() {
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
        let table_id = match handler
            .handle(
                &t1,
                &mut ws,
                StorageRequest::CreateRelation {
                    db_id,
                    schema: users_schema(),
                },
            )
            .expect("table")
        {
            StorageResponse::RelationCreated { table_id } => table_id,
            other => panic!("unexpected"),
        };
        let rows = (0..7u64)
            .map(|i| Row::new(vec![Value::UInt64(i), Value::Str(format!("u{i}"))]))
            .collect();
        handler
            .handle(&t1, &mut ws, StorageRequest::Write { table_id, rows })
            .expect("write");
        commit_workspace(&handler, &t1, &ws, 11);

        let t2 = txn_at(20);
        let mut ws2 = Workspace::default();
        let iter_id = match handler
            .handle(&t2, &mut ws2, StorageRequest::NewTableIter { table_id })
            .expect("iter")
        {
            StorageResponse::IterOpened { iter_id, attr_index } => {
                assert_eq!(attr_index["id"], 0);
                assert_eq!(attr_index["name"], 1);
                iter_id
            }
            other => panic!("unexpected response: {other:?}"),
        };

        let mut seen = 0;
        loop {
            match handler
                .handle(
                    &t2,
                    &mut ws2,
                    StorageRequest::IterNext { iter_id, limit: 3 },
                )
                .expect("next")
            {
                StorageResponse::IterBatch { rows, done } => {
                    seen += rows.len();
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }
        assert_eq!(seen, 7);
        handler
            .handle(&t2, &mut ws2, StorageRequest::CloseTableIter { iter_id })
            .expect("close");
    }
}
