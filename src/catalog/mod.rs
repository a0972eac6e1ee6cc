pub mod chain;
pub mod entry;
pub mod schema;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::chain::{NodeRecord, TxnReader, UpdateNode, VersionChain};
use crate::catalog::entry::{
    BlockEntry, DbEntry, EntityId, EntityRef, EntryPayload, SegmentEntry, SegmentState, TableEntry,
    ENTITY_BLOCK, ENTITY_DATABASE, ENTITY_SEGMENT, ENTITY_TABLE,
};
use crate::catalog::schema::{ColumnDef, ColumnType, IndexDef, TableSchema};
use crate::clock::Timestamp;
use crate::error::{EntityKind, StoreError};
use crate::txn::TxnCtx;

pub const SYSTEM_TENANT: u32 = 0;
pub const SYSTEM_DB_NAME: &str = "mo_catalog";
pub const SYSTEM_DB_ID: EntityId = 1;
pub const SYSTEM_TABLE_DATABASES: &str = "mo_database";
pub const SYSTEM_TABLE_TABLES: &str = "mo_tables";
pub const SYSTEM_TABLE_COLUMNS: &str = "mo_columns";
pub const SYSTEM_TABLE_DATABASES_ID: EntityId = 1;
pub const SYSTEM_TABLE_TABLES_ID: EntityId = 2;
pub const SYSTEM_TABLE_COLUMNS_ID: EntityId = 3;

/// User entity ids start above the reserved system range.
const FIRST_USER_ID: u64 = 1024;

pub fn is_system_table_id(table_id: EntityId) -> bool {
    (SYSTEM_TABLE_DATABASES_ID..=SYSTEM_TABLE_COLUMNS_ID).contains(&table_id)
}

/// Schema alterations accepted by `alter_table`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TableAlteration {
    AddColumn(ColumnDef),
    DropColumn(String),
    AlterComment(String),
    AddIndex(IndexDef),
    DropIndex(String),
    SetPrimaryKey(Vec<String>),
}

/// Node image plus addressing, as collected for a checkpoint window.
#[derive(Debug, Clone)]
pub struct CollectedNode {
    pub entity_type: u8,
    pub entity_id: EntityId,
    pub record: NodeRecord<EntryPayload>,
    pub log_index: Option<u64>,
}

fn db_full_name(tenant_id: u32, name: &str) -> String {
    let tenant = if name == SYSTEM_DB_NAME { 0 } else { tenant_id };
    format!("{tenant}-{name}")
}

/// The catalog: a lock-coupled tree of databases, tables, segments, and
/// blocks, every level versioned by an MVCC chain. One id allocator is
/// shared by all entity kinds; replay re-seeds it to the max observed id.
#[derive(Debug)]
pub struct CatalogTree {
    next_id: AtomicU64,
    dbs: RwLock<std::collections::BTreeMap<EntityId, Arc<DbEntry>>>,
    db_names: RwLock<HashMap<String, Vec<EntityId>>>,
}

impl Default for CatalogTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogTree {
    /// Empty catalog with the seeded system database and its three
    /// virtual tables, committed at the dawn of time.
    pub fn new() -> Self {
        let catalog = Self {
            next_id: AtomicU64::new(FIRST_USER_ID),
            dbs: RwLock::new(std::collections::BTreeMap::new()),
            db_names: RwLock::new(HashMap::new()),
        };
        catalog.seed_system_db();
        catalog
    }

    fn seed_system_db(&self) {
        let db = Arc::new(DbEntry::new(
            SYSTEM_DB_ID,
            SYSTEM_TENANT,
            SYSTEM_DB_NAME.to_string(),
        ));
        db.chain
            .write()
            .insert(UpdateNode::seeded(EntryPayload::Database {
                tenant_id: SYSTEM_TENANT,
                name: SYSTEM_DB_NAME.to_string(),
            }))
            .expect("seed system db");

        let seeds = [
            (SYSTEM_TABLE_DATABASES_ID, mo_database_schema()),
            (SYSTEM_TABLE_TABLES_ID, mo_tables_schema()),
            (SYSTEM_TABLE_COLUMNS_ID, mo_columns_schema()),
        ];
        for (id, schema) in seeds {
            let table = Arc::new(TableEntry::new(id, SYSTEM_DB_ID, schema.name.clone()));
            table
                .chain
                .write()
                .insert(UpdateNode::seeded(EntryPayload::Table {
                    db_id: SYSTEM_DB_ID,
                    schema,
                }))
                .expect("seed system table");
            db.attach_table(table);
        }

        self.db_names
            .write()
            .entry(db_full_name(SYSTEM_TENANT, SYSTEM_DB_NAME))
            .or_default()
            .push(SYSTEM_DB_ID);
        self.dbs.write().insert(SYSTEM_DB_ID, db);
    }

    pub fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Replay feeds every observed id through here so fresh allocations
    /// stay above anything already in the log.
    pub fn observe_id(&self, id: EntityId) {
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    fn stage_node(
        chain: &VersionChain<EntryPayload>,
        txn: &Arc<TxnCtx>,
        payload: EntryPayload,
        deleted: bool,
    ) -> Result<(), StoreError> {
        let mut guard = chain.write();
        match guard.head() {
            Some(head) if !head.is_committed() && head.txn_id == txn.id() => {
                guard.update_in_place(txn.start_ts(), payload, deleted)
            }
            _ => guard.insert(UpdateNode::uncommitted(txn, payload, deleted)),
        }
    }

    // ---- databases ----

    pub fn create_database(
        &self,
        txn: &Arc<TxnCtx>,
        tenant_id: u32,
        name: &str,
    ) -> Result<Arc<DbEntry>, StoreError> {
        if name == SYSTEM_DB_NAME {
            return Err(StoreError::NotPermitted(format!(
                "database '{SYSTEM_DB_NAME}' is reserved"
            )));
        }
        let reader = TxnReader::from(txn.as_ref());
        let full = db_full_name(tenant_id, name);
        if let Some(bucket) = self.db_names.read().get(&full) {
            let dbs = self.dbs.read();
            for id in bucket {
                if let Some(existing) = dbs.get(id) {
                    let (visible, dropped) = existing.chain.can_get(&reader);
                    if visible {
                        return Err(StoreError::Duplicate {
                            entity: EntityKind::Database,
                            name: name.to_string(),
                        });
                    }
                    if dropped {
                        break;
                    }
                    if let Some(head) = existing.chain.read().head() {
                        if !head.is_committed() && head.txn_id != txn.id() {
                            return Err(StoreError::Conflict(format!(
                                "database '{name}' is being created by txn {}",
                                head.txn_id
                            )));
                        }
                    }
                }
            }
        }

        let db = Arc::new(DbEntry::new(
            self.allocate_id(),
            tenant_id,
            name.to_string(),
        ));
        Self::stage_node(
            &db.chain,
            txn,
            EntryPayload::Database {
                tenant_id,
                name: name.to_string(),
            },
            false,
        )?;
        self.db_names
            .write()
            .entry(full)
            .or_default()
            .insert(0, db.id);
        self.dbs.write().insert(db.id, Arc::clone(&db));
        debug!(db = %db, txn = %txn.id(), "created database");
        Ok(db)
    }

    pub fn drop_database(
        &self,
        txn: &Arc<TxnCtx>,
        tenant_id: u32,
        name: &str,
    ) -> Result<Arc<DbEntry>, StoreError> {
        if name == SYSTEM_DB_NAME {
            return Err(StoreError::NotPermitted(format!(
                "cannot drop '{SYSTEM_DB_NAME}'"
            )));
        }
        let reader = TxnReader::from(txn.as_ref());
        let db = self
            .get_database(&reader, tenant_id, name)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Database,
                name: name.to_string(),
            })?;
        Self::stage_node(
            &db.chain,
            txn,
            EntryPayload::Database {
                tenant_id: db.tenant_id,
                name: db.name.clone(),
            },
            true,
        )?;
        debug!(db = %db, txn = %txn.id(), "dropped database");
        Ok(db)
    }

    pub fn get_database(
        &self,
        reader: &TxnReader,
        tenant_id: u32,
        name: &str,
    ) -> Option<Arc<DbEntry>> {
        let full = db_full_name(tenant_id, name);
        let bucket = self.db_names.read().get(&full).cloned()?;
        let dbs = self.dbs.read();
        for id in bucket {
            if let Some(db) = dbs.get(&id) {
                let (visible, dropped) = db.chain.can_get(reader);
                if visible {
                    return Some(Arc::clone(db));
                }
                if dropped {
                    return None;
                }
            }
        }
        None
    }

    pub fn database_by_id(&self, id: EntityId) -> Option<Arc<DbEntry>> {
        self.dbs.read().get(&id).cloned()
    }

    /// Databases visible at the reader, id order.
    pub fn databases(&self, reader: &TxnReader) -> Vec<Arc<DbEntry>> {
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        dbs.into_iter()
            .filter(|db| db.chain.can_get(reader).0)
            .collect()
    }

    // ---- tables ----

    fn visible_db_for_write(
        &self,
        reader: &TxnReader,
        db_id: EntityId,
    ) -> Result<Arc<DbEntry>, StoreError> {
        let db = self
            .database_by_id(db_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Database,
                name: db_id.to_string(),
            })?;
        if !db.is_visible(reader) {
            return Err(StoreError::NotFound {
                entity: EntityKind::Database,
                name: db_id.to_string(),
            });
        }
        Ok(db)
    }

    pub fn create_table(
        &self,
        txn: &Arc<TxnCtx>,
        db_id: EntityId,
        schema: TableSchema,
    ) -> Result<Arc<TableEntry>, StoreError> {
        if db_id == SYSTEM_DB_ID {
            return Err(StoreError::NotPermitted(format!(
                "'{SYSTEM_DB_NAME}' is read-only"
            )));
        }
        if !schema.is_finalized() {
            return Err(StoreError::InvalidRequest(format!(
                "schema '{}' is not finalized",
                schema.name
            )));
        }
        let reader = TxnReader::from(txn.as_ref());
        let db = self.visible_db_for_write(&reader, db_id)?;
        if db.table_by_name(&schema.name, &reader).is_some() {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Table,
                name: schema.name.clone(),
            });
        }

        let table = Arc::new(TableEntry::new(
            self.allocate_id(),
            db_id,
            schema.name.clone(),
        ));
        Self::stage_node(
            &table.chain,
            txn,
            EntryPayload::Table { db_id, schema },
            false,
        )?;
        db.attach_table(Arc::clone(&table));
        debug!(table = %table, txn = %txn.id(), "created table");
        Ok(table)
    }

    pub fn drop_table(
        &self,
        txn: &Arc<TxnCtx>,
        db_id: EntityId,
        name: &str,
    ) -> Result<Arc<TableEntry>, StoreError> {
        if db_id == SYSTEM_DB_ID {
            return Err(StoreError::NotPermitted(format!(
                "'{SYSTEM_DB_NAME}' is read-only"
            )));
        }
        let reader = TxnReader::from(txn.as_ref());
        let db = self.visible_db_for_write(&reader, db_id)?;
        let table = db
            .table_by_name(name, &reader)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: name.to_string(),
            })?;
        let schema = table.schema_at(&reader).ok_or_else(|| StoreError::NotFound {
            entity: EntityKind::Table,
            name: name.to_string(),
        })?;
        Self::stage_node(
            &table.chain,
            txn,
            EntryPayload::Table { db_id, schema },
            true,
        )?;
        debug!(table = %table, txn = %txn.id(), "dropped table");
        Ok(table)
    }

    /// Truncation swaps in a fresh table entity under the same name,
    /// tombstoning the old generation; tuple data is keyed by table id so
    /// the old rows become unreachable.
    pub fn truncate_table(
        &self,
        txn: &Arc<TxnCtx>,
        db_id: EntityId,
        name: &str,
    ) -> Result<(Arc<TableEntry>, Arc<TableEntry>), StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        let db = self.visible_db_for_write(&reader, db_id)?;
        // Capture the schema before the tombstone hides this generation.
        let schema = db
            .table_by_name(name, &reader)
            .and_then(|t| t.schema_at(&reader))
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: name.to_string(),
            })?;
        let old = self.drop_table(txn, db_id, name)?;
        let fresh = Arc::new(TableEntry::new(self.allocate_id(), db_id, name.to_string()));
        Self::stage_node(
            &fresh.chain,
            txn,
            EntryPayload::Table { db_id, schema },
            false,
        )?;
        db.attach_table(Arc::clone(&fresh));
        Ok((old, fresh))
    }

    pub fn alter_table(
        &self,
        txn: &Arc<TxnCtx>,
        db_id: EntityId,
        name: &str,
        alteration: TableAlteration,
    ) -> Result<Arc<TableEntry>, StoreError> {
        if db_id == SYSTEM_DB_ID {
            return Err(StoreError::NotPermitted(format!(
                "'{SYSTEM_DB_NAME}' is read-only"
            )));
        }
        let reader = TxnReader::from(txn.as_ref());
        let db = self.visible_db_for_write(&reader, db_id)?;
        let table = db
            .table_by_name(name, &reader)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: name.to_string(),
            })?;
        let schema = table.schema_at(&reader).ok_or_else(|| StoreError::NotFound {
            entity: EntityKind::Table,
            name: name.to_string(),
        })?;
        let next = match alteration {
            TableAlteration::AddColumn(def) => schema.with_added_column(def)?,
            TableAlteration::DropColumn(col) => schema.with_dropped_column(&col)?,
            TableAlteration::AlterComment(comment) => schema.with_comment(comment)?,
            TableAlteration::AddIndex(index) => schema.with_index(index)?,
            TableAlteration::DropIndex(ix) => schema.without_index(&ix)?,
            TableAlteration::SetPrimaryKey(cols) => schema.with_primary_key(&cols)?,
        };
        Self::stage_node(
            &table.chain,
            txn,
            EntryPayload::Table {
                db_id,
                schema: next,
            },
            false,
        )?;
        Ok(table)
    }

    pub fn get_table(
        &self,
        reader: &TxnReader,
        tenant_id: u32,
        db_name: &str,
        table_name: &str,
    ) -> Option<Arc<TableEntry>> {
        // Hierarchical visibility: the table exists only under a visible db.
        let db = self.get_database(reader, tenant_id, db_name)?;
        db.table_by_name(table_name, reader)
    }

    pub fn table_by_id(&self, db_id: EntityId, table_id: EntityId) -> Option<Arc<TableEntry>> {
        self.database_by_id(db_id)?.table_by_id(table_id)
    }

    /// Locate a table by id alone, scanning databases. Replay and the
    /// storage handlers address tables this way.
    pub fn find_table(&self, table_id: EntityId) -> Option<(Arc<DbEntry>, Arc<TableEntry>)> {
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        for db in dbs {
            if let Some(table) = db.table_by_id(table_id) {
                return Some((db, table));
            }
        }
        None
    }

    // ---- segments and blocks ----

    pub fn create_segment(
        &self,
        txn: &Arc<TxnCtx>,
        db_id: EntityId,
        table_id: EntityId,
    ) -> Result<Arc<SegmentEntry>, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        let db = self.visible_db_for_write(&reader, db_id)?;
        let table = db
            .table_by_id(table_id)
            .filter(|t| t.chain.can_get(&reader).0)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Table,
                name: table_id.to_string(),
            })?;
        let segment = Arc::new(SegmentEntry::new(self.allocate_id(), table_id));
        Self::stage_node(
            &segment.chain,
            txn,
            EntryPayload::Segment {
                table_id,
                state: SegmentState::Appendable,
            },
            false,
        )?;
        table.attach_segment(Arc::clone(&segment));
        Ok(segment)
    }

    pub fn drop_segment(
        &self,
        txn: &Arc<TxnCtx>,
        table: &Arc<TableEntry>,
        segment_id: EntityId,
    ) -> Result<Arc<SegmentEntry>, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        let segment = table
            .segment_by_id(segment_id)
            .filter(|s| s.chain.can_get(&reader).0)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Segment,
                name: segment_id.to_string(),
            })?;
        let state = segment
            .state_at(&reader)
            .unwrap_or(SegmentState::NotAppendable);
        Self::stage_node(
            &segment.chain,
            txn,
            EntryPayload::Segment {
                table_id: table.id,
                state,
            },
            true,
        )?;
        Ok(segment)
    }

    pub fn create_block(
        &self,
        txn: &Arc<TxnCtx>,
        segment: &Arc<SegmentEntry>,
    ) -> Result<Arc<BlockEntry>, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        if !segment.chain.can_get(&reader).0 {
            return Err(StoreError::NotFound {
                entity: EntityKind::Segment,
                name: segment.id.to_string(),
            });
        }
        let block = Arc::new(BlockEntry::new(self.allocate_id(), segment.id));
        Self::stage_node(
            &block.chain,
            txn,
            EntryPayload::Block {
                segment_id: segment.id,
                rows: 0,
            },
            false,
        )?;
        segment.attach_block(Arc::clone(&block));
        Ok(block)
    }

    pub fn drop_block(
        &self,
        txn: &Arc<TxnCtx>,
        segment: &Arc<SegmentEntry>,
        block_id: EntityId,
    ) -> Result<Arc<BlockEntry>, StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        let block = segment
            .block_by_id(block_id)
            .filter(|b| b.chain.can_get(&reader).0)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Block,
                name: block_id.to_string(),
            })?;
        let rows = block.rows_at(&reader);
        Self::stage_node(
            &block.chain,
            txn,
            EntryPayload::Block {
                segment_id: segment.id,
                rows,
            },
            true,
        )?;
        Ok(block)
    }

    // ---- checkpoint support ----

    /// Committed nodes with end timestamps in `(min_exclusive,
    /// max_inclusive]`, walking the whole tree. The system database and
    /// its virtual tables never checkpoint.
    pub fn collect_committed(
        &self,
        min_exclusive: Timestamp,
        max_inclusive: Timestamp,
    ) -> Vec<CollectedNode> {
        let mut out = Vec::new();
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        for db in dbs {
            if db.id == SYSTEM_DB_ID {
                continue;
            }
            collect_chain(
                &db.chain,
                ENTITY_DATABASE,
                db.id,
                min_exclusive,
                max_inclusive,
                &mut out,
            );
            for table in db.tables() {
                collect_chain(
                    &table.chain,
                    ENTITY_TABLE,
                    table.id,
                    min_exclusive,
                    max_inclusive,
                    &mut out,
                );
                for segment in table.segments() {
                    collect_chain(
                        &segment.chain,
                        ENTITY_SEGMENT,
                        segment.id,
                        min_exclusive,
                        max_inclusive,
                        &mut out,
                    );
                    for block in segment.blocks() {
                        collect_chain(
                            &block.chain,
                            ENTITY_BLOCK,
                            block.id,
                            min_exclusive,
                            max_inclusive,
                            &mut out,
                        );
                        block.observe_checkpoint(max_inclusive);
                    }
                }
            }
        }
        out
    }

    /// Drop entities whose tombstone fell below the truncation watermark.
    pub fn gc(&self, watermark: Timestamp) -> usize {
        let mut removed = 0;
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        for db in dbs {
            if db.id == SYSTEM_DB_ID {
                continue;
            }
            for table in db.tables() {
                for segment in table.segments() {
                    for block in segment.blocks() {
                        if block.chain.read().is_garbage(watermark) {
                            segment.detach_block(block.id);
                            removed += 1;
                        }
                    }
                    if segment.chain.read().is_garbage(watermark) {
                        table.detach_segment(segment.id);
                        removed += 1;
                    }
                }
                if table.chain.read().is_garbage(watermark) {
                    db.detach_table(table.id);
                    removed += 1;
                }
            }
            if db.chain.read().is_garbage(watermark) {
                let mut names = self.db_names.write();
                if let Some(bucket) = names.get_mut(&db_full_name(db.tenant_id, &db.name)) {
                    bucket.retain(|&id| id != db.id);
                    if bucket.is_empty() {
                        names.remove(&db_full_name(db.tenant_id, &db.name));
                    }
                }
                self.dbs.write().remove(&db.id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "catalog gc pass");
        }
        removed
    }

    // ---- replay support ----

    /// Materialize-or-merge one replayed node. Missing entities are
    /// created from the node payload; an existing node with the same
    /// start timestamp is merged, latest information winning.
    pub fn replay_node(
        &self,
        entity_id: EntityId,
        node: UpdateNode<EntryPayload>,
    ) -> Result<EntityRef, StoreError> {
        self.observe_id(entity_id);
        match &node.payload {
            EntryPayload::Database { tenant_id, name } => {
                let db = match self.database_by_id(entity_id) {
                    Some(db) => db,
                    None => {
                        let db = Arc::new(DbEntry::new(entity_id, *tenant_id, name.clone()));
                        self.db_names
                            .write()
                            .entry(db_full_name(*tenant_id, name))
                            .or_default()
                            .insert(0, entity_id);
                        self.dbs.write().insert(entity_id, Arc::clone(&db));
                        db
                    }
                };
                db.chain.write().replay(node);
                Ok(EntityRef::Database(db))
            }
            EntryPayload::Table { db_id, schema } => {
                let db = self
                    .database_by_id(*db_id)
                    .ok_or_else(|| StoreError::Internal(format!(
                        "replayed table {entity_id} references missing database {db_id}"
                    )))?;
                let table = match db.table_by_id(entity_id) {
                    Some(table) => table,
                    None => {
                        let table =
                            Arc::new(TableEntry::new(entity_id, *db_id, schema.name.clone()));
                        db.attach_table(Arc::clone(&table));
                        table
                    }
                };
                table.chain.write().replay(node);
                Ok(EntityRef::Table(table))
            }
            EntryPayload::Segment { table_id, .. } => {
                let (_, table) = self.find_table(*table_id).ok_or_else(|| {
                    StoreError::Internal(format!(
                        "replayed segment {entity_id} references missing table {table_id}"
                    ))
                })?;
                let segment = match table.segment_by_id(entity_id) {
                    Some(segment) => segment,
                    None => {
                        let segment = Arc::new(SegmentEntry::new(entity_id, *table_id));
                        table.attach_segment(Arc::clone(&segment));
                        segment
                    }
                };
                segment.chain.write().replay(node);
                Ok(EntityRef::Segment(segment))
            }
            EntryPayload::Block { segment_id, .. } => {
                let segment = self.find_segment(*segment_id).ok_or_else(|| {
                    StoreError::Internal(format!(
                        "replayed block {entity_id} references missing segment {segment_id}"
                    ))
                })?;
                let block = match segment.block_by_id(entity_id) {
                    Some(block) => block,
                    None => {
                        let block = Arc::new(BlockEntry::new(entity_id, *segment_id));
                        segment.attach_block(Arc::clone(&block));
                        block
                    }
                };
                block.chain.write().replay(node);
                Ok(EntityRef::Block(block))
            }
        }
    }

    pub fn find_segment(&self, segment_id: EntityId) -> Option<Arc<SegmentEntry>> {
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        for db in dbs {
            for table in db.tables() {
                if let Some(segment) = table.segment_by_id(segment_id) {
                    return Some(segment);
                }
            }
        }
        None
    }

    /// Recompute per-table row counts from live blocks, system database
    /// excluded. Runs at the end of replay.
    pub fn rebuild_row_counts(&self, reader: &TxnReader) {
        let dbs: Vec<Arc<DbEntry>> = self.dbs.read().values().cloned().collect();
        for db in dbs {
            if db.id == SYSTEM_DB_ID {
                continue;
            }
            for table in db.tables() {
                let mut rows: i64 = 0;
                for segment in table.segments() {
                    if !segment.chain.can_get(reader).0 {
                        continue;
                    }
                    for block in segment.blocks() {
                        if block.chain.can_get(reader).0 {
                            rows += block.rows_at(reader) as i64;
                        }
                    }
                }
                table.set_row_count(rows);
            }
        }
    }
}

fn collect_chain(
    chain: &VersionChain<EntryPayload>,
    entity_type: u8,
    entity_id: EntityId,
    min_exclusive: Timestamp,
    max_inclusive: Timestamp,
    out: &mut Vec<CollectedNode>,
) {
    let guard = chain.read();
    for node in guard.committed_in(min_exclusive, max_inclusive) {
        out.push(CollectedNode {
            entity_type,
            entity_id,
            record: NodeRecord::from_node(node),
            log_index: node.log_index,
        });
    }
}

fn mo_database_schema() -> TableSchema {
    let mut schema = TableSchema::new(SYSTEM_TABLE_DATABASES);
    schema
        .add_column(ColumnDef::new("dat_id", ColumnType::UInt64).primary())
        .and_then(|s| s.add_column(ColumnDef::new("datname", ColumnType::Varchar).not_null()))
        .and_then(|s| s.add_column(ColumnDef::new("dat_tenant_id", ColumnType::UInt32)))
        .and_then(|s| s.add_column(ColumnDef::new("created_ts", ColumnType::Timestamp)))
        .expect("mo_database schema");
    schema.finalize().expect("mo_database schema");
    schema
}

fn mo_tables_schema() -> TableSchema {
    let mut schema = TableSchema::new(SYSTEM_TABLE_TABLES);
    schema
        .add_column(ColumnDef::new("rel_id", ColumnType::UInt64).primary())
        .and_then(|s| s.add_column(ColumnDef::new("relname", ColumnType::Varchar).not_null()))
        .and_then(|s| s.add_column(ColumnDef::new("reldatabase_id", ColumnType::UInt64)))
        .and_then(|s| s.add_column(ColumnDef::new("rel_comment", ColumnType::Varchar)))
        .and_then(|s| s.add_column(ColumnDef::new("created_ts", ColumnType::Timestamp)))
        .expect("mo_tables schema");
    schema.finalize().expect("mo_tables schema");
    schema
}

fn mo_columns_schema() -> TableSchema {
    let mut schema = TableSchema::new(SYSTEM_TABLE_COLUMNS);
    schema
        .add_column(ColumnDef::new("att_relname_id", ColumnType::UInt64).primary())
        .and_then(|s| s.add_column(ColumnDef::new("attname", ColumnType::Varchar).primary()))
        .and_then(|s| s.add_column(ColumnDef::new("atttyp", ColumnType::Varchar)))
        .and_then(|s| s.add_column(ColumnDef::new("attnotnull", ColumnType::Bool)))
        .and_then(|s| s.add_column(ColumnDef::new("att_is_primary", ColumnType::Bool)))
        .and_then(|s| s.add_column(ColumnDef::new("attnum", ColumnType::UInt32)))
        .expect("mo_columns schema");
    schema.finalize().expect("mo_columns schema");
    schema
}
