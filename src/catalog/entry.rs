use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::chain::{TxnReader, VersionChain};
use crate::catalog::schema::TableSchema;
use crate::clock::Timestamp;

pub type EntityId = u64;

pub const ENTITY_DATABASE: u8 = 0;
pub const ENTITY_TABLE: u8 = 1;
pub const ENTITY_SEGMENT: u8 = 2;
pub const ENTITY_BLOCK: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Appendable,
    NotAppendable,
}

/// Versioned state carried by catalog MVCC nodes. Each variant names its
/// parent so replay can materialize an entity from the node alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    Database {
        tenant_id: u32,
        name: String,
    },
    Table {
        db_id: EntityId,
        schema: TableSchema,
    },
    Segment {
        table_id: EntityId,
        state: SegmentState,
    },
    Block {
        segment_id: EntityId,
        rows: u64,
    },
}

#[derive(Debug)]
pub struct DbEntry {
    pub id: EntityId,
    pub tenant_id: u32,
    pub name: String,
    pub chain: VersionChain<EntryPayload>,
    tables: RwLock<BTreeMap<EntityId, Arc<TableEntry>>>,
    // Name buckets keep dropped generations around; newest id first.
    table_names: RwLock<HashMap<String, Vec<EntityId>>>,
}

impl DbEntry {
    pub fn new(id: EntityId, tenant_id: u32, name: String) -> Self {
        Self {
            id,
            tenant_id,
            name,
            chain: VersionChain::new(),
            tables: RwLock::new(BTreeMap::new()),
            table_names: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_visible(&self, reader: &TxnReader) -> bool {
        self.chain.can_get(reader).0
    }

    pub fn attach_table(&self, table: Arc<TableEntry>) {
        let mut names = self.table_names.write();
        names
            .entry(table.name.clone())
            .or_default()
            .insert(0, table.id);
        self.tables.write().insert(table.id, table);
    }

    pub fn detach_table(&self, id: EntityId) {
        let removed = self.tables.write().remove(&id);
        if let Some(table) = removed {
            let mut names = self.table_names.write();
            if let Some(bucket) = names.get_mut(&table.name) {
                bucket.retain(|&tid| tid != id);
                if bucket.is_empty() {
                    names.remove(&table.name);
                }
            }
        }
    }

    pub fn table_by_id(&self, id: EntityId) -> Option<Arc<TableEntry>> {
        self.tables.read().get(&id).cloned()
    }

    /// Newest generation under `name` that is visible at the reader.
    pub fn table_by_name(&self, name: &str, reader: &TxnReader) -> Option<Arc<TableEntry>> {
        let candidates = self.table_names.read().get(name).cloned()?;
        let tables = self.tables.read();
        for id in candidates {
            if let Some(table) = tables.get(&id) {
                let (visible, dropped) = table.chain.can_get(reader);
                if visible {
                    return Some(Arc::clone(table));
                }
                if dropped {
                    return None;
                }
            }
        }
        None
    }

    pub fn tables(&self) -> Vec<Arc<TableEntry>> {
        self.tables.read().values().cloned().collect()
    }
}

impl std::fmt::Display for DbEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "db[{} \"{}\"]", self.id, self.name)
    }
}

#[derive(Debug)]
pub struct TableEntry {
    pub id: EntityId,
    pub db_id: EntityId,
    pub name: String,
    pub chain: VersionChain<EntryPayload>,
    segments: RwLock<BTreeMap<EntityId, Arc<SegmentEntry>>>,
    row_count: AtomicI64,
}

impl TableEntry {
    pub fn new(id: EntityId, db_id: EntityId, name: String) -> Self {
        Self {
            id,
            db_id,
            name,
            chain: VersionChain::new(),
            segments: RwLock::new(BTreeMap::new()),
            row_count: AtomicI64::new(0),
        }
    }

    /// Schema as of the reader's snapshot.
    pub fn schema_at(&self, reader: &TxnReader) -> Option<TableSchema> {
        let node = self.chain.visible_node(reader)?;
        if node.deleted {
            return None;
        }
        match node.payload {
            EntryPayload::Table { schema, .. } => Some(schema),
            _ => None,
        }
    }

    pub fn attach_segment(&self, segment: Arc<SegmentEntry>) {
        self.segments.write().insert(segment.id, segment);
    }

    pub fn detach_segment(&self, id: EntityId) {
        self.segments.write().remove(&id);
    }

    pub fn segment_by_id(&self, id: EntityId) -> Option<Arc<SegmentEntry>> {
        self.segments.read().get(&id).cloned()
    }

    pub fn segments(&self) -> Vec<Arc<SegmentEntry>> {
        self.segments.read().values().cloned().collect()
    }

    pub fn row_count(&self) -> i64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn add_rows(&self, delta: i64) {
        self.row_count.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set_row_count(&self, rows: i64) {
        self.row_count.store(rows, Ordering::Release);
    }
}

impl std::fmt::Display for TableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table[{} \"{}\" db={}]", self.id, self.name, self.db_id)
    }
}

#[derive(Debug)]
pub struct SegmentEntry {
    pub id: EntityId,
    pub table_id: EntityId,
    pub chain: VersionChain<EntryPayload>,
    blocks: RwLock<BTreeMap<EntityId, Arc<BlockEntry>>>,
}

impl SegmentEntry {
    pub fn new(id: EntityId, table_id: EntityId) -> Self {
        Self {
            id,
            table_id,
            chain: VersionChain::new(),
            blocks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn state_at(&self, reader: &TxnReader) -> Option<SegmentState> {
        let node = self.chain.visible_node(reader)?;
        if node.deleted {
            return None;
        }
        match node.payload {
            EntryPayload::Segment { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn attach_block(&self, block: Arc<BlockEntry>) {
        self.blocks.write().insert(block.id, block);
    }

    pub fn detach_block(&self, id: EntityId) {
        self.blocks.write().remove(&id);
    }

    pub fn block_by_id(&self, id: EntityId) -> Option<Arc<BlockEntry>> {
        self.blocks.read().get(&id).cloned()
    }

    pub fn blocks(&self) -> Vec<Arc<BlockEntry>> {
        self.blocks.read().values().cloned().collect()
    }
}

#[derive(Debug)]
pub struct BlockEntry {
    pub id: EntityId,
    pub segment_id: EntityId,
    pub chain: VersionChain<EntryPayload>,
    max_checkpoint_ts: RwLock<Timestamp>,
}

impl BlockEntry {
    pub fn new(id: EntityId, segment_id: EntityId) -> Self {
        Self {
            id,
            segment_id,
            chain: VersionChain::new(),
            max_checkpoint_ts: RwLock::new(Timestamp::MIN),
        }
    }

    pub fn max_checkpoint_ts(&self) -> Timestamp {
        *self.max_checkpoint_ts.read()
    }

    pub fn observe_checkpoint(&self, ts: Timestamp) {
        let mut guard = self.max_checkpoint_ts.write();
        if ts > *guard {
            *guard = ts;
        }
    }

    /// Row count from the newest visible node payload.
    pub fn rows_at(&self, reader: &TxnReader) -> u64 {
        match self.chain.visible_node(reader) {
            Some(node) if !node.deleted => match node.payload {
                EntryPayload::Block { rows, .. } => rows,
                _ => 0,
            },
            _ => 0,
        }
    }
}

/// Handle to any catalog entity, as tracked in a transaction workspace.
#[derive(Debug, Clone)]
pub enum EntityRef {
    Database(Arc<DbEntry>),
    Table(Arc<TableEntry>),
    Segment(Arc<SegmentEntry>),
    Block(Arc<BlockEntry>),
}

impl EntityRef {
    pub fn id(&self) -> EntityId {
        match self {
            EntityRef::Database(e) => e.id,
            EntityRef::Table(e) => e.id,
            EntityRef::Segment(e) => e.id,
            EntityRef::Block(e) => e.id,
        }
    }

    pub fn entity_type(&self) -> u8 {
        match self {
            EntityRef::Database(_) => ENTITY_DATABASE,
            EntityRef::Table(_) => ENTITY_TABLE,
            EntityRef::Segment(_) => ENTITY_SEGMENT,
            EntityRef::Block(_) => ENTITY_BLOCK,
        }
    }

    pub fn chain(&self) -> &VersionChain<EntryPayload> {
        match self {
            EntityRef::Database(e) => &e.chain,
            EntityRef::Table(e) => &e.chain,
            EntityRef::Segment(e) => &e.chain,
            EntityRef::Block(e) => &e.chain,
        }
    }
}
