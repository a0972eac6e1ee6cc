pub mod catalog_handler;
pub mod handler;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::chain::{TxnReader, VersionChain};
use crate::catalog::entry::EntityId;
use crate::catalog::schema::TableSchema;
use crate::clock::Timestamp;
use crate::error::{EntityKind, StoreError};
use crate::txn::{TxnCtx, TxnId};

/// Typed cell values carried by tuple rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float64(f64),
    Decimal128([u8; 16]),
    Str(String),
    Bytes(Vec<u8>),
    Ts(Timestamp),
}

impl Eq for Value {}

impl Value {
    /// Order-preserving key encoding: one tag byte, then big-endian
    /// payload bytes. Signed integers flip the sign bit; floats use the
    /// IEEE total-order trick; strings terminate with 0x00.
    pub fn encode_key_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0x00),
            Value::Bool(v) => {
                out.push(0x01);
                out.push(u8::from(*v));
            }
            Value::Int32(v) => {
                out.push(0x02);
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
            }
            Value::Int64(v) => {
                out.push(0x03);
                out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
            }
            Value::UInt32(v) => {
                out.push(0x04);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::UInt64(v) => {
                out.push(0x05);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Float64(v) => {
                out.push(0x06);
                let bits = v.to_bits();
                let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
                    !bits
                } else {
                    bits ^ 0x8000_0000_0000_0000
                };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::Decimal128(v) => {
                out.push(0x07);
                out.extend_from_slice(v);
            }
            Value::Str(v) => {
                out.push(0x08);
                out.extend_from_slice(v.as_bytes());
                out.push(0x00);
            }
            Value::Bytes(v) => {
                out.push(0x09);
                out.extend_from_slice(v);
                out.push(0x00);
            }
            Value::Ts(v) => {
                out.push(0x0a);
                out.extend_from_slice(&v.to_bytes());
            }
        }
    }
}

/// One tuple, columns in schema order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// Mutation kinds staged against a tuple table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// Row image as written to WAL records and applied on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMutation {
    pub table_id: EntityId,
    pub key: Vec<u8>,
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub txn_id: TxnId,
    pub deleted: bool,
    pub row: Row,
}

/// Primary-key tuple concatenation. Tables without a user primary key get
/// a synthetic random 128-bit `__version` suffix so every row is unique.
pub fn row_key(schema: &TableSchema, row: &Row) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    if schema.primary_key.is_empty() {
        out.push(0xff);
        out.extend_from_slice(&rand::random::<u128>().to_be_bytes());
        return Ok(out);
    }
    for &idx in &schema.primary_key {
        let value = row.values.get(idx).ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "row has {} values, primary key references column {idx}",
                row.values.len()
            ))
        })?;
        if matches!(value, Value::Null) {
            return Err(StoreError::InvalidRequest(
                "primary key value is null".into(),
            ));
        }
        value.encode_key_into(&mut out);
    }
    Ok(out)
}

pub fn key_from_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        value.encode_key_into(&mut out);
    }
    out
}

/// In-memory tuple storage for one table generation: per-key MVCC chains
/// under one map lock, chain locks taken per key for the duration of a
/// staging or finalize step.
#[derive(Debug)]
pub struct TupleTable {
    pub table_id: EntityId,
    rows: RwLock<BTreeMap<Vec<u8>, Arc<VersionChain<Row>>>>,
}

impl TupleTable {
    pub fn new(table_id: EntityId) -> Self {
        Self {
            table_id,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    fn chain_for(&self, key: &[u8], create: bool) -> Option<Arc<VersionChain<Row>>> {
        if let Some(chain) = self.rows.read().get(key) {
            return Some(Arc::clone(chain));
        }
        if !create {
            return None;
        }
        let mut rows = self.rows.write();
        Some(Arc::clone(
            rows.entry(key.to_vec())
                .or_insert_with(|| Arc::new(VersionChain::new())),
        ))
    }

    /// Stage one mutation for `txn`. Inserts require the key to be absent
    /// at the snapshot, updates and deletes require it present.
    pub fn stage(
        &self,
        txn: &Arc<TxnCtx>,
        kind: WriteKind,
        key: Vec<u8>,
        row: Row,
    ) -> Result<(), StoreError> {
        let reader = TxnReader::from(txn.as_ref());
        let chain = self
            .chain_for(&key, true)
            .ok_or_else(|| StoreError::Internal("row chain vanished".into()))?;
        let (present, _) = chain.can_get(&reader);
        match kind {
            WriteKind::Insert => {
                if present {
                    return Err(StoreError::Duplicate {
                        entity: EntityKind::Row,
                        name: format!("table {} key {:02x?}", self.table_id, key),
                    });
                }
            }
            WriteKind::Update | WriteKind::Delete => {
                if !present {
                    return Err(StoreError::NotFound {
                        entity: EntityKind::Row,
                        name: format!("table {} key {:02x?}", self.table_id, key),
                    });
                }
            }
        }
        let result = chain
            .write()
            .stage_pending(txn, row, kind == WriteKind::Delete);
        result
    }

    /// Commit-time write-write validation for every key `txn` staged.
    pub fn validate(&self, txn: &TxnCtx, keys: &[Vec<u8>]) -> Result<(), StoreError> {
        for key in keys {
            if let Some(chain) = self.chain_for(key, false) {
                if let Some(winner) = chain.read().commit_conflict(txn.id(), txn.start_ts()) {
                    return Err(StoreError::Conflict(format!(
                        "table {} key {:02x?} committed at {winner} past snapshot {}",
                        self.table_id,
                        key,
                        txn.start_ts()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn set_prepare_ts(&self, txn: &TxnCtx, keys: &[Vec<u8>], prepare_ts: Timestamp) {
        for key in keys {
            if let Some(chain) = self.chain_for(key, false) {
                chain.write().set_prepare_ts(txn.start_ts(), prepare_ts);
            }
        }
    }

    pub fn commit(
        &self,
        txn: &TxnCtx,
        keys: &[Vec<u8>],
        commit_ts: Timestamp,
    ) -> Result<(), StoreError> {
        for key in keys {
            let chain = self
                .chain_for(key, false)
                .ok_or_else(|| StoreError::Internal("committed row chain missing".into()))?;
            let mut guard = chain.write();
            if guard.has_pending(txn.id()) {
                guard.commit(txn.start_ts(), commit_ts)?;
            }
        }
        Ok(())
    }

    pub fn rollback(&self, txn: &TxnCtx, keys: &[Vec<u8>]) {
        for key in keys {
            if let Some(chain) = self.chain_for(key, false) {
                let mut guard = chain.write();
                if guard.has_pending(txn.id()) {
                    let _ = guard.rollback(txn.start_ts());
                }
            }
        }
    }

    /// Build WAL row images for this transaction's staged keys.
    pub fn wal_mutations(
        &self,
        txn: &TxnCtx,
        keys: &[Vec<u8>],
        commit_ts: Timestamp,
    ) -> Vec<RowMutation> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(chain) = self.chain_for(key, false) {
                let guard = chain.read();
                if let Some(node) = guard
                    .nodes()
                    .iter()
                    .find(|n| n.txn_id == txn.id() && n.start_ts == txn.start_ts())
                {
                    out.push(RowMutation {
                        table_id: self.table_id,
                        key: key.clone(),
                        start_ts: node.start_ts,
                        commit_ts,
                        txn_id: node.txn_id,
                        deleted: node.deleted,
                        row: node.payload.clone(),
                    });
                }
            }
        }
        out
    }

    /// Apply one replayed committed row image.
    pub fn replay(&self, mutation: RowMutation) {
        let chain = {
            let mut rows = self.rows.write();
            Arc::clone(
                rows.entry(mutation.key.clone())
                    .or_insert_with(|| Arc::new(VersionChain::new())),
            )
        };
        let mut guard = chain.write();
        guard.replay(crate::catalog::chain::UpdateNode {
            start_ts: mutation.start_ts,
            prepare_ts: mutation.commit_ts,
            end_ts: mutation.commit_ts,
            txn_id: mutation.txn_id,
            log_index: None,
            deleted: mutation.deleted,
            payload: mutation.row,
            txn: None,
        });
    }

    pub fn get(&self, reader: &TxnReader, key: &[u8]) -> Option<Row> {
        let chain = self.chain_for(key, false)?;
        let node = chain.visible_node(reader)?;
        if node.deleted {
            return None;
        }
        Some(node.payload)
    }

    /// Range scan from an exclusive cursor position, visible rows only,
    /// at most `limit` entries. Returns the rows and the last key seen.
    pub fn scan(
        &self,
        reader: &TxnReader,
        after: Option<&[u8]>,
        limit: usize,
    ) -> (Vec<(Vec<u8>, Row)>, Option<Vec<u8>>) {
        let chains: Vec<(Vec<u8>, Arc<VersionChain<Row>>)> = {
            let rows = self.rows.read();
            let range = match after {
                Some(cursor) => rows.range::<[u8], _>((Bound::Excluded(cursor), Bound::Unbounded)),
                None => rows.range::<[u8], _>((Bound::Unbounded, Bound::Unbounded)),
            };
            range
                .map(|(k, chain)| (k.clone(), Arc::clone(chain)))
                .collect()
        };

        let mut out = Vec::new();
        let mut last_key = None;
        for (key, chain) in chains {
            if out.len() >= limit {
                break;
            }
            last_key = Some(key.clone());
            if let Some(node) = chain.visible_node(reader) {
                if !node.deleted {
                    out.push((key, node.payload));
                }
            }
        }
        (out, last_key)
    }

    /// All committed row versions at or below `max_ts`, key order, as a
    /// checkpoint collects them.
    pub fn committed_mutations(&self, max_ts: Timestamp) -> Vec<RowMutation> {
        let chains: Vec<(Vec<u8>, Arc<VersionChain<Row>>)> = self
            .rows
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        let mut out = Vec::new();
        for (key, chain) in chains {
            let guard = chain.read();
            for node in guard.nodes().iter().rev() {
                if node.is_committed() && node.end_ts <= max_ts {
                    out.push(RowMutation {
                        table_id: self.table_id,
                        key: key.clone(),
                        start_ts: node.start_ts,
                        commit_ts: node.end_ts,
                        txn_id: node.txn_id,
                        deleted: node.deleted,
                        row: node.payload.clone(),
                    });
                }
            }
        }
        out
    }

    pub fn live_row_count(&self, reader: &TxnReader) -> u64 {
        let chains: Vec<Arc<VersionChain<Row>>> =
            self.rows.read().values().cloned().collect();
        chains
            .into_iter()
            .filter(|chain| {
                chain
                    .visible_node(reader)
                    .map(|n| !n.deleted)
                    .unwrap_or(false)
            })
            .count() as u64
    }
}
