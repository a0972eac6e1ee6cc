use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use crate::catalog::chain::NodeRecord;
use crate::catalog::entry::{EntityId, EntryPayload};
use crate::catalog::CollectedNode;
use crate::clock::Timestamp;
use crate::error::StoreError;
use crate::storage::RowMutation;
use crate::txn::TxnId;

pub const CHECKPOINT_MAGIC: &[u8; 7] = b"TAECKPT";
pub const CHECKPOINT_VERSION: u8 = 1;

/// Entity tag for tuple batches riding inside a checkpoint alongside the
/// four catalog entity kinds.
pub const ENTITY_TUPLES: u8 = 4;

/// Variable body of one checkpoint node entry. Catalog entries carry the
/// rest of their MVCC node image; tuple entries carry a table's committed
/// row versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckpointNodeBody {
    Catalog {
        prepare_ts: Timestamp,
        deleted: bool,
        payload: EntryPayload,
    },
    Tuples {
        mutations: Vec<RowMutation>,
    },
}

/// One catalog snapshot. Snapshots are cumulative: everything committed
/// at or before `max_ts` is inside, which is what lets replay restore
/// from the latest checkpoint alone after the log prefix is truncated.
/// `min_ts` records the window this checkpoint newly covers.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub nodes: Vec<CollectedNode>,
    pub tuples: Vec<(EntityId, Vec<RowMutation>)>,
}

/// Serialize a snapshot:
/// magic, version u8, min_ts, max_ts, node_count u32 BE, then for each
/// node `entity_type u8 | entity_id u64 BE | start_ts | end_ts |
/// txn_id [16] | payload_len u32 BE | payload`, closed by a crc32c
/// trailer over everything before it.
pub fn encode_checkpoint(snapshot: &CheckpointSnapshot) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    out.extend_from_slice(CHECKPOINT_MAGIC);
    out.push(CHECKPOINT_VERSION);
    out.extend_from_slice(&snapshot.min_ts.to_bytes());
    out.extend_from_slice(&snapshot.max_ts.to_bytes());
    let count = u32::try_from(snapshot.nodes.len() + snapshot.tuples.len())
        .map_err(|_| StoreError::Encode("too many checkpoint nodes".into()))?;
    out.extend_from_slice(&count.to_be_bytes());

    for node in &snapshot.nodes {
        let body = CheckpointNodeBody::Catalog {
            prepare_ts: node.record.prepare_ts,
            deleted: node.record.deleted,
            payload: node.record.payload.clone(),
        };
        write_node(
            &mut out,
            node.entity_type,
            node.entity_id,
            node.record.start_ts,
            node.record.end_ts,
            node.record.txn_id,
            &body,
        )?;
    }
    for (table_id, mutations) in &snapshot.tuples {
        let body = CheckpointNodeBody::Tuples {
            mutations: mutations.clone(),
        };
        write_node(
            &mut out,
            ENTITY_TUPLES,
            *table_id,
            snapshot.min_ts,
            snapshot.max_ts,
            TxnId([0u8; 16]),
            &body,
        )?;
    }

    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

fn write_node(
    out: &mut Vec<u8>,
    entity_type: u8,
    entity_id: EntityId,
    start_ts: Timestamp,
    end_ts: Timestamp,
    txn_id: TxnId,
    body: &CheckpointNodeBody,
) -> Result<(), StoreError> {
    out.push(entity_type);
    out.extend_from_slice(&entity_id.to_be_bytes());
    out.extend_from_slice(&start_ts.to_bytes());
    out.extend_from_slice(&end_ts.to_bytes());
    out.extend_from_slice(txn_id.as_bytes());
    let body_bytes = rmp_serde::to_vec(body).map_err(|e| StoreError::Encode(e.to_string()))?;
    let body_len = u32::try_from(body_bytes.len())
        .map_err(|_| StoreError::Encode("checkpoint node payload too large".into()))?;
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&body_bytes);
    Ok(())
}

pub(crate) fn catalog_node_record(
    start_ts: Timestamp,
    end_ts: Timestamp,
    txn_id: TxnId,
    prepare_ts: Timestamp,
    deleted: bool,
    payload: EntryPayload,
) -> NodeRecord<EntryPayload> {
    NodeRecord {
        start_ts,
        prepare_ts,
        end_ts,
        txn_id,
        deleted,
        payload,
    }
}
