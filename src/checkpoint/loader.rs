use crc32c::crc32c;

use crate::catalog::CollectedNode;
use crate::checkpoint::writer::{
    catalog_node_record, CheckpointNodeBody, CheckpointSnapshot, CHECKPOINT_MAGIC,
    CHECKPOINT_VERSION, ENTITY_TUPLES,
};
use crate::clock::Timestamp;
use crate::error::StoreError;
use crate::txn::TxnId;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        if self.pos + n > self.buf.len() {
            return Err(StoreError::Decode("checkpoint truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, StoreError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, StoreError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("sized")))
    }

    fn take_u64(&mut self) -> Result<u64, StoreError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("sized")))
    }

    fn take_ts(&mut self) -> Result<Timestamp, StoreError> {
        let raw: [u8; Timestamp::ENCODED_LEN] = self
            .take(Timestamp::ENCODED_LEN)?
            .try_into()
            .expect("sized");
        Ok(Timestamp::from_bytes(&raw))
    }
}

/// Decode and validate one checkpoint image: magic, version, crc32c
/// trailer, then the node list. Integrity failures are decode errors;
/// replay treats them as fatal.
pub fn decode_checkpoint(bytes: &[u8]) -> Result<CheckpointSnapshot, StoreError> {
    if bytes.len() < CHECKPOINT_MAGIC.len() + 1 + 2 * Timestamp::ENCODED_LEN + 4 + 4 {
        return Err(StoreError::Decode("checkpoint too short".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_be_bytes(trailer.try_into().expect("sized"));
    if stored_crc != crc32c(body) {
        return Err(StoreError::Decode("checkpoint crc mismatch".into()));
    }

    let mut cursor = Cursor { buf: body, pos: 0 };
    if cursor.take(CHECKPOINT_MAGIC.len())? != CHECKPOINT_MAGIC {
        return Err(StoreError::Decode("bad checkpoint magic".into()));
    }
    let version = cursor.take_u8()?;
    if version != CHECKPOINT_VERSION {
        return Err(StoreError::Decode(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let min_ts = cursor.take_ts()?;
    let max_ts = cursor.take_ts()?;
    let count = cursor.take_u32()? as usize;

    let mut nodes = Vec::new();
    let mut tuples = Vec::new();
    for _ in 0..count {
        let entity_type = cursor.take_u8()?;
        let entity_id = cursor.take_u64()?;
        let start_ts = cursor.take_ts()?;
        let end_ts = cursor.take_ts()?;
        let txn_id = TxnId(cursor.take(16)?.try_into().expect("sized"));
        let body_len = cursor.take_u32()? as usize;
        let node_body: CheckpointNodeBody = rmp_serde::from_slice(cursor.take(body_len)?)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        match node_body {
            CheckpointNodeBody::Catalog {
                prepare_ts,
                deleted,
                payload,
            } => {
                nodes.push(CollectedNode {
                    entity_type,
                    entity_id,
                    record: catalog_node_record(
                        start_ts, end_ts, txn_id, prepare_ts, deleted, payload,
                    ),
                    log_index: None,
                });
            }
            CheckpointNodeBody::Tuples { mutations } => {
                if entity_type != ENTITY_TUPLES {
                    return Err(StoreError::Decode(format!(
                        "tuple body under entity type {entity_type}"
                    )));
                }
                tuples.push((entity_id, mutations));
            }
        }
    }
    if cursor.pos != body.len() {
        return Err(StoreError::Decode("trailing bytes in checkpoint".into()));
    }

    Ok(CheckpointSnapshot {
        min_ts,
        max_ts,
        nodes,
        tuples,
    })
}

#[cfg(test)]
mod tests {
    use super::decode_checkpoint;
    use crate::catalog::chain::NodeRecord;
    use crate::catalog::entry::{EntryPayload, ENTITY_DATABASE};
    use crate::catalog::CollectedNode;
    use crate::checkpoint::writer::{encode_checkpoint, CheckpointSnapshot};
    use crate::clock::Timestamp;
    use crate::storage::{Row, RowMutation, Value};
    use crate::txn::TxnId;

    fn sample() -> CheckpointSnapshot {
        CheckpointSnapshot {
            min_ts: Timestamp::new(1, 0),
            max_ts: Timestamp::new(100, 0),
            nodes: vec![CollectedNode {
                entity_type: ENTITY_DATABASE,
                entity_id: 1024,
                record: NodeRecord {
                    start_ts: Timestamp::new(10, 0),
                    prepare_ts: Timestamp::new(12, 0),
                    end_ts: Timestamp::new(12, 0),
                    txn_id: TxnId::generate(),
                    deleted: false,
                    payload: EntryPayload::Database {
                        tenant_id: 0,
                        name: "app".into(),
                    },
                },
                log_index: Some(5),
            }],
            tuples: vec![(
                1025,
                vec![RowMutation {
                    table_id: 1025,
                    key: vec![0x05, 0x00],
                    start_ts: Timestamp::new(20, 0),
                    commit_ts: Timestamp::new(21, 0),
                    txn_id: TxnId::generate(),
                    deleted: false,
                    row: Row::new(vec![Value::UInt64(5), Value::Str("x".into())]),
                }],
            )],
        }
    }

    #[test]
    fn checkpoint_round_trip() {
        let snapshot = sample();
        let bytes = encode_checkpoint(&snapshot).expect("encode");
        assert_eq!(&bytes[..7], b"TAECKPT");

        let decoded = decode_checkpoint(&bytes).expect("decode");
        assert_eq!(decoded.min_ts, snapshot.min_ts);
        assert_eq!(decoded.max_ts, snapshot.max_ts);
        assert_eq!(decoded.nodes.len(), 1);
        assert_eq!(decoded.nodes[0].record, snapshot.nodes[0].record);
        assert_eq!(decoded.nodes[0].entity_id, 1024);
        assert_eq!(decoded.tuples.len(), 1);
        assert_eq!(decoded.tuples[0].0, 1025);
        assert_eq!(decoded.tuples[0].1, snapshot.tuples[0].1);
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut bytes = encode_checkpoint(&sample()).expect("encode");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(decode_checkpoint(&bytes).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_checkpoint(&sample()).expect("encode");
        bytes[0] = b'X';
        assert!(decode_checkpoint(&bytes).is_err());
    }

    #[test]
    fn empty_checkpoint_round_trips() {
        let snapshot = CheckpointSnapshot {
            min_ts: Timestamp::new(50, 0),
            max_ts: Timestamp::new(60, 0),
            nodes: Vec::new(),
            tuples: Vec::new(),
        };
        let bytes = encode_checkpoint(&snapshot).expect("encode");
        let decoded = decode_checkpoint(&bytes).expect("decode");
        assert!(decoded.nodes.is_empty());
        assert!(decoded.tuples.is_empty());
        assert_eq!(decoded.max_ts, Timestamp::new(60, 0));
    }
}
