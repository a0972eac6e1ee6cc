use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::chain::{NodeRecord, TxnReader};
use crate::catalog::entry::{EntityId, EntryPayload};
use crate::checkpoint::loader::decode_checkpoint;
use crate::checkpoint::{CheckpointEntry, CKP_DISCRIMINATOR};
use crate::clock::Timestamp;
use crate::error::StoreError;
use crate::logservice::record::{LogRecord, RecordType};
use crate::storage::handler::MemHandler;
use crate::storage::RowMutation;
use crate::txn::TxnId;

/// First payload byte of an ordinary transactional user record.
pub const TXN_DISCRIMINATOR: u8 = 0x01;

/// Commands carried by transactional WAL records. `Log*` variants
/// materialize an entity first seen through the log; `Update*` variants
/// merge one version node into a possibly-present entity. `Composed`
/// wraps one transaction's full command set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalCommand {
    Composed(Vec<WalCommand>),
    LogDatabase {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    UpdateDatabase {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    LogTable {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    UpdateTable {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    LogSegment {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    UpdateSegment {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    LogBlock {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    UpdateBlock {
        id: EntityId,
        node: NodeRecord<EntryPayload>,
    },
    Rows(Vec<RowMutation>),
    /// 2PC coordinator decision record, appended before participant
    /// commits go out.
    Committing {
        txn_id: TxnId,
        commit_ts: Timestamp,
        participants: Vec<u64>,
    },
    /// 2PC completion record, appended after every participant acked.
    Committed {
        txn_id: TxnId,
        commit_ts: Timestamp,
    },
}

pub fn encode_txn_record(cmd: &WalCommand) -> Result<Vec<u8>, StoreError> {
    let body = rmp_serde::to_vec(cmd).map_err(|e| StoreError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(TXN_DISCRIMINATOR);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_txn_record(payload: &[u8]) -> Result<WalCommand, StoreError> {
    if payload.first() != Some(&TXN_DISCRIMINATOR) {
        return Err(StoreError::Decode("not a transactional record".into()));
    }
    rmp_serde::from_slice(&payload[1..]).map_err(|e| StoreError::Decode(e.to_string()))
}

/// A 2PC decision whose completion record never made it to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    pub txn_id: TxnId,
    pub commit_ts: Timestamp,
    pub participants: Vec<u64>,
}

/// Replay progress callback: applied and stale `(log_index, commit_ts)`
/// pairs, as the catalog store reports them upward.
pub trait ReplayObserver: Send + Sync {
    fn on_applied(&self, _log_index: u64, _commit_ts: Timestamp) {}
    fn on_stale(&self, _log_index: u64) {}
}

pub struct NoopObserver;

impl ReplayObserver for NoopObserver {}

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub checkpoint: Option<CheckpointEntry>,
    pub applied_records: usize,
    pub stale_nodes: usize,
    pub max_commit_ts: Timestamp,
    /// Coordinator decisions seen without a matching completion record;
    /// the transaction service re-sends commits for these on startup.
    pub unresolved_committing: Vec<PendingCommit>,
}

/// Rebuilds in-memory state from one shard's log: the most recent
/// checkpoint snapshot first, then every transactional record past it.
pub struct Replayer<'a> {
    handler: &'a Arc<MemHandler>,
    observer: &'a dyn ReplayObserver,
}

impl<'a> Replayer<'a> {
    pub fn new(handler: &'a Arc<MemHandler>, observer: &'a dyn ReplayObserver) -> Self {
        Self { handler, observer }
    }

    pub fn replay(&self, records: &[LogRecord]) -> Result<ReplayOutcome, StoreError> {
        let mut outcome = ReplayOutcome::default();

        // Locate the newest checkpoint in the retained log suffix.
        let mut ckpt: Option<(u64, Vec<u8>)> = None;
        for record in records {
            if record.rec_type == RecordType::UserRecord
                && record.payload.first() == Some(&CKP_DISCRIMINATOR)
            {
                ckpt = Some((record.lsn, record.payload[1..].to_vec()));
            }
        }

        let mut ckpt_max = Timestamp::MIN;
        let mut ckpt_lsn = 0u64;
        if let Some((lsn, image)) = ckpt {
            let snapshot = decode_checkpoint(&image)?;
            for node in &snapshot.nodes {
                // Replay correctness demands a crash here, not a skip: a
                // checkpoint that references missing parents is corrupt.
                self.handler
                    .catalog()
                    .replay_node(node.entity_id, node.record.clone().into_node(None))
                    .unwrap_or_else(|e| panic!("checkpoint replay failed: {e}"));
            }
            for (table_id, mutations) in snapshot.tuples {
                let table = self.handler.get_or_create_tuple_table(table_id);
                for mutation in mutations {
                    table.replay(mutation);
                }
            }
            ckpt_max = snapshot.max_ts;
            ckpt_lsn = lsn;
            outcome.checkpoint = Some(CheckpointEntry {
                min_ts: snapshot.min_ts,
                max_ts: snapshot.max_ts,
                lsn,
            });
            outcome.max_commit_ts = ckpt_max;
            info!(lsn, max_ts = %ckpt_max, "applied checkpoint snapshot");
        }

        let mut committing: Vec<PendingCommit> = Vec::new();
        for record in records {
            if record.lsn <= ckpt_lsn || record.rec_type != RecordType::UserRecord {
                continue;
            }
            match record.payload.first() {
                Some(&TXN_DISCRIMINATOR) => {
                    let cmd = decode_txn_record(&record.payload)?;
                    self.apply_command(cmd, record.lsn, ckpt_max, &mut committing, &mut outcome)?;
                    outcome.applied_records += 1;
                }
                Some(&CKP_DISCRIMINATOR) | None => {}
                Some(other) => {
                    warn!(lsn = record.lsn, tag = other, "skipping unknown user record");
                }
            }
        }

        outcome.unresolved_committing = committing;
        self.rebuild_row_counts(outcome.max_commit_ts);
        Ok(outcome)
    }

    fn apply_command(
        &self,
        cmd: WalCommand,
        log_index: u64,
        ckpt_max: Timestamp,
        committing: &mut Vec<PendingCommit>,
        outcome: &mut ReplayOutcome,
    ) -> Result<(), StoreError> {
        match cmd {
            WalCommand::Composed(cmds) => {
                for sub in cmds {
                    self.apply_command(sub, log_index, ckpt_max, committing, outcome)?;
                }
            }
            WalCommand::LogDatabase { id, node }
            | WalCommand::UpdateDatabase { id, node }
            | WalCommand::LogTable { id, node }
            | WalCommand::UpdateTable { id, node }
            | WalCommand::LogSegment { id, node }
            | WalCommand::UpdateSegment { id, node }
            | WalCommand::LogBlock { id, node }
            | WalCommand::UpdateBlock { id, node } => {
                // Nodes already covered by the checkpoint are reported but
                // not applied.
                if node.start_ts <= ckpt_max {
                    outcome.stale_nodes += 1;
                    self.observer.on_stale(log_index);
                    return Ok(());
                }
                let commit_ts = node.end_ts;
                self.handler
                    .catalog()
                    .replay_node(id, node.into_node(Some(log_index)))
                    .unwrap_or_else(|e| panic!("log replay failed at lsn {log_index}: {e}"));
                if !commit_ts.is_uncommitted() {
                    outcome.max_commit_ts = outcome.max_commit_ts.max(commit_ts);
                }
                self.observer.on_applied(log_index, commit_ts);
            }
            WalCommand::Rows(mutations) => {
                for mutation in mutations {
                    if mutation.commit_ts <= ckpt_max {
                        outcome.stale_nodes += 1;
                        self.observer.on_stale(log_index);
                        continue;
                    }
                    outcome.max_commit_ts = outcome.max_commit_ts.max(mutation.commit_ts);
                    let table = self.handler.get_or_create_tuple_table(mutation.table_id);
                    table.replay(mutation);
                    self.observer.on_applied(log_index, outcome.max_commit_ts);
                }
            }
            WalCommand::Committing {
                txn_id,
                commit_ts,
                participants,
            } => {
                committing.push(PendingCommit {
                    txn_id,
                    commit_ts,
                    participants,
                });
            }
            WalCommand::Committed { txn_id, .. } => {
                committing.retain(|p| p.txn_id != txn_id);
            }
        }
        Ok(())
    }

    /// Recompute live table row counts, system database excluded.
    fn rebuild_row_counts(&self, as_of: Timestamp) {
        let reader = TxnReader::snapshot(as_of.next());
        let catalog = self.handler.catalog();
        catalog.rebuild_row_counts(&reader);
        for table in self.handler.tuple_tables() {
            if let Some((db, entry)) = catalog.find_table(table.table_id) {
                if db.id != crate::catalog::SYSTEM_DB_ID {
                    let block_rows = entry.row_count();
                    entry.set_row_count(block_rows + table.live_row_count(&reader) as i64);
                }
            }
        }
    }
}
