use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::catalog::chain::NodeRecord;
use crate::catalog::entry::{ENTITY_BLOCK, ENTITY_DATABASE, ENTITY_SEGMENT, ENTITY_TABLE};
use crate::clock::{HybridClock, Timestamp};
use crate::error::{StoreError, StoreErrorCode};
use crate::logservice::client::LogClient;
use crate::recovery::{encode_txn_record, WalCommand};
use crate::storage::catalog_handler::CatalogHandler;
use crate::storage::handler::{StorageRequest, StorageResponse, Workspace};
use crate::txn::{TxnCtx, TxnId, TxnMeta, TxnState};

/// One data-shard replica on a store: a catalog slice plus tuple storage,
/// executing transactional reads and the participant half of 2PC. Each
/// in-flight transaction owns a workspace of staged changes that is
/// finalized or discarded as a unit.
pub struct Replica {
    pub shard_id: u64,
    pub replica_id: u64,
    handler: Arc<CatalogHandler>,
    clock: Arc<HybridClock>,
    log: Arc<LogClient>,
    txns: Mutex<HashMap<TxnId, Arc<TxnCtx>>>,
    workspaces: Mutex<HashMap<TxnId, Arc<Mutex<Workspace>>>>,
}

impl Replica {
    pub fn new(
        shard_id: u64,
        replica_id: u64,
        handler: Arc<CatalogHandler>,
        clock: Arc<HybridClock>,
        log: Arc<LogClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            replica_id,
            handler,
            clock,
            log,
            txns: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
        })
    }

    pub fn handler(&self) -> &Arc<CatalogHandler> {
        &self.handler
    }

    pub fn log(&self) -> &Arc<LogClient> {
        &self.log
    }

    /// Resolve or admit the transaction named by `meta`. A replica first
    /// reached mid-transaction builds its local context from the wire
    /// snapshot.
    pub fn resolve_txn(&self, meta: &TxnMeta) -> Arc<TxnCtx> {
        let mut txns = self.txns.lock();
        if let Some(txn) = txns.get(&meta.id) {
            return Arc::clone(txn);
        }
        let txn = Arc::new(TxnCtx::new(meta.id, meta.snapshot_ts, Vec::new()));
        txns.insert(meta.id, Arc::clone(&txn));
        txn
    }

    pub fn lookup_txn(&self, id: TxnId) -> Option<Arc<TxnCtx>> {
        self.txns.lock().get(&id).cloned()
    }

    fn workspace(&self, id: TxnId) -> Arc<Mutex<Workspace>> {
        let mut workspaces = self.workspaces.lock();
        Arc::clone(workspaces.entry(id).or_default())
    }

    fn forget(&self, id: TxnId) {
        self.txns.lock().remove(&id);
        self.workspaces.lock().remove(&id);
    }

    pub fn execute(
        &self,
        meta: &TxnMeta,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        let txn = self.resolve_txn(meta);
        if txn.state(false) != TxnState::Active {
            return Err(StoreError::TxnNotActive {
                state: txn.state(false),
            });
        }
        let ws = self.workspace(meta.id);
        let mut ws = ws.lock();
        self.handler.handle(&txn, &mut ws, req)
    }

    fn validate_rows(&self, txn: &TxnCtx, ws: &Workspace) -> Result<(), StoreError> {
        for (table_id, keys) in ws.row_keys() {
            if let Some(table) = self.handler.upstream().tuple_table(*table_id) {
                table.validate(txn, keys)?;
            }
        }
        Ok(())
    }

    fn set_prepare_ts(&self, txn: &TxnCtx, ws: &Workspace, prepare_ts: Timestamp) {
        for entity in ws.entities() {
            entity
                .chain()
                .write()
                .set_prepare_ts(txn.start_ts(), prepare_ts);
        }
        for (table_id, keys) in ws.row_keys() {
            if let Some(table) = self.handler.upstream().tuple_table(*table_id) {
                table.set_prepare_ts(txn, keys, prepare_ts);
            }
        }
    }

    fn build_wal_command(
        &self,
        txn: &TxnCtx,
        ws: &Workspace,
        commit_ts: Timestamp,
    ) -> Result<Option<WalCommand>, StoreError> {
        let mut cmds = Vec::new();
        for entity in ws.entities() {
            let guard = entity.chain().read();
            let Some(node) = guard
                .nodes()
                .iter()
                .find(|n| n.txn_id == txn.id() && !n.is_committed())
            else {
                continue;
            };
            let record = NodeRecord {
                start_ts: node.start_ts,
                prepare_ts: commit_ts,
                end_ts: commit_ts,
                txn_id: node.txn_id,
                deleted: node.deleted,
                payload: node.payload.clone(),
            };
            let id = entity.id();
            cmds.push(match entity.entity_type() {
                ENTITY_DATABASE => WalCommand::UpdateDatabase { id, node: record },
                ENTITY_TABLE => WalCommand::UpdateTable { id, node: record },
                ENTITY_SEGMENT => WalCommand::UpdateSegment { id, node: record },
                ENTITY_BLOCK => WalCommand::UpdateBlock { id, node: record },
                other => {
                    return Err(StoreError::Internal(format!(
                        "unknown entity type {other}"
                    )))
                }
            });
        }
        let mut mutations = Vec::new();
        for (table_id, keys) in ws.row_keys() {
            if let Some(table) = self.handler.upstream().tuple_table(*table_id) {
                mutations.extend(table.wal_mutations(txn, keys, commit_ts));
            }
        }
        if !mutations.is_empty() {
            cmds.push(WalCommand::Rows(mutations));
        }
        if cmds.is_empty() {
            return Ok(None);
        }
        Ok(Some(WalCommand::Composed(cmds)))
    }

    fn finalize(
        &self,
        txn: &TxnCtx,
        ws: &Workspace,
        commit_ts: Timestamp,
        log_index: Option<u64>,
    ) -> Result<(), StoreError> {
        for entity in ws.entities() {
            let mut chain = entity.chain().write();
            if chain.has_pending(txn.id()) {
                chain.commit(txn.start_ts(), commit_ts)?;
                if let Some(lsn) = log_index {
                    chain.set_log_index(txn.start_ts(), lsn);
                }
            }
        }
        for (table_id, keys) in ws.row_keys() {
            if let Some(table) = self.handler.upstream().tuple_table(*table_id) {
                table.commit(txn, keys, commit_ts)?;
            }
        }
        let catalog = self.handler.upstream().catalog();
        for (table_id, delta) in ws.row_count_deltas() {
            if *delta != 0 {
                if let Some((_, entry)) = catalog.find_table(*table_id) {
                    entry.add_rows(*delta);
                }
            }
        }
        Ok(())
    }

    fn undo(&self, txn: &TxnCtx, ws: &Workspace) {
        for entity in ws.entities() {
            let mut chain = entity.chain().write();
            if chain.has_pending(txn.id()) {
                let _ = chain.rollback(txn.start_ts());
            }
        }
        for (table_id, keys) in ws.row_keys() {
            if let Some(table) = self.handler.upstream().tuple_table(*table_id) {
                table.rollback(txn, keys);
            }
        }
    }

    /// Single-participant fast path: prepare, log, and commit in one
    /// step on this replica.
    pub fn commit_single(&self, meta: &TxnMeta) -> Result<Timestamp, StoreError> {
        let txn = self.resolve_txn(meta);
        let ws_handle = self.workspace(meta.id);
        let ws = ws_handle.lock();

        let commit_ts = self.clock.update(txn.start_ts());
        if let Err(conflict) = self.validate_rows(&txn, &ws) {
            drop(ws);
            self.abort(&txn, &ws_handle)?;
            return Err(conflict);
        }
        txn.to_committing(commit_ts)?;
        self.set_prepare_ts(&txn, &ws, commit_ts);

        let log_index = match self.build_wal_command(&txn, &ws, commit_ts)? {
            Some(cmd) => Some(self.log.append(encode_txn_record(&cmd)?)?),
            None => None,
        };
        self.finalize(&txn, &ws, commit_ts, log_index)?;
        txn.to_committed()?;
        drop(ws);
        self.forget(meta.id);
        debug!(txn = %txn, shard = self.shard_id, "fast-path commit");
        Ok(commit_ts)
    }

    /// Participant prepare: validate, stamp with this shard's clock
    /// (advanced past the coordinator's hint), and report the prepare
    /// timestamp back.
    pub fn prepare(&self, meta: &TxnMeta, hint_ts: Timestamp) -> Result<Timestamp, StoreError> {
        let txn = self.resolve_txn(meta);
        let ws_handle = self.workspace(meta.id);
        let ws = ws_handle.lock();

        let prepare_ts = self.clock.update(hint_ts.max(txn.start_ts()));
        txn.to_preparing(prepare_ts)?;
        if let Err(conflict) = self.validate_rows(&txn, &ws) {
            return Err(conflict);
        }
        self.set_prepare_ts(&txn, &ws, prepare_ts);
        txn.to_prepared()?;
        debug!(txn = %txn, shard = self.shard_id, "prepared");
        Ok(prepare_ts)
    }

    /// Participant commit with the coordinator's final timestamp.
    /// Idempotent on `commit_ts`: a replayed commit for an already
    /// committed transaction succeeds without effect.
    pub fn commit_prepared(&self, meta: &TxnMeta, commit_ts: Timestamp) -> Result<(), StoreError> {
        let Some(txn) = self.lookup_txn(meta.id) else {
            // Already committed and forgotten; the retry is a no-op.
            return Ok(());
        };
        if txn.state(false) == TxnState::Committed {
            if txn.commit_ts() == commit_ts {
                return Ok(());
            }
            return Err(StoreError::Internal(format!(
                "commit ts mismatch on retry: {} vs {commit_ts}",
                txn.commit_ts()
            )));
        }
        let ws_handle = self.workspace(meta.id);
        let ws = ws_handle.lock();

        // A retry may find the first attempt stranded mid-commit; resume
        // from where it stopped rather than rejecting the transition.
        if txn.state(false) == TxnState::Committing {
            if txn.commit_ts() != commit_ts {
                return Err(StoreError::Internal(format!(
                    "commit ts mismatch on retry: {} vs {commit_ts}",
                    txn.commit_ts()
                )));
            }
        } else {
            txn.to_committing(commit_ts)?;
        }
        self.set_prepare_ts(&txn, &ws, commit_ts);
        let log_index = match self.build_wal_command(&txn, &ws, commit_ts)? {
            Some(cmd) => Some(self.log.append(encode_txn_record(&cmd)?)?),
            None => None,
        };
        self.finalize(&txn, &ws, commit_ts, log_index)?;
        txn.to_committed()?;
        drop(ws);
        self.forget(meta.id);
        debug!(txn = %txn, shard = self.shard_id, "participant committed");
        Ok(())
    }

    fn abort(&self, txn: &Arc<TxnCtx>, ws_handle: &Arc<Mutex<Workspace>>) -> Result<(), StoreError> {
        let rollback_ts = self.clock.update(txn.start_ts());
        txn.to_rollbacking(rollback_ts)?;
        let ws = ws_handle.lock();
        self.undo(txn, &ws);
        txn.to_rollbacked()?;
        Ok(())
    }

    /// Roll back whatever this replica staged for the transaction.
    /// Idempotent: unknown or already rolled back transactions succeed.
    pub fn rollback(&self, meta: &TxnMeta) -> Result<(), StoreError> {
        let Some(txn) = self.lookup_txn(meta.id) else {
            return Ok(());
        };
        if txn.state(false) == TxnState::Rollbacked {
            self.forget(meta.id);
            return Ok(());
        }
        let ws_handle = self.workspace(meta.id);
        match self.abort(&txn, &ws_handle) {
            Ok(()) => {}
            Err(e) if e.code() == StoreErrorCode::TxnCannotRollback => {
                warn!(txn = %txn, error = %e, "rollback refused");
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.forget(meta.id);
        debug!(txn = %txn, shard = self.shard_id, "rolled back");
        Ok(())
    }
}

/// Routing seam between the coordinator and shard replicas. The local
/// implementation dispatches in-process; the RPC client implements the
/// same surface across stores.
#[async_trait::async_trait]
pub trait ShardRouter: Send + Sync {
    async fn read(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError>;
    async fn write(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError>;
    async fn prepare(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        prepare_ts: Timestamp,
    ) -> Result<Timestamp, StoreError>;
    async fn commit(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        commit_ts: Timestamp,
    ) -> Result<(), StoreError>;
    async fn commit_single(&self, shard_id: u64, meta: TxnMeta) -> Result<Timestamp, StoreError>;
    async fn rollback(&self, shard_id: u64, meta: TxnMeta) -> Result<(), StoreError>;
}

/// In-process router over this store's own replicas.
pub struct LocalRouter {
    replicas: Mutex<HashMap<u64, Arc<Replica>>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replicas: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, replica: Arc<Replica>) {
        self.replicas.lock().insert(replica.shard_id, replica);
    }

    pub fn remove(&self, shard_id: u64) {
        self.replicas.lock().remove(&shard_id);
    }

    pub fn get(&self, shard_id: u64) -> Result<Arc<Replica>, StoreError> {
        self.replicas
            .lock()
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: crate::error::EntityKind::Shard,
                name: shard_id.to_string(),
            })
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        self.replicas.lock().keys().copied().collect()
    }
}

#[async_trait::async_trait]
impl ShardRouter for LocalRouter {
    async fn read(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        let replica = self.get(shard_id)?;
        replica.execute(&meta, req)
    }

    async fn write(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        let replica = self.get(shard_id)?;
        replica.execute(&meta, req)
    }

    async fn prepare(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        prepare_ts: Timestamp,
    ) -> Result<Timestamp, StoreError> {
        let replica = self.get(shard_id)?;
        replica.prepare(&meta, prepare_ts)
    }

    async fn commit(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        commit_ts: Timestamp,
    ) -> Result<(), StoreError> {
        let replica = self.get(shard_id)?;
        replica.commit_prepared(&meta, commit_ts)
    }

    async fn commit_single(&self, shard_id: u64, meta: TxnMeta) -> Result<Timestamp, StoreError> {
        let replica = self.get(shard_id)?;
        replica.commit_single(&meta)
    }

    async fn rollback(&self, shard_id: u64, meta: TxnMeta) -> Result<(), StoreError> {
        let replica = self.get(shard_id)?;
        replica.rollback(&meta)
    }
}
