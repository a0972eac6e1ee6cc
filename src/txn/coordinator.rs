use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::clock::{HybridClock, Timestamp};
use crate::error::StoreError;
use crate::logservice::client::LogClient;
use crate::recovery::{encode_txn_record, PendingCommit, WalCommand};
use crate::storage::handler::{StorageRequest, StorageResponse};
use crate::txn::service::ShardRouter;
use crate::txn::{TxnCtx, TxnId, TxnMeta, TxnState};

/// Client-facing transaction service: begins transactions, routes reads
/// and writes to shard replicas, and drives two-phase commit when a
/// transaction touched more than one shard. Coordinator decisions are
/// made durable on this store's home log shard before participants are
/// told to commit.
pub struct TxnService {
    clock: Arc<HybridClock>,
    router: Arc<dyn ShardRouter>,
    home_log: Arc<LogClient>,
    txns: Mutex<HashMap<TxnId, Arc<TxnCtx>>>,
    commit_timeout: Duration,
    zombie_timeout: Duration,
}

impl TxnService {
    pub fn new(
        clock: Arc<HybridClock>,
        router: Arc<dyn ShardRouter>,
        home_log: Arc<LogClient>,
        commit_timeout: Duration,
        zombie_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            router,
            home_log,
            txns: Mutex::new(HashMap::new()),
            commit_timeout,
            zombie_timeout,
        })
    }

    /// Start a transaction at the clock's current time, or at a caller
    /// supplied snapshot.
    pub fn begin(&self, snapshot_ts: Option<Timestamp>) -> Arc<TxnCtx> {
        let start_ts = snapshot_ts.unwrap_or_else(|| self.clock.now());
        let txn = Arc::new(TxnCtx::new(TxnId::generate(), start_ts, Vec::new()));
        self.txns.lock().insert(txn.id(), Arc::clone(&txn));
        txn
    }

    pub fn lookup(&self, id: TxnId) -> Option<Arc<TxnCtx>> {
        self.txns.lock().get(&id).cloned()
    }

    fn forget(&self, id: TxnId) {
        self.txns.lock().remove(&id);
    }

    fn ensure_open(&self, txn: &Arc<TxnCtx>) -> Result<(), StoreError> {
        match txn.state(false) {
            TxnState::Active => Ok(()),
            state if state.is_terminal() => Err(StoreError::TxnClosed),
            state => Err(StoreError::TxnNotActive { state }),
        }
    }

    pub async fn read(
        &self,
        txn: &Arc<TxnCtx>,
        shard_id: u64,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        self.ensure_open(txn)?;
        let meta = txn.meta();
        tokio::time::timeout(self.commit_timeout, self.router.read(shard_id, meta, req))
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// Route a write and record the shard as a commit participant.
    pub async fn write(
        &self,
        txn: &Arc<TxnCtx>,
        shard_id: u64,
        req: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        self.ensure_open(txn)?;
        let meta = txn.meta();
        let resp =
            tokio::time::timeout(self.commit_timeout, self.router.write(shard_id, meta, req))
                .await
                .map_err(|_| StoreError::Timeout)??;
        txn.add_participant(shard_id);
        Ok(resp)
    }

    pub async fn commit(&self, txn: &Arc<TxnCtx>) -> Result<Timestamp, StoreError> {
        let participants = txn.participants();
        let result = match participants.len() {
            0 => self.commit_read_only(txn),
            1 => self.commit_single(txn, participants[0]).await,
            _ => self.commit_two_phase(txn, participants).await,
        };
        if result.is_ok() {
            self.forget(txn.id());
        }
        result
    }

    fn commit_read_only(&self, txn: &Arc<TxnCtx>) -> Result<Timestamp, StoreError> {
        let commit_ts = self.clock.now();
        txn.to_committing(commit_ts)?;
        txn.to_committed()?;
        Ok(commit_ts)
    }

    async fn commit_single(
        &self,
        txn: &Arc<TxnCtx>,
        shard_id: u64,
    ) -> Result<Timestamp, StoreError> {
        let meta = txn.meta();
        let outcome = tokio::time::timeout(
            self.commit_timeout,
            self.router.commit_single(shard_id, meta),
        )
        .await
        .map_err(|_| StoreError::Timeout)
        .and_then(|r| r);

        match outcome {
            Ok(commit_ts) => {
                self.clock.update(commit_ts);
                txn.to_committing(commit_ts)?;
                txn.to_committed()?;
                self.clock.sleep_until(commit_ts).await;
                Ok(commit_ts)
            }
            Err(e) => {
                self.finish_rollback(txn, &[shard_id]).await;
                Err(e)
            }
        }
    }

    async fn commit_two_phase(
        &self,
        txn: &Arc<TxnCtx>,
        participants: Vec<u64>,
    ) -> Result<Timestamp, StoreError> {
        let hint = self.clock.now();
        txn.to_preparing(hint)?;

        // Phase one: prepare every participant in parallel.
        let mut joins = JoinSet::new();
        for shard_id in participants.clone() {
            let router = Arc::clone(&self.router);
            let meta = txn.meta();
            let timeout = self.commit_timeout;
            joins.spawn(async move {
                let result =
                    tokio::time::timeout(timeout, router.prepare(shard_id, meta, hint))
                        .await
                        .map_err(|_| StoreError::Timeout)
                        .and_then(|r| r);
                (shard_id, result)
            });
        }

        let mut commit_ts = Timestamp::MIN;
        let mut failure: Option<StoreError> = None;
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((_, Ok(prepare_ts))) => commit_ts = commit_ts.max(prepare_ts),
                Ok((shard_id, Err(e))) => {
                    warn!(shard_id, error = %e, "prepare failed");
                    failure.get_or_insert(e);
                }
                Err(join_err) => {
                    failure.get_or_insert(StoreError::Internal(join_err.to_string()));
                }
            }
        }
        if let Some(e) = failure {
            self.finish_rollback(txn, &participants).await;
            return Err(e);
        }
        txn.to_prepared()?;
        self.clock.update(commit_ts);

        // Decision point: the committing record makes the outcome durable.
        let committing = WalCommand::Committing {
            txn_id: txn.id(),
            commit_ts,
            participants: participants.clone(),
        };
        self.home_log.append(encode_txn_record(&committing)?)?;
        txn.to_committing(commit_ts)?;

        // Phase two: commits are retried until every participant acks or
        // the zombie budget runs out; participants are idempotent on the
        // commit timestamp.
        let acked = self
            .drive_commits(txn.id(), txn.meta(), &participants, commit_ts)
            .await;
        if !acked {
            txn.to_unknown();
            error!(txn = %txn, "commit outcome unknown after zombie timeout");
            return Err(StoreError::Timeout);
        }

        let committed = WalCommand::Committed {
            txn_id: txn.id(),
            commit_ts,
        };
        self.home_log.append(encode_txn_record(&committed)?)?;
        txn.to_committed()?;
        self.clock.sleep_until(commit_ts).await;
        info!(txn = %txn, participants = participants.len(), "two-phase commit done");
        Ok(commit_ts)
    }

    async fn drive_commits(
        &self,
        txn_id: TxnId,
        meta: TxnMeta,
        participants: &[u64],
        commit_ts: Timestamp,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.zombie_timeout;
        let mut pending: Vec<u64> = participants.to_vec();
        let mut backoff = Duration::from_millis(10);
        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for shard_id in pending {
                let attempt = tokio::time::timeout(
                    self.commit_timeout,
                    self.router.commit(shard_id, meta.clone(), commit_ts),
                )
                .await
                .map_err(|_| StoreError::Timeout)
                .and_then(|r| r);
                if let Err(e) = attempt {
                    warn!(shard_id, txn = %txn_id, error = %e, "commit attempt failed");
                    still_pending.push(shard_id);
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                return false;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
        true
    }

    pub async fn rollback(&self, txn: &Arc<TxnCtx>) -> Result<(), StoreError> {
        let participants = txn.participants();
        let rollback_ts = self.clock.now();
        txn.to_rollbacking(rollback_ts)?;
        for shard_id in &participants {
            let meta = txn.meta();
            if let Err(e) = self.router.rollback(*shard_id, meta).await {
                warn!(shard_id, error = %e, "participant rollback failed");
            }
        }
        txn.to_rollbacked()?;
        self.forget(txn.id());
        Ok(())
    }

    async fn finish_rollback(&self, txn: &Arc<TxnCtx>, participants: &[u64]) {
        let rollback_ts = self.clock.now();
        if txn.to_rollbacking(rollback_ts).is_err() {
            return;
        }
        for shard_id in participants {
            let meta = txn.meta();
            if let Err(e) = self.router.rollback(*shard_id, meta).await {
                warn!(shard_id, error = %e, "participant rollback failed");
            }
        }
        let _ = txn.to_rollbacked();
        self.forget(txn.id());
    }

    /// Startup recovery: re-send commits for every committing record
    /// without a completion record, then close them out. Participants
    /// that already committed treat the retry as a no-op.
    pub async fn resolve_pending(&self, pending: Vec<PendingCommit>) -> Result<(), StoreError> {
        for decision in pending {
            info!(
                txn = %decision.txn_id,
                commit_ts = %decision.commit_ts,
                "resolving committing transaction from recovery"
            );
            let meta = TxnMeta {
                id: decision.txn_id,
                status: TxnState::Committing,
                snapshot_ts: decision.commit_ts.prev(),
                participants: decision.participants.clone(),
            };
            let acked = self
                .drive_commits(
                    decision.txn_id,
                    meta,
                    &decision.participants,
                    decision.commit_ts,
                )
                .await;
            if !acked {
                warn!(txn = %decision.txn_id, "recovery commit still unresolved");
                continue;
            }
            let committed = WalCommand::Committed {
                txn_id: decision.txn_id,
                commit_ts: decision.commit_ts,
            };
            self.home_log.append(encode_txn_record(&committed)?)?;
        }
        Ok(())
    }

    /// Flip transactions with no coordinator progress to `Unknown` and
    /// surface them; runs from the store's background sweep.
    pub fn sweep_zombies(&self) -> usize {
        let stalled: Vec<Arc<TxnCtx>> = self
            .txns
            .lock()
            .values()
            .filter(|t| {
                matches!(
                    t.state(false),
                    TxnState::Preparing | TxnState::Prepared | TxnState::Committing
                ) && Duration::from_secs(t.seconds_since_progress()) >= self.zombie_timeout
            })
            .cloned()
            .collect();
        for txn in &stalled {
            error!(txn = %txn, "zombie transaction, outcome unknown");
            txn.to_unknown();
        }
        stalled.len()
    }
}
