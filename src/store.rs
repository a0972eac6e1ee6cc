use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::CatalogTree;
use crate::checkpoint::Checkpointer;
use crate::clock::{HybridClock, Timestamp};
use crate::config::StoreConfig;
use crate::error::{EntityKind, StoreError};
use crate::hakeeper::{DnHeartbeat, DnShardDesc, HaKeeper, LogShardInfo, ScheduleCommand};
use crate::logservice::client::LogClient;
use crate::logservice::{LogService, HAKEEPER_SHARD_ID};
use crate::recovery::{NoopObserver, PendingCommit, Replayer};
use crate::rpc::{AdminApi, Request, Response, RpcClient, RpcServer};
use crate::storage::catalog_handler::CatalogHandler;
use crate::storage::handler::{MemHandler, StorageRequest, StorageResponse};
use crate::txn::coordinator::TxnService;
use crate::txn::service::{LocalRouter, Replica};
use crate::txn::TxnCtx;

/// Stable numeric identity under which a store's log clients take leases.
fn dn_numeric_id(uuid: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in uuid.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash | 1
}

struct BackgroundTask {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

/// Node-level container: hosts shard replicas, the log service face, the
/// transaction service, the heartbeat loop, and per-replica checkpoint
/// loops. Replica lifecycle is driven by HAKeeper schedule commands and
/// is idempotent per shard id.
pub struct Store {
    uuid: String,
    config: StoreConfig,
    clock: Arc<HybridClock>,
    log: Arc<LogService>,
    local_router: Arc<LocalRouter>,
    router: Arc<crate::rpc::RemoteRouter>,
    txn_service: RwLock<Option<Arc<TxnService>>>,
    replica_meta: RwLock<HashMap<u64, DnShardDesc>>,
    checkpointers: Mutex<HashMap<u64, Arc<Checkpointer>>>,
    pending_commits: Mutex<Vec<PendingCommit>>,
    hakeeper_client: RwLock<Option<RpcClient>>,
    tasks: Mutex<Vec<BackgroundTask>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl Store {
    pub fn open(uuid: impl Into<String>, config: StoreConfig) -> Result<Arc<Self>, StoreError> {
        config.validate()?;
        let uuid = uuid.into();
        let log = LogService::open(config.data_dir.join("log"))?;
        let local_router = LocalRouter::new();
        let router = crate::rpc::RemoteRouter::new(Arc::clone(&local_router));
        info!(store = %uuid, "store opened");
        Ok(Arc::new(Self {
            uuid,
            config,
            clock: Arc::new(HybridClock::new()),
            log,
            local_router,
            router,
            txn_service: RwLock::new(None),
            replica_meta: RwLock::new(HashMap::new()),
            checkpointers: Mutex::new(HashMap::new()),
            pending_commits: Mutex::new(Vec::new()),
            hakeeper_client: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn log_service(&self) -> &Arc<LogService> {
        &self.log
    }

    pub fn dn_id(&self) -> u64 {
        dn_numeric_id(&self.uuid)
    }

    /// Host the HAKeeper state machine on this store's log service.
    pub fn promote_to_hakeeper(&self) -> Arc<HaKeeper> {
        let keeper = Arc::new(HaKeeper::new(self.config.store_expiry_ticks));
        self.log.attach_hakeeper(Arc::clone(&keeper));
        // The distinguished shard exists as soon as its host does.
        let _ = self.log.shard(HAKEEPER_SHARD_ID);
        keeper
    }

    pub fn set_hakeeper_address(&self, address: impl Into<String>) {
        *self.hakeeper_client.write() = Some(RpcClient::new(
            address,
            Duration::from_millis(self.config.rpc_timeout_ms),
        ));
    }

    pub fn router(&self) -> &Arc<crate::rpc::RemoteRouter> {
        &self.router
    }

    pub fn replica(&self, shard_id: u64) -> Result<Arc<Replica>, StoreError> {
        self.local_router.get(shard_id)
    }

    /// Create and start a replica for `(shard_id, replica_id)`. The
    /// shard's WAL is replayed into a fresh catalog and tuple store
    /// before the replica goes live. Idempotent on `shard_id`.
    pub fn create_replica(
        &self,
        shard_id: u64,
        replica_id: u64,
    ) -> Result<Arc<Replica>, StoreError> {
        if let Ok(existing) = self.local_router.get(shard_id) {
            return Ok(existing);
        }
        if shard_id == HAKEEPER_SHARD_ID {
            return Err(StoreError::InvalidRequest(
                "shard 0 is reserved for the hakeeper".into(),
            ));
        }

        let catalog = Arc::new(CatalogTree::new());
        let mem = Arc::new(MemHandler::new(
            catalog,
            self.config.max_read_batch_rows,
        ));
        // One log shard per data shard.
        let client = Arc::new(LogClient::connect(&self.log, shard_id, self.dn_id())?);

        let records = client.read(client.truncated_lsn() + 1, usize::MAX);
        let outcome = Replayer::new(&mem, &NoopObserver).replay(&records)?;
        if !outcome.unresolved_committing.is_empty() {
            self.pending_commits
                .lock()
                .extend(outcome.unresolved_committing.clone());
        }
        self.clock.update(outcome.max_commit_ts);
        info!(
            shard_id,
            replica_id,
            records = outcome.applied_records,
            stale = outcome.stale_nodes,
            "replica replayed"
        );

        let handler = Arc::new(CatalogHandler::new(Arc::clone(&mem)));
        let replica = Replica::new(
            shard_id,
            replica_id,
            handler,
            Arc::clone(&self.clock),
            Arc::clone(&client),
        );
        self.local_router.register(Arc::clone(&replica));
        self.replica_meta.write().insert(
            shard_id,
            DnShardDesc {
                shard_id,
                replica_id,
            },
        );

        let checkpointer = Checkpointer::new(
            mem,
            Arc::clone(&client),
            Arc::clone(&self.clock),
            Duration::from_millis(self.config.checkpoint_interval_ms),
            self.config.checkpoint_wal_threshold,
        );
        if let Some(entry) = outcome.checkpoint {
            checkpointer.install(entry);
        }
        if self.started.load(Ordering::Acquire) {
            let (handle, stop) = checkpointer.spawn();
            self.tasks.lock().push(BackgroundTask { handle, stop });
        }
        self.checkpointers
            .lock()
            .insert(shard_id, Arc::clone(&checkpointer));

        // The first replica's log shard doubles as the coordinator's
        // home shard for committing/committed records.
        if self.txn_service.read().is_none() {
            let service = TxnService::new(
                Arc::clone(&self.clock),
                self.router.clone() as Arc<dyn crate::txn::service::ShardRouter>,
                client,
                Duration::from_millis(self.config.commit_timeout_ms),
                Duration::from_millis(self.config.zombie_timeout_ms),
            );
            *self.txn_service.write() = Some(service);
        }
        Ok(replica)
    }

    /// Stop and drop a replica. Idempotent on `shard_id`.
    pub fn remove_replica(&self, shard_id: u64, _replica_id: u64) -> Result<(), StoreError> {
        self.local_router.remove(shard_id);
        self.replica_meta.write().remove(&shard_id);
        self.checkpointers.lock().remove(&shard_id);
        info!(shard_id, "replica removed");
        Ok(())
    }

    pub fn checkpointer(&self, shard_id: u64) -> Option<Arc<Checkpointer>> {
        self.checkpointers.lock().get(&shard_id).cloned()
    }

    pub fn txn_service(&self) -> Result<Arc<TxnService>, StoreError> {
        self.txn_service
            .read()
            .clone()
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Replica,
                name: "no replica hosted yet".into(),
            })
    }

    // ---- client-facing transactional surface ----

    pub fn begin(&self, snapshot_ts: Option<Timestamp>) -> Result<Arc<TxnCtx>, StoreError> {
        Ok(self.txn_service()?.begin(snapshot_ts))
    }

    pub async fn read(
        &self,
        txn: &Arc<TxnCtx>,
        shard_id: u64,
        op: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        self.txn_service()?.read(txn, shard_id, op).await
    }

    pub async fn write(
        &self,
        txn: &Arc<TxnCtx>,
        shard_id: u64,
        op: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        self.txn_service()?.write(txn, shard_id, op).await
    }

    pub async fn commit(&self, txn: &Arc<TxnCtx>) -> Result<Timestamp, StoreError> {
        self.txn_service()?.commit(txn).await
    }

    pub async fn rollback(&self, txn: &Arc<TxnCtx>) -> Result<(), StoreError> {
        self.txn_service()?.rollback(txn).await
    }

    /// Re-drive 2PC commits recovered from the WAL (committing records
    /// without completion records).
    pub async fn resolve_recovered(&self) -> Result<(), StoreError> {
        let pending: Vec<PendingCommit> = std::mem::take(&mut *self.pending_commits.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.txn_service()?.resolve_pending(pending).await
    }

    /// Apply one schedule command. Commands are idempotent: applying the
    /// same command twice leaves the same state behind.
    pub fn apply_command(&self, command: &ScheduleCommand) -> Result<(), StoreError> {
        info!(command = %command, "applying schedule command");
        match command {
            ScheduleCommand::AddReplica { replica, .. }
            | ScheduleCommand::StartReplica { replica, .. } => self
                .create_replica(replica.shard_id, replica.replica_id)
                .map(|_| ()),
            ScheduleCommand::RemoveReplica { replica, .. }
            | ScheduleCommand::StopReplica { replica, .. }
            | ScheduleCommand::KillZombie { replica, .. } => {
                self.remove_replica(replica.shard_id, replica.replica_id)
            }
            ScheduleCommand::ShutdownStore { .. } => {
                self.shutting_down.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    fn heartbeat_payload(&self) -> DnHeartbeat {
        DnHeartbeat {
            uuid: self.uuid.clone(),
            service_address: self.config.service_address.clone(),
            shards: self.replica_meta.read().values().cloned().collect(),
        }
    }

    /// One heartbeat round: report membership, apply whatever commands
    /// come back. Failed replica starts are retried on the next round by
    /// construction, since commands re-derive until state converges.
    pub async fn heartbeat_once(&self) -> Result<usize, StoreError> {
        let hb = self.heartbeat_payload();
        let commands: Vec<ScheduleCommand> = if self.log.check_hakeeper() {
            self.log.dn_heartbeat(hb)?
        } else if let Some(client) = {
            let client = self.hakeeper_client.read().clone();
            client
        } {
            match client.request(&Request::DnHeartbeat(hb)).await? {
                Response::Commands(commands) => commands,
                other => {
                    return Err(StoreError::Internal(format!(
                        "unexpected heartbeat response {other:?}"
                    )))
                }
            }
        } else {
            Vec::new()
        };

        let applied = commands.len();
        for command in &commands {
            if let Err(e) = self.apply_command(command) {
                warn!(command = %command, error = %e, "schedule command failed");
            }
        }
        Ok(applied)
    }

    /// Local answer to shard metadata queries, fed by the HAKeeper view
    /// when this store hosts it.
    pub fn get_shard_info(&self, shard_id: u64) -> Option<LogShardInfo> {
        self.log.hakeeper().and_then(|k| k.shard_info(shard_id))
    }

    /// Start background duties: heartbeat loop (plus HAKeeper ticking
    /// when hosted here), zombie sweep, per-replica checkpoint loops,
    /// and the RPC server.
    pub async fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr, StoreError> {
        self.started.store(true, Ordering::Release);

        let server = RpcServer::new(Arc::clone(&self.local_router), Arc::clone(&self.log));
        server.set_admin(Arc::clone(self) as Arc<dyn AdminApi>);
        let (addr, server_handle, server_stop) = server.serve(&self.config.service_address).await?;
        self.tasks.lock().push(BackgroundTask {
            handle: server_handle,
            stop: server_stop,
        });

        // Checkpoint loops for replicas created before start.
        for checkpointer in self.checkpointers.lock().values() {
            let (handle, stop) = checkpointer.spawn();
            self.tasks.lock().push(BackgroundTask { handle, stop });
        }

        let heartbeat = {
            let store = Arc::clone(self);
            let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
            let period = Duration::from_millis(store.config.heartbeat_interval_ms);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if store.shutting_down.load(Ordering::Acquire) {
                                break;
                            }
                            if let Some(keeper) = store.log.hakeeper() {
                                keeper.tick();
                            }
                            if let Err(e) = store.heartbeat_once().await {
                                warn!(error = %e, "heartbeat failed");
                            }
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            });
            BackgroundTask {
                handle,
                stop: stop_tx,
            }
        };
        self.tasks.lock().push(heartbeat);

        let sweep = {
            let store = Arc::clone(self);
            let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
            let period = Duration::from_millis((store.config.zombie_timeout_ms / 4).max(100));
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Ok(service) = store.txn_service() {
                                service.sweep_zombies();
                            }
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            });
            BackgroundTask {
                handle,
                stop: stop_tx,
            }
        };
        self.tasks.lock().push(sweep);

        self.resolve_recovered().await.ok();
        info!(store = %self.uuid, %addr, "store started");
        Ok(addr)
    }

    /// Ordered shutdown: stop background tasks (heartbeat first), then
    /// close each replica in parallel. Log appends are synchronous, so
    /// stopping the tasks also drains in-flight WAL writes.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);
        let tasks: Vec<BackgroundTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            // A task that already exited dropped its receiver; ignore.
            let _ = task.stop.send(());
            let _ = task.handle.await;
        }
        let mut closing = tokio::task::JoinSet::new();
        for shard_id in self.local_router.shard_ids() {
            let store = Arc::clone(self);
            closing.spawn(async move {
                let _ = store.remove_replica(shard_id, 0);
            });
        }
        while closing.join_next().await.is_some() {}
        info!(store = %self.uuid, "store shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl AdminApi for Store {
    fn start_replica(
        &self,
        shard_id: u64,
        replica_id: u64,
        _log_shard_id: u64,
    ) -> Result<(), StoreError> {
        self.create_replica(shard_id, replica_id).map(|_| ())
    }

    fn stop_replica(&self, shard_id: u64, replica_id: u64) -> Result<(), StoreError> {
        self.remove_replica(shard_id, replica_id)
    }
}
