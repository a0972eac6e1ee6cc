use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Timestamp;
use crate::error::{EntityKind, StoreError, StoreErrorCode};
use crate::hakeeper::{CnHeartbeat, DnHeartbeat, LogHeartbeat, ScheduleCommand};
use crate::logservice::record::LogRecord;
use crate::logservice::LogService;
use crate::storage::handler::{StorageRequest, StorageResponse};
use crate::txn::service::{LocalRouter, ShardRouter};
use crate::txn::TxnMeta;

/// Frames larger than this are rejected before allocation.
const MAX_RPC_FRAME: usize = 64 * 1024 * 1024;

/// The full request union carried by the binary RPC: transactional
/// operations, log service operations, and the administrative pair used
/// by schedule-command application. One variant per wire method keeps
/// dispatch exhaustive; decode failures surface as `InvalidRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Read {
        meta: TxnMeta,
        shard_id: u64,
        op: StorageRequest,
    },
    Write {
        meta: TxnMeta,
        shard_id: u64,
        op: StorageRequest,
    },
    Prepare {
        meta: TxnMeta,
        shard_id: u64,
        prepare_ts: Timestamp,
    },
    Commit {
        meta: TxnMeta,
        shard_id: u64,
        commit_ts: Timestamp,
    },
    CommitSingle {
        meta: TxnMeta,
        shard_id: u64,
    },
    Rollback {
        meta: TxnMeta,
        shard_id: u64,
    },
    LogConnect {
        shard_id: u64,
        dn_id: u64,
    },
    LogConnectRo {
        shard_id: u64,
        dn_id: u64,
    },
    LogAppend {
        shard_id: u64,
        dn_id: u64,
        payload: Vec<u8>,
    },
    LogRead {
        shard_id: u64,
        from_lsn: u64,
        max_bytes: u64,
    },
    LogTruncate {
        shard_id: u64,
        up_to_lsn: u64,
    },
    LogGetTruncate {
        shard_id: u64,
    },
    TsoUpdate {
        count: u64,
    },
    CheckHaKeeper,
    LogHeartbeat(LogHeartbeat),
    DnHeartbeat(DnHeartbeat),
    CnHeartbeat(CnHeartbeat),
    StartReplica {
        shard_id: u64,
        replica_id: u64,
        log_shard_id: u64,
    },
    StopReplica {
        shard_id: u64,
        replica_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Unit,
    Storage(StorageResponse),
    Prepared { prepare_ts: Timestamp },
    Committed { commit_ts: Option<Timestamp> },
    Lsn(u64),
    Records(Vec<LogRecord>),
    Truncated(u64),
    Tso { first: u64 },
    Bool(bool),
    Commands(Vec<ScheduleCommand>),
    Err { kind: String, message: String },
}

impl Response {
    fn from_error(e: &StoreError) -> Self {
        Response::Err {
            kind: e.code_str().to_string(),
            message: e.to_string(),
        }
    }
}

/// Reconstruct a typed error from its wire kind tag; kinds that carry
/// structured fields fold into their message form.
pub fn wire_error(kind: &str, message: String) -> StoreError {
    match kind {
        k if k == StoreErrorCode::Timeout.as_str() => StoreError::Timeout,
        k if k == StoreErrorCode::Conflict.as_str() => StoreError::Conflict(message),
        k if k == StoreErrorCode::NotPermitted.as_str() => StoreError::NotPermitted(message),
        k if k == StoreErrorCode::InvalidRequest.as_str() => StoreError::InvalidRequest(message),
        k if k == StoreErrorCode::NotFound.as_str() => StoreError::NotFound {
            entity: EntityKind::Shard,
            name: message,
        },
        k if k == StoreErrorCode::Duplicate.as_str() => StoreError::Duplicate {
            entity: EntityKind::Row,
            name: message,
        },
        k if k == StoreErrorCode::NotLeaseHolder.as_str() => StoreError::NotLeaseHolder {
            shard_id: 0,
            holder: 0,
            requester: 0,
        },
        k if k == StoreErrorCode::LsnAlreadyTruncated.as_str() => {
            StoreError::LsnAlreadyTruncated {
                shard_id: 0,
                lsn: 0,
                truncated: 0,
            }
        }
        k if k == StoreErrorCode::TxnNotActive.as_str() => StoreError::TxnNotActive {
            state: crate::txn::TxnState::Unknown,
        },
        _ => StoreError::Internal(message),
    }
}

pub async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), StoreError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StoreError::Encode("rpc frame too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, StoreError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RPC_FRAME {
        return Err(StoreError::Decode(format!("rpc frame of {len} bytes")));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Administrative hooks the RPC server calls back into the hosting store.
pub trait AdminApi: Send + Sync {
    fn start_replica(
        &self,
        shard_id: u64,
        replica_id: u64,
        log_shard_id: u64,
    ) -> Result<(), StoreError>;
    fn stop_replica(&self, shard_id: u64, replica_id: u64) -> Result<(), StoreError>;
}

/// Binary RPC server: length-prefixed MessagePack frames over TCP, one
/// task per connection, request dispatch onto the local router, the log
/// service, and the admin hooks.
pub struct RpcServer {
    router: Arc<LocalRouter>,
    log: Arc<LogService>,
    admin: RwLock<Option<Arc<dyn AdminApi>>>,
}

impl RpcServer {
    pub fn new(router: Arc<LocalRouter>, log: Arc<LogService>) -> Arc<Self> {
        Arc::new(Self {
            router,
            log,
            admin: RwLock::new(None),
        })
    }

    pub fn set_admin(&self, admin: Arc<dyn AdminApi>) {
        *self.admin.write() = Some(admin);
    }

    /// Bind and serve until the shutdown signal fires. Returns the bound
    /// address and the serve task handle.
    pub async fn serve(
        self: &Arc<Self>,
        bind: &str,
    ) -> Result<(std::net::SocketAddr, JoinHandle<()>, oneshot::Sender<()>), StoreError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let server = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "rpc connection");
                                let server = Arc::clone(&server);
                                tokio::spawn(async move {
                                    if let Err(e) = server.serve_connection(stream).await {
                                        debug!(error = %e, "rpc connection closed");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "rpc accept failed");
                                break;
                            }
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        Ok((addr, handle, stop_tx))
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<(), StoreError> {
        while let Some(frame) = read_frame(&mut stream).await? {
            let response = match rmp_serde::from_slice::<Request>(&frame) {
                Ok(request) => match self.dispatch(request).await {
                    Ok(response) => response,
                    Err(e) => Response::from_error(&e),
                },
                Err(e) => Response::from_error(&StoreError::InvalidRequest(e.to_string())),
            };
            let bytes = rmp_serde::to_vec(&response)
                .map_err(|e| StoreError::Encode(e.to_string()))?;
            write_frame(&mut stream, &bytes).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Response, StoreError> {
        match request {
            Request::Read { meta, shard_id, op } => Ok(Response::Storage(
                self.router.read(shard_id, meta, op).await?,
            )),
            Request::Write { meta, shard_id, op } => Ok(Response::Storage(
                self.router.write(shard_id, meta, op).await?,
            )),
            Request::Prepare {
                meta,
                shard_id,
                prepare_ts,
            } => Ok(Response::Prepared {
                prepare_ts: self.router.prepare(shard_id, meta, prepare_ts).await?,
            }),
            Request::Commit {
                meta,
                shard_id,
                commit_ts,
            } => {
                self.router.commit(shard_id, meta, commit_ts).await?;
                Ok(Response::Committed { commit_ts: None })
            }
            Request::CommitSingle { meta, shard_id } => Ok(Response::Committed {
                commit_ts: Some(self.router.commit_single(shard_id, meta).await?),
            }),
            Request::Rollback { meta, shard_id } => {
                self.router.rollback(shard_id, meta).await?;
                Ok(Response::Unit)
            }
            Request::LogConnect { shard_id, dn_id } => {
                let shard = self.log.shard(shard_id)?;
                Ok(Response::Lsn(shard.connect(dn_id)?))
            }
            Request::LogConnectRo { shard_id, .. } => {
                let shard = self.log.shard(shard_id)?;
                shard.connect_ro()?;
                Ok(Response::Unit)
            }
            Request::LogAppend {
                shard_id,
                dn_id,
                payload,
            } => {
                let shard = self.log.shard(shard_id)?;
                Ok(Response::Lsn(shard.append(dn_id, payload)?))
            }
            Request::LogRead {
                shard_id,
                from_lsn,
                max_bytes,
            } => {
                let shard = self.log.shard(shard_id)?;
                Ok(Response::Records(
                    shard.read(from_lsn, max_bytes as usize),
                ))
            }
            Request::LogTruncate {
                shard_id,
                up_to_lsn,
            } => {
                let shard = self.log.shard(shard_id)?;
                shard.truncate(up_to_lsn)?;
                Ok(Response::Unit)
            }
            Request::LogGetTruncate { shard_id } => {
                let shard = self.log.shard(shard_id)?;
                Ok(Response::Truncated(shard.truncated_lsn()))
            }
            Request::TsoUpdate { count } => Ok(Response::Tso {
                first: self.log.tso_update(count)?,
            }),
            Request::CheckHaKeeper => Ok(Response::Bool(self.log.check_hakeeper())),
            Request::LogHeartbeat(hb) => Ok(Response::Commands(self.log.log_heartbeat(hb)?)),
            Request::DnHeartbeat(hb) => Ok(Response::Commands(self.log.dn_heartbeat(hb)?)),
            Request::CnHeartbeat(hb) => Ok(Response::Commands(self.log.cn_heartbeat(hb)?)),
            Request::StartReplica {
                shard_id,
                replica_id,
                log_shard_id,
            } => {
                let admin = self.admin.read().clone().ok_or_else(|| {
                    StoreError::InvalidRequest("no admin surface on this node".into())
                })?;
                admin.start_replica(shard_id, replica_id, log_shard_id)?;
                Ok(Response::Unit)
            }
            Request::StopReplica {
                shard_id,
                replica_id,
            } => {
                let admin = self.admin.read().clone().ok_or_else(|| {
                    StoreError::InvalidRequest("no admin surface on this node".into())
                })?;
                admin.stop_replica(shard_id, replica_id)?;
                Ok(Response::Unit)
            }
        }
    }
}

/// One-shot request client: connect, exchange one frame pair, close.
/// Heartbeats and schedule traffic are low-rate enough that connection
/// reuse is not worth the state.
#[derive(Debug, Clone)]
pub struct RpcClient {
    address: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn call(&self, request: &Request) -> Result<Response, StoreError> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.address).await?;
            let bytes =
                rmp_serde::to_vec(request).map_err(|e| StoreError::Encode(e.to_string()))?;
            write_frame(&mut stream, &bytes).await?;
            let frame = read_frame(&mut stream)
                .await?
                .ok_or_else(|| StoreError::Internal("rpc peer closed".into()))?;
            rmp_serde::from_slice::<Response>(&frame)
                .map_err(|e| StoreError::Decode(e.to_string()))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    fn expect_ok(response: Response) -> Result<Response, StoreError> {
        match response {
            Response::Err { kind, message } => Err(wire_error(&kind, message)),
            other => Ok(other),
        }
    }

    pub async fn request(&self, request: &Request) -> Result<Response, StoreError> {
        Self::expect_ok(self.call(request).await?)
    }
}

/// Router over remote shard replicas: shard ids resolve to peer RPC
/// addresses learned from heartbeat responses or configuration; shards
/// hosted locally short-circuit through the local router.
pub struct RemoteRouter {
    local: Arc<LocalRouter>,
    peers: RwLock<HashMap<u64, RpcClient>>,
}

impl RemoteRouter {
    pub fn new(local: Arc<LocalRouter>) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn local(&self) -> &Arc<LocalRouter> {
        &self.local
    }

    pub fn set_peer(&self, shard_id: u64, client: RpcClient) {
        self.peers.write().insert(shard_id, client);
    }

    fn peer(&self, shard_id: u64) -> Result<RpcClient, StoreError> {
        self.peers
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Shard,
                name: shard_id.to_string(),
            })
    }

    fn is_local(&self, shard_id: u64) -> bool {
        self.local.get(shard_id).is_ok()
    }
}

#[async_trait::async_trait]
impl ShardRouter for RemoteRouter {
    async fn read(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        op: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        if self.is_local(shard_id) {
            return self.local.read(shard_id, meta, op).await;
        }
        match self
            .peer(shard_id)?
            .request(&Request::Read { meta, shard_id, op })
            .await?
        {
            Response::Storage(resp) => Ok(resp),
            other => Err(StoreError::Internal(format!(
                "unexpected rpc response {other:?}"
            ))),
        }
    }

    async fn write(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        op: StorageRequest,
    ) -> Result<StorageResponse, StoreError> {
        if self.is_local(shard_id) {
            return self.local.write(shard_id, meta, op).await;
        }
        match self
            .peer(shard_id)?
            .request(&Request::Write { meta, shard_id, op })
            .await?
        {
            Response::Storage(resp) => Ok(resp),
            other => Err(StoreError::Internal(format!(
                "unexpected rpc response {other:?}"
            ))),
        }
    }

    async fn prepare(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        prepare_ts: Timestamp,
    ) -> Result<Timestamp, StoreError> {
        if self.is_local(shard_id) {
            return self.local.prepare(shard_id, meta, prepare_ts).await;
        }
        match self
            .peer(shard_id)?
            .request(&Request::Prepare {
                meta,
                shard_id,
                prepare_ts,
            })
            .await?
        {
            Response::Prepared { prepare_ts } => Ok(prepare_ts),
            other => Err(StoreError::Internal(format!(
                "unexpected rpc response {other:?}"
            ))),
        }
    }

    async fn commit(
        &self,
        shard_id: u64,
        meta: TxnMeta,
        commit_ts: Timestamp,
    ) -> Result<(), StoreError> {
        if self.is_local(shard_id) {
            return self.local.commit(shard_id, meta, commit_ts).await;
        }
        self.peer(shard_id)?
            .request(&Request::Commit {
                meta,
                shard_id,
                commit_ts,
            })
            .await?;
        Ok(())
    }

    async fn commit_single(&self, shard_id: u64, meta: TxnMeta) -> Result<Timestamp, StoreError> {
        if self.is_local(shard_id) {
            return self.local.commit_single(shard_id, meta).await;
        }
        match self
            .peer(shard_id)?
            .request(&Request::CommitSingle { meta, shard_id })
            .await?
        {
            Response::Committed {
                commit_ts: Some(ts),
            } => Ok(ts),
            other => Err(StoreError::Internal(format!(
                "unexpected rpc response {other:?}"
            ))),
        }
    }

    async fn rollback(&self, shard_id: u64, meta: TxnMeta) -> Result<(), StoreError> {
        if self.is_local(shard_id) {
            return self.local.rollback(shard_id, meta).await;
        }
        self.peer(shard_id)?
            .request(&Request::Rollback { meta, shard_id })
            .await?;
        Ok(())
    }
}
