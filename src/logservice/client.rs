use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::logservice::record::LogRecord;
use crate::logservice::{LogService, LogShard};

/// Append client for one transactional shard's WAL: holds the DN identity
/// under which the lease was taken and funnels all appends through it.
pub struct LogClient {
    shard: Arc<LogShard>,
    dn_id: u64,
}

impl LogClient {
    /// Attach to `log_shard_id` and take the append lease for `dn_id`.
    pub fn connect(
        service: &Arc<LogService>,
        log_shard_id: u64,
        dn_id: u64,
    ) -> Result<Self, StoreError> {
        let shard = service.shard(log_shard_id)?;
        let lease_lsn = shard.connect(dn_id)?;
        debug!(log_shard_id, dn_id, lease_lsn, "log client connected");
        Ok(Self { shard, dn_id })
    }

    /// Read-only attach; appends through this client will be fenced off
    /// unless `dn_id` already holds the lease.
    pub fn connect_read_only(
        service: &Arc<LogService>,
        log_shard_id: u64,
        dn_id: u64,
    ) -> Result<Self, StoreError> {
        let shard = service.shard(log_shard_id)?;
        shard.connect_ro()?;
        Ok(Self { shard, dn_id })
    }

    pub fn dn_id(&self) -> u64 {
        self.dn_id
    }

    pub fn shard_id(&self) -> u64 {
        self.shard.shard_id
    }

    pub fn append(&self, payload: Vec<u8>) -> Result<u64, StoreError> {
        self.shard.append(self.dn_id, payload)
    }

    pub fn read(&self, from_lsn: u64, max_bytes: usize) -> Vec<LogRecord> {
        self.shard.read(from_lsn, max_bytes)
    }

    pub fn truncate(&self, up_to_lsn: u64) -> Result<(), StoreError> {
        self.shard.truncate(up_to_lsn)
    }

    pub fn truncated_lsn(&self) -> u64 {
        self.shard.truncated_lsn()
    }

    pub fn last_lsn(&self) -> u64 {
        self.shard.last_lsn()
    }
}
