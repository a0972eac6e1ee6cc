use std::path::PathBuf;

use crate::error::StoreError;

/// Runtime configuration for one store process.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding per-shard log segments and checkpoint files.
    pub data_dir: PathBuf,
    /// Listen address advertised in heartbeats.
    pub service_address: String,
    /// Checkpoint when committed time advances this far past the last
    /// checkpoint upper bound.
    pub checkpoint_interval_ms: u64,
    /// Checkpoint when the catalog WAL holds more records than this,
    /// regardless of elapsed time.
    pub checkpoint_wal_threshold: u64,
    pub heartbeat_interval_ms: u64,
    /// HAKeeper logical tick period.
    pub tick_interval_ms: u64,
    /// Heartbeat-less ticks before the HAKeeper expires a store.
    pub store_expiry_ticks: u64,
    /// Deadline for one prepare/commit/rollback round.
    pub commit_timeout_ms: u64,
    /// Stalled-coordinator budget before a transaction is surfaced as
    /// Unknown to the operator log.
    pub zombie_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Maximum rows returned by one storage read call.
    pub max_read_batch_rows: usize,
    pub desired_log_replicas: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tidemark-data"),
            service_address: "127.0.0.1:0".to_string(),
            checkpoint_interval_ms: 60_000,
            checkpoint_wal_threshold: 10_000,
            heartbeat_interval_ms: 1_000,
            tick_interval_ms: 1_000,
            store_expiry_ticks: 10,
            commit_timeout_ms: 60_000,
            zombie_timeout_ms: 300_000,
            rpc_timeout_ms: 5_000,
            max_read_batch_rows: 4096,
            desired_log_replicas: 3,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.checkpoint_interval_ms == 0 {
            return Err(StoreError::InvalidConfig {
                message: "checkpoint_interval_ms must be positive".into(),
            });
        }
        if self.heartbeat_interval_ms == 0 || self.tick_interval_ms == 0 {
            return Err(StoreError::InvalidConfig {
                message: "heartbeat and tick intervals must be positive".into(),
            });
        }
        if self.store_expiry_ticks < 2 {
            return Err(StoreError::InvalidConfig {
                message: "store_expiry_ticks must be at least 2".into(),
            });
        }
        if self.max_read_batch_rows == 0 {
            return Err(StoreError::InvalidConfig {
                message: "max_read_batch_rows must be positive".into(),
            });
        }
        if self.desired_log_replicas == 0 {
            return Err(StoreError::InvalidConfig {
                message: "desired_log_replicas must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::StoreConfig;

    #[test]
    fn default_config_is_valid() {
        StoreConfig::default().validate().expect("default config");
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut cfg = StoreConfig::default();
        cfg.checkpoint_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StoreConfig::default();
        cfg.tick_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
