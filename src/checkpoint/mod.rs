pub mod loader;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::writer::{encode_checkpoint, CheckpointSnapshot};
use crate::clock::{HybridClock, Timestamp};
use crate::error::{StoreError, StoreErrorCode};
use crate::logservice::client::LogClient;
use crate::storage::handler::MemHandler;

/// First payload byte of a checkpoint user record.
pub const CKP_DISCRIMINATOR: u8 = 0xC0;

/// One committed checkpoint: newly covers `(previous.max_ts, max_ts]`,
/// stored at `lsn` in the catalog's log shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub lsn: u64,
}

/// Periodically snapshots committed state into the WAL and advances the
/// log truncation point. Snapshots are cumulative, so the latest one
/// alone restores everything at or below its upper bound. One checkpoint
/// runs at a time; the in-flight lock doubles as the `wait_done` handle.
pub struct Checkpointer {
    handler: Arc<MemHandler>,
    client: Arc<LogClient>,
    clock: Arc<HybridClock>,
    entries: Mutex<Vec<CheckpointEntry>>,
    inflight: Mutex<()>,
    interval: Duration,
    wal_threshold: u64,
}

impl Checkpointer {
    pub fn new(
        handler: Arc<MemHandler>,
        client: Arc<LogClient>,
        clock: Arc<HybridClock>,
        interval: Duration,
        wal_threshold: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            client,
            clock,
            entries: Mutex::new(Vec::new()),
            inflight: Mutex::new(()),
            interval,
            wal_threshold,
        })
    }

    pub fn last(&self) -> Option<CheckpointEntry> {
        self.entries.lock().last().copied()
    }

    /// Seed the checkpoint list from replay.
    pub fn install(&self, entry: CheckpointEntry) {
        let mut entries = self.entries.lock();
        entries.push(entry);
        entries.sort_by_key(|e| e.max_ts);
    }

    /// Block until no checkpoint append is in flight.
    pub fn wait_done(&self) {
        drop(self.inflight.lock());
    }

    fn due(&self) -> bool {
        let wal_len = self
            .client
            .last_lsn()
            .saturating_sub(self.client.truncated_lsn());
        if wal_len > self.wal_threshold {
            return true;
        }
        let last_max = self.last().map(|e| e.max_ts).unwrap_or(Timestamp::MIN);
        let committed = self.clock.peek();
        committed.physical.saturating_sub(last_max.physical) >= self.interval.as_nanos() as u64
    }

    /// Run the checkpoint policy once; emits a checkpoint (possibly
    /// empty) when due, otherwise does nothing.
    pub fn maybe_run(&self) -> Result<Option<CheckpointEntry>, StoreError> {
        if !self.due() {
            return Ok(None);
        }
        self.run_once()
    }

    /// Take a checkpoint now. The new window's lower bound is the
    /// previous checkpoint's upper bound; a window that has not advanced
    /// is a no-op.
    pub fn run_once(&self) -> Result<Option<CheckpointEntry>, StoreError> {
        let _guard = self.inflight.lock();

        let prev_max = self
            .last()
            .map(|e| e.max_ts)
            .unwrap_or_else(|| Timestamp::MIN.next());
        let max_ts = self.clock.now();
        if max_ts <= prev_max {
            return Ok(None);
        }

        let catalog = self.handler.catalog();
        let nodes = catalog.collect_committed(Timestamp::MIN, max_ts);
        let mut tuples = Vec::new();
        for table in self.handler.tuple_tables() {
            let mutations = table.committed_mutations(max_ts);
            if !mutations.is_empty() {
                tuples.push((table.table_id, mutations));
            }
        }

        let node_count = nodes.len();
        let snapshot = CheckpointSnapshot {
            min_ts: prev_max.next(),
            max_ts,
            nodes,
            tuples,
        };
        let image = encode_checkpoint(&snapshot)?;
        let mut payload = Vec::with_capacity(1 + image.len());
        payload.push(CKP_DISCRIMINATOR);
        payload.extend_from_slice(&image);

        let lsn = self.client.append(payload)?;
        let entry = CheckpointEntry {
            min_ts: snapshot.min_ts,
            max_ts,
            lsn,
        };
        self.entries.lock().push(entry);
        info!(
            lsn,
            node_count,
            tuple_tables = snapshot.tuples.len(),
            max_ts = %max_ts,
            "checkpoint committed"
        );

        // Everything strictly before the checkpoint record is covered by
        // the snapshot and can leave the log.
        if lsn > 1 {
            match self.client.truncate(lsn - 1) {
                Ok(()) => {}
                Err(e) if e.code() == StoreErrorCode::LsnAlreadyTruncated => {}
                Err(e) => warn!(error = %e, "checkpoint truncation failed"),
            }
        }

        let swept = catalog.gc(prev_max);
        if swept > 0 {
            debug!(swept, "checkpoint gc");
        }
        Ok(Some(entry))
    }

    /// Background loop: wake periodically, run the policy, stop on
    /// shutdown signal.
    pub fn spawn(self: &Arc<Self>) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let this = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll = Duration::from_millis(200).min(this.interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.maybe_run() {
                            warn!(error = %e, "checkpoint pass failed");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        (handle, stop_tx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{CheckpointEntry, Checkpointer, CKP_DISCRIMINATOR};
    use crate::catalog::CatalogTree;
    use crate::checkpoint::loader::decode_checkpoint;
    use crate::clock::{HybridClock, Timestamp};
    use crate::logservice::client::LogClient;
    use crate::logservice::record::RecordType;
    use crate::logservice::LogService;
    use crate::storage::handler::MemHandler;
    use crate::txn::{TxnCtx, TxnId};

    fn fixture() -> (TempDir, Arc<MemHandler>, Arc<LogClient>, Arc<HybridClock>) {
        let dir = TempDir::new().expect("tempdir");
        let service = LogService::open(dir.path()).expect("service");
        let client = Arc::new(LogClient::connect(&service, 1, 7).expect("client"));
        let handler = Arc::new(MemHandler::new(Arc::new(CatalogTree::new()), 4096));
        (dir, handler, client, Arc::new(HybridClock::new()))
    }

    fn commit_database(handler: &Arc<MemHandler>, clock: &HybridClock, name: &str) {
        let start = clock.now();
        let txn = Arc::new(TxnCtx::new(TxnId::generate(), start, Vec::new()));
        let db = handler
            .catalog()
            .create_database(&txn, 0, name)
            .expect("create");
        let commit_ts = clock.now();
        txn.to_committing(commit_ts).expect("committing");
        db.chain
            .write()
            .commit(txn.start_ts(), commit_ts)
            .expect("chain commit");
        txn.to_committed().expect("committed");
    }

    #[test]
    fn checkpoint_collects_committed_state_and_truncates() {
        let (_dir, handler, client, clock) = fixture();
        let checkpointer = Checkpointer::new(
            Arc::clone(&handler),
            Arc::clone(&client),
            Arc::clone(&clock),
            Duration::from_secs(3600),
            u64::MAX,
        );

        commit_database(&handler, &clock, "a");
        commit_database(&handler, &clock, "b");
        // Pad the log so truncation has something to remove.
        for _ in 0..5 {
            client.append(vec![0x01, 0xAA]).expect("pad");
        }

        let entry = checkpointer
            .run_once()
            .expect("checkpoint")
            .expect("entry emitted");
        assert_eq!(client.truncated_lsn(), entry.lsn - 1);

        let records = client.read(1, usize::MAX);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rec_type, RecordType::UserRecord);
        assert_eq!(records[0].payload[0], CKP_DISCRIMINATOR);

        let snapshot = decode_checkpoint(&records[0].payload[1..]).expect("decode");
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.max_ts, entry.max_ts);
    }

    #[test]
    fn snapshots_stay_cumulative_across_checkpoints() {
        let (_dir, handler, client, clock) = fixture();
        let checkpointer = Checkpointer::new(
            Arc::clone(&handler),
            Arc::clone(&client),
            Arc::clone(&clock),
            Duration::from_secs(3600),
            u64::MAX,
        );

        commit_database(&handler, &clock, "a");
        checkpointer.run_once().expect("first").expect("entry");

        commit_database(&handler, &clock, "b");
        let second = checkpointer.run_once().expect("second").expect("entry");

        // The latest snapshot alone carries both databases.
        let records = client.read(second.lsn, usize::MAX);
        let snapshot = decode_checkpoint(&records[0].payload[1..]).expect("decode");
        assert_eq!(snapshot.nodes.len(), 2);
    }

    #[test]
    fn unchanged_window_is_a_noop() {
        let (_dir, handler, client, clock) = fixture();
        let checkpointer = Checkpointer::new(
            handler,
            client,
            Arc::clone(&clock),
            Duration::from_secs(3600),
            u64::MAX,
        );
        checkpointer.install(CheckpointEntry {
            min_ts: Timestamp::MIN.next(),
            max_ts: Timestamp::MAX.prev(),
            lsn: 1,
        });
        assert!(checkpointer.run_once().expect("run").is_none());
    }

    #[test]
    fn idle_interval_emits_empty_checkpoint() {
        let (_dir, handler, client, clock) = fixture();
        let checkpointer = Checkpointer::new(
            handler,
            Arc::clone(&client),
            Arc::clone(&clock),
            Duration::from_nanos(1),
            u64::MAX,
        );
        clock.now();

        let entry = checkpointer
            .maybe_run()
            .expect("run")
            .expect("empty checkpoint");
        let records = client.read(entry.lsn, usize::MAX);
        let snapshot = decode_checkpoint(&records[0].payload[1..]).expect("decode");
        assert!(snapshot.nodes.is_empty());

        // Truncation point advanced to just below the checkpoint record.
        assert_eq!(client.truncated_lsn(), entry.lsn.saturating_sub(1));
    }
}
