pub mod coordinator;
pub mod service;

use std::collections::BTreeSet;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Timestamp, UNCOMMIT_TS};
use crate::error::StoreError;

/// Opaque unique transaction identifier; printed as a UUID.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub [u8; 16]);

impl TxnId {
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Rollbacking,
    Rollbacked,
    Unknown,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Rollbacked | TxnState::Unknown
        )
    }
}

/// Wire form of a transaction attached to every transactional RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMeta {
    pub id: TxnId,
    pub status: TxnState,
    pub snapshot_ts: Timestamp,
    pub participants: Vec<u64>,
}

#[derive(Debug)]
struct TxnInner {
    prepare_ts: Timestamp,
    commit_ts: Timestamp,
    state: TxnState,
    participants: BTreeSet<u64>,
    last_progress: Instant,
}

/// Per-transaction state machine. The start timestamp is fixed at begin;
/// everything else moves under one mutex, with a condition variable
/// broadcast once on the terminal transition so snapshot readers blocked
/// on a committing writer wake exactly once.
#[derive(Debug)]
pub struct TxnCtx {
    id: TxnId,
    start_ts: Timestamp,
    info: Vec<u8>,
    inner: Mutex<TxnInner>,
    done: Condvar,
}

impl TxnCtx {
    pub fn new(id: TxnId, start_ts: Timestamp, info: Vec<u8>) -> Self {
        Self {
            id,
            start_ts,
            info,
            inner: Mutex::new(TxnInner {
                prepare_ts: UNCOMMIT_TS,
                commit_ts: UNCOMMIT_TS,
                state: TxnState::Active,
                participants: BTreeSet::new(),
                last_progress: Instant::now(),
            }),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }

    pub fn commit_ts(&self) -> Timestamp {
        self.inner.lock().commit_ts
    }

    pub fn prepare_ts(&self) -> Timestamp {
        self.inner.lock().prepare_ts
    }

    pub fn add_participant(&self, shard_id: u64) {
        self.inner.lock().participants.insert(shard_id);
    }

    pub fn participants(&self) -> Vec<u64> {
        self.inner.lock().participants.iter().copied().collect()
    }

    pub fn seconds_since_progress(&self) -> u64 {
        self.inner.lock().last_progress.elapsed().as_secs()
    }

    pub fn meta(&self) -> TxnMeta {
        let inner = self.inner.lock();
        TxnMeta {
            id: self.id,
            status: inner.state,
            snapshot_ts: self.start_ts,
            participants: inner.participants.iter().copied().collect(),
        }
    }

    /// Current state. With `wait` set, blocks while the transaction is
    /// `Committing`: a snapshot reader that raced a commit must not decide
    /// visibility until the end timestamp is final.
    pub fn state(&self, wait: bool) -> TxnState {
        let mut inner = self.inner.lock();
        if !wait {
            return inner.state;
        }
        while inner.state == TxnState::Committing {
            self.done.wait(&mut inner);
        }
        inner.state
    }

    // Commit timestamps arrive over the wire; a stale or hostile peer
    // must not be able to take the store down with one.
    fn check_commit_ts(&self, ts: Timestamp) -> Result<(), StoreError> {
        if ts <= self.start_ts {
            return Err(StoreError::InvalidRequest(format!(
                "txn {}: commit ts {} not after start ts {}",
                self.id, ts, self.start_ts
            )));
        }
        Ok(())
    }

    pub fn to_preparing(&self, ts: Timestamp) -> Result<(), StoreError> {
        self.check_commit_ts(ts)?;
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(StoreError::TxnNotActive { state: inner.state });
        }
        inner.prepare_ts = ts;
        inner.commit_ts = ts;
        inner.state = TxnState::Preparing;
        inner.last_progress = Instant::now();
        Ok(())
    }

    pub fn to_prepared(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Preparing {
            return Err(StoreError::TxnNotActive { state: inner.state });
        }
        inner.state = TxnState::Prepared;
        inner.last_progress = Instant::now();
        Ok(())
    }

    pub fn to_committing(&self, ts: Timestamp) -> Result<(), StoreError> {
        self.check_commit_ts(ts)?;
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active | TxnState::Prepared => {}
            state => return Err(StoreError::TxnNotActive { state }),
        }
        inner.prepare_ts = ts;
        inner.commit_ts = ts;
        inner.state = TxnState::Committing;
        inner.last_progress = Instant::now();
        Ok(())
    }

    pub fn to_committed(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Committing {
            return Err(StoreError::TxnNotCommitting { state: inner.state });
        }
        inner.state = TxnState::Committed;
        inner.last_progress = Instant::now();
        drop(inner);
        self.done.notify_all();
        Ok(())
    }

    pub fn to_rollbacking(&self, ts: Timestamp) -> Result<(), StoreError> {
        self.check_commit_ts(ts)?;
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Active | TxnState::Preparing | TxnState::Prepared => {}
            state => return Err(StoreError::TxnCannotRollback { state }),
        }
        inner.prepare_ts = ts;
        inner.commit_ts = ts;
        inner.state = TxnState::Rollbacking;
        inner.last_progress = Instant::now();
        Ok(())
    }

    pub fn to_rollbacked(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Rollbacking {
            return Err(StoreError::TxnNotRollbacking { state: inner.state });
        }
        inner.state = TxnState::Rollbacked;
        inner.last_progress = Instant::now();
        drop(inner);
        self.done.notify_all();
        Ok(())
    }

    /// Terminal state for transactions whose coordinator lost contact.
    pub fn to_unknown(&self) {
        let mut inner = self.inner.lock();
        inner.state = TxnState::Unknown;
        drop(inner);
        self.done.notify_all();
    }
}

impl std::fmt::Display for TxnCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "txn[{} {}->{} {:?}]",
            self.id, self.start_ts, inner.commit_ts, inner.state
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{TxnCtx, TxnId, TxnState};
    use crate::clock::Timestamp;
    use crate::error::StoreErrorCode;

    fn ctx() -> TxnCtx {
        TxnCtx::new(TxnId::generate(), Timestamp::new(10, 0), Vec::new())
    }

    #[test]
    fn fast_path_commit_transitions() {
        let txn = ctx();
        txn.to_committing(Timestamp::new(12, 0)).expect("committing");
        txn.to_committed().expect("committed");
        assert_eq!(txn.state(false), TxnState::Committed);
        assert_eq!(txn.commit_ts(), Timestamp::new(12, 0));
    }

    #[test]
    fn two_phase_transitions() {
        let txn = ctx();
        txn.to_preparing(Timestamp::new(11, 0)).expect("preparing");
        txn.to_prepared().expect("prepared");
        txn.to_committing(Timestamp::new(13, 0)).expect("committing");
        txn.to_committed().expect("committed");
        assert_eq!(txn.state(false), TxnState::Committed);
    }

    #[test]
    fn illegal_transitions_return_taxonomy_errors() {
        let txn = ctx();
        assert_eq!(
            txn.to_committed().unwrap_err().code(),
            StoreErrorCode::TxnNotCommitting
        );
        assert_eq!(
            txn.to_rollbacked().unwrap_err().code(),
            StoreErrorCode::TxnNotRollbacking
        );

        txn.to_committing(Timestamp::new(12, 0)).expect("committing");
        assert_eq!(
            txn.to_preparing(Timestamp::new(13, 0)).unwrap_err().code(),
            StoreErrorCode::TxnNotActive
        );
        assert_eq!(
            txn.to_rollbacking(Timestamp::new(13, 0)).unwrap_err().code(),
            StoreErrorCode::TxnCannotRollback
        );
    }

    #[test]
    fn rollback_allowed_from_prepared() {
        let txn = ctx();
        txn.to_preparing(Timestamp::new(11, 0)).expect("preparing");
        txn.to_prepared().expect("prepared");
        txn.to_rollbacking(Timestamp::new(12, 0)).expect("rollbacking");
        txn.to_rollbacked().expect("rollbacked");
        assert_eq!(txn.state(false), TxnState::Rollbacked);
    }

    #[test]
    fn commit_ts_at_or_below_start_ts_is_rejected() {
        let txn = ctx();
        let err = txn.to_committing(Timestamp::new(9, 0)).unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::InvalidRequest);
        // The transaction is untouched and still usable.
        assert_eq!(txn.state(false), TxnState::Active);
        txn.to_committing(Timestamp::new(12, 0)).expect("committing");

        let txn = ctx();
        let err = txn.to_preparing(txn.start_ts()).unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::InvalidRequest);
        let err = txn.to_rollbacking(Timestamp::new(9, 0)).unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::InvalidRequest);
    }

    #[test]
    fn waiting_reader_unblocks_on_commit() {
        let txn = Arc::new(ctx());
        txn.to_committing(Timestamp::new(15, 0)).expect("committing");

        let waiter = {
            let txn = Arc::clone(&txn);
            std::thread::spawn(move || txn.state(true))
        };
        std::thread::sleep(Duration::from_millis(50));
        txn.to_committed().expect("committed");
        assert_eq!(waiter.join().expect("join"), TxnState::Committed);
    }

    #[test]
    fn participants_are_ordered_and_deduplicated() {
        let txn = ctx();
        txn.add_participant(3);
        txn.add_participant(1);
        txn.add_participant(3);
        assert_eq!(txn.participants(), vec![1, 3]);
        assert_eq!(txn.meta().participants, vec![1, 3]);
    }
}
