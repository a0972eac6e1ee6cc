use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::{Timestamp, UNCOMMIT_TS};
use crate::error::StoreError;
use crate::txn::{TxnCtx, TxnId, TxnState};

/// Visibility credential: who is reading and at which snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnReader {
    pub txn_id: TxnId,
    pub start_ts: Timestamp,
}

impl TxnReader {
    pub fn new(txn_id: TxnId, start_ts: Timestamp) -> Self {
        Self { txn_id, start_ts }
    }

    pub fn snapshot(start_ts: Timestamp) -> Self {
        Self {
            txn_id: TxnId([0u8; 16]),
            start_ts,
        }
    }
}

impl From<&TxnCtx> for TxnReader {
    fn from(txn: &TxnCtx) -> Self {
        Self::new(txn.id(), txn.start_ts())
    }
}

/// One version in a chain. `end_ts` is the commit timestamp once the
/// writer finalizes, `UNCOMMIT_TS` while in flight. The writer context is
/// kept only while in flight so blocked readers can wait on its state.
#[derive(Debug, Clone)]
pub struct UpdateNode<P> {
    pub start_ts: Timestamp,
    pub prepare_ts: Timestamp,
    pub end_ts: Timestamp,
    pub txn_id: TxnId,
    pub log_index: Option<u64>,
    pub deleted: bool,
    pub payload: P,
    pub txn: Option<Arc<TxnCtx>>,
}

impl<P> UpdateNode<P> {
    pub fn uncommitted(txn: &Arc<TxnCtx>, payload: P, deleted: bool) -> Self {
        Self {
            start_ts: txn.start_ts(),
            prepare_ts: UNCOMMIT_TS,
            end_ts: UNCOMMIT_TS,
            txn_id: txn.id(),
            log_index: None,
            deleted,
            payload,
            txn: Some(Arc::clone(txn)),
        }
    }

    /// Bootstrap node for seeded system entities, committed at the dawn of
    /// time so every snapshot sees it.
    pub fn seeded(payload: P) -> Self {
        Self {
            start_ts: Timestamp::MIN,
            prepare_ts: Timestamp::MIN,
            end_ts: Timestamp::MIN.next(),
            txn_id: TxnId([0u8; 16]),
            log_index: None,
            deleted: false,
            payload,
            txn: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        !self.end_ts.is_uncommitted()
    }
}

/// Serializable image of a node, as written to checkpoints and WAL
/// command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord<P> {
    pub start_ts: Timestamp,
    pub prepare_ts: Timestamp,
    pub end_ts: Timestamp,
    pub txn_id: TxnId,
    pub deleted: bool,
    pub payload: P,
}

impl<P: Clone> NodeRecord<P> {
    pub fn from_node(node: &UpdateNode<P>) -> Self {
        Self {
            start_ts: node.start_ts,
            prepare_ts: node.prepare_ts,
            end_ts: node.end_ts,
            txn_id: node.txn_id,
            deleted: node.deleted,
            payload: node.payload.clone(),
        }
    }

    pub fn into_node(self, log_index: Option<u64>) -> UpdateNode<P> {
        UpdateNode {
            start_ts: self.start_ts,
            prepare_ts: self.prepare_ts,
            end_ts: self.end_ts,
            txn_id: self.txn_id,
            log_index,
            deleted: self.deleted,
            payload: self.payload,
            txn: None,
        }
    }
}

enum Resolution<P> {
    Visible(UpdateNode<P>),
    Invisible,
    Wait(Arc<TxnCtx>),
}

/// Version chain for one entity: update nodes newest first, strictly
/// decreasing `start_ts` down the list, at most one in-flight writer.
#[derive(Debug, Default)]
pub struct MvccChain<P> {
    nodes: Vec<UpdateNode<P>>,
}

impl<P: Clone> MvccChain<P> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn with_node(node: UpdateNode<P>) -> Self {
        Self { nodes: vec![node] }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn head(&self) -> Option<&UpdateNode<P>> {
        self.nodes.first()
    }

    pub fn nodes(&self) -> &[UpdateNode<P>] {
        &self.nodes
    }

    /// Append a new version at the head. A concurrent uncommitted writer
    /// from another transaction is a write-write conflict; a second node
    /// from the same transaction is a caller bug (edits within one
    /// transaction go through `update_in_place`).
    pub fn insert(&mut self, node: UpdateNode<P>) -> Result<(), StoreError> {
        if let Some(head) = self.nodes.first() {
            if !head.is_committed() {
                if head.txn_id != node.txn_id {
                    return Err(StoreError::Conflict(format!(
                        "entity already has an in-flight writer (txn {})",
                        head.txn_id
                    )));
                }
                return Err(StoreError::Internal(
                    "duplicate uncommitted node for one transaction".into(),
                ));
            }
            if node.start_ts <= head.start_ts && !node.start_ts.is_uncommitted() {
                if node.start_ts == head.start_ts {
                    return Err(StoreError::Internal(
                        "two chain nodes with equal start_ts".into(),
                    ));
                }
                return Err(StoreError::Internal(
                    "non-monotonic start_ts on chain insert".into(),
                ));
            }
        }
        self.nodes.insert(0, node);
        Ok(())
    }

    /// Replace the payload of the in-flight node owned by `start_ts`.
    pub fn update_in_place(
        &mut self,
        start_ts: Timestamp,
        payload: P,
        deleted: bool,
    ) -> Result<(), StoreError> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.start_ts == start_ts && !n.is_committed())
            .ok_or_else(|| {
                StoreError::Internal(format!("no in-flight node with start ts {start_ts}"))
            })?;
        node.payload = payload;
        node.deleted = deleted;
        Ok(())
    }

    pub fn set_prepare_ts(&mut self, start_ts: Timestamp, prepare_ts: Timestamp) {
        if let Some(node) = self
            .nodes
            .iter_mut()
            .find(|n| n.start_ts == start_ts && !n.is_committed())
        {
            node.prepare_ts = prepare_ts;
        }
    }

    pub fn commit(&mut self, start_ts: Timestamp, commit_ts: Timestamp) -> Result<(), StoreError> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.start_ts == start_ts && !n.is_committed())
            .ok_or_else(|| {
                StoreError::Internal(format!("commit: no in-flight node with start ts {start_ts}"))
            })?;
        if node.prepare_ts.is_uncommitted() {
            node.prepare_ts = commit_ts;
        }
        node.end_ts = commit_ts;
        node.txn = None;
        Ok(())
    }

    pub fn set_log_index(&mut self, start_ts: Timestamp, log_index: u64) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.start_ts == start_ts) {
            node.log_index = Some(log_index);
        }
    }

    pub fn rollback(&mut self, start_ts: Timestamp) -> Result<(), StoreError> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.start_ts == start_ts && !n.is_committed())
            .ok_or_else(|| {
                StoreError::Internal(format!(
                    "rollback: no in-flight node with start ts {start_ts}"
                ))
            })?;
        self.nodes.remove(pos);
        Ok(())
    }

    /// Tuple-row variant of `insert`: chains under tuple storage admit one
    /// pending node per transaction and resolve overlap at commit time
    /// (first committer wins), so a second in-flight writer is not an
    /// immediate conflict here.
    pub fn insert_pending(&mut self, node: UpdateNode<P>) -> Result<(), StoreError> {
        if self
            .nodes
            .iter()
            .any(|n| !n.is_committed() && n.txn_id == node.txn_id)
        {
            return Err(StoreError::Internal(
                "transaction already has a pending node on this chain".into(),
            ));
        }
        let pos = self
            .nodes
            .iter()
            .position(|n| n.start_ts < node.start_ts)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(pos, node);
        Ok(())
    }

    /// Stage a pending write for `txn`, replacing its earlier pending node
    /// if the transaction touches the same chain twice.
    pub fn stage_pending(
        &mut self,
        txn: &Arc<TxnCtx>,
        payload: P,
        deleted: bool,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self
            .nodes
            .iter_mut()
            .find(|n| !n.is_committed() && n.txn_id == txn.id())
        {
            existing.payload = payload;
            existing.deleted = deleted;
            return Ok(());
        }
        self.insert_pending(UpdateNode::uncommitted(txn, payload, deleted))
    }

    /// Commit-time write-write validation: a committed node from another
    /// transaction with an end timestamp past our snapshot means a
    /// concurrent writer won the race.
    pub fn commit_conflict(&self, txn_id: TxnId, start_ts: Timestamp) -> Option<Timestamp> {
        self.nodes
            .iter()
            .filter(|n| n.is_committed() && n.txn_id != txn_id)
            .find(|n| n.end_ts > start_ts)
            .map(|n| n.end_ts)
    }

    /// Whether `txn` has a pending node here.
    pub fn has_pending(&self, txn_id: TxnId) -> bool {
        self.nodes
            .iter()
            .any(|n| !n.is_committed() && n.txn_id == txn_id)
    }

    fn resolve(&self, reader: &TxnReader) -> Resolution<P> {
        for node in &self.nodes {
            if node.txn_id == reader.txn_id {
                let mut own = node.clone();
                own.txn = None;
                return Resolution::Visible(own);
            }
            if !node.is_committed() {
                if let Some(txn) = &node.txn {
                    if txn.state(false) == TxnState::Committing
                        && node.prepare_ts <= reader.start_ts
                    {
                        return Resolution::Wait(Arc::clone(txn));
                    }
                }
                continue;
            }
            if node.end_ts <= reader.start_ts {
                return Resolution::Visible(node.clone());
            }
        }
        Resolution::Invisible
    }

    /// Committed nodes with `end_ts` in `(min_exclusive, max_inclusive]`,
    /// oldest first, as checkpointing collects them.
    pub fn committed_in(
        &self,
        min_exclusive: Timestamp,
        max_inclusive: Timestamp,
    ) -> Vec<&UpdateNode<P>> {
        let mut out: Vec<&UpdateNode<P>> = self
            .nodes
            .iter()
            .filter(|n| n.is_committed() && n.end_ts > min_exclusive && n.end_ts <= max_inclusive)
            .collect();
        out.reverse();
        out
    }

    /// Merge-or-insert during replay. Latest information wins: an existing
    /// node with the same `start_ts` adopts the incoming end timestamp and
    /// payload; otherwise the node is spliced in keeping start order.
    pub fn replay(&mut self, node: UpdateNode<P>) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.start_ts == node.start_ts) {
            existing.end_ts = node.end_ts;
            existing.prepare_ts = node.prepare_ts;
            existing.deleted = node.deleted;
            existing.payload = node.payload;
            if node.log_index.is_some() {
                existing.log_index = node.log_index;
            }
            return;
        }
        let pos = self
            .nodes
            .iter()
            .position(|n| n.start_ts < node.start_ts)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(pos, node);
    }

    /// A chain is garbage once its newest committed node is a tombstone at
    /// or below the truncation watermark and nothing is in flight.
    pub fn is_garbage(&self, watermark: Timestamp) -> bool {
        if self.nodes.iter().any(|n| !n.is_committed()) {
            return false;
        }
        match self.nodes.first() {
            Some(head) => head.deleted && head.end_ts <= watermark,
            None => true,
        }
    }
}

/// Lock-wrapped chain with blocking visibility resolution. Waiting happens
/// outside the chain lock: the reader drops it, parks on the writer's done
/// condition, then rescans.
#[derive(Debug, Default)]
pub struct VersionChain<P> {
    inner: RwLock<MvccChain<P>>,
}

impl<P: Clone> VersionChain<P> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MvccChain::new()),
        }
    }

    pub fn with_node(node: UpdateNode<P>) -> Self {
        Self {
            inner: RwLock::new(MvccChain::with_node(node)),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, MvccChain<P>> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, MvccChain<P>> {
        self.inner.write()
    }

    /// Newest node visible at the reader's snapshot, blocking while the
    /// candidate writer is committing with `prepare_ts <= reader.start_ts`.
    pub fn visible_node(&self, reader: &TxnReader) -> Option<UpdateNode<P>> {
        loop {
            let pending = {
                let chain = self.inner.read();
                match chain.resolve(reader) {
                    Resolution::Visible(node) => return Some(node),
                    Resolution::Invisible => return None,
                    Resolution::Wait(txn) => txn,
                }
            };
            let _ = pending.state(true);
        }
    }

    /// Iterator-facing visibility: (exists, observed tombstone).
    pub fn can_get(&self, reader: &TxnReader) -> (bool, bool) {
        match self.visible_node(reader) {
            Some(node) if node.deleted => (false, true),
            Some(_) => (true, false),
            None => (false, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{MvccChain, TxnReader, UpdateNode, VersionChain};
    use crate::clock::Timestamp;
    use crate::error::StoreErrorCode;
    use crate::txn::{TxnCtx, TxnId};

    fn txn_at(physical: u64) -> Arc<TxnCtx> {
        Arc::new(TxnCtx::new(
            TxnId::generate(),
            Timestamp::new(physical, 0),
            Vec::new(),
        ))
    }

    fn committed_node(start: u64, end: u64, payload: &str) -> UpdateNode<String> {
        let txn = txn_at(start);
        let mut node = UpdateNode::uncommitted(&txn, payload.to_string(), false);
        node.end_ts = Timestamp::new(end, 0);
        node.prepare_ts = node.end_ts;
        node.txn = None;
        node
    }

    #[test]
    fn snapshot_reads_pick_newest_committed_at_or_before_ts() {
        let mut chain = MvccChain::new();
        chain.insert(committed_node(10, 11, "v1")).expect("insert");
        chain.insert(committed_node(20, 21, "v2")).expect("insert");
        chain.insert(committed_node(30, 31, "v3")).expect("insert");

        let chain = VersionChain {
            inner: parking_lot::RwLock::new(chain),
        };
        let at = |physical| TxnReader::snapshot(Timestamp::new(physical, 0));

        assert!(chain.visible_node(&at(10)).is_none());
        assert_eq!(chain.visible_node(&at(11)).expect("v1").payload, "v1");
        assert_eq!(chain.visible_node(&at(25)).expect("v2").payload, "v2");
        assert_eq!(chain.visible_node(&at(100)).expect("v3").payload, "v3");
    }

    #[test]
    fn uncommitted_node_is_invisible_to_others_and_visible_to_owner() {
        let txn = txn_at(40);
        let mut chain = MvccChain::new();
        chain.insert(committed_node(10, 11, "base")).expect("insert");
        chain
            .insert(UpdateNode::uncommitted(&txn, "mine".to_string(), false))
            .expect("insert");

        let chain = VersionChain {
            inner: parking_lot::RwLock::new(chain),
        };
        let other = TxnReader::snapshot(Timestamp::new(50, 0));
        assert_eq!(chain.visible_node(&other).expect("base").payload, "base");

        let own = TxnReader::new(txn.id(), txn.start_ts());
        assert_eq!(chain.visible_node(&own).expect("own").payload, "mine");
    }

    #[test]
    fn second_writer_conflicts() {
        let t1 = txn_at(10);
        let t2 = txn_at(11);
        let mut chain = MvccChain::new();
        chain
            .insert(UpdateNode::uncommitted(&t1, "a".to_string(), false))
            .expect("first writer");
        let err = chain
            .insert(UpdateNode::uncommitted(&t2, "b".to_string(), false))
            .unwrap_err();
        assert_eq!(err.code(), StoreErrorCode::Conflict);
    }

    #[test]
    fn rollback_removes_the_node() {
        let txn = txn_at(10);
        let mut chain = MvccChain::new();
        chain
            .insert(UpdateNode::uncommitted(&txn, "a".to_string(), false))
            .expect("insert");
        chain.rollback(txn.start_ts()).expect("rollback");
        assert!(chain.is_empty());
    }

    #[test]
    fn reader_waits_for_committing_writer() {
        let txn = txn_at(10);
        let chain = Arc::new(VersionChain::new());
        chain
            .write()
            .insert(UpdateNode::uncommitted(&txn, "pending".to_string(), false))
            .expect("insert");

        // Writer enters Committing with prepare ts below the reader snapshot.
        chain
            .write()
            .set_prepare_ts(txn.start_ts(), Timestamp::new(15, 0));
        txn.to_committing(Timestamp::new(15, 0)).expect("committing");

        let reader_chain = Arc::clone(&chain);
        let reader = std::thread::spawn(move || {
            let reader = TxnReader::snapshot(Timestamp::new(20, 0));
            reader_chain.visible_node(&reader)
        });

        std::thread::sleep(Duration::from_millis(50));
        chain
            .write()
            .commit(txn.start_ts(), Timestamp::new(15, 0))
            .expect("chain commit");
        txn.to_committed().expect("committed");

        let node = reader.join().expect("join").expect("visible after commit");
        assert_eq!(node.payload, "pending");
        assert_eq!(node.end_ts, Timestamp::new(15, 0));
    }

    #[test]
    fn committing_writer_above_reader_snapshot_is_skipped() {
        let txn = txn_at(30);
        let chain = VersionChain::new();
        chain
            .write()
            .insert(UpdateNode::uncommitted(&txn, "future".to_string(), false))
            .expect("insert");
        chain
            .write()
            .set_prepare_ts(txn.start_ts(), Timestamp::new(35, 0));
        txn.to_committing(Timestamp::new(35, 0)).expect("committing");

        // Reader snapshot below prepare ts must not block.
        let reader = TxnReader::snapshot(Timestamp::new(32, 0));
        assert!(chain.visible_node(&reader).is_none());
    }

    #[test]
    fn can_get_reports_tombstones() {
        let mut inner = MvccChain::new();
        inner.insert(committed_node(10, 11, "live")).expect("insert");
        let mut drop_node = committed_node(20, 21, "dead");
        drop_node.deleted = true;
        inner.insert(drop_node).expect("insert");
        let chain = VersionChain {
            inner: parking_lot::RwLock::new(inner),
        };

        let before = TxnReader::snapshot(Timestamp::new(15, 0));
        assert_eq!(chain.can_get(&before), (true, false));
        let after = TxnReader::snapshot(Timestamp::new(25, 0));
        assert_eq!(chain.can_get(&after), (false, true));
    }

    #[test]
    fn replay_merges_by_start_ts() {
        let mut chain: MvccChain<String> = MvccChain::new();
        let mut open = committed_node(10, 0, "draft");
        open.end_ts = crate::clock::UNCOMMIT_TS;
        chain.replay(open);

        // Same start ts arrives again with the final commit timestamp.
        chain.replay(committed_node(10, 12, "final"));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.head().expect("head").payload, "final");
        assert_eq!(chain.head().expect("head").end_ts, Timestamp::new(12, 0));

        // Out-of-order older node splices below the head.
        chain.replay(committed_node(5, 6, "older"));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.head().expect("head").payload, "final");
    }

    #[test]
    fn checkpoint_window_collection_is_half_open() {
        let mut chain = MvccChain::new();
        chain.insert(committed_node(10, 11, "a")).expect("insert");
        chain.insert(committed_node(20, 21, "b")).expect("insert");
        chain.insert(committed_node(30, 31, "c")).expect("insert");

        let collected =
            chain.committed_in(Timestamp::new(11, 0), Timestamp::new(31, 0));
        let payloads: Vec<_> = collected.iter().map(|n| n.payload.as_str()).collect();
        assert_eq!(payloads, vec!["b", "c"]);
    }

    #[test]
    fn overlapping_pending_writers_resolve_at_commit() {
        let t1 = txn_at(10);
        let t2 = txn_at(11);
        let mut chain = MvccChain::new();
        chain
            .stage_pending(&t1, "t1".to_string(), false)
            .expect("t1 stage");
        chain
            .stage_pending(&t2, "t2".to_string(), false)
            .expect("t2 stage");

        // T2 commits first.
        assert!(chain.commit_conflict(t2.id(), t2.start_ts()).is_none());
        chain
            .commit(t2.start_ts(), Timestamp::new(12, 0))
            .expect("t2 commit");

        // T1 now observes a committed writer past its snapshot.
        let clash = chain
            .commit_conflict(t1.id(), t1.start_ts())
            .expect("conflict");
        assert_eq!(clash, Timestamp::new(12, 0));
        chain.rollback(t1.start_ts()).expect("t1 rollback");
        assert!(!chain.has_pending(t1.id()));
    }

    #[test]
    fn tombstone_below_watermark_is_garbage() {
        let mut chain = MvccChain::new();
        chain.insert(committed_node(10, 11, "a")).expect("insert");
        let mut dead = committed_node(20, 21, "x");
        dead.deleted = true;
        chain.insert(dead).expect("insert");

        assert!(chain.is_garbage(Timestamp::new(21, 0)));
        assert!(!chain.is_garbage(Timestamp::new(20, 0)));
    }
}
