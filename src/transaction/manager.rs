//! Transaction registry: lifecycle state, snapshots, write sets, and undo
//! images, under one lock so `begin` captures a consistent snapshot against
//! concurrent commits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::TransactionState;
use crate::concurrency::snapshot::Snapshot;
use crate::storage::page::RowId;
use crate::storage::wal::record::{ActiveTxnUndo, Lsn, UndoImage};

/// Error types for transaction operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    #[error("Transaction {0} is {1}, expected active")]
    NotActive(TransactionId, TransactionState),
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

struct TransactionRecord {
    state: TransactionState,
    snapshot: Arc<Snapshot>,
    /// Rows this transaction has written or deleted.
    write_set: HashSet<RowId>,
    /// Before-images in apply order; reversed on rollback.
    undo: Vec<UndoImage>,
    /// LSN of the Begin record.
    first_lsn: Lsn,
    /// LSN of the latest record, chained into the next one's prev_lsn.
    last_lsn: Lsn,
}

struct RegistryInner {
    records: HashMap<TransactionId, TransactionRecord>,
    /// Highest committed transaction ID; new snapshots start here.
    last_committed: TransactionId,
}

/// The transaction registry.
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    inner: RwLock<RegistryInner>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            inner: RwLock::new(RegistryInner {
                records: HashMap::new(),
                last_committed: TransactionId::BOOTSTRAP,
            }),
        }
    }

    /// Begin a transaction: assign an ID and capture its snapshot (highest
    /// committed ID plus the set of transactions active right now) in one
    /// critical section.
    pub fn begin(&self) -> (TransactionId, Arc<Snapshot>) {
        let mut inner = self.inner.write().unwrap();
        let id = self.id_generator.next();

        // A Committing transaction has not committed yet, so it belongs in
        // the active set like any other in-flight transaction.
        let active_at_start: HashSet<TransactionId> = inner
            .records
            .iter()
            .filter(|(_, record)| !record.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let snapshot = Arc::new(Snapshot::new(id, inner.last_committed, active_at_start));
        inner.records.insert(
            id,
            TransactionRecord {
                state: TransactionState::Active,
                snapshot: snapshot.clone(),
                write_set: HashSet::new(),
                undo: Vec::new(),
                first_lsn: Lsn::INVALID,
                last_lsn: Lsn::INVALID,
            },
        );

        (id, snapshot)
    }

    /// Resolve a transaction's state. A missing entry resolves as
    /// Committed: only terminal transactions below the vacuum watermark are
    /// ever pruned, and aborted ones have no surviving versions by then.
    pub fn state(&self, id: TransactionId) -> TransactionState {
        if id.is_bootstrap() {
            return TransactionState::Committed;
        }
        let inner = self.inner.read().unwrap();
        inner
            .records
            .get(&id)
            .map(|record| record.state)
            .unwrap_or(TransactionState::Committed)
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .get(&id)
            .map(|record| record.state.is_active())
            .unwrap_or(false)
    }

    pub fn snapshot(&self, id: TransactionId) -> Result<Arc<Snapshot>> {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .get(&id)
            .map(|record| record.snapshot.clone())
            .ok_or(TransactionError::NotFound(id))
    }

    pub fn set_first_lsn(&self, id: TransactionId, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        record.first_lsn = lsn;
        record.last_lsn = lsn;
        Ok(())
    }

    pub fn last_lsn(&self, id: TransactionId) -> Result<Lsn> {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .get(&id)
            .map(|record| record.last_lsn)
            .ok_or(TransactionError::NotFound(id))
    }

    /// Record one applied update: its row, its undo image, and the LSN of
    /// its log record.
    pub fn record_write(
        &self,
        id: TransactionId,
        row_id: RowId,
        undo: UndoImage,
        lsn: Lsn,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        if !record.state.is_active() {
            return Err(TransactionError::NotActive(id, record.state));
        }
        record.write_set.insert(row_id);
        record.undo.push(undo);
        record.last_lsn = lsn;
        Ok(())
    }

    /// Reserve the commit transition: verify the transaction is still
    /// Active, move it to Committing so no competing transition can claim
    /// it, and hand back the last LSN for chaining the Commit record.
    /// `mark_committed` finishes the transition once the record is durable.
    pub fn begin_commit(&self, id: TransactionId) -> Result<Lsn> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        if !record.state.is_active() {
            return Err(TransactionError::NotActive(id, record.state));
        }
        record.state = TransactionState::Committing;
        Ok(record.last_lsn)
    }

    /// Transition to Committed and advance the committed high-water mark.
    /// Undo state is dropped; it can never be needed again.
    pub fn mark_committed(&self, id: TransactionId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        if record.state.is_terminal() {
            return Err(TransactionError::NotActive(id, record.state));
        }
        record.state = TransactionState::Committed;
        record.undo = Vec::new();
        record.write_set = HashSet::new();
        if id > inner.last_committed {
            inner.last_committed = id;
        }
        Ok(())
    }

    /// Transition to Aborted, handing back the undo images (in apply order)
    /// and write set for rollback. Visibility of the transaction's versions
    /// is cut the moment this returns.
    pub fn mark_aborted(&self, id: TransactionId) -> Result<(Vec<UndoImage>, HashSet<RowId>)> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(TransactionError::NotFound(id))?;
        if !record.state.is_active() {
            return Err(TransactionError::NotActive(id, record.state));
        }
        record.state = TransactionState::Aborted;
        let undo = std::mem::take(&mut record.undo);
        let write_set = std::mem::take(&mut record.write_set);
        Ok((undo, write_set))
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .iter()
            .filter(|(_, record)| record.state.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshots of all active transactions, for vacuum.
    pub fn active_snapshots(&self) -> Vec<Arc<Snapshot>> {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .values()
            .filter(|record| record.state.is_active())
            .map(|record| record.snapshot.clone())
            .collect()
    }

    /// Undo state of every unfinished transaction, embedded into checkpoint
    /// marks so replay is self-contained from the mark. Committing
    /// transactions are included: if the crash lands before their Commit
    /// record, they must be undone like any other in-flight transaction.
    pub fn active_undo(&self) -> Vec<ActiveTxnUndo> {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .iter()
            .filter(|(_, record)| !record.state.is_terminal())
            .map(|(id, record)| ActiveTxnUndo {
                transaction_id: *id,
                undo: record.undo.clone(),
            })
            .collect()
    }

    /// The vacuum watermark: no active snapshot can see effects of any
    /// transaction above it. With no active transactions this is the
    /// committed high-water mark.
    pub fn watermark(&self) -> TransactionId {
        let inner = self.inner.read().unwrap();
        inner
            .records
            .values()
            .filter(|record| record.state.is_active())
            .map(|record| record.snapshot.snapshot_start())
            .min()
            .unwrap_or(inner.last_committed)
    }

    /// Highest committed transaction ID.
    pub fn last_committed(&self) -> TransactionId {
        self.inner.read().unwrap().last_committed
    }

    /// Recovery hook: resume ID assignment above IDs replayed from the log
    /// and seed the committed high-water mark.
    pub fn restore_counters(&self, max_seen: TransactionId) {
        self.id_generator.advance_past(max_seen);
        let mut inner = self.inner.write().unwrap();
        if max_seen > inner.last_committed {
            inner.last_committed = max_seen;
        }
    }

    /// Drop terminal entries at or below the watermark. Their states become
    /// implicit (missing resolves as Committed).
    pub fn prune_terminated(&self, watermark: TransactionId) -> usize {
        let mut inner = self.inner.write().unwrap();
        let before = inner.records.len();
        inner
            .records
            .retain(|id, record| !record.state.is_terminal() || *id > watermark);
        before - inner.records.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;

    fn undo_image() -> UndoImage {
        UndoImage {
            page_id: PageId(0),
            slot: 0,
            before_image: None,
        }
    }

    #[test]
    fn test_begin_assigns_unique_ids() {
        let manager = TransactionManager::new();

        let (id1, _) = manager.begin();
        let (id2, _) = manager.begin();

        assert_ne!(id1, id2);
        assert_eq!(manager.active_transactions().len(), 2);
    }

    #[test]
    fn test_commit_and_state_resolution() {
        let manager = TransactionManager::new();

        let (id, _) = manager.begin();
        assert_eq!(manager.state(id), TransactionState::Active);

        manager.mark_committed(id).unwrap();
        assert_eq!(manager.state(id), TransactionState::Committed);
        assert_eq!(manager.last_committed(), id);

        // Terminal transitions are final.
        assert!(manager.mark_committed(id).is_err());
        assert!(manager.mark_aborted(id).is_err());
    }

    #[test]
    fn test_begin_commit_reserves_transition() {
        let manager = TransactionManager::new();

        let (id, _) = manager.begin();
        manager
            .record_write(id, RowId(1), undo_image(), Lsn(3))
            .unwrap();

        let prev = manager.begin_commit(id).unwrap();
        assert_eq!(prev, Lsn(3));
        assert_eq!(manager.state(id), TransactionState::Committing);

        // Neither a second commit reservation nor an abort can claim it.
        assert!(manager.begin_commit(id).is_err());
        assert!(manager.mark_aborted(id).is_err());

        manager.mark_committed(id).unwrap();
        assert_eq!(manager.state(id), TransactionState::Committed);
    }

    #[test]
    fn test_begin_commit_rejects_aborted() {
        let manager = TransactionManager::new();

        let (id, _) = manager.begin();
        manager.mark_aborted(id).unwrap();

        assert_eq!(
            manager.begin_commit(id),
            Err(TransactionError::NotActive(id, TransactionState::Aborted))
        );
    }

    #[test]
    fn test_committing_counts_as_unfinished() {
        let manager = TransactionManager::new();

        let (id, _) = manager.begin();
        manager
            .record_write(id, RowId(1), undo_image(), Lsn(2))
            .unwrap();
        manager.begin_commit(id).unwrap();

        // Checkpoint marks must carry its undo, new snapshots must not see
        // it, and pruning must not drop it.
        let undo = manager.active_undo();
        assert_eq!(undo.len(), 1);
        assert_eq!(undo[0].transaction_id, id);

        let (_, snap) = manager.begin();
        assert!(snap.active_at_start().contains(&id));
        assert_eq!(manager.prune_terminated(id), 0);

        manager.mark_committed(id).unwrap();
    }

    #[test]
    fn test_abort_returns_undo_state() {
        let manager = TransactionManager::new();

        let (id, _) = manager.begin();
        manager
            .record_write(id, RowId(5), undo_image(), Lsn(10))
            .unwrap();
        manager
            .record_write(id, RowId(6), undo_image(), Lsn(11))
            .unwrap();

        let (undo, write_set) = manager.mark_aborted(id).unwrap();
        assert_eq!(undo.len(), 2);
        assert!(write_set.contains(&RowId(5)));
        assert!(write_set.contains(&RowId(6)));
        assert_eq!(manager.state(id), TransactionState::Aborted);
    }

    #[test]
    fn test_snapshot_captures_active_set() {
        let manager = TransactionManager::new();

        let (id1, _) = manager.begin();
        let (_, snap2) = manager.begin();

        // id1 was active when the second snapshot was taken.
        assert!(snap2.active_at_start().contains(&id1));

        // Even after id1 commits, snapshot 2 must not include it.
        manager.mark_committed(id1).unwrap();
        assert!(!snap2.contains(id1));
    }

    #[test]
    fn test_snapshot_start_tracks_last_committed() {
        let manager = TransactionManager::new();

        let (id1, _) = manager.begin();
        manager.mark_committed(id1).unwrap();

        let (_, snap) = manager.begin();
        assert_eq!(snap.snapshot_start(), id1);
        assert!(snap.contains(id1));
    }

    #[test]
    fn test_missing_entry_resolves_committed() {
        let manager = TransactionManager::new();
        assert_eq!(
            manager.state(TransactionId(999)),
            TransactionState::Committed
        );
        assert_eq!(
            manager.state(TransactionId::BOOTSTRAP),
            TransactionState::Committed
        );
    }

    #[test]
    fn test_watermark() {
        let manager = TransactionManager::new();

        let (id1, _) = manager.begin();
        manager.mark_committed(id1).unwrap();

        // No active transactions: watermark is the committed high water.
        assert_eq!(manager.watermark(), id1);

        let (id2, snap2) = manager.begin();
        assert_eq!(manager.watermark(), snap2.snapshot_start());

        manager.mark_committed(id2).unwrap();
        assert_eq!(manager.watermark(), id2);
    }

    #[test]
    fn test_prune_terminated() {
        let manager = TransactionManager::new();

        let (id1, _) = manager.begin();
        let (id2, _) = manager.begin();
        manager.mark_committed(id1).unwrap();

        let pruned = manager.prune_terminated(id2);
        assert_eq!(pruned, 1);
        assert_eq!(manager.transaction_count(), 1);
        assert!(manager.is_active(id2));

        // Pruned committed entries still resolve as committed.
        assert_eq!(manager.state(id1), TransactionState::Committed);
    }

    #[test]
    fn test_thread_safe_begin() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(TransactionManager::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let mgr = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                (0..50).map(|_| mgr.begin().0).collect::<Vec<_>>()
            }));
        }

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        let mut unique = all_ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(all_ids.len(), 400);
        assert_eq!(unique.len(), 400);
    }
}
