//! MVCC manager: snapshot reads, conflict-checked writes, and vacuum.
//!
//! Reads walk a row's chain newest-first and return the first version
//! whose creation is inside the reader's snapshot; a visible delete stamp
//! shadows everything older. Writers take the row lock and then apply the
//! conflict policy against the chain head, so a transaction that waited
//! out a competing commit sees that commit and fails with `Conflict`
//! (first-committer-wins).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::lock::{LockError, LockManager};
use super::snapshot::Snapshot;
use super::version::{RecordVersion, VersionChain};
use crate::storage::page::RowId;
use crate::transaction::{TransactionId, TransactionManager};

/// Recoverable concurrency errors. The transaction that receives one is
/// still alive; the caller decides whether to retry or abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("write-write conflict on row {0}: a competing transaction committed first")]
    Conflict(RowId),

    #[error("timed out waiting for the lock on row {0}")]
    LockTimeout(RowId),

    #[error("deadlock detected while waiting for the lock on row {0}")]
    Deadlock(RowId),

    #[error("row {0} does not exist in this snapshot")]
    RowNotFound(RowId),
}

/// What happens when two transactions write the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The second writer blocks on the row lock; if the first commits, the
    /// second fails with `Conflict` once it gets through.
    #[default]
    FirstCommitterWins,
    /// The second writer fails immediately while the lock is held.
    FirstWriterWins,
}

#[derive(Debug, Clone)]
pub struct MvccConfig {
    /// How long a writer may wait on a row lock.
    pub lock_wait_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Version manager coordinating chains, row locks, and transaction states.
pub struct MvccManager {
    chains: RwLock<HashMap<RowId, VersionChain>>,
    locks: LockManager,
    txns: Arc<TransactionManager>,
    config: MvccConfig,
}

impl MvccManager {
    pub fn new(txns: Arc<TransactionManager>, config: MvccConfig) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            locks: LockManager::new(),
            txns,
            config,
        }
    }

    fn creation_visible(&self, version: &RecordVersion, snapshot: &Snapshot) -> bool {
        if version.created_by == snapshot.owner() {
            return true;
        }
        self.txns.state(version.created_by).is_committed() && snapshot.contains(version.created_by)
    }

    fn deletion_visible(&self, version: &RecordVersion, snapshot: &Snapshot) -> bool {
        match version.deleted_by {
            Some(deleter) => {
                deleter == snapshot.owner()
                    || (self.txns.state(deleter).is_committed() && snapshot.contains(deleter))
            }
            None => false,
        }
    }

    /// Read the row as of `snapshot`. The newest version whose creation is
    /// visible decides: a visible delete means the row is gone, anything
    /// older is shadowed.
    pub fn read(&self, row_id: RowId, snapshot: &Snapshot) -> Option<Bytes> {
        let chains = self.chains.read().unwrap();
        let chain = chains.get(&row_id)?;

        for version in chain.iter() {
            if self.creation_visible(version, snapshot) {
                if self.deletion_visible(version, snapshot) {
                    return None;
                }
                return Some(version.data.clone());
            }
        }
        None
    }

    /// Lock the row and run the conflict check. For deletes the row must
    /// also exist in the writer's snapshot.
    pub fn prepare_write(
        &self,
        txn: TransactionId,
        snapshot: &Snapshot,
        row_id: RowId,
        is_delete: bool,
    ) -> Result<(), ConcurrencyError> {
        match self.config.conflict_policy {
            ConflictPolicy::FirstCommitterWins => self
                .locks
                .acquire(txn, row_id, self.config.lock_wait_timeout)
                .map_err(|e| match e {
                    LockError::Timeout => ConcurrencyError::LockTimeout(row_id),
                    LockError::Deadlock => ConcurrencyError::Deadlock(row_id),
                })?,
            ConflictPolicy::FirstWriterWins => {
                if !self.locks.try_acquire(txn, row_id) {
                    return Err(ConcurrencyError::Conflict(row_id));
                }
            }
        }

        let chains = self.chains.read().unwrap();
        if let Some(chain) = chains.get(&row_id) {
            if let Some(head) = chain.head() {
                // A committed head outside our snapshot means someone beat
                // us to this row since we began.
                let competing_writer = head.created_by != txn
                    && self.txns.state(head.created_by).is_committed()
                    && !snapshot.contains(head.created_by);
                let competing_deleter = head.deleted_by.is_some_and(|deleter| {
                    deleter != txn
                        && self.txns.state(deleter).is_committed()
                        && !snapshot.contains(deleter)
                });
                if competing_writer || competing_deleter {
                    return Err(ConcurrencyError::Conflict(row_id));
                }
            }
        }

        if is_delete {
            drop(chains);
            if self.read(row_id, snapshot).is_none() {
                return Err(ConcurrencyError::RowNotFound(row_id));
            }
        }
        Ok(())
    }

    /// Install a new head version for the row. The caller holds the row
    /// lock and has logged the change.
    pub fn apply_write(&self, row_id: RowId, data: Bytes, txn: TransactionId) {
        let mut chains = self.chains.write().unwrap();
        chains
            .entry(row_id)
            .or_insert_with(VersionChain::new)
            .push_head(data, txn);
    }

    /// Stamp the newest version deleted by `txn`. The caller holds the row
    /// lock, so the head is either our own version or the committed one the
    /// conflict check approved.
    pub fn apply_delete(&self, row_id: RowId, txn: TransactionId) {
        let mut chains = self.chains.write().unwrap();
        if let Some(head) = chains.get_mut(&row_id).and_then(|chain| chain.head_mut()) {
            head.deleted_by = Some(txn);
        }
    }

    /// Seed a chain from a page slot during recovery.
    pub fn load_bootstrap(&self, row_id: RowId, data: Bytes) {
        let mut chains = self.chains.write().unwrap();
        chains
            .entry(row_id)
            .or_insert_with(VersionChain::new)
            .push_head(data, TransactionId::BOOTSTRAP);
    }

    /// Remove every trace of an aborted transaction from the given rows.
    /// The registry already shows the transaction as Aborted, so its
    /// versions are invisible before this even runs.
    pub fn purge_transaction(&self, txn: TransactionId, rows: &HashSet<RowId>) {
        let mut chains = self.chains.write().unwrap();
        for row_id in rows {
            if let Some(chain) = chains.get_mut(row_id) {
                chain.purge_creator(txn);
                if chain.is_empty() {
                    chains.remove(row_id);
                }
            }
        }
    }

    /// Release the transaction's row locks. Called exactly once, at commit
    /// or abort.
    pub fn release_locks(&self, txn: TransactionId) {
        self.locks.release_all(txn);
    }

    /// Reclaim versions no live snapshot can reference.
    ///
    /// For each chain, find the newest version visible to every horizon
    /// snapshot (all active snapshots plus the synthetic latest). Versions
    /// older than it are unreachable by any current or future snapshot and
    /// are dropped; if that survivor is the head and its deletion is also
    /// visible to every horizon, the whole chain is dead.
    ///
    /// Returns the number of versions reclaimed.
    pub fn vacuum(&self, horizons: &[Arc<Snapshot>], latest: &Snapshot) -> usize {
        let visible_to_all = |version: &RecordVersion| {
            self.txns.state(version.created_by).is_committed()
                && latest.contains(version.created_by)
                && horizons.iter().all(|s| {
                    self.creation_visible(version, s)
                })
        };
        let deletion_visible_to_all = |version: &RecordVersion| match version.deleted_by {
            Some(deleter) => {
                self.txns.state(deleter).is_committed()
                    && latest.contains(deleter)
                    && horizons.iter().all(|s| self.deletion_visible(version, s))
            }
            None => false,
        };

        let mut chains = self.chains.write().unwrap();
        let mut reclaimed = 0;
        let mut dead_rows = Vec::new();

        for (row_id, chain) in chains.iter_mut() {
            let cut = chain.iter().position(&visible_to_all);

            match cut {
                Some(0) => {
                    if chain.head().is_some_and(&deletion_visible_to_all) {
                        reclaimed += chain.clear();
                        dead_rows.push(*row_id);
                    } else {
                        reclaimed += chain.truncate_after(1);
                    }
                }
                Some(pos) => {
                    reclaimed += chain.truncate_after(pos + 1);
                }
                None => {}
            }
        }

        for row_id in dead_rows {
            chains.remove(&row_id);
        }
        reclaimed
    }

    /// Number of rows with at least one version, for tests and stats.
    pub fn row_count(&self) -> usize {
        self.chains.read().unwrap().len()
    }

    /// Total live versions across all chains.
    pub fn version_count(&self) -> usize {
        let chains = self.chains.read().unwrap();
        chains.values().map(|chain| chain.len()).sum()
    }
}
