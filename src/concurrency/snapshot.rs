//! Transaction snapshots.
//!
//! A snapshot is taken at begin time and never changes: the highest
//! committed transaction ID plus the set of transactions that were still
//! active. A committed transaction's effects are inside the snapshot iff
//! its ID is at or below the high-water mark and it was not in the active
//! set. IDs alone cannot decide this, since a lower ID may commit later.

use std::collections::HashSet;

use crate::transaction::TransactionId;

#[derive(Debug, Clone)]
pub struct Snapshot {
    owner: TransactionId,
    snapshot_start: TransactionId,
    active_at_start: HashSet<TransactionId>,
}

impl Snapshot {
    pub fn new(
        owner: TransactionId,
        snapshot_start: TransactionId,
        active_at_start: HashSet<TransactionId>,
    ) -> Self {
        Self {
            owner,
            snapshot_start,
            active_at_start,
        }
    }

    /// Synthetic snapshot seeing everything committed up to now. Used for
    /// latest-committed reads and as the vacuum horizon when nothing is
    /// active.
    pub fn latest(last_committed: TransactionId) -> Self {
        Self {
            owner: TransactionId::BOOTSTRAP,
            snapshot_start: last_committed,
            active_at_start: HashSet::new(),
        }
    }

    pub fn owner(&self) -> TransactionId {
        self.owner
    }

    pub fn snapshot_start(&self) -> TransactionId {
        self.snapshot_start
    }

    pub fn active_at_start(&self) -> &HashSet<TransactionId> {
        &self.active_at_start
    }

    /// Whether the effects of `txn`, assuming it committed, are inside
    /// this snapshot. The caller checks the committed part.
    pub fn contains(&self, txn: TransactionId) -> bool {
        if txn.is_bootstrap() {
            return true;
        }
        txn <= self.snapshot_start && !self.active_at_start.contains(&txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_by_id_order() {
        let snap = Snapshot::new(TransactionId(10), TransactionId(5), HashSet::new());

        assert!(snap.contains(TransactionId(3)));
        assert!(snap.contains(TransactionId(5)));
        assert!(!snap.contains(TransactionId(6)));
    }

    #[test]
    fn test_active_at_start_excluded() {
        let mut active = HashSet::new();
        active.insert(TransactionId(4));
        let snap = Snapshot::new(TransactionId(10), TransactionId(5), active);

        // Transaction 4 had a low ID but had not committed when the
        // snapshot was taken.
        assert!(!snap.contains(TransactionId(4)));
        assert!(snap.contains(TransactionId(3)));
    }

    #[test]
    fn test_bootstrap_always_contained() {
        let snap = Snapshot::new(TransactionId(1), TransactionId(0), HashSet::new());
        assert!(snap.contains(TransactionId::BOOTSTRAP));
    }

    #[test]
    fn test_latest_sees_all_committed() {
        let snap = Snapshot::latest(TransactionId(7));
        assert!(snap.contains(TransactionId(7)));
        assert!(!snap.contains(TransactionId(8)));
    }
}
