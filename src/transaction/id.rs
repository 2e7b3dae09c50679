//! Transaction identifiers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a transaction, assigned in begin order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Owner of row versions rebuilt from pages during recovery. Always
    /// resolves as committed and is visible to every snapshot.
    pub const BOOTSTRAP: TransactionId = TransactionId(0);

    pub fn new(id: u64) -> Self {
        TransactionId(id)
    }

    pub fn is_bootstrap(self) -> bool {
        self == Self::BOOTSTRAP
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic generator for transaction IDs, starting at 1.
pub struct TransactionIdGenerator {
    next_id: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> TransactionId {
        TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Highest ID handed out so far.
    pub fn current(&self) -> TransactionId {
        TransactionId(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Ensure future IDs land strictly above `seen`. Used by recovery after
    /// replaying IDs from the log.
    pub fn advance_past(&self, seen: TransactionId) {
        self.next_id.fetch_max(seen.0 + 1, Ordering::SeqCst);
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
