//! Transaction lifecycle states.

/// The state of a transaction.
///
/// Transitions are Active -> Committing -> Committed or Active -> Aborted;
/// terminal states never change. Committing reserves the commit transition
/// while the Commit record is made durable, so no other transition can
/// claim the transaction in between. Committed entries are retained for
/// MVCC visibility checks until vacuum prunes them below the oldest active
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(self) -> bool {
        self == TransactionState::Active
    }

    pub fn is_committed(self) -> bool {
        self == TransactionState::Committed
    }

    pub fn is_aborted(self) -> bool {
        self == TransactionState::Aborted
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionState::Active => "active",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}
