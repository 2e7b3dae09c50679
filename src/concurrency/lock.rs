//! Exclusive row locks.
//!
//! Writers serialize per row; readers never take locks. A lock is held
//! until its owner reaches a terminal state, which is what makes
//! first-committer-wins conflicts observable: the second writer blocks on
//! the row lock and re-checks the chain head once it gets through.
//!
//! Blocking waits carry a timeout, and a wait-for-graph walk before each
//! wait turns a cycle into an immediate deadlock error for the newcomer.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::storage::page::RowId;
use crate::transaction::TransactionId;

/// Why a lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The wait exceeded the configured timeout.
    Timeout,
    /// Waiting would close a cycle in the wait-for graph.
    Deadlock,
}

#[derive(Default)]
struct LockTables {
    /// Current holder per row.
    holders: HashMap<RowId, TransactionId>,
    /// Rows held per transaction, for terminal-state release.
    held: HashMap<TransactionId, HashSet<RowId>>,
    /// The single row each blocked transaction is waiting for.
    waiting: HashMap<TransactionId, RowId>,
}

impl LockTables {
    fn grant(&mut self, txn: TransactionId, row: RowId) {
        self.holders.insert(row, txn);
        self.held.entry(txn).or_default().insert(row);
        self.waiting.remove(&txn);
    }

    /// Would `txn` waiting on `row` close a cycle? Follows the chain
    /// holder-of(row) -> row-it-waits-for -> holder-of(that row) -> ...
    fn would_deadlock(&self, txn: TransactionId, row: RowId) -> bool {
        let mut visited = HashSet::new();
        let mut current = match self.holders.get(&row) {
            Some(holder) => *holder,
            None => return false,
        };

        loop {
            if current == txn {
                return true;
            }
            if !visited.insert(current) {
                return false;
            }
            let next_row = match self.waiting.get(&current) {
                Some(row) => *row,
                None => return false,
            };
            current = match self.holders.get(&next_row) {
                Some(holder) => *holder,
                None => return false,
            };
        }
    }
}

/// Row lock manager.
pub struct LockManager {
    tables: Mutex<LockTables>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LockTables::default()),
            released: Condvar::new(),
        }
    }

    /// Acquire the exclusive lock on `row`, blocking up to `timeout`.
    /// Reentrant for the current holder.
    pub fn acquire(
        &self,
        txn: TransactionId,
        row: RowId,
        timeout: Duration,
    ) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        let mut tables = self.tables.lock().unwrap();

        loop {
            match tables.holders.get(&row) {
                None => {
                    tables.grant(txn, row);
                    return Ok(());
                }
                Some(holder) if *holder == txn => return Ok(()),
                Some(_) => {}
            }

            if tables.would_deadlock(txn, row) {
                // A wait entry from an earlier pass must not linger, or
                // other transactions would see phantom cycles through us.
                tables.waiting.remove(&txn);
                return Err(LockError::Deadlock);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    tables.waiting.remove(&txn);
                    return Err(LockError::Timeout);
                }
            };

            tables.waiting.insert(txn, row);
            let (guard, wait_result) = self.released.wait_timeout(tables, remaining).unwrap();
            tables = guard;

            if wait_result.timed_out() && tables.holders.get(&row).is_some_and(|h| *h != txn) {
                tables.waiting.remove(&txn);
                return Err(LockError::Timeout);
            }
        }
    }

    /// Take the lock only if it is free (or already ours). Never blocks.
    pub fn try_acquire(&self, txn: TransactionId, row: RowId) -> bool {
        let mut tables = self.tables.lock().unwrap();
        match tables.holders.get(&row) {
            None => {
                tables.grant(txn, row);
                true
            }
            Some(holder) => *holder == txn,
        }
    }

    /// Release every lock held by `txn`. Called exactly when the
    /// transaction reaches a terminal state.
    pub fn release_all(&self, txn: TransactionId) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.held.remove(&txn) {
            for row in rows {
                tables.holders.remove(&row);
            }
        }
        tables.waiting.remove(&txn);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn holds(&self, txn: TransactionId, row: RowId) -> bool {
        let tables = self.tables.lock().unwrap();
        tables.holders.get(&row) == Some(&txn)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
