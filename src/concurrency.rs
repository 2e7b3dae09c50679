//! Concurrency control.
//!
//! Multi-version concurrency control with snapshot isolation:
//! - Snapshots fix what each transaction can see at begin time
//! - Row version chains serve reads without blocking writers
//! - Exclusive row locks serialize writers per row, with timeouts and
//!   wait-for-graph deadlock detection
//! - Vacuum reclaims versions no live snapshot can reference

pub mod lock;
pub mod mvcc;
pub mod snapshot;
pub mod version;

pub use lock::LockManager;
pub use mvcc::{ConcurrencyError, ConflictPolicy, MvccManager};
pub use snapshot::Snapshot;
