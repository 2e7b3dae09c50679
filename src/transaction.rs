//! Transaction coordination.
//!
//! The registry here owns transaction lifecycle state: identifiers,
//! Active/Committed/Aborted states, per-transaction snapshots, write sets,
//! and in-memory undo images. Commit durability sequencing lives in the
//! engine facade (`database`), which drives the WAL around these state
//! transitions.

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{TransactionError, TransactionManager};
pub use state::TransactionState;
