//! quilldb: a single-node durable, versioned record store.
//!
//! Records are fixed-size rows addressed by a dense `RowId` key space,
//! stored in 8KB pages behind a buffer cache. Durability comes from a
//! write-ahead log with crash recovery; isolation comes from multi-version
//! concurrency control with per-transaction snapshots.
//!
//! ```no_run
//! use quilldb::{Database, DatabaseConfig, RowId};
//!
//! # fn main() -> Result<(), quilldb::EngineError> {
//! let db = Database::open(DatabaseConfig::new("/tmp/quilldb"))?;
//!
//! let txn = db.begin()?;
//! db.write(txn, RowId(1), b"hello")?;
//! db.commit(txn)?;
//!
//! assert_eq!(db.read_committed(RowId(1)).as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

pub mod concurrency;
pub mod database;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use concurrency::{ConcurrencyError, ConflictPolicy, Snapshot};
pub use database::{Database, DatabaseConfig, EngineError, EngineResult};
pub use recovery::{CheckpointConfig, RecoveryReport};
pub use storage::wal::Lsn;
pub use storage::{PageId, RowId, StorageError};
pub use transaction::{TransactionId, TransactionState};
