//! Write-ahead logging.
//!
//! Records are appended to an in-memory buffer and become durable when a
//! flush covering their LSN returns. Commit is the only operation that
//! waits on a flush; everything else rides along (group commit).

pub mod manager;
pub mod record;

pub use manager::{WalConfig, WalCursor, WalManager};
pub use record::{Lsn, WalPayload, WalRecord, WalRecordKind};
