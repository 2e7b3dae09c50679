//! Storage layer for quilldb.
//!
//! Three cooperating pieces sit under this module:
//!
//! - **WAL**: the append-only log that is the sole durability boundary
//! - **Page store**: fixed 8KB blocks holding the latest row images
//! - **Buffer cache**: pinned in-memory pages with LRU eviction, enforcing
//!   the write-ahead rule on every path to the page store
//!
//! Higher layers never write the page store directly; the checkpointer and
//! recovery drive all page traffic through the buffer cache.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{PageId, RowId};
