//! Page and row identifiers plus the fixed record-page geometry.
//!
//! Rows live in fixed 256-byte slots, 31 per page, behind a 12-byte page
//! header. The mapping from a row to its home page and slot is purely
//! arithmetic, which keeps redo and undo physical (byte images of one slot).

pub mod record_page;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PAGE_SIZE;
use record_page::{PAGE_HEADER_SIZE, SLOT_SIZE};

/// Identifier of a fixed-size page in the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a record in the dense row key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of record slots on a single page.
pub const SLOTS_PER_PAGE: u64 = ((PAGE_SIZE - PAGE_HEADER_SIZE) / SLOT_SIZE) as u64;

/// Locate a row's home page and slot. Row ids whose page index does not
/// fit in a `PageId` are rejected; truncating instead would alias two rows
/// onto one slot.
pub fn locate(row_id: RowId) -> StorageResult<(PageId, u16)> {
    let page = row_id.0 / SLOTS_PER_PAGE;
    if page > u32::MAX as u64 {
        return Err(StorageError::RowIdOutOfRange(row_id));
    }
    let slot = (row_id.0 % SLOTS_PER_PAGE) as u16;
    Ok((PageId(page as u32), slot))
}

/// Inverse of [`locate`]: the row stored at a given page and slot.
pub fn row_at(page_id: PageId, slot: u16) -> RowId {
    RowId(page_id.0 as u64 * SLOTS_PER_PAGE + slot as u64)
}
