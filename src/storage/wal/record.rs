//! WAL record types.
//!
//! Every change to the store is described by one of five record kinds:
//! Begin, Update (a delete is an Update whose after-image is absent),
//! Commit, Abort, and Checkpoint. Records carry before- and after-images of
//! a single slot, so redo and undo are physical byte copies.

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, RowId};
use crate::transaction::TransactionId;

/// Log sequence number. Strictly increasing from 1; 0 is the invalid
/// sentinel used for "no previous record".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid sentinel LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// The next LSN in sequence.
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record kinds, in the order they appear in a transaction's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    Begin,
    Update,
    Commit,
    Abort,
    Checkpoint,
}

/// Common header carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalRecordHeader {
    /// Sequence number of this record.
    pub lsn: Lsn,
    /// Previous record of the same transaction (invalid for Begin).
    pub prev_lsn: Lsn,
    /// Owning transaction. Checkpoint records use the bootstrap id.
    pub transaction_id: TransactionId,
    /// Record kind.
    pub kind: WalRecordKind,
}

/// Physical image of one slot change.
///
/// `before_image`/`after_image` are the record bytes stored in the slot;
/// `None` means the slot is empty on that side of the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub row_id: RowId,
    pub page_id: PageId,
    pub slot: u16,
    pub before_image: Option<Vec<u8>>,
    pub after_image: Option<Vec<u8>>,
}

impl UpdatePayload {
    /// Whether this update removes the row.
    pub fn is_delete(&self) -> bool {
        self.after_image.is_none()
    }
}

/// Undo image saved for one update, applied in reverse on rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoImage {
    pub page_id: PageId,
    pub slot: u16,
    pub before_image: Option<Vec<u8>>,
}

impl UpdatePayload {
    /// The undo image for this update.
    pub fn undo_image(&self) -> UndoImage {
        UndoImage {
            page_id: self.page_id,
            slot: self.slot,
            before_image: self.before_image.clone(),
        }
    }
}

/// Undo state of one transaction still active when a checkpoint ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTxnUndo {
    pub transaction_id: TransactionId,
    pub undo: Vec<UndoImage>,
}

/// Checkpoint mark.
///
/// The mark is self-contained: replay can start at the mark because every
/// page dirtied before it was flushed first, and the undo images of
/// transactions still active at the mark ride along inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// LSN captured when the checkpoint began.
    pub checkpoint_lsn: Lsn,
    /// Pages flushed by this checkpoint.
    pub flushed_pages: Vec<PageId>,
    /// Transactions active at the mark, with their accumulated undo images.
    pub active: Vec<ActiveTxnUndo>,
}

/// Per-kind record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    Begin,
    Update(UpdatePayload),
    Commit,
    Abort,
    Checkpoint(CheckpointPayload),
}

impl WalPayload {
    pub fn kind(&self) -> WalRecordKind {
        match self {
            WalPayload::Begin => WalRecordKind::Begin,
            WalPayload::Update(_) => WalRecordKind::Update,
            WalPayload::Commit => WalRecordKind::Commit,
            WalPayload::Abort => WalRecordKind::Abort,
            WalPayload::Checkpoint(_) => WalRecordKind::Checkpoint,
        }
    }
}

/// A complete WAL record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: WalPayload,
}

impl WalRecord {
    pub fn new(
        lsn: Lsn,
        prev_lsn: Lsn,
        transaction_id: TransactionId,
        payload: WalPayload,
    ) -> Self {
        let header = WalRecordHeader {
            lsn,
            prev_lsn,
            transaction_id,
            kind: payload.kind(),
        };
        WalRecord { header, payload }
    }

    /// Whether this record must be reapplied to a page with the given LSN.
    pub fn needs_redo(&self, page_lsn: Lsn) -> bool {
        self.header.lsn > page_lsn
    }

    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}
