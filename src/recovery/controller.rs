//! Crash recovery.
//!
//! Recovery runs in three phases before the store accepts work:
//!
//! 1. **Scan**: locate the most recent checkpoint mark (via the locator
//!    file when it validates, a full log scan otherwise).
//! 2. **Redo**: replay every update past the mark whose LSN is newer than
//!    its page's LSN, collecting undo images per transaction and noting
//!    which transactions reached Commit.
//! 3. **Undo**: reverse, newest-first, every transaction that did not
//!    commit, including ones whose Abort record made it to the log, since
//!    redo just reapplied their updates. Undo writes before-images without
//!    lowering page LSNs, so running recovery twice converges on the same
//!    state.
//!
//! Afterwards the row version chains are rebuilt from the page store and a
//! fresh checkpoint is cut, so the next recovery starts from here.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::concurrency::MvccManager;
use crate::recovery::checkpoint::{self, CheckpointManager};
use crate::storage::page::{record_page, row_at, SLOTS_PER_PAGE};
use crate::storage::wal::record::{CheckpointPayload, UndoImage};
use crate::storage::wal::{Lsn, WalCursor, WalManager, WalPayload};
use crate::storage::{BufferPoolManager, StorageError};
use crate::transaction::{TransactionId, TransactionManager};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What recovery did, reported once at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Update records reapplied during redo.
    pub records_replayed: usize,
    /// Transactions rolled back during undo.
    pub transactions_rolled_back: usize,
}

/// Drives the recovery phases at open.
pub struct RecoveryController {
    wal: Arc<WalManager>,
    buffer: BufferPoolManager,
    txns: Arc<TransactionManager>,
    mvcc: Arc<MvccManager>,
}

impl RecoveryController {
    pub fn new(
        wal: Arc<WalManager>,
        buffer: BufferPoolManager,
        txns: Arc<TransactionManager>,
        mvcc: Arc<MvccManager>,
    ) -> Self {
        Self {
            wal,
            buffer,
            txns,
            mvcc,
        }
    }

    /// Run full recovery and cut a fresh checkpoint.
    pub fn recover(&self, checkpoints: &CheckpointManager) -> Result<RecoveryReport, RecoveryError> {
        let (mark, cursor) = self.locate_mark(checkpoints.dir())?;

        // Seed undo state from the mark: transactions active at the
        // checkpoint carry their pre-mark undo images inside it.
        let mut undo_map: HashMap<TransactionId, Vec<UndoImage>> = HashMap::new();
        let mut committed: Vec<TransactionId> = Vec::new();
        let mut max_seen = TransactionId::BOOTSTRAP;
        if let Some(mark) = &mark {
            for active in &mark.active {
                undo_map.insert(active.transaction_id, active.undo.clone());
                max_seen = max_seen.max(active.transaction_id);
            }
        }

        let replayed = self.redo(cursor, &mut undo_map, &mut committed, &mut max_seen)?;

        for id in &committed {
            undo_map.remove(id);
        }
        let rolled_back = undo_map.len();
        self.undo(undo_map)?;

        // Flush before rebuilding: redone pages may exist only in the
        // buffer cache, and the rebuild walks the page store's extent.
        self.buffer.flush_all()?;
        self.rebuild_versions()?;
        self.txns.restore_counters(max_seen);
        checkpoints.run_checkpoint()?;

        let report = RecoveryReport {
            records_replayed: replayed,
            transactions_rolled_back: rolled_back,
        };
        log::info!(
            "recovery complete: {} records replayed, {} transactions rolled back",
            report.records_replayed,
            report.transactions_rolled_back
        );
        Ok(report)
    }

    /// Find the newest checkpoint mark and a cursor positioned just past
    /// it. Tries the locator file first and verifies it against the log; on
    /// any mismatch, falls back to scanning the whole log.
    fn locate_mark(
        &self,
        dir: &std::path::Path,
    ) -> Result<(Option<CheckpointPayload>, WalCursor), RecoveryError> {
        if let Some((mark_lsn, offset)) = checkpoint::read_meta(dir) {
            let mut cursor = self.wal.cursor_at(offset)?;
            if let Some(Ok(record)) = cursor.next() {
                if record.header.lsn == mark_lsn {
                    if let WalPayload::Checkpoint(payload) = record.payload {
                        log::debug!("checkpoint mark located at lsn {} via locator", mark_lsn);
                        return Ok((Some(payload), cursor));
                    }
                }
            }
            log::warn!("checkpoint locator is stale, scanning the log");
        }

        let mut mark: Option<CheckpointPayload> = None;
        let mut mark_lsn = Lsn::INVALID;
        for record in self.wal.read_from(Lsn(1))? {
            let record = record?;
            if let WalPayload::Checkpoint(payload) = record.payload {
                mark_lsn = record.header.lsn;
                mark = Some(payload);
            }
        }

        let cursor = self.wal.read_from(mark_lsn.next())?;
        Ok((mark, cursor))
    }

    /// Reapply updates newer than their page, collecting undo images and
    /// transaction outcomes.
    fn redo(
        &self,
        cursor: WalCursor,
        undo_map: &mut HashMap<TransactionId, Vec<UndoImage>>,
        committed: &mut Vec<TransactionId>,
        max_seen: &mut TransactionId,
    ) -> Result<usize, RecoveryError> {
        let mut replayed = 0;

        for record in cursor {
            let record = record?;
            let txn = record.header.transaction_id;
            let lsn = record.header.lsn;
            *max_seen = (*max_seen).max(txn);

            match record.payload {
                WalPayload::Begin => {
                    undo_map.entry(txn).or_default();
                }
                WalPayload::Update(update) => {
                    undo_map.entry(txn).or_default().push(update.undo_image());

                    let mut page = self.buffer.fetch_page_write(update.page_id)?;
                    if lsn > record_page::page_lsn(&page) {
                        record_page::write_slot(
                            &mut page,
                            update.slot,
                            update.after_image.as_deref(),
                        )?;
                        record_page::set_page_lsn(&mut page, lsn);
                        replayed += 1;
                    }
                }
                WalPayload::Commit => {
                    committed.push(txn);
                }
                // Aborted transactions are undone like unfinished ones:
                // redo just reapplied their updates.
                WalPayload::Abort => {}
                WalPayload::Checkpoint(_) => {}
            }
        }

        Ok(replayed)
    }

    /// Restore before-images for every transaction that never committed.
    /// Page LSNs are left alone, so a repeated recovery redoes nothing and
    /// applies the same images again.
    fn undo(&self, undo_map: HashMap<TransactionId, Vec<UndoImage>>) -> Result<(), RecoveryError> {
        for (txn, images) in undo_map {
            if images.is_empty() {
                continue;
            }
            log::debug!("rolling back transaction {} ({} images)", txn, images.len());
            for image in images.iter().rev() {
                let mut page = self.buffer.fetch_page_write(image.page_id)?;
                record_page::write_slot(&mut page, image.slot, image.before_image.as_deref())?;
            }
        }
        Ok(())
    }

    /// Rebuild the version chains from the page store: every occupied slot
    /// becomes a single committed version owned by the bootstrap id.
    fn rebuild_versions(&self) -> Result<(), RecoveryError> {
        let num_pages = self.buffer.num_pages()?;
        for page_no in 0..num_pages {
            let page_id = crate::storage::PageId(page_no);
            let page = self.buffer.fetch_page(page_id)?;
            for slot in 0..SLOTS_PER_PAGE as u16 {
                if let Some(record) = record_page::read_slot(&page, slot) {
                    self.mvcc
                        .load_bootstrap(row_at(page_id, slot), Bytes::copy_from_slice(record));
                }
            }
        }
        Ok(())
    }
}
