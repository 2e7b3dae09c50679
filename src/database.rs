//! The engine facade.
//!
//! `Database::open` wires the WAL, page store, buffer cache, transaction
//! registry, and version manager together, runs crash recovery, and only
//! then accepts work. Commit is the sole durability point: it flushes the
//! log through the Commit record before reporting success, so anything a
//! committed transaction wrote survives a crash, and anything an
//! uncommitted one wrote is rolled back at the next open.
//!
//! A fatal storage error (I/O failure, corruption) latches the engine into
//! a halted state: new transactions and writes are refused, while reads of
//! already-committed data keep working from memory.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::concurrency::mvcc::MvccConfig;
use crate::concurrency::{ConcurrencyError, ConflictPolicy, MvccManager, Snapshot};
use crate::recovery::{
    CheckpointConfig, CheckpointManager, RecoveryController, RecoveryError, RecoveryReport,
};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::page::{locate, record_page};
use crate::storage::wal::manager::WAL_FILE_NAME;
use crate::storage::wal::record::UpdatePayload;
use crate::storage::wal::{Lsn, WalConfig, WalManager, WalPayload};
use crate::storage::{
    BufferPoolManager, PageManager, RowId, StorageError, StorageResult,
};
use crate::transaction::{TransactionError, TransactionId, TransactionManager};

/// File holding the page store.
pub const DATA_FILE_NAME: &str = "data.db";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("engine is halted after a fatal storage error")]
    Halted,
}

impl EngineError {
    /// Whether the error left the transaction usable. Conflicts, lock
    /// timeouts, and oversized records are recoverable; the caller may
    /// retry in a new transaction or abort.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Concurrency(_) => true,
            EngineError::Storage(e) => !e.is_fatal(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine configuration. Everything but the directory has a default.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the page store, log, and checkpoint locator.
    pub dir: PathBuf,
    /// Buffer cache capacity in pages.
    pub pool_size: usize,
    /// Whether commit fsyncs the log. Turning this off trades the
    /// durability of the most recent commits for throughput.
    pub sync_on_commit: bool,
    pub lock_wait_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    pub checkpoint: CheckpointConfig,
}

impl DatabaseConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pool_size: 256,
            sync_on_commit: true,
            lock_wait_timeout: Duration::from_secs(5),
            conflict_policy: ConflictPolicy::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// A single-node durable, versioned record store.
pub struct Database {
    wal: Arc<WalManager>,
    buffer: BufferPoolManager,
    txns: Arc<TransactionManager>,
    mvcc: Arc<MvccManager>,
    checkpoints: CheckpointManager,
    /// Writers hold this shared; the checkpointer takes it exclusively to
    /// quiesce them. Readers never touch it.
    checkpoint_latch: parking_lot::RwLock<()>,
    halted: AtomicBool,
    recovery_report: RecoveryReport,
}

impl Database {
    /// Open (or create) the store at `config.dir`, running crash recovery
    /// before any transaction is admitted.
    pub fn open(config: DatabaseConfig) -> EngineResult<Self> {
        fs::create_dir_all(&config.dir).map_err(StorageError::Io)?;

        let wal_config = WalConfig {
            dir: config.dir.clone(),
            sync_on_commit: config.sync_on_commit,
        };
        let wal = Arc::new(if config.dir.join(WAL_FILE_NAME).exists() {
            WalManager::open(wal_config)?
        } else {
            WalManager::create(wal_config)?
        });

        let data_path = config.dir.join(DATA_FILE_NAME);
        let page_manager = if data_path.exists() {
            PageManager::open(&data_path)?
        } else {
            PageManager::create(&data_path)?
        };

        let buffer = BufferPoolManager::new(
            page_manager,
            wal.clone(),
            Box::new(LruReplacer::new(config.pool_size)),
            config.pool_size,
        );
        let txns = Arc::new(TransactionManager::new());
        let mvcc = Arc::new(MvccManager::new(
            txns.clone(),
            MvccConfig {
                lock_wait_timeout: config.lock_wait_timeout,
                conflict_policy: config.conflict_policy,
            },
        ));
        let checkpoints = CheckpointManager::new(
            wal.clone(),
            buffer.clone(),
            txns.clone(),
            &config.dir,
            config.checkpoint.clone(),
        );

        let recovery =
            RecoveryController::new(wal.clone(), buffer.clone(), txns.clone(), mvcc.clone());
        let recovery_report = recovery.recover(&checkpoints)?;

        Ok(Self {
            wal,
            buffer,
            txns,
            mvcc,
            checkpoints,
            checkpoint_latch: parking_lot::RwLock::new(()),
            halted: AtomicBool::new(false),
            recovery_report,
        })
    }

    /// What recovery did at open.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery_report
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.wal.is_halted()
    }

    /// Begin a transaction, capturing its snapshot.
    pub fn begin(&self) -> EngineResult<TransactionId> {
        self.check_halted()?;
        let (id, _snapshot) = self.txns.begin();
        let lsn = self.fatal(self.wal.append(Lsn::INVALID, id, WalPayload::Begin))?;
        self.txns.set_first_lsn(id, lsn)?;
        log::debug!("transaction {} began at lsn {}", id, lsn);
        Ok(id)
    }

    /// Write (insert or overwrite) a record inside a transaction. The
    /// change is logged and visible to this transaction immediately; other
    /// transactions see it only after commit.
    pub fn write(&self, txn: TransactionId, row_id: RowId, data: &[u8]) -> EngineResult<()> {
        self.check_halted()?;
        if data.len() > record_page::MAX_RECORD_SIZE {
            return Err(EngineError::Storage(StorageError::RecordTooLarge {
                size: data.len(),
                max: record_page::MAX_RECORD_SIZE,
            }));
        }

        let (page_id, slot) = locate(row_id)?;
        let snapshot = self.txns.snapshot(txn)?;
        let _quiesce = self.checkpoint_latch.read();
        self.mvcc.prepare_write(txn, &snapshot, row_id, false)?;

        let prev_lsn = self.txns.last_lsn(txn)?;
        let mut page = self.fatal(self.buffer.fetch_page_write(page_id))?;

        let payload = UpdatePayload {
            row_id,
            page_id,
            slot,
            before_image: record_page::read_slot(&page, slot).map(<[u8]>::to_vec),
            after_image: Some(data.to_vec()),
        };
        let undo = payload.undo_image();

        let lsn = self.fatal(self.wal.append(prev_lsn, txn, WalPayload::Update(payload)))?;
        record_page::write_slot(&mut page, slot, Some(data))?;
        record_page::set_page_lsn(&mut page, lsn);
        drop(page);

        self.mvcc.apply_write(row_id, Bytes::copy_from_slice(data), txn);
        self.txns.record_write(txn, row_id, undo, lsn)?;
        Ok(())
    }

    /// Delete a record inside a transaction. The row must exist in the
    /// transaction's snapshot.
    pub fn delete(&self, txn: TransactionId, row_id: RowId) -> EngineResult<()> {
        self.check_halted()?;

        let (page_id, slot) = locate(row_id)?;
        let snapshot = self.txns.snapshot(txn)?;
        let _quiesce = self.checkpoint_latch.read();
        self.mvcc.prepare_write(txn, &snapshot, row_id, true)?;

        let prev_lsn = self.txns.last_lsn(txn)?;
        let mut page = self.fatal(self.buffer.fetch_page_write(page_id))?;

        let payload = UpdatePayload {
            row_id,
            page_id,
            slot,
            before_image: record_page::read_slot(&page, slot).map(<[u8]>::to_vec),
            after_image: None,
        };
        let undo = payload.undo_image();

        let lsn = self.fatal(self.wal.append(prev_lsn, txn, WalPayload::Update(payload)))?;
        record_page::write_slot(&mut page, slot, None)?;
        record_page::set_page_lsn(&mut page, lsn);
        drop(page);

        self.mvcc.apply_delete(row_id, txn);
        self.txns.record_write(txn, row_id, undo, lsn)?;
        Ok(())
    }

    /// Read a record as of the transaction's snapshot, including the
    /// transaction's own uncommitted writes.
    pub fn read(&self, txn: TransactionId, row_id: RowId) -> EngineResult<Option<Bytes>> {
        let snapshot = self.txns.snapshot(txn)?;
        Ok(self.mvcc.read(row_id, &snapshot))
    }

    /// Read the latest committed value without a transaction. Keeps
    /// working after the engine halts, since it only touches memory.
    pub fn read_committed(&self, row_id: RowId) -> Option<Bytes> {
        let snapshot = Snapshot::latest(self.txns.last_committed());
        self.mvcc.read(row_id, &snapshot)
    }

    /// Commit: reserve the terminal transition, append the Commit record,
    /// flush the log through it, and only then report success. One
    /// caller's flush covers every record buffered behind it.
    pub fn commit(&self, txn: TransactionId) -> EngineResult<()> {
        self.check_halted()?;

        // The reservation comes first: a transaction that already reached
        // a terminal state must never get a durable Commit record, or
        // recovery would replay it as committed.
        let prev_lsn = self.txns.begin_commit(txn)?;

        // Held so a concurrent checkpoint cannot slip its mark between
        // this Commit record and the undo snapshot it embeds.
        let quiesce = self.checkpoint_latch.read();
        let lsn = self.fatal(self.wal.append(prev_lsn, txn, WalPayload::Commit))?;
        self.fatal(self.wal.flush(lsn))?;
        self.txns.mark_committed(txn)?;
        drop(quiesce);

        self.mvcc.release_locks(txn);
        log::debug!("transaction {} committed at lsn {}", txn, lsn);

        self.maybe_checkpoint();
        Ok(())
    }

    /// Abort: cut visibility, purge the transaction's versions, restore
    /// before-images in the buffer cache, and release its locks. The
    /// restores are not logged; recovery rolls back from the same images
    /// in the log, so every crash interleaving converges.
    pub fn abort(&self, txn: TransactionId) -> EngineResult<()> {
        let (undo, write_set) = self.txns.mark_aborted(txn)?;
        self.mvcc.purge_transaction(txn, &write_set);

        let _quiesce = self.checkpoint_latch.read();
        for image in undo.iter().rev() {
            let mut page = self.fatal(self.buffer.fetch_page_write(image.page_id))?;
            record_page::write_slot(&mut page, image.slot, image.before_image.as_deref())?;
        }
        drop(_quiesce);

        // Best-effort marker; an aborted transaction is rolled back at
        // recovery whether or not this record survives.
        if !self.wal.is_halted() {
            let prev_lsn = self.txns.last_lsn(txn)?;
            let _ = self.wal.append(prev_lsn, txn, WalPayload::Abort);
        }

        self.mvcc.release_locks(txn);
        log::debug!("transaction {} aborted", txn);
        Ok(())
    }

    /// Cut a checkpoint now, quiescing writers for the duration.
    pub fn checkpoint(&self) -> EngineResult<Lsn> {
        self.check_halted()?;
        let _quiesce = self.checkpoint_latch.write();
        let lsn = self.fatal(self.checkpoints.run_checkpoint())?;
        Ok(lsn)
    }

    /// Reclaim row versions no live snapshot can reference and prune
    /// terminated transactions from the registry. Returns the number of
    /// versions reclaimed.
    pub fn vacuum(&self) -> usize {
        let horizons = self.txns.active_snapshots();
        let latest = Snapshot::latest(self.txns.last_committed());
        let reclaimed = self.mvcc.vacuum(&horizons, &latest);
        let pruned = self.txns.prune_terminated(self.txns.watermark());
        log::debug!(
            "vacuum reclaimed {} versions, pruned {} transactions",
            reclaimed,
            pruned
        );
        reclaimed
    }

    fn maybe_checkpoint(&self) {
        if !self.checkpoints.should_run() {
            return;
        }
        if let Err(e) = self.checkpoint() {
            log::warn!("automatic checkpoint failed: {}", e);
        }
    }

    fn check_halted(&self) -> EngineResult<()> {
        if self.is_halted() {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    /// Wrap a storage result, latching the engine halted on fatal errors.
    fn fatal<T>(&self, result: StorageResult<T>) -> EngineResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_fatal() {
                    self.halted.store(true, Ordering::SeqCst);
                    log::error!("engine halted: {}", e);
                }
                Err(EngineError::Storage(e))
            }
        }
    }
}
