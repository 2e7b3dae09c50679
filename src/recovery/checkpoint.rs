//! Checkpointing.
//!
//! A checkpoint flushes every dirty page, then appends a self-contained
//! mark to the log: replay after a crash starts at the mark because every
//! change before it has reached the page store, and the undo images of
//! transactions still active at the mark ride along inside it. The caller
//! quiesces writers for the duration, so the mark sees a stable world.
//!
//! The mark's file offset is mirrored into a small `checkpoint.meta` file
//! so recovery can seek straight to it. The file is advisory: it carries
//! its own checksum, and a missing or stale copy just means recovery scans
//! the log for the mark instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::storage::wal::record::CheckpointPayload;
use crate::storage::wal::{Lsn, WalManager, WalPayload};
use crate::storage::{BufferPoolManager, StorageError, StorageResult};
use crate::transaction::TransactionManager;

/// Locator file pointing at the most recent checkpoint mark.
pub const CHECKPOINT_META_NAME: &str = "checkpoint.meta";

/// When to cut checkpoints automatically.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Cut a checkpoint at least this often.
    pub interval: Duration,
    /// Never cut checkpoints closer together than this.
    pub min_interval: Duration,
    /// Cut early once the log has grown by this many bytes.
    pub log_growth_bytes: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(5),
            log_growth_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    mark_lsn: Lsn,
    offset: u64,
}

struct CheckpointState {
    last_mark_lsn: Lsn,
    last_run: Option<Instant>,
    log_size_at_last: u64,
}

/// Cuts checkpoints and maintains the locator file.
pub struct CheckpointManager {
    wal: Arc<WalManager>,
    buffer: BufferPoolManager,
    txns: Arc<TransactionManager>,
    dir: PathBuf,
    meta_path: PathBuf,
    config: CheckpointConfig,
    state: Mutex<CheckpointState>,
}

impl CheckpointManager {
    pub fn new(
        wal: Arc<WalManager>,
        buffer: BufferPoolManager,
        txns: Arc<TransactionManager>,
        dir: &Path,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            wal,
            buffer,
            txns,
            dir: dir.to_path_buf(),
            meta_path: dir.join(CHECKPOINT_META_NAME),
            config,
            state: Mutex::new(CheckpointState {
                last_mark_lsn: Lsn::INVALID,
                last_run: None,
                log_size_at_last: 0,
            }),
        }
    }

    /// Whether the interval or log-growth trigger has fired. The caller
    /// still decides when it is safe to quiesce writers and run.
    pub fn should_run(&self) -> bool {
        let state = self.state.lock().unwrap();
        let elapsed = match state.last_run {
            Some(at) => at.elapsed(),
            None => return true,
        };
        if elapsed < self.config.min_interval {
            return false;
        }
        if elapsed >= self.config.interval {
            return true;
        }
        self.wal.log_size().saturating_sub(state.log_size_at_last) >= self.config.log_growth_bytes
    }

    /// Cut a checkpoint. Writers must be quiesced by the caller; readers
    /// may continue.
    pub fn run_checkpoint(&self) -> StorageResult<Lsn> {
        let checkpoint_lsn = self.wal.current_lsn();
        let active = self.txns.active_undo();
        let flushed_pages = self.buffer.flush_dirty(|_| true)?;

        let payload = CheckpointPayload {
            checkpoint_lsn,
            flushed_pages,
            active,
        };
        let active_count = payload.active.len();
        let flushed_count = payload.flushed_pages.len();
        let (mark_lsn, offset) = self.wal.append_checkpoint(WalPayload::Checkpoint(payload))?;

        // The locator is advisory; a failed write only costs a log scan at
        // the next recovery.
        if let Err(e) = write_meta(&self.meta_path, mark_lsn, offset) {
            log::warn!("failed to write checkpoint locator: {}", e);
        }

        let mut state = self.state.lock().unwrap();
        state.last_mark_lsn = mark_lsn;
        state.last_run = Some(Instant::now());
        state.log_size_at_last = self.wal.log_size();

        log::info!(
            "checkpoint at lsn {} (offset {}): {} pages flushed, {} active transactions",
            mark_lsn,
            offset,
            flushed_count,
            active_count
        );
        Ok(mark_lsn)
    }

    pub fn last_mark_lsn(&self) -> Lsn {
        self.state.lock().unwrap().last_mark_lsn
    }

    /// Directory holding the log and the locator file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn write_meta(path: &Path, mark_lsn: Lsn, offset: u64) -> StorageResult<()> {
    let body = bincode::serialize(&CheckpointMeta { mark_lsn, offset })
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut bytes = body;
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());

    let tmp = path.with_extension("meta.tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the checkpoint locator, returning the mark's LSN and file offset.
/// Any corruption or absence yields `None`; recovery falls back to a scan.
pub fn read_meta(dir: &Path) -> Option<(Lsn, u64)> {
    let bytes = fs::read(dir.join(CHECKPOINT_META_NAME)).ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32fast::hash(body) != stored {
        return None;
    }
    let meta: CheckpointMeta = bincode::deserialize(body).ok()?;
    Some((meta.mark_lsn, meta.offset))
}
