//! WAL manager implementation.
//!
//! The log is a single append-only file of frames, each frame being a
//! 4-byte length, a 4-byte CRC32 of the body, and the bincode-encoded
//! record. `append` assigns LSNs and buffers frames under one lock, so
//! records reach the file in LSN order; `flush` is the durability boundary
//! and serves group commit (one flush covers every buffered record).
//!
//! Any I/O failure latches the manager into a halted state: later appends
//! and flushes fail with `WalHalted` and the engine stops accepting work.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::record::{Lsn, WalPayload, WalRecord};
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::TransactionId;

/// Size of the WAL buffer in bytes (1MB).
const WAL_BUFFER_SIZE: usize = 1024 * 1024;

/// Frame header: 4-byte body length + 4-byte body CRC32.
const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single record body; larger lengths in a frame header
/// are treated as a corrupt tail.
const MAX_RECORD_BODY: u32 = 16 * 1024 * 1024;

/// WAL file name inside the engine directory.
pub const WAL_FILE_NAME: &str = "wal.log";

/// WAL manager configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the log file.
    pub dir: PathBuf,
    /// Whether flush fsyncs. Disabled only in tests that do not exercise
    /// durability.
    pub sync_on_commit: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            dir: PathBuf::from("."),
            sync_on_commit: true,
        }
    }
}

struct WalInner {
    file: File,
    /// Durable length of the file (frames written out, not necessarily synced).
    file_len: u64,
    /// Frames appended but not yet written to the file.
    buffer: Vec<u8>,
    /// Highest LSN sitting in the buffer; invalid when the buffer is empty.
    last_buffered: Lsn,
    /// Next LSN to assign.
    next_lsn: Lsn,
}

/// WAL manager for a single append-only log file.
pub struct WalManager {
    config: WalConfig,
    path: PathBuf,
    inner: Mutex<WalInner>,
    /// Last assigned LSN, readable without the inner lock.
    current_lsn: AtomicU64,
    /// All records up to this LSN have been written out (and synced when
    /// `sync_on_commit` is set).
    flushed_lsn: AtomicU64,
    halted: AtomicBool,
}

impl WalManager {
    /// Create a fresh, empty log in `config.dir`.
    pub fn create(config: WalConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self::from_parts(config, path, file, 0, Lsn::INVALID))
    }

    /// Open an existing log, truncating a torn or corrupt tail. The next
    /// append continues the LSN sequence after the last valid record.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        let path = config.dir.join(WAL_FILE_NAME);
        let (last_lsn, valid_len) = Self::scan_tail(&path)?;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(valid_len)?;

        Ok(Self::from_parts(config, path, file, valid_len, last_lsn))
    }

    fn from_parts(
        config: WalConfig,
        path: PathBuf,
        mut file: File,
        file_len: u64,
        last_lsn: Lsn,
    ) -> Self {
        let _ = file.seek(SeekFrom::End(0));
        WalManager {
            config,
            path,
            inner: Mutex::new(WalInner {
                file,
                file_len,
                buffer: Vec::with_capacity(WAL_BUFFER_SIZE),
                last_buffered: Lsn::INVALID,
                next_lsn: last_lsn.next(),
            }),
            current_lsn: AtomicU64::new(last_lsn.0),
            flushed_lsn: AtomicU64::new(last_lsn.0),
            halted: AtomicBool::new(false),
        }
    }

    /// Scan the log and return the LSN of the last valid record and the
    /// byte length of the valid prefix. A torn or checksum-corrupt frame
    /// ends the log.
    fn scan_tail(path: &Path) -> StorageResult<(Lsn, u64)> {
        let mut cursor = WalCursor::open(path)?;
        let mut last_lsn = Lsn::INVALID;
        let mut valid_len = 0u64;
        while let Some(record) = cursor.next().transpose()? {
            last_lsn = record.header.lsn;
            valid_len = cursor.offset();
        }
        Ok((last_lsn, valid_len))
    }

    /// Last assigned LSN.
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.current_lsn.load(Ordering::SeqCst))
    }

    /// Highest LSN known to have reached the file.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Total log volume in bytes, buffered frames included. Drives the
    /// checkpoint log-growth trigger.
    pub fn log_size(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.file_len + inner.buffer.len() as u64
    }

    fn halted_error(&self) -> StorageError {
        StorageError::WalHalted {
            flushed: self.flushed_lsn(),
        }
    }

    fn halt_on<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if result.is_err() {
            self.halted.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Append a record, assigning its LSN. The record is buffered; it is
    /// not durable until a `flush` covering its LSN returns.
    pub fn append(
        &self,
        prev_lsn: Lsn,
        transaction_id: TransactionId,
        payload: WalPayload,
    ) -> StorageResult<Lsn> {
        if self.is_halted() {
            return Err(self.halted_error());
        }

        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        let record = WalRecord::new(lsn, prev_lsn, transaction_id, payload);
        let frame = encode_frame(&record)?;

        // A full buffer spills to the file without fsync; durability still
        // waits for an explicit flush.
        if inner.buffer.len() + frame.len() > WAL_BUFFER_SIZE {
            let result = Self::write_buffer(&mut inner);
            self.halt_on(result)?;
        }

        inner.buffer.extend_from_slice(&frame);
        inner.last_buffered = lsn;
        inner.next_lsn = lsn.next();
        self.current_lsn.store(lsn.0, Ordering::SeqCst);

        Ok(lsn)
    }

    /// Make every record up to (at least) `up_to` durable. A no-op when
    /// that prefix is already flushed, so group commit falls out: one
    /// caller's flush covers everyone buffered behind it.
    pub fn flush(&self, up_to: Lsn) -> StorageResult<()> {
        if self.flushed_lsn() >= up_to {
            return Ok(());
        }
        if self.is_halted() {
            return Err(self.halted_error());
        }

        let mut inner = self.inner.lock().unwrap();
        let flushed_to = if inner.buffer.is_empty() {
            Lsn(inner.next_lsn.0 - 1)
        } else {
            inner.last_buffered
        };

        let result = Self::write_buffer(&mut inner).and_then(|()| {
            if self.config.sync_on_commit {
                inner.file.sync_data()?;
            }
            Ok(())
        });
        self.halt_on(result)?;

        self.flushed_lsn.fetch_max(flushed_to.0, Ordering::SeqCst);
        Ok(())
    }

    fn write_buffer(inner: &mut WalInner) -> StorageResult<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        inner.file.write_all(&inner.buffer)?;
        inner.file_len += inner.buffer.len() as u64;
        inner.buffer.clear();
        inner.last_buffered = Lsn::INVALID;
        Ok(())
    }

    /// Append a checkpoint mark: flush everything buffered, write the mark
    /// frame, and fsync. Returns the mark's LSN and its file offset (fed to
    /// the checkpoint locator).
    pub fn append_checkpoint(&self, payload: WalPayload) -> StorageResult<(Lsn, u64)> {
        debug_assert!(matches!(payload, WalPayload::Checkpoint(_)));
        if self.is_halted() {
            return Err(self.halted_error());
        }

        let mut inner = self.inner.lock().unwrap();
        let result = Self::write_buffer(&mut inner);
        self.halt_on(result)?;

        let offset = inner.file_len;
        let lsn = inner.next_lsn;
        let record = WalRecord::new(lsn, Lsn::INVALID, TransactionId::BOOTSTRAP, payload);
        let frame = encode_frame(&record)?;

        let result = inner
            .file
            .write_all(&frame)
            .and_then(|()| inner.file.sync_data())
            .map_err(StorageError::Io);
        self.halt_on(result)?;

        inner.file_len += frame.len() as u64;
        inner.next_lsn = lsn.next();
        self.current_lsn.store(lsn.0, Ordering::SeqCst);
        self.flushed_lsn.store(lsn.0, Ordering::SeqCst);

        Ok((lsn, offset))
    }

    /// Cursor over the durable log starting at the first record with
    /// `lsn >= from`. Buffered records are written out first so the reader
    /// sees a complete prefix.
    pub fn read_from(&self, from: Lsn) -> StorageResult<WalCursor> {
        {
            let mut inner = self.inner.lock().unwrap();
            let result = Self::write_buffer(&mut inner);
            self.halt_on(result)?;
        }
        let mut cursor = WalCursor::open(&self.path)?;
        cursor.skip_until(from)?;
        Ok(cursor)
    }

    /// Cursor positioned at a known frame offset (from a checkpoint locator).
    pub fn cursor_at(&self, offset: u64) -> StorageResult<WalCursor> {
        WalCursor::from_offset(&self.path, offset)
    }
}

fn encode_frame(record: &WalRecord) -> StorageResult<Vec<u8>> {
    let body = record.serialize()?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Sequential reader over log frames.
///
/// A truncated frame, a checksum mismatch, or an undecodable body all end
/// the iteration cleanly: a torn tail is simply the end of the log.
pub struct WalCursor {
    reader: BufReader<File>,
    offset: u64,
    pending: Option<WalRecord>,
    done: bool,
}

impl WalCursor {
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::from_offset(path, 0)
    }

    pub fn from_offset(path: &Path, offset: u64) -> StorageResult<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(WalCursor {
            reader: BufReader::new(file),
            offset,
            pending: None,
            done: false,
        })
    }

    /// Byte offset just past the last frame read from the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Skip records with LSNs below `from`; the first record at or past it
    /// is held back and yielded by the next call.
    fn skip_until(&mut self, from: Lsn) -> StorageResult<()> {
        while let Some(record) = self.read_frame()? {
            if record.header.lsn >= from {
                self.pending = Some(record);
                break;
            }
        }
        Ok(())
    }

    fn read_frame(&mut self) -> StorageResult<Option<WalRecord>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        if self.done {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        if !read_exact_or_eof(&mut self.reader, &mut header)? {
            self.done = true;
            return Ok(None);
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 || len > MAX_RECORD_BODY {
            self.done = true;
            return Ok(None);
        }

        let mut body = vec![0u8; len as usize];
        if !read_exact_or_eof(&mut self.reader, &mut body)? {
            self.done = true;
            return Ok(None);
        }

        if crc32fast::hash(&body) != crc {
            self.done = true;
            return Ok(None);
        }

        let record = match WalRecord::deserialize(&body) {
            Ok(record) => record,
            Err(_) => {
                self.done = true;
                return Ok(None);
            }
        };

        self.offset += (FRAME_HEADER_SIZE + len as usize) as u64;
        Ok(Some(record))
    }
}

impl Iterator for WalCursor {
    type Item = StorageResult<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> StorageResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{PageId, RowId};
    use crate::storage::wal::record::UpdatePayload;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn test_manager(sync: bool) -> (WalManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_on_commit: sync,
        };
        let manager = WalManager::create(config).unwrap();
        (manager, temp_dir)
    }

    fn update_payload(row: u64, data: &[u8]) -> WalPayload {
        WalPayload::Update(UpdatePayload {
            row_id: RowId(row),
            page_id: PageId(0),
            slot: row as u16,
            before_image: None,
            after_image: Some(data.to_vec()),
        })
    }

    #[test]
    fn test_append_assigns_monotonic_lsns() {
        let (manager, _dir) = test_manager(false);

        let lsn1 = manager
            .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
            .unwrap();
        let lsn2 = manager
            .append(lsn1, TransactionId(1), update_payload(0, b"a"))
            .unwrap();
        let lsn3 = manager
            .append(lsn2, TransactionId(1), WalPayload::Commit)
            .unwrap();

        assert_eq!(lsn1, Lsn(1));
        assert_eq!(lsn2, Lsn(2));
        assert_eq!(lsn3, Lsn(3));
        assert_eq!(manager.current_lsn(), Lsn(3));
    }

    #[test]
    fn test_flush_advances_flushed_lsn() {
        let (manager, _dir) = test_manager(true);

        let lsn = manager
            .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
            .unwrap();
        assert_eq!(manager.flushed_lsn(), Lsn(0));

        manager.flush(lsn).unwrap();
        assert_eq!(manager.flushed_lsn(), lsn);

        // Already durable: no-op.
        manager.flush(lsn).unwrap();
        assert_eq!(manager.flushed_lsn(), lsn);
    }

    #[test]
    fn test_group_flush_covers_earlier_records() {
        let (manager, _dir) = test_manager(true);

        let mut last = Lsn::INVALID;
        for txn in 1..=5u64 {
            last = manager
                .append(Lsn::INVALID, TransactionId(txn), WalPayload::Begin)
                .unwrap();
        }

        manager.flush(last).unwrap();
        assert_eq!(manager.flushed_lsn(), last);
    }

    #[test]
    fn test_read_back_in_order() {
        let (manager, _dir) = test_manager(false);

        let lsn1 = manager
            .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
            .unwrap();
        let lsn2 = manager
            .append(lsn1, TransactionId(1), update_payload(3, b"payload"))
            .unwrap();
        manager.append(lsn2, TransactionId(1), WalPayload::Commit).unwrap();

        let records: Vec<WalRecord> = manager
            .read_from(Lsn(1))
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].header.lsn, Lsn(1));
        assert_eq!(records[1].header.lsn, Lsn(2));
        assert_eq!(records[2].header.lsn, Lsn(3));
        assert!(matches!(records[1].payload, WalPayload::Update(_)));
    }

    #[test]
    fn test_read_from_skips_prefix() {
        let (manager, _dir) = test_manager(false);

        for txn in 1..=4u64 {
            manager
                .append(Lsn::INVALID, TransactionId(txn), WalPayload::Begin)
                .unwrap();
        }

        let records: Vec<WalRecord> = manager
            .read_from(Lsn(3))
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].header.lsn, Lsn(3));
    }

    #[test]
    fn test_open_resumes_lsn_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_on_commit: false,
        };

        {
            let manager = WalManager::create(config.clone()).unwrap();
            let lsn = manager
                .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
                .unwrap();
            manager.flush(lsn).unwrap();
        }

        let manager = WalManager::open(config).unwrap();
        assert_eq!(manager.current_lsn(), Lsn(1));
        assert_eq!(manager.flushed_lsn(), Lsn(1));

        let lsn = manager
            .append(Lsn::INVALID, TransactionId(2), WalPayload::Begin)
            .unwrap();
        assert_eq!(lsn, Lsn(2));
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_on_commit: false,
        };

        {
            let manager = WalManager::create(config.clone()).unwrap();
            let lsn1 = manager
                .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
                .unwrap();
            let lsn2 = manager
                .append(lsn1, TransactionId(1), update_payload(0, b"keep"))
                .unwrap();
            manager.flush(lsn2).unwrap();
        }

        // Simulate a crash mid-append: a frame header with no body.
        let path = temp_dir.path().join(WAL_FILE_NAME);
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&0xdead_beefu32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let manager = WalManager::open(config).unwrap();
        assert_eq!(manager.current_lsn(), Lsn(2));

        let records: Vec<WalRecord> = manager
            .read_from(Lsn(1))
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_corrupt_record_ends_replay() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_on_commit: false,
        };

        let valid_end;
        {
            let manager = WalManager::create(config.clone()).unwrap();
            let lsn1 = manager
                .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
                .unwrap();
            let lsn2 = manager
                .append(lsn1, TransactionId(1), update_payload(0, b"good"))
                .unwrap();
            manager.flush(lsn2).unwrap();
            valid_end = manager.log_size();
        }

        // Append a full frame whose body does not match its checksum.
        let path = temp_dir.path().join(WAL_FILE_NAME);
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let body = vec![0xabu8; 32];
            file.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&1234u32.to_le_bytes()).unwrap();
            file.write_all(&body).unwrap();
        }

        let (last_lsn, len) = WalManager::scan_tail(&path).unwrap();
        assert_eq!(last_lsn, Lsn(2));
        assert_eq!(len, valid_end);
    }

    #[test]
    fn test_checkpoint_mark_offset() {
        let (manager, _dir) = test_manager(false);

        let lsn1 = manager
            .append(Lsn::INVALID, TransactionId(1), WalPayload::Begin)
            .unwrap();
        manager.flush(lsn1).unwrap();

        let payload = WalPayload::Checkpoint(crate::storage::wal::record::CheckpointPayload {
            checkpoint_lsn: manager.current_lsn(),
            flushed_pages: vec![],
            active: vec![],
        });
        let (mark_lsn, offset) = manager.append_checkpoint(payload).unwrap();
        assert_eq!(mark_lsn, Lsn(2));

        let record = manager
            .cursor_at(offset)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.header.lsn, mark_lsn);
        assert!(matches!(record.payload, WalPayload::Checkpoint(_)));
    }
}
