//! Buffer cache over the page store.
//!
//! Pages are pinned through RAII guards; unpinned frames are eviction
//! candidates in the replacer. Each frame carries its own latch: any number
//! of read guards can share a page, but only one write guard is live at a
//! time, so slot mutations never alias. Every path that writes a dirty
//! page to the page store (explicit flush, checkpoint flush, eviction)
//! first forces the WAL to durability up to that page's LSN. That single
//! rule is the write-ahead invariant: no page image can reach disk
//! describing an effect whose log record is not durable.

pub mod lru;
pub mod replacer;

use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::record_page;
use crate::storage::wal::WalManager;
use crate::storage::{PageId, PageManager, PAGE_SIZE};

type PageImage = Box<[u8; PAGE_SIZE]>;

pub struct Frame {
    /// The page image behind its own latch. Guards hold this latch for
    /// their whole lifetime, keeping page mutation single-writer.
    data: Arc<RwLock<PageImage>>,
    page_id: Option<PageId>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            page_id: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count.store(0, Ordering::SeqCst);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.data.write().fill(0);
    }
}

#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    page_manager: Mutex<PageManager>,
    wal: Arc<WalManager>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

impl BufferPoolManager {
    pub fn new(
        page_manager: PageManager,
        wal: Arc<WalManager>,
        replacer: Box<dyn Replacer>,
        max_frames: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                page_manager: Mutex::new(page_manager),
                wal,
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    /// Pin a page for reading. The page must exist in the page store.
    /// Blocks while a writer holds the page's latch.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let (frame_id, data) = match self.pin_existing(page_id, false) {
            Some(pinned) => pinned,
            None => self.load_page(page_id, false, false)?,
        };

        // The latch is taken with no pool locks held; the pin keeps the
        // frame from being recycled while we wait.
        let data = data.read_arc();
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Pin a page for writing, marking its frame dirty. A page that does
    /// not exist in the page store yet is materialized as zeroes. Blocks
    /// until no other guard holds the page.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let (frame_id, data) = match self.pin_existing(page_id, true) {
            Some(pinned) => pinned,
            None => self.load_page(page_id, true, true)?,
        };

        let data = data.write_arc();
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            data,
        })
    }

    /// Pin the frame currently holding `page_id`, if any. The mapping is
    /// re-verified under the frames lock, so a frame an evictor recycled
    /// between the table lookup and the pin is not trusted.
    fn pin_existing(&self, page_id: PageId, dirty: bool) -> Option<(FrameId, Arc<RwLock<PageImage>>)> {
        let frame_id = self.inner.page_table.get(&page_id).map(|e| *e.value())?;
        let frames = self.inner.frames.read();
        let frame = frames.get(&frame_id)?;
        if frame.page_id != Some(page_id) {
            return None;
        }

        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        if dirty {
            frame.is_dirty.store(true, Ordering::SeqCst);
        }
        self.inner.replacer.lock().pin(frame_id);
        Some((frame_id, frame.data.clone()))
    }

    /// Load a page from disk into a free frame. `allow_missing` zero-fills
    /// pages beyond the end of the store instead of failing.
    fn load_page(
        &self,
        page_id: PageId,
        dirty: bool,
        allow_missing: bool,
    ) -> StorageResult<(FrameId, Arc<RwLock<PageImage>>)> {
        let frame_id = self.acquire_frame()?;

        let mut page_manager = self.inner.page_manager.lock();
        let mut frames = self.inner.frames.write();

        // A concurrent loader may have brought the page in while we were
        // acquiring a frame; reuse its frame and hand ours back.
        if let Some(existing) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            if let Some(frame) = frames.get(&existing) {
                if frame.page_id == Some(page_id) {
                    frame.pin_count.fetch_add(1, Ordering::SeqCst);
                    if dirty {
                        frame.is_dirty.store(true, Ordering::SeqCst);
                    }
                    let data = frame.data.clone();
                    let mut replacer = self.inner.replacer.lock();
                    replacer.pin(existing);
                    replacer.unpin(frame_id);
                    return Ok((existing, data));
                }
            }
        }

        let frame = frames.get_mut(&frame_id).expect("frame just acquired");
        let loaded = {
            let mut image = frame.data.write();
            match page_manager.read_page(page_id, &mut image[..]) {
                Ok(()) => record_page::verify(&image, page_id),
                Err(StorageError::PageNotFound(_)) if allow_missing => {
                    image.fill(0);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = loaded {
            frame.reset();
            self.inner.replacer.lock().unpin(frame_id);
            return Err(e);
        }

        frame.page_id = Some(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(dirty, Ordering::SeqCst);
        let data = frame.data.clone();

        self.inner.page_table.insert(page_id, frame_id);
        self.inner.replacer.lock().pin(frame_id);

        Ok((frame_id, data))
    }

    /// Flush one page if dirty, honoring the write-ahead rule.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let image = {
            let frames = self.inner.frames.read();
            let frame_id = match self.inner.page_table.get(&page_id).map(|e| *e.value()) {
                Some(id) => id,
                None => return Ok(()),
            };
            match frames.get(&frame_id) {
                Some(frame)
                    if frame.page_id == Some(page_id)
                        && frame.is_dirty.load(Ordering::SeqCst) =>
                {
                    frame.data.read().clone()
                }
                _ => return Ok(()),
            }
        };

        self.write_out(page_id, image)?;

        // Clear the dirty bit only after the write succeeded.
        if let Some(frame_id) = self.inner.page_table.get(&page_id).map(|e| *e.value()) {
            let frames = self.inner.frames.read();
            if let Some(frame) = frames.get(&frame_id) {
                frame.is_dirty.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Flush every dirty page matching `predicate`. Returns the pages
    /// written. Used by the checkpointer (`|_| true`).
    pub fn flush_dirty(&self, predicate: impl Fn(PageId) -> bool) -> StorageResult<Vec<PageId>> {
        let dirty: Vec<PageId> = {
            let frames = self.inner.frames.read();
            frames
                .values()
                .filter_map(|frame| frame.page_id)
                .filter(|page_id| predicate(*page_id))
                .collect()
        };

        let mut flushed = Vec::new();
        for page_id in dirty {
            let was_dirty = {
                let frames = self.inner.frames.read();
                self.inner
                    .page_table
                    .get(&page_id)
                    .map(|e| *e.value())
                    .and_then(|frame_id| frames.get(&frame_id))
                    .map(|frame| frame.is_dirty.load(Ordering::SeqCst))
                    .unwrap_or(false)
            };
            if was_dirty {
                self.flush_page(page_id)?;
                flushed.push(page_id);
            }
        }
        Ok(flushed)
    }

    /// Flush everything dirty.
    pub fn flush_all(&self) -> StorageResult<()> {
        self.flush_dirty(|_| true)?;
        Ok(())
    }

    /// Number of pages in the page store.
    pub fn num_pages(&self) -> StorageResult<u32> {
        self.inner.page_manager.lock().num_pages()
    }

    /// Seal the checksum and write a page image out, WAL first.
    fn write_out(&self, page_id: PageId, mut image: PageImage) -> StorageResult<()> {
        let page_lsn = record_page::page_lsn(image.as_ref());
        if !page_lsn.is_invalid() {
            self.inner.wal.flush(page_lsn)?;
        }
        record_page::seal(image.as_mut());
        self.inner.page_manager.lock().write_page(page_id, image.as_ref())
    }

    fn acquire_frame(&self) -> StorageResult<FrameId> {
        {
            let frames = self.inner.frames.read();
            if frames.len() < self.inner.max_frames {
                drop(frames);
                let mut frames = self.inner.frames.write();
                // Double-check after acquiring write lock
                if frames.len() < self.inner.max_frames {
                    let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                    frames.insert(frame_id, Frame::new());
                    return Ok(frame_id);
                }
            }
        }

        // The replacer only offers unpinned frames, but a concurrent fetch
        // can re-pin a victim between the replacer's choice and our claim,
        // so the pin count is re-checked under the frames write lock.
        loop {
            let victim = {
                let mut replacer = self.inner.replacer.lock();
                replacer.evict().ok_or(StorageError::BufferPoolFull)?
            };

            let flush = {
                let mut frames = self.inner.frames.write();
                let frame = match frames.get_mut(&victim) {
                    Some(frame) => frame,
                    None => return Ok(victim),
                };
                if frame.pin_count.load(Ordering::SeqCst) != 0 {
                    // Re-pinned since the replacer chose it; it becomes a
                    // candidate again once the pin drops.
                    continue;
                }

                // Claim the frame: with the table entry gone and the pin
                // count at zero, no fetch can reach it anymore.
                let old_page_id = frame.page_id.take();
                if let Some(page_id) = old_page_id {
                    self.inner.page_table.remove(&page_id);
                }
                let image = if frame.is_dirty.load(Ordering::SeqCst) {
                    old_page_id.map(|page_id| (page_id, frame.data.read().clone()))
                } else {
                    None
                };
                frame.reset();
                image
            };

            // Evicting a dirty page writes it out, WAL first (without
            // holding the frames lock).
            if let Some((page_id, image)) = flush {
                self.write_out(page_id, image)?;
            }

            return Ok(victim);
        }
    }
}

pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: ArcRwLockReadGuard<parking_lot::RawRwLock, PageImage>,
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id);
    }
}

pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    data: ArcRwLockWriteGuard<parking_lot::RawRwLock, PageImage>,
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        unpin_frame(&self.inner, self.frame_id);
    }
}

fn unpin_frame(inner: &Arc<BufferPoolInner>, frame_id: FrameId) {
    let should_unpin = {
        let frames = inner.frames.read();
        if let Some(frame) = frames.get(&frame_id) {
            frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1
        } else {
            false
        }
    };

    if should_unpin {
        inner.replacer.lock().unpin(frame_id);
    }
}
