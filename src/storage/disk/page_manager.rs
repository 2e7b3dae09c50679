//! The page store: fixed-size blocks in a single file.
//!
//! Pages are only ever written through the buffer pool's flush and eviction
//! paths, which enforce the write-ahead rule before calling into here.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

pub const PAGE_SIZE: usize = 8192;

pub struct PageManager {
    file: File,
}

impl PageManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self { file })
    }

    /// Read a page into `buf`. A page beyond the end of the file returns
    /// `PageNotFound`, which the buffer pool treats as a fresh zero page.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    /// Write a page image and sync it to disk, extending the file if the
    /// page lies beyond the current end. Intervening pages read back as
    /// zeroes until they are written.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;

        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        self.file
            .set_len((current_pages as u64 + 1) * PAGE_SIZE as u64)?;

        Ok(new_page_id)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
