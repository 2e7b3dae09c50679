//! Byte-level layout of a record page.
//!
//! Header (12 bytes):
//! - bytes 0..8: page LSN (little endian), the LSN of the last record
//!   applied to this page. The write-ahead rule keys off this field.
//! - bytes 8..12: CRC32 of the slot region, sealed at flush time and
//!   verified at load. A stored value of 0 means "unchecksummed" (a page
//!   that was never flushed, or a hole zero-filled by file extension).
//!
//! Slot (256 bytes): 2-byte little-endian length followed by the record
//! bytes. Length 0 means the slot is empty (absent or deleted row).

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::record::Lsn;
use crate::storage::{PageId, PAGE_SIZE};

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 12;

/// Size of a record slot in bytes (2-byte length prefix included).
pub const SLOT_SIZE: usize = 256;

/// Largest record payload that fits in a slot.
pub const MAX_RECORD_SIZE: usize = SLOT_SIZE - 2;

const LSN_OFFSET: usize = 0;
const CRC_OFFSET: usize = 8;

/// Read the page LSN from a page image.
pub fn page_lsn(data: &[u8; PAGE_SIZE]) -> Lsn {
    Lsn(LittleEndian::read_u64(&data[LSN_OFFSET..LSN_OFFSET + 8]))
}

/// Set the page LSN on a page image.
pub fn set_page_lsn(data: &mut [u8; PAGE_SIZE], lsn: Lsn) {
    LittleEndian::write_u64(&mut data[LSN_OFFSET..LSN_OFFSET + 8], lsn.0);
}

fn slot_offset(slot: u16) -> usize {
    PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE
}

/// Read the record stored in a slot, if any.
pub fn read_slot(data: &[u8; PAGE_SIZE], slot: u16) -> Option<&[u8]> {
    let offset = slot_offset(slot);
    let len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
    if len == 0 {
        None
    } else {
        Some(&data[offset + 2..offset + 2 + len])
    }
}

/// Write a record into a slot, or clear the slot with `None`.
pub fn write_slot(data: &mut [u8; PAGE_SIZE], slot: u16, record: Option<&[u8]>) -> StorageResult<()> {
    let offset = slot_offset(slot);
    match record {
        Some(bytes) => {
            if bytes.len() > MAX_RECORD_SIZE {
                return Err(StorageError::RecordTooLarge {
                    size: bytes.len(),
                    max: MAX_RECORD_SIZE,
                });
            }
            LittleEndian::write_u16(&mut data[offset..offset + 2], bytes.len() as u16);
            data[offset + 2..offset + 2 + bytes.len()].copy_from_slice(bytes);
            // Zero the tail so slot images compare byte-for-byte.
            data[offset + 2 + bytes.len()..offset + SLOT_SIZE].fill(0);
        }
        None => {
            data[offset..offset + SLOT_SIZE].fill(0);
        }
    }
    Ok(())
}

fn checksum(data: &[u8; PAGE_SIZE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[PAGE_HEADER_SIZE..]);
    hasher.finalize()
}

/// Seal the slot-region checksum into a page image before it goes to disk.
pub fn seal(data: &mut [u8; PAGE_SIZE]) {
    let crc = checksum(data);
    LittleEndian::write_u32(&mut data[CRC_OFFSET..CRC_OFFSET + 4], crc);
}

/// Verify the stored checksum of a page image loaded from disk.
pub fn verify(data: &[u8; PAGE_SIZE], page_id: PageId) -> StorageResult<()> {
    let stored = LittleEndian::read_u32(&data[CRC_OFFSET..CRC_OFFSET + 4]);
    if stored == 0 {
        return Ok(());
    }
    let computed = checksum(data);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "page {} checksum mismatch: stored {:#010x}, computed {:#010x}",
            page_id, stored, computed
        )));
    }
    Ok(())
}
