//! Row version chains.
//!
//! Each row maps to a chain of versions ordered newest-first. Versions are
//! stored arena-style in a Vec and linked by index, with a head pointer;
//! removing versions moves pointers, and vacuum compacts the arena.

use bytes::Bytes;

use crate::transaction::TransactionId;

/// One version of a row.
#[derive(Debug, Clone)]
pub struct RecordVersion {
    /// Record payload of this version.
    pub data: Bytes,
    /// Transaction that wrote this version.
    pub created_by: TransactionId,
    /// Transaction that deleted the row at this version, if any.
    pub deleted_by: Option<TransactionId>,
    /// Index of the next-older version.
    next: Option<usize>,
}

/// Version chain for a single row, newest-first.
#[derive(Debug, Default)]
pub struct VersionChain {
    versions: Vec<RecordVersion>,
    head: Option<usize>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a new version as the chain head.
    pub fn push_head(&mut self, data: Bytes, created_by: TransactionId) {
        let idx = self.versions.len();
        self.versions.push(RecordVersion {
            data,
            created_by,
            deleted_by: None,
            next: self.head,
        });
        self.head = Some(idx);
    }

    pub fn head(&self) -> Option<&RecordVersion> {
        self.head.map(|idx| &self.versions[idx])
    }

    pub fn head_mut(&mut self) -> Option<&mut RecordVersion> {
        self.head.map(move |idx| &mut self.versions[idx])
    }

    /// Iterate versions newest-first.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.head,
        }
    }

    /// Number of versions reachable from the head.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Remove every version created by `txn` and clear its delete stamps.
    /// Used on abort; the row lock guarantees the transaction's versions
    /// sit contiguously at the head.
    pub fn purge_creator(&mut self, txn: TransactionId) -> usize {
        let mut removed = 0;
        while let Some(idx) = self.head {
            if self.versions[idx].created_by != txn {
                break;
            }
            self.head = self.versions[idx].next;
            removed += 1;
        }

        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if self.versions[idx].deleted_by == Some(txn) {
                self.versions[idx].deleted_by = None;
            }
            cursor = self.versions[idx].next;
        }

        removed
    }

    /// Keep only the newest `keep` versions and compact the arena.
    /// Returns the number of versions dropped.
    pub fn truncate_after(&mut self, keep: usize) -> usize {
        let live: Vec<RecordVersion> = self.iter().cloned().collect();
        let dropped = live.len().saturating_sub(keep);
        if dropped == 0 && live.len() == self.versions.len() {
            return 0;
        }

        self.versions.clear();
        self.head = None;
        for version in live.into_iter().take(keep).rev() {
            let idx = self.versions.len();
            self.versions.push(RecordVersion {
                next: self.head,
                ..version
            });
            self.head = Some(idx);
        }
        dropped
    }

    /// Drop the whole chain.
    pub fn clear(&mut self) -> usize {
        let live = self.len();
        self.versions.clear();
        self.head = None;
        live
    }
}

pub struct ChainIter<'a> {
    chain: &'a VersionChain,
    next: Option<usize>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a RecordVersion;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let version = &self.chain.versions[idx];
        self.next = version.next;
        Some(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_head_orders_newest_first() {
        let mut chain = VersionChain::new();
        chain.push_head(Bytes::from_static(b"v1"), TransactionId(1));
        chain.push_head(Bytes::from_static(b"v2"), TransactionId(2));

        let datas: Vec<&[u8]> = chain.iter().map(|v| v.data.as_ref()).collect();
        assert_eq!(datas, vec![&b"v2"[..], &b"v1"[..]]);
        assert_eq!(chain.head().unwrap().created_by, TransactionId(2));
    }

    #[test]
    fn test_purge_creator_removes_head_run() {
        let mut chain = VersionChain::new();
        chain.push_head(Bytes::from_static(b"committed"), TransactionId(1));
        chain.push_head(Bytes::from_static(b"mine-a"), TransactionId(2));
        chain.push_head(Bytes::from_static(b"mine-b"), TransactionId(2));

        let removed = chain.purge_creator(TransactionId(2));
        assert_eq!(removed, 2);
        assert_eq!(chain.head().unwrap().created_by, TransactionId(1));
    }

    #[test]
    fn test_purge_creator_clears_delete_stamp() {
        let mut chain = VersionChain::new();
        chain.push_head(Bytes::from_static(b"row"), TransactionId(1));
        chain.head_mut().unwrap().deleted_by = Some(TransactionId(2));

        chain.purge_creator(TransactionId(2));
        assert_eq!(chain.head().unwrap().deleted_by, None);
    }

    #[test]
    fn test_truncate_after_compacts() {
        let mut chain = VersionChain::new();
        for i in 1..=4u64 {
            chain.push_head(Bytes::from(format!("v{}", i)), TransactionId(i));
        }

        let dropped = chain.truncate_after(2);
        assert_eq!(dropped, 2);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.head().unwrap().data.as_ref(), b"v4");

        let datas: Vec<&[u8]> = chain.iter().map(|v| v.data.as_ref()).collect();
        assert_eq!(datas, vec![&b"v4"[..], &b"v3"[..]]);
    }

    #[test]
    fn test_clear() {
        let mut chain = VersionChain::new();
        chain.push_head(Bytes::from_static(b"v"), TransactionId(1));
        assert_eq!(chain.clear(), 1);
        assert!(chain.is_empty());
    }
}
