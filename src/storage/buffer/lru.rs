use super::replacer::{FrameId, Replacer};
use std::collections::{HashSet, VecDeque};

/// LRU replacer with lazy deletion: pin leaves stale queue entries behind
/// and membership is tracked in a set, so pin/unpin stay O(1) and stale
/// entries are skipped at eviction time.
#[derive(Debug)]
pub struct LruReplacer {
    /// Candidate queue, least recently unpinned at the front. May contain
    /// entries whose frames were re-pinned since.
    queue: VecDeque<FrameId>,
    /// Frames currently evictable.
    evictable: HashSet<FrameId>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            evictable: HashSet::with_capacity(capacity),
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        while let Some(frame_id) = self.queue.pop_front() {
            if self.evictable.remove(&frame_id) {
                return Some(frame_id);
            }
        }
        None
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.evictable.remove(&frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.evictable.insert(frame_id) {
            self.queue.push_back(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.evictable.len()
    }
}
