use linked_hash_map::LinkedHashMap;
use crate::common::types::FrameId;

/// LRU (Least Recently Used) frame replacement policy.
///
/// Tracks the frames that are currently evictable, ordered by the time they
/// last became evictable. The owning buffer pool instance guards this
/// structure with its own mutex, so no latch lives here.
pub struct LruReplacer {
    // Front of the map = least recently unpinned = next victim
    evictable: LinkedHashMap<FrameId, ()>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            evictable: LinkedHashMap::with_capacity(pool_size),
        }
    }

    /// Select the frame that has been evictable the longest
    pub fn victim(&mut self) -> Option<FrameId> {
        self.evictable.pop_front().map(|(frame_id, _)| frame_id)
    }

    /// The frame is in active use and must not be evicted
    pub fn pin(&mut self, frame_id: FrameId) {
        self.evictable.remove(&frame_id);
    }

    /// The frame's pin count dropped to zero: it becomes evictable.
    /// No-op when the frame is already tracked, so re-unpinning does not
    /// refresh its position.
    pub fn unpin(&mut self, frame_id: FrameId) {
        if !self.evictable.contains_key(&frame_id) {
            self.evictable.insert(frame_id, ());
        }
    }

    /// Number of evictable frames
    pub fn len(&self) -> usize {
        self.evictable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evictable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_least_recently_unpinned() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_removes_frame_from_consideration() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);

        assert_eq!(replacer.len(), 1);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);

        // Pinned frame only comes back after another unpin
        replacer.unpin(1);
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_pin_absent_frame_is_noop() {
        let mut replacer = LruReplacer::new(4);
        replacer.pin(7);
        assert_eq!(replacer.len(), 0);
    }

    #[test]
    fn test_unpin_twice_keeps_original_position() {
        let mut replacer = LruReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        // Frame 1 is already evictable; this must not move it behind 2
        replacer.unpin(1);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
    }
}
