//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned) or not.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction and forgets it.
    ///
    /// Returns None if no frame is evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes an evictable frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU-K replacement algorithm.
///
/// Frames are partitioned into two regions by access count:
///
/// - frames with fewer than `k` accesses live in a FIFO region ordered by
///   first access;
/// - frames with at least `k` accesses live in an LRU region ordered by most
///   recent access.
///
/// Eviction takes the oldest evictable frame from the FIFO region first and
/// falls back to the least recently used evictable frame in the LRU region.
/// Frames that never earn `k` accesses therefore cycle out quickly, while
/// frequently re-referenced frames compete on recency.
pub struct LruKReplacer {
    /// Number of frames the pool owns; frame ids must be below this.
    num_frames: usize,
    /// The K threshold. Must be at least 1.
    k: usize,
    /// Region queues and per-frame state.
    inner: Mutex<LruKInner>,
}

struct LruKInner {
    /// Per-frame access count and evictable flag.
    entries: HashMap<FrameId, FrameEntry>,
    /// FIFO region: front = most recently admitted, back = oldest.
    fifo: VecDeque<FrameId>,
    /// LRU region: front = most recently accessed, back = least recent.
    lru: VecDeque<FrameId>,
    /// Count of evictable frames across both regions.
    evictable: usize,
}

struct FrameEntry {
    /// Number of recorded accesses.
    accesses: usize,
    /// Whether this frame may be evicted.
    evictable: bool,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer for a pool of `num_frames` frames.
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            num_frames,
            k,
            inner: Mutex::new(LruKInner {
                entries: HashMap::new(),
                fifo: VecDeque::new(),
                lru: VecDeque::new(),
                evictable: 0,
            }),
        }
    }

    /// Returns the total frame capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    /// Returns the K constant.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    fn check_frame(&self, frame_id: FrameId, op: &str) {
        assert!(
            (frame_id.0 as usize) < self.num_frames,
            "{op}: frame id {frame_id} out of range (pool has {} frames)",
            self.num_frames
        );
    }
}

fn detach(queue: &mut VecDeque<FrameId>, frame_id: FrameId) {
    if let Some(pos) = queue.iter().position(|&f| f == frame_id) {
        queue.remove(pos);
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.check_frame(frame_id, "record_access");
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.get_mut(&frame_id) {
            Some(entry) => {
                entry.accesses += 1;
                let accesses = entry.accesses;
                if accesses == self.k {
                    // Crossed the threshold: promote from FIFO to LRU head.
                    detach(&mut inner.fifo, frame_id);
                    inner.lru.push_front(frame_id);
                } else if accesses > self.k {
                    // Already in LRU: refresh recency.
                    detach(&mut inner.lru, frame_id);
                    inner.lru.push_front(frame_id);
                }
                // Below the threshold the frame keeps its FIFO slot: the
                // region is ordered by first access, not recency.
            }
            None => {
                // Admit at the head of the appropriate region, pinned.
                inner.entries.insert(
                    frame_id,
                    FrameEntry {
                        accesses: 1,
                        evictable: false,
                    },
                );
                if self.k == 1 {
                    inner.lru.push_front(frame_id);
                } else {
                    inner.fifo.push_front(frame_id);
                }
            }
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame(frame_id, "set_evictable");
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.entries.get_mut(&frame_id) else {
            return;
        };
        if entry.evictable == evictable {
            return;
        }
        entry.evictable = evictable;
        if evictable {
            inner.evictable += 1;
        } else {
            inner.evictable -= 1;
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut guard = self.inner.lock();
        if guard.evictable == 0 {
            return None;
        }
        let inner = &mut *guard;

        fn oldest_evictable(
            queue: &VecDeque<FrameId>,
            entries: &HashMap<FrameId, FrameEntry>,
        ) -> Option<FrameId> {
            queue.iter().rev().copied().find(|f| entries[f].evictable)
        }

        // Oldest evictable FIFO frame first, then oldest evictable LRU frame.
        if let Some(frame_id) = oldest_evictable(&inner.fifo, &inner.entries) {
            detach(&mut inner.fifo, frame_id);
            inner.entries.remove(&frame_id);
            inner.evictable -= 1;
            return Some(frame_id);
        }
        if let Some(frame_id) = oldest_evictable(&inner.lru, &inner.entries) {
            detach(&mut inner.lru, frame_id);
            inner.entries.remove(&frame_id);
            inner.evictable -= 1;
            return Some(frame_id);
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.entries.get(&frame_id) else {
            return;
        };
        if !entry.evictable {
            return;
        }
        detach(&mut inner.fifo, frame_id);
        detach(&mut inner.lru, frame_id);
        inner.entries.remove(&frame_id);
        inner.evictable -= 1;
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_new() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.k(), 2);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    #[should_panic(expected = "k >= 1")]
    fn test_lru_k_zero_k_panics() {
        LruKReplacer::new(10, 0);
    }

    #[test]
    fn test_evict_empty() {
        let replacer = LruKReplacer::new(10, 2);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_admitted_frames_start_pinned() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_fifo_order_is_first_access() {
        let replacer = LruKReplacer::new(10, 2);

        // All frames stay below k = 2 accesses.
        for i in 0..3 {
            replacer.record_access(FrameId(i));
            replacer.set_evictable(FrameId(i), true);
        }

        // Eviction follows first-access order.
        assert_eq!(replacer.evict(), Some(FrameId(0)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_fifo_region_ignores_recency() {
        let replacer = LruKReplacer::new(10, 3);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        // A second access (still below k = 3) does not move frame 0.
        replacer.record_access(FrameId(0));

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    fn test_fifo_evicted_before_lru() {
        // k = 2, 3 frames, access sequence 0,1,2,0,1.
        let replacer = LruKReplacer::new(3, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(2));
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        for i in 0..3 {
            replacer.set_evictable(FrameId(i), true);
        }

        // Frames 0 and 1 reached k accesses and moved to the LRU region;
        // frame 2 is the only FIFO resident and goes first.
        assert_eq!(replacer.evict(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_region_evicts_least_recent() {
        let replacer = LruKReplacer::new(10, 2);

        // Push both frames into the LRU region.
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(1));
        // Refresh frame 0: it is now the most recent.
        replacer.record_access(FrameId(0));

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    fn test_k_equals_one_is_plain_lru() {
        let replacer = LruKReplacer::new(10, 1);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(0));

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    fn test_set_evictable_toggles_size() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 1);

        // Toggling to the same state is a no-op.
        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_set_evictable_unknown_frame_ignored() {
        let replacer = LruKReplacer::new(10, 2);
        replacer.set_evictable(FrameId(5), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let replacer = LruKReplacer::new(10, 2);

        for i in 0..3 {
            replacer.record_access(FrameId(i));
            replacer.set_evictable(FrameId(i), true);
        }
        replacer.set_evictable(FrameId(0), false);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_remove_evictable_frame() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_remove_pinned_frame_ignored() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.remove(FrameId(0));

        // Still tracked: making it evictable works.
        replacer.set_evictable(FrameId(0), true);
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    fn test_readmission_after_evict() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(0));
        replacer.set_evictable(FrameId(0), true);
        assert_eq!(replacer.evict(), Some(FrameId(0)));

        // The frame starts over with a fresh access history.
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        // Frame 0 is back in the FIFO region, frame 1 is in LRU.
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_record_access_out_of_range_panics() {
        let replacer = LruKReplacer::new(5, 2);
        replacer.record_access(FrameId(5));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_evictable_out_of_range_panics() {
        let replacer = LruKReplacer::new(5, 2);
        replacer.set_evictable(FrameId(100), true);
    }
}
