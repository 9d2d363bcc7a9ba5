use hashlink::LinkedHashSet;
use log::warn;
use parking_lot::Mutex;

/// Identifies a frame in the buffer pool.
pub type FrameId = usize;

/// Eviction policy for buffer pool frames.
///
/// Implementations synchronize internally so they can be shared without an
/// outer lock.
pub trait Replacer: Send + Sync {
    /// Removes and returns the frame to evict next.
    fn victim(&self) -> Option<FrameId>;

    /// Pins a frame, removing it from eviction consideration.
    fn pin(&self, frame_id: FrameId);

    /// Unpins a frame, adding it to eviction consideration.
    fn unpin(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU replacer that evicts the least recently unpinned frame.
#[derive(Debug)]
pub struct LruReplacer {
    capacity: usize,
    // front is least recently unpinned
    order: Mutex<LinkedHashSet<FrameId>>,
}

impl LruReplacer {
    /// Creates a new LRU replacer tracking at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Mutex::new(LinkedHashSet::with_capacity(capacity)),
        }
    }

    /// Tracks a frame as the least recently unpinned, so it is the next victim.
    pub fn restore_oldest(&self, frame_id: FrameId) {
        let mut order = self.order.lock();
        if order.contains(&frame_id) || order.len() >= self.capacity {
            return;
        }
        order.insert(frame_id);
        order.to_front(&frame_id);
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.order.lock().pop_front()
    }

    fn pin(&self, frame_id: FrameId) {
        self.order.lock().remove(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut order = self.order.lock();
        if order.contains(&frame_id) {
            return;
        }
        if order.len() >= self.capacity {
            let Some(dropped) = order.pop_front() else {
                // zero capacity tracks nothing
                return;
            };
            warn!("lru replacer full, dropping frame {dropped} to track frame {frame_id}");
        }
        order.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.order.lock().len()
    }
}
