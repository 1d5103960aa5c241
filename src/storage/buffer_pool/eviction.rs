//! LRU eviction ordering for the buffer pool.
//!
//! Frames enter the queue when their pin count drops to zero and leave it
//! when they are pinned again or chosen as a victim.

use std::collections::VecDeque;

/// Least-recently-unpinned ordering of buffer frames.
#[derive(Debug, Default)]
pub struct LruEvictionQueue {
    /// Frame indices, least recently unpinned first.
    queue: VecDeque<usize>,
}

impl LruEvictionQueue {
    /// Creates an empty queue sized for `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
        }
    }

    /// Marks a frame as most recently unpinned.
    pub fn touch(&mut self, frame_idx: usize) {
        self.remove(frame_idx);
        self.queue.push_back(frame_idx);
    }

    /// Drops a frame from the queue (it was pinned again).
    pub fn remove(&mut self, frame_idx: usize) {
        if let Some(pos) = self.queue.iter().position(|&idx| idx == frame_idx) {
            self.queue.remove(pos);
        }
    }

    /// Removes and returns the oldest frame accepted by `is_evictable`.
    ///
    /// Frames rejected by the predicate stay queued in their original order.
    pub fn pop_victim(&mut self, mut is_evictable: impl FnMut(usize) -> bool) -> Option<usize> {
        let pos = self.queue.iter().position(|&idx| is_evictable(idx))?;
        self.queue.remove(pos)
    }

    /// Returns the number of queued frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_first() {
        let mut queue = LruEvictionQueue::new(4);
        queue.touch(0);
        queue.touch(1);
        queue.touch(2);

        assert_eq!(queue.pop_victim(|_| true), Some(0));
        assert_eq!(queue.pop_victim(|_| true), Some(1));
        assert_eq!(queue.pop_victim(|_| true), Some(2));
        assert_eq!(queue.pop_victim(|_| true), None);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut queue = LruEvictionQueue::new(4);
        queue.touch(0);
        queue.touch(1);
        queue.touch(0);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_victim(|_| true), Some(1));
        assert_eq!(queue.pop_victim(|_| true), Some(0));
    }

    #[test]
    fn test_skips_rejected_frames() {
        let mut queue = LruEvictionQueue::new(4);
        queue.touch(0);
        queue.touch(1);
        queue.touch(2);

        assert_eq!(queue.pop_victim(|idx| idx != 0), Some(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_victim(|_| true), Some(0));
    }

    #[test]
    fn test_remove() {
        let mut queue = LruEvictionQueue::new(4);
        queue.touch(3);
        queue.remove(3);
        queue.remove(7);
        assert!(queue.is_empty());
    }
}
