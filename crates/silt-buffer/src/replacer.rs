//! LRU victim selection over buffer-pool frames.
//!
//! The replacer tracks only frames that are eligible for eviction
//! (unpinned, resident). The buffer pool removes a frame from tracking the
//! moment it is pinned and re-inserts it when its pin count returns to
//! zero; [`LruReplacer::victim`] then hands back the frame whose last
//! unpin is oldest.

use parking_lot::Mutex;
use silt_types::FrameId;

/// Link node for one tracked frame. Links are frame indices, not pointers;
/// frame ids are dense, so the frame index doubles as the slab slot.
#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct LruState {
    /// `slots[f]` is `Some` iff frame `f` is tracked.
    slots: Vec<Option<Node>>,
    /// Least recently unpinned frame; the next victim.
    head: Option<u32>,
    /// Most recently unpinned frame.
    tail: Option<u32>,
    len: usize,
}

impl LruState {
    fn unlink(&mut self, raw: u32) {
        let Some(node) = self.slots[raw as usize].take() else {
            return;
        };
        match node.prev {
            Some(p) => {
                if let Some(slot) = self.slots[p as usize].as_mut() {
                    slot.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(slot) = self.slots[n as usize].as_mut() {
                    slot.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;
    }

    fn push_tail(&mut self, raw: u32) {
        let node = Node {
            prev: self.tail,
            next: None,
        };
        if let Some(t) = self.tail {
            if let Some(slot) = self.slots[t as usize].as_mut() {
                slot.next = Some(raw);
            }
        } else {
            self.head = Some(raw);
        }
        self.tail = Some(raw);
        self.slots[raw as usize] = Some(node);
        self.len += 1;
    }
}

/// O(1) LRU replacer over a fixed universe of frame ids.
///
/// All three operations are idempotent: pinning an untracked frame and
/// unpinning a tracked one are no-ops, as are operations on frame ids
/// outside the pool's range.
#[derive(Debug)]
pub struct LruReplacer {
    inner: Mutex<LruState>,
}

impl LruReplacer {
    /// Create a replacer for a pool of `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruState {
                slots: vec![None; capacity],
                head: None,
                tail: None,
                len: 0,
            }),
        }
    }

    /// Remove and return the least recently unpinned frame, or `None` if
    /// no frame is currently evictable.
    pub fn victim(&self) -> Option<FrameId> {
        let mut lru = self.inner.lock();
        let raw = lru.head?;
        lru.unlink(raw);
        Some(FrameId::new(raw))
    }

    /// Stop tracking `frame_id`: the frame is in use and must not be
    /// chosen as a victim.
    pub fn pin(&self, frame_id: FrameId) {
        let mut lru = self.inner.lock();
        if (frame_id.index()) < lru.slots.len() {
            lru.unlink(frame_id.get());
        }
    }

    /// Track `frame_id` as most recently used, making it evictable.
    /// Ignored if the frame is already tracked or out of range.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut lru = self.inner.lock();
        let idx = frame_id.index();
        if idx >= lru.slots.len() || lru.slots[idx].is_some() {
            return;
        }
        lru.push_tail(frame_id.get());
    }

    /// Number of frames currently evictable.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Returns `true` if no frame is evictable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
