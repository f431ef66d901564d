//! Per-traversal visited marks.
//!
//! Every beam search needs to know which node ids it has already scored.
//! Instead of clearing a bitmap per search, each slot stores the stamp of the
//! traversal that last touched it; starting a new traversal just advances the
//! stamp.

/// Visited marks indexed by node id.
///
/// `stamp == 0` never marks anything, so a default set is inert until
/// [`ensure_capacity`](Self::ensure_capacity) sizes it.
#[derive(Debug, Default)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    stamp: u16,
}

impl VisitedSet {
    /// Creates a set covering ids in `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            stamps: vec![0; capacity],
            stamp: 1,
        }
    }

    /// Start a new traversal. The slots are wiped only when the stamp runs out.
    pub fn reset(&mut self) {
        self.stamp = match self.stamp.checked_add(1) {
            Some(next) => next,
            None => {
                self.stamps.fill(0);
                1
            }
        };
    }

    /// Grow to cover ids in `0..capacity`.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.stamps.len() < capacity {
            self.stamps.resize(capacity, 0);
        }
        self.stamp = self.stamp.max(1);
    }

    /// Returns `true` the first time `id` is seen in the current traversal.
    #[inline]
    pub fn mark(&mut self, id: u32) -> bool {
        let slot = &mut self.stamps[id as usize];
        let fresh = *slot != self.stamp;
        *slot = self.stamp;
        fresh
    }
}
