//! C5: the delayed-free quarantine.
//!
//! A fixed-size FIFO of recently-freed blocks, kept `Unaddressable` so a
//! subsequent use is still observable instead of landing in memory the
//! allocator has already recycled. Mirrors Dr. Memory's `delay_free_list`
//! / `delay_free_tree` pair (`original_source/drmemory/alloc_drmem.c`):
//! an array for FIFO order, plus an interval tree (here, [`IntervalTree`]
//! in [`TreeMode::NonMerging`]) for O(log n) overlap queries.

use crate::interval_tree::{IntervalTree, TreeMode};
use typed_index_collections::TiVec;

/// A typed index into the quarantine's circular slot array, so a raw
/// `usize` slot offset can never be confused with an address or a size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotIdx(usize);

impl From<usize> for SlotIdx {
    fn from(i: usize) -> Self {
        SlotIdx(i)
    }
}

impl From<SlotIdx> for usize {
    fn from(i: SlotIdx) -> Self {
        i.0
    }
}

#[derive(Clone, Debug)]
struct QuarantineEntry {
    real_base: u64,
    real_size: u64,
    heap_id: Option<u64>,
    #[allow(dead_code)]
    app_size: u64,
    has_redzone: bool,
}

/// The pointer (and, on platforms with per-heap free, heap handle) that
/// must actually be passed to the underlying free — `None` means "free a
/// NULL pointer": the quarantine is holding the memory instead.
pub type RealFreeAction = Option<(u64, Option<u64>)>;

pub struct DelayedFreeQuarantine {
    capacity: usize,
    head: usize,
    fill: usize,
    slots: TiVec<SlotIdx, Option<QuarantineEntry>>,
    tree: IntervalTree<bool>,
}

impl DelayedFreeQuarantine {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            head: 0,
            fill: 0,
            slots: TiVec::new(),
            tree: IntervalTree::new(TreeMode::NonMerging),
        }
    }

    fn trace(&self, what: &str) {
        if crate::trace_state_transitions() {
            eprintln!(
                "quarantine: {what} (head={}, fill={}/{})",
                self.head, self.fill, self.capacity
            );
        }
    }

    /// Enqueues a freed block. Returns the action the caller must take on
    /// the real allocator: `None` to free a NULL pointer (the quarantine
    /// is not yet full), or `Some((ptr, heap_id))` for the block evicted
    /// to make room.
    pub fn enqueue(
        &mut self,
        real_base: u64,
        real_size: u64,
        heap_id: Option<u64>,
        app_size: u64,
        has_redzone: bool,
    ) -> RealFreeAction {
        self.tree
            .insert(real_base, real_size, has_redzone)
            .expect("quarantine real-address ranges must never overlap");
        let entry = QuarantineEntry {
            real_base,
            real_size,
            heap_id,
            app_size,
            has_redzone,
        };

        if self.fill < self.capacity {
            let idx = SlotIdx(self.fill);
            if usize::from(idx) < self.slots.len() {
                self.slots[idx] = Some(entry);
            } else {
                self.slots.push(Some(entry));
            }
            self.fill += 1;
            self.trace("enqueued (not yet full)");
            None
        } else {
            let idx = SlotIdx(self.head);
            let evicted = self.slots[idx].take();
            self.slots[idx] = Some(entry);
            self.head = (self.head + 1) % self.capacity;
            self.trace("enqueued (evicted oldest)");
            match evicted {
                Some(e) => {
                    self.tree.remove_exact(e.real_base, e.real_size);
                    Some((e.real_base, e.heap_id))
                }
                // The slot had already been invalidated by a heap-destroy
                // sweep; there is nothing left to really free.
                None => None,
            }
        }
    }

    /// Removes every slot belonging to the destroyed heap, without
    /// compacting: `head`/`fill` are unchanged, and the now-`None` slots
    /// are simply skipped the next time eviction reaches them.
    pub fn heap_destroy_sweep(&mut self, heap_id: u64) {
        for slot in self.slots.iter_mut() {
            if let Some(e) = slot {
                if e.heap_id == Some(heap_id) {
                    self.tree.remove_exact(e.real_base, e.real_size);
                    *slot = None;
                }
            }
        }
        self.trace("heap-destroy sweep");
    }

    /// Reports whether `[lo, hi)` overlaps a quarantined block's
    /// app-visible body, shrinking redzone endpoints by `redzone_size`
    /// first so that redzone-only accesses don't count as use-after-free.
    /// Returns the (possibly shrunk) free range on a hit.
    pub fn overlaps(&self, lo: u64, hi: u64, redzone_size: u64) -> Option<(u64, u64)> {
        let mut found = None;
        self.tree.ordered_iterate(|base, size, has_redzone| {
            if found.is_some() {
                return;
            }
            let (body_lo, body_hi) = if *has_redzone {
                (base + redzone_size, base + size - redzone_size)
            } else {
                (base, base + size)
            };
            if body_lo < hi && lo < body_hi {
                found = Some((body_lo, body_hi));
            }
        });
        found
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_evicts_oldest_on_wraparound() {
        let mut q = DelayedFreeQuarantine::new(2);
        assert_eq!(q.enqueue(0x1000, 0x20, None, 0x18, false), None);
        assert_eq!(q.enqueue(0x2000, 0x30, None, 0x28, false), None);
        let evicted = q.enqueue(0x3000, 0x40, None, 0x38, false);
        assert_eq!(evicted, Some((0x1000, None)));

        assert_eq!(q.overlaps(0x1008, 0x1010, 0), None);
        assert_eq!(q.overlaps(0x2008, 0x2010, 0), Some((0x2000, 0x2030)));
    }

    #[test]
    fn redzone_shrinks_the_hit_window() {
        let mut q = DelayedFreeQuarantine::new(4);
        // app range 0x4008..0x4028, real range 0x4000..0x4030.
        q.enqueue(0x4000, 0x30, None, 0x20, true);
        assert_eq!(q.overlaps(0x4000, 0x4008, 8), None);
        assert_eq!(q.overlaps(0x4010, 0x4018, 8), Some((0x4008, 0x4028)));
    }

    #[test]
    fn heap_destroy_sweep_skips_invalidated_slots_on_eviction() {
        let mut q = DelayedFreeQuarantine::new(2);
        q.enqueue(0x1000, 0x10, Some(7), 0x10, false);
        q.enqueue(0x2000, 0x10, Some(9), 0x10, false);
        q.heap_destroy_sweep(7);
        assert_eq!(q.overlaps(0x1000, 0x1010, 0), None);
        // The next enqueue evicts the (already-invalidated) heap-7 slot:
        // nothing left to really free.
        let evicted = q.enqueue(0x3000, 0x10, Some(9), 0x10, false);
        assert_eq!(evicted, None);
    }

    proptest::proptest! {
        /// After any sequence of enqueues, the quarantine never holds more
        /// than `capacity` live blocks, and every live block is findable by
        /// `overlaps` at its own address.
        #[test]
        fn enqueue_sequence_respects_capacity_and_stays_queryable(
            n in 1usize..12, count in 1usize..30
        ) {
            let mut q = DelayedFreeQuarantine::new(n);
            let mut live = Vec::new();
            for i in 0..count {
                let base = 0x1000 * (i as u64 + 1);
                let evicted = q.enqueue(base, 0x10, None, 0x10, false);
                live.push(base);
                if live.len() > n {
                    let oldest = live.remove(0);
                    proptest::prop_assert_eq!(evicted, Some((oldest, None)));
                }
            }
            proptest::prop_assert!(q.len() <= n);
            for base in &live {
                proptest::prop_assert!(q.overlaps(*base, *base + 1, 0).is_some());
            }
        }
    }

    #[test]
    fn full_rotation_returns_originally_enqueued_block() {
        let mut q = DelayedFreeQuarantine::new(3);
        q.enqueue(0x1000, 0x10, None, 0x10, false);
        q.enqueue(0x2000, 0x10, None, 0x10, false);
        q.enqueue(0x3000, 0x10, None, 0x10, false);
        // Exactly `delay_frees` (3) further enqueues should bring us back
        // around to evicting the original block (0x1000).
        q.enqueue(0x4000, 0x10, None, 0x10, false);
        q.enqueue(0x5000, 0x10, None, 0x10, false);
        let evicted = q.enqueue(0x6000, 0x10, None, 0x10, false);
        assert_eq!(evicted, Some((0x1000, None)));
    }
}
