//! C2: an ordered, non-overlapping interval tree.
//!
//! `spec.md` §4.2 leaves balancing unspecified ("any ordered map with
//! O(log n) operations suffices"). The teacher's own `intervaltree` crate
//! (used in `yktrace`'s block-map lookup) is bulk-built from an iterator
//! and has no incremental insert/remove — exactly backwards from what the
//! anon-map tracker (C3) and quarantine (C5) need, which insert and remove
//! one interval at a time as mmap/free events arrive. A `BTreeMap` keyed
//! by low endpoint gives the same O(log n) bound with the incremental API
//! this crate actually needs (see `DESIGN.md`).
//!
//! One tree owns one [`parking_lot::Mutex`]; every public operation
//! acquires it, per `spec.md` §4.2/§5.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalTreeError {
    #[error("interval [{0:#x}, {1:#x}) overlaps an existing entry")]
    Overlap(u64, u64),
}

#[derive(Clone, Debug)]
struct Node<P> {
    size: u64,
    payload: P,
}

/// Whether a tree coalesces overlapping/adjacent intervals on insert (the
/// anon-map tracker's mode) or rejects overlap and only splits on removal
/// (the quarantine's mode).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TreeMode {
    Merging,
    NonMerging,
}

struct Inner<P> {
    mode: TreeMode,
    nodes: BTreeMap<u64, Node<P>>,
}

impl<P: Clone> Inner<P> {
    fn overlapping_keys(&self, lo: u64, hi: u64) -> Vec<u64> {
        // Any node whose base is < hi could still overlap [lo, hi) if it
        // extends far enough; walk backwards from the first candidate.
        let mut keys = Vec::new();
        for (&base, node) in self.nodes.range(..hi) {
            if base + node.size > lo {
                keys.push(base);
            }
        }
        keys
    }

    fn touching_keys(&self, lo: u64, hi: u64) -> Vec<u64> {
        // Overlapping, plus exactly-adjacent (touching) nodes, used only
        // in merging mode.
        let mut keys = Vec::new();
        for (&base, node) in self.nodes.iter() {
            let end = base + node.size;
            if end >= lo && base <= hi {
                keys.push(base);
            }
        }
        keys
    }

    fn insert_merging(&mut self, base: u64, size: u64, payload: P) {
        let mut lo = base;
        let mut hi = base + size;
        for key in self.touching_keys(lo, hi) {
            let node = self.nodes.remove(&key).unwrap();
            lo = lo.min(key);
            hi = hi.max(key + node.size);
        }
        self.nodes.insert(lo, Node { size: hi - lo, payload });
    }

    fn insert_non_merging(&mut self, base: u64, size: u64, payload: P) -> Result<(), IntervalTreeError> {
        let hi = base + size;
        if !self.overlapping_keys(base, hi).is_empty() {
            return Err(IntervalTreeError::Overlap(base, hi));
        }
        self.nodes.insert(base, Node { size, payload });
        Ok(())
    }

    /// Removes (splitting as needed) every node overlapping `[lo, hi)`.
    /// Returns the ranges that were *fully or partially* removed, as
    /// `(base, size, payload)` of the pre-split node.
    fn remove_range(&mut self, lo: u64, hi: u64) -> Vec<(u64, u64, P)> {
        let mut removed = Vec::new();
        for key in self.overlapping_keys(lo, hi) {
            let node = self.nodes.remove(&key).unwrap();
            let node_end = key + node.size;
            removed.push((key, node.size, node.payload.clone()));
            if key < lo {
                // Left residual survives.
                match self.mode {
                    TreeMode::Merging => self.insert_merging(key, lo - key, node.payload.clone()),
                    TreeMode::NonMerging => {
                        self.nodes.insert(key, Node { size: lo - key, payload: node.payload.clone() });
                    }
                }
            }
            if node_end > hi {
                match self.mode {
                    TreeMode::Merging => self.insert_merging(hi, node_end - hi, node.payload.clone()),
                    TreeMode::NonMerging => {
                        self.nodes.insert(hi, Node { size: node_end - hi, payload: node.payload });
                    }
                }
            }
        }
        removed
    }
}

/// A mutex-guarded, ordered, (mode-dependent) non-overlapping interval
/// tree. See the module docs for why this isn't built on the teacher's
/// `intervaltree` crate.
pub struct IntervalTree<P> {
    inner: Mutex<Inner<P>>,
}

impl<P: Clone> IntervalTree<P> {
    pub fn new(mode: TreeMode) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode,
                nodes: BTreeMap::new(),
            }),
        }
    }

    /// Inserts `[base, base+size)`. In [`TreeMode::Merging`] mode this
    /// coalesces with any overlapping or adjacent node and never fails. In
    /// [`TreeMode::NonMerging`] mode this asserts non-overlap.
    pub fn insert(&self, base: u64, size: u64, payload: P) -> Result<(), IntervalTreeError> {
        let mut inner = self.inner.lock();
        match inner.mode {
            TreeMode::Merging => {
                inner.insert_merging(base, size, payload);
                Ok(())
            }
            TreeMode::NonMerging => inner.insert_non_merging(base, size, payload),
        }
    }

    /// Removes (splitting enclosing nodes as needed) every node
    /// overlapping `[lo, hi)`. Returns the pre-split `(base, size,
    /// payload)` of each node that was touched; empty iff nothing
    /// overlapped.
    pub fn remove_range(&self, lo: u64, hi: u64) -> Vec<(u64, u64, P)> {
        self.inner.lock().remove_range(lo, hi)
    }

    /// Removes the node whose interval is exactly `[base, base+size)`, if
    /// one exists, returning its payload. Used by the quarantine, whose
    /// entries are never partially overlapped (each slot's interval is
    /// inserted and removed whole).
    pub fn remove_exact(&self, base: u64, size: u64) -> Option<P> {
        let mut inner = self.inner.lock();
        match inner.nodes.get(&base) {
            Some(n) if n.size == size => inner.nodes.remove(&base).map(|n| n.payload),
            _ => None,
        }
    }

    /// First node overlapping `[lo, hi)`, if any.
    pub fn overlaps(&self, lo: u64, hi: u64) -> Option<(u64, u64, P)> {
        let inner = self.inner.lock();
        inner
            .overlapping_keys(lo, hi)
            .into_iter()
            .next()
            .map(|base| {
                let n = &inner.nodes[&base];
                (base, n.size, n.payload.clone())
            })
    }

    /// The node containing `addr`, if any.
    pub fn contains(&self, addr: u64) -> Option<(u64, u64, P)> {
        self.overlaps(addr, addr + 1)
    }

    /// Visits every node in ascending order of its low endpoint.
    pub fn ordered_iterate<F: FnMut(u64, u64, &P)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for (&base, node) in inner.nodes.iter() {
            f(base, node.size, &node.payload);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
