//! C4: the shared, reference-counted callstack pool.
//!
//! Mirrors Dr. Memory's allocation-site callstack sharing (PR 465174,
//! `alloc_stack_table` in `original_source/drmemory/alloc_drmem.c`): every
//! malloc records a callstack, but most allocation sites recur millions of
//! times, so identical stacks are deduplicated and refcounted instead of
//! stored per-allocation.
//!
//! The hash table is keyed by content hash (`fxhash`, already an `ykrt`
//! sibling-crate dependency via `yktrace`) with content equality on
//! collision. Refcounting is manual rather than `Arc`-based: `spec.md`
//! §4.4/§9 requires a hook at "refcount dropped to 1" (remove from table)
//! distinct from "refcount dropped to 0" (free storage), which `Arc`'s
//! `Drop` can't express without a second indirection.

use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An immutable, content-addressable sequence of return addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedCallstack {
    addrs: Box<[u64]>,
}

impl PackedCallstack {
    pub fn new(addrs: Vec<u64>) -> Self {
        Self {
            addrs: addrs.into_boxed_slice(),
        }
    }

    pub fn addrs(&self) -> &[u64] {
        &self.addrs
    }

    fn content_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = fxhash::FxHasher::default();
        self.addrs.hash(&mut h);
        h.finish()
    }
}

struct CallstackEntry {
    hash: u64,
    pcs: PackedCallstack,
    /// 1 = only the pool's own self-reference remains; N = that plus
    /// (N-1) live external handles.
    refcount: AtomicUsize,
}

/// An opaque, `Copy`able handle to a pooled callstack. Safe to store as an
/// allocation record's client data; only meaningful when passed back to
/// the [`CallstackPool`] that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallstackHandle(*const CallstackEntry);

// SAFETY: a `CallstackHandle` is an inert address; all mutation of the
// entry it points to goes through atomic operations or the pool's mutex.
unsafe impl Send for CallstackHandle {}
unsafe impl Sync for CallstackHandle {}

/// The deduplicated, refcounted table of callstacks.
///
/// Per `spec.md` §5, every mutation here is expected to happen while the
/// caller holds the external allocator-tracking-table's lock; this type's
/// own [`parking_lot::Mutex`] is the pool's leaf lock, nested inside that
/// one.
pub struct CallstackPool {
    buckets: Mutex<FxHashMap<u64, Vec<Box<CallstackEntry>>>>,
}

impl Default for CallstackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CallstackPool {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(FxHashMap::default()),
        }
    }

    /// Interns `pcs`: if content-equal to an existing entry, that entry is
    /// reused (gaining one reference) and `pcs` is dropped; otherwise
    /// `pcs` becomes a new entry. Either way, returns a handle carrying
    /// one reference owned by the caller.
    pub fn intern(&self, pcs: PackedCallstack) -> CallstackHandle {
        let hash = pcs.content_hash();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(hash).or_default();
        if let Some(existing) = bucket.iter().find(|e| e.pcs == pcs) {
            existing.refcount.fetch_add(1, Ordering::AcqRel);
            return CallstackHandle(existing.as_ref() as *const CallstackEntry);
        }
        let entry = Box::new(CallstackEntry {
            hash,
            pcs,
            // 1 (pool self-reference) + 1 (this caller's new handle).
            refcount: AtomicUsize::new(2),
        });
        let ptr = entry.as_ref() as *const CallstackEntry;
        bucket.push(entry);
        CallstackHandle(ptr)
    }

    pub fn add_ref(&self, handle: CallstackHandle) {
        // SAFETY: handles only outlive their entry while the caller holds
        // at least one reference, which this call requires as a precondition.
        let entry = unsafe { &*handle.0 };
        entry.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one reference. If this was the last external reference
    /// (refcount 2 -> 1), the entry is removed from the table and its
    /// storage freed in the same step — the pool's self-reference is
    /// released immediately after removal, collapsing 1 -> 0.
    pub fn release(&self, handle: CallstackHandle) {
        // SAFETY: see `add_ref`.
        let entry = unsafe { &*handle.0 };
        let prev = entry.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 2, "release() called with no remaining external reference");
        if prev == 2 {
            let mut buckets = self.buckets.lock();
            if let Some(bucket) = buckets.get_mut(&entry.hash) {
                bucket.retain(|e| e.as_ref() as *const CallstackEntry != handle.0);
                if bucket.is_empty() {
                    buckets.remove(&entry.hash);
                }
            }
        }
    }

    pub fn refcount(&self, handle: CallstackHandle) -> usize {
        // SAFETY: see `add_ref`.
        unsafe { &*handle.0 }.refcount.load(Ordering::Acquire)
    }

    pub fn addrs(&self, handle: CallstackHandle) -> Vec<u64> {
        // SAFETY: see `add_ref`.
        unsafe { &*handle.0 }.pcs.addrs().to_vec()
    }

    /// Number of distinct callstacks currently pooled.
    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_stacks_dedup_and_refcount() {
        let pool = CallstackPool::new();
        let s1 = || PackedCallstack::new(vec![0x1000, 0x2000, 0x3000]);
        let s2 = PackedCallstack::new(vec![0x9000]);

        let h1a = pool.intern(s1());
        let h1b = pool.intern(s1());
        let h1c = pool.intern(s1());
        let h2 = pool.intern(s2);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.refcount(h1a), 4); // 3 external + 1 self
        assert_eq!(pool.refcount(h2), 2);

        pool.release(h1a);
        pool.release(h1b);
        assert_eq!(pool.refcount(h1c), 2);

        pool.release(h1c);
        // Entry removed from the table; S2 untouched.
        assert_eq!(pool.len(), 1);
    }

    proptest::proptest! {
        /// Interning the same callstack N times then releasing N times
        /// always leaves the pool empty of that entry, regardless of N or
        /// interleaving with a distinct, never-released stack.
        #[test]
        fn intern_release_pairs_always_balance(n in 1usize..20) {
            let pool = CallstackPool::new();
            let other = pool.intern(PackedCallstack::new(vec![0xdead]));

            let mut handles = Vec::new();
            for _ in 0..n {
                handles.push(pool.intern(PackedCallstack::new(vec![1, 2, 3])));
            }
            proptest::prop_assert_eq!(pool.refcount(handles[0]), n + 1);
            for h in handles {
                pool.release(h);
            }
            proptest::prop_assert_eq!(pool.len(), 1);
            proptest::prop_assert_eq!(pool.refcount(other), 2);
        }
    }

    #[test]
    fn distinct_stacks_never_collide_even_with_equal_hash_bucket() {
        let pool = CallstackPool::new();
        let a = pool.intern(PackedCallstack::new(vec![1, 2, 3]));
        let b = pool.intern(PackedCallstack::new(vec![4, 5, 6]));
        assert_ne!(pool.addrs(a), pool.addrs(b));
        assert_eq!(pool.len(), 2);
    }
}
