//! C6: the allocator event handler.
//!
//! Converts malloc/realloc/free/heap-destroy/failure events into shadow,
//! quarantine and callstack effects (`spec.md` §4.6). Grounded on Dr.
//! Memory's `handle_malloc_pre`/`handle_free_pre`/`handle_realloc_pre`
//! family in `original_source/drmemory/alloc_drmem.c`, adapted from their
//! monolithic dispatch into one method per event the way `ykrt::mt::MT`
//! exposes one method per control-point event.

use crate::callstack::{CallstackHandle, PackedCallstack};
use crate::context::Context;
use crate::quarantine::RealFreeAction;
use crate::report::ReportEvent;
use crate::tag::ShadowTag;

pub struct AllocatorEvents<'c> {
    ctx: &'c Context,
}

impl<'c> AllocatorEvents<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self { ctx }
    }

    /// A successful malloc (or the allocation half of calloc/realloc).
    /// Returns the interned callstack handle so the caller's allocation
    /// record can carry it as opaque client data.
    pub fn malloc(&self, base: u64, size: u64, zeroed: bool, callstack: Vec<u64>, pc: u64) -> CallstackHandle {
        let _ = pc;
        let handle = self.ctx.callstacks().intern(PackedCallstack::new(callstack));
        let tag = if zeroed { ShadowTag::Defined } else { ShadowTag::Undefined };
        self.ctx.shadow().set_range(base, base + size, tag);
        self.ctx.leak_tracker().record_allocation(base, size, Some(handle));
        handle
    }

    /// `realloc(old_base, old_size) -> (new_base, new_size)`. Per `spec.md`
    /// §4.6, handled as two independent, non-exclusive region-order cases
    /// rather than one branch, since the new block may be fully subsumed
    /// by the old one (both "new after old" and "new before old" can be
    /// simultaneously false, or — for a shrink in place — both checks
    /// degenerate to a no-op tail).
    pub fn realloc(&self, old_base: u64, old_size: u64, new_base: u64, new_size: u64) {
        let shadow = self.ctx.shadow();
        let overlap_lo = new_base.max(old_base);
        let overlap_hi = (new_base + new_size).min(old_base + old_size);
        if overlap_lo < overlap_hi {
            // Surviving overlap keeps its own tags: nothing to do, a
            // `copy_range` would be a self-copy. When the allocator
            // actually moved the bytes the copy already happened; mirror
            // that tag-preserving move here.
            if new_base != old_base {
                shadow.copy_range(old_base, new_base, overlap_hi - overlap_lo);
            }
        }

        // New tail past the old block's extent: UNDEFINED.
        if new_base + new_size > old_base + old_size {
            let tail_lo = (old_base + old_size).max(new_base);
            shadow.set_range(tail_lo, new_base + new_size, ShadowTag::Undefined);
        }

        // New block entirely before the old one: the region between the
        // two is not part of either block.
        if new_base < old_base {
            let tail_hi = old_base.min(new_base + new_size);
            if new_base < tail_hi {
                shadow.set_range(new_base, tail_hi, ShadowTag::Undefined);
            }
        }

        // Abandoned prefix/suffix of the old block: UNADDRESSABLE.
        if old_base < new_base {
            shadow.set_range(old_base, new_base.min(old_base + old_size), ShadowTag::Unaddressable);
        }
        if old_base + old_size > new_base + new_size {
            let lo = (new_base + new_size).max(old_base);
            shadow.set_range(lo, old_base + old_size, ShadowTag::Unaddressable);
        }

        // Known hazard (`spec.md` §4.6): realloc's abandoned memory is not
        // routed through the quarantine here.
    }

    /// A successful free. Returns the action the caller must apply to the
    /// real underlying allocator (see [`RealFreeAction`]).
    pub fn free(
        &self,
        base: u64,
        size: u64,
        real_base: u64,
        real_size: u64,
        app_size: u64,
        heap_id: Option<u64>,
        has_redzone: bool,
    ) -> RealFreeAction {
        self.ctx.shadow().set_range(base, base + size, ShadowTag::Unaddressable);
        self.ctx.leak_tracker().forget_allocation(base);

        if self.ctx.config().delay_frees > 0 {
            self.ctx
                .quarantine_lock()
                .enqueue(real_base, real_size, heap_id, app_size, has_redzone)
        } else {
            Some((real_base, heap_id))
        }
    }

    /// Heap destroyed as a unit (e.g. `HeapDestroy` on Windows): sweeps
    /// quarantine slots belonging to it and tells the leak tracker to drop
    /// its allocations.
    pub fn heap_destroy(&self, heap_id: u64) {
        self.ctx.quarantine_lock().heap_destroy_sweep(heap_id);
        self.ctx.leak_tracker().forget_heap(heap_id);
    }

    pub fn alloc_failure(&self, requested_size: u64, pc: u64) {
        if self.ctx.config().warn_null_ptr {
            self.ctx
                .reporter()
                .report(ReportEvent::AllocationFailure { requested_size, pc });
        }
    }

    pub fn realloc_of_null(&self, requested_size: u64, pc: u64) {
        if self.ctx.config().warn_null_ptr {
            self.ctx
                .reporter()
                .report(ReportEvent::ReallocOfNull { requested_size, pc });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ContextBuilder;
    use crate::host::{AddressSpaceProbe, EventReporter, LeakTracker, ModuleInfo, ModuleLookup, ModuleWalker};
    use crate::shadow::ShadowMemory;
    use parking_lot::Mutex;

    struct NullHost;
    impl EventReporter for NullHost {
        fn report(&self, _event: ReportEvent) {}
    }
    impl ModuleLookup for NullHost {
        fn module_containing(&self, _addr: u64) -> Option<ModuleInfo> {
            None
        }
    }
    impl AddressSpaceProbe for NullHost {
        fn probe_readable(&self, _addr: u64, _len: u64) -> bool {
            true
        }
        fn probe_writable(&self, _addr: u64, _len: u64) -> bool {
            true
        }
        fn safe_read(&self, _addr: u64, _len: u64, _out: &mut [u8]) -> usize {
            0
        }
    }
    #[derive(Default)]
    struct RecordingLeakTracker {
        forgotten: Mutex<Vec<u64>>,
    }
    impl LeakTracker for RecordingLeakTracker {
        fn record_allocation(&self, _base: u64, _size: u64, _callstack: Option<CallstackHandle>) {}
        fn forget_allocation(&self, base: u64) {
            self.forgotten.lock().push(base);
        }
        fn forget_heap(&self, _heap_id: u64) {}
    }
    impl ModuleWalker for NullHost {
        fn shadow_image_mapping(&self, _base: u64, _size: u64, _shadow: &ShadowMemory) {}
    }

    fn test_context() -> Context {
        ContextBuilder::new(Config::default())
            .reporter(NullHost)
            .modules(NullHost)
            .probe(NullHost)
            .leak_tracker(RecordingLeakTracker::default())
            .module_walker(NullHost)
            .build()
    }

    #[test]
    fn malloc_marks_defined_when_zeroed() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.malloc(0x1000, 0x20, true, vec![0x400000], 0x500000);
        let (ok, _) = ctx.shadow().check_range(0x1000, 0x20, ShadowTag::Defined);
        assert!(ok);
    }

    #[test]
    fn malloc_marks_undefined_when_not_zeroed() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.malloc(0x1000, 0x20, false, vec![0x400000], 0x500000);
        let (ok, _) = ctx.shadow().check_range(0x1000, 0x20, ShadowTag::Undefined);
        assert!(ok);
    }

    #[test]
    fn free_marks_unaddressable_and_quarantines_with_delay_frees() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.malloc(0x1000, 0x20, false, vec![], 0);
        let action = events.free(0x1000, 0x20, 0x1000, 0x20, 0x20, None, false);
        assert_eq!(action, None);
        let (ok, _) = ctx.shadow().check_range(0x1000, 0x20, ShadowTag::Unaddressable);
        assert!(ok);
        assert!(ctx.overlaps_delayed_free(0x1008, 0x1010).is_some());
    }

    #[test]
    fn realloc_grow_in_place_extends_undefined_tail() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.malloc(0x1000, 0x10, true, vec![], 0);
        events.realloc(0x1000, 0x10, 0x1000, 0x20);
        let (ok, _) = ctx.shadow().check_range(0x1000, 0x10, ShadowTag::Defined);
        assert!(ok);
        let (ok, _) = ctx.shadow().check_range(0x1010, 0x10, ShadowTag::Undefined);
        assert!(ok);
    }

    #[test]
    fn realloc_shrink_marks_abandoned_suffix_unaddressable() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.malloc(0x1000, 0x20, true, vec![], 0);
        events.realloc(0x1000, 0x20, 0x1000, 0x10);
        let (ok, _) = ctx.shadow().check_range(0x1010, 0x10, ShadowTag::Unaddressable);
        assert!(ok);
    }

    #[test]
    fn heap_destroy_sweeps_quarantine_and_notifies_leak_tracker() {
        let ctx = test_context();
        let events = AllocatorEvents::new(&ctx);
        events.free(0x1000, 0x10, 0x1000, 0x10, 0x10, Some(5), false);
        events.heap_destroy(5);
        assert!(ctx.overlaps_delayed_free(0x1000, 0x1010).is_none());
    }
}
