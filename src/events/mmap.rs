//! C7: the memory-map event handler.
//!
//! Converts mmap/munmap/mremap into shadow and anon-map-tracker updates
//! (`spec.md` §4.7). Grounded on Dr. Memory's `handle_mmap`/`handle_munmap`
//! pair in `original_source/drmemory/alloc_drmem.c`.

use crate::context::Context;
use crate::tag::ShadowTag;

pub struct MapEvents<'c> {
    ctx: &'c Context,
}

/// Whether a successful mmap/VirtualAlloc covers anonymous memory or a
/// file/image backing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingKind {
    Anonymous,
    FileOrImage,
}

impl<'c> MapEvents<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self { ctx }
    }

    /// A successful mmap/VirtualAlloc of `[base, base+size)`.
    pub fn mmap(&self, base: u64, size: u64, kind: MappingKind, thread_in_allocator_routine: bool) {
        match kind {
            MappingKind::Anonymous => {
                let tag = if thread_in_allocator_routine {
                    ShadowTag::Unaddressable
                } else {
                    ShadowTag::Defined
                };
                self.ctx.shadow().set_range(base, base + size, tag);
                self.ctx.anon_maps().add(base, size);
            }
            MappingKind::FileOrImage => {
                self.ctx.module_walker().shadow_image_mapping(base, size, self.ctx.shadow());
            }
        }
    }

    /// A successful munmap/VirtualFree of `[base, base+size)`. Returns
    /// whether the range was tracked as anonymous (and so handled here)
    /// versus treated as a file mapping delegated to the walker.
    pub fn munmap(&self, base: u64, size: u64) -> MappingKind {
        if self.ctx.anon_maps().remove(base, size) {
            self.ctx.shadow().set_range(base, base + size, ShadowTag::Unaddressable);
            MappingKind::Anonymous
        } else {
            self.ctx.module_walker().shadow_image_mapping(base, size, self.ctx.shadow());
            MappingKind::FileOrImage
        }
    }

    /// A munmap/VirtualFree that the underlying syscall rejected. `spec.md`
    /// §4.7: pre-call shadow isn't snapshotted, so the best recoverable
    /// state is `DEFINED` rather than whatever it actually was.
    pub fn munmap_failed(&self, base: u64, size: u64) {
        self.ctx.anon_maps().add(base, size);
        self.ctx.shadow().set_range(base, base + size, ShadowTag::Defined);
    }

    /// A successful mremap that moved and/or resized `[old_base, old_size)`
    /// to `[new_base, new_size)`.
    pub fn mremap(&self, old_base: u64, old_size: u64, new_base: u64, new_size: u64, is_image: bool) {
        let shadow = self.ctx.shadow();
        let common = old_size.min(new_size);
        shadow.copy_range(old_base, new_base, common);

        if new_size < old_size {
            // Tail of the old block beyond what was copied: UNADDRESSABLE.
            shadow.set_range(old_base + new_size, old_base + old_size, ShadowTag::Unaddressable);
        } else if new_size > old_size {
            let tail_tag = if is_image { ShadowTag::Defined } else { ShadowTag::Undefined };
            shadow.set_range(new_base + old_size, new_base + new_size, tail_tag);
        }

        self.ctx.anon_maps().remove(old_base, old_size);
        self.ctx.anon_maps().add(new_base, new_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ContextBuilder;
    use crate::events::alloc::AllocatorEvents;
    use crate::host::{AddressSpaceProbe, EventReporter, LeakTracker, ModuleInfo, ModuleLookup, ModuleWalker};
    use crate::report::ReportEvent;
    use crate::shadow::ShadowMemory;

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
    struct NullLeakTracker;
    impl LeakTracker for NullLeakTracker {
        fn record_allocation(&self, _base: u64, _size: u64, _callstack: Option<crate::callstack::CallstackHandle>) {}
        fn forget_allocation(&self, _base: u64) {}
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
            .leak_tracker(NullLeakTracker)
            .module_walker(NullHost)
            .build()
    }

    #[test]
    fn anonymous_mmap_outside_allocator_becomes_defined() {
        let ctx = test_context();
        let events = MapEvents::new(&ctx);
        events.mmap(0x10000, 0x1000, MappingKind::Anonymous, false);
        let (ok, _) = ctx.shadow().check_range(0x10000, 0x1000, ShadowTag::Defined);
        assert!(ok);
        assert_eq!(ctx.mmap_anon_lookup(0x10500), Some((0x10000, 0x1000)));
    }

    #[test]
    fn anonymous_mmap_inside_allocator_stays_unaddressable() {
        let ctx = test_context();
        let events = MapEvents::new(&ctx);
        events.mmap(0x10000, 0x1000, MappingKind::Anonymous, true);
        let (ok, _) = ctx.shadow().check_range(0x10000, 0x1000, ShadowTag::Unaddressable);
        assert!(ok);
    }

    #[test]
    fn munmap_of_tracked_anon_range_marks_unaddressable() {
        let ctx = test_context();
        let events = MapEvents::new(&ctx);
        events.mmap(0x10000, 0x1000, MappingKind::Anonymous, false);
        let kind = events.munmap(0x10000, 0x1000);
        assert_eq!(kind, MappingKind::Anonymous);
        let (ok, _) = ctx.shadow().check_range(0x10000, 0x1000, ShadowTag::Unaddressable);
        assert!(ok);
    }

    #[test]
    fn munmap_of_untracked_range_delegates_to_walker() {
        let ctx = test_context();
        let events = MapEvents::new(&ctx);
        let kind = events.munmap(0x50000, 0x1000);
        assert_eq!(kind, MappingKind::FileOrImage);
    }

    #[test]
    fn mremap_grow_extends_undefined_tail_and_moves_tracking() {
        let ctx = test_context();
        let alloc = AllocatorEvents::new(&ctx);
        let events = MapEvents::new(&ctx);
        alloc.malloc(0x10000, 0x10, true, vec![], 0);
        events.mmap(0x10000, 0x10, MappingKind::Anonymous, false);
        events.mremap(0x10000, 0x10, 0x20000, 0x20, false);
        let (ok, _) = ctx.shadow().check_range(0x20010, 0x10, ShadowTag::Undefined);
        assert!(ok);
        assert_eq!(ctx.mmap_anon_lookup(0x10008), None);
        assert_eq!(ctx.mmap_anon_lookup(0x20008), Some((0x20000, 0x20)));
    }
}
