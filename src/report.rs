//! Reportable program-under-test bugs (`spec.md` §7's second tier).
//!
//! Unlike [`crate::error::InternalError`], a [`ReportEvent`] is not this
//! crate misbehaving — it's this crate doing its job, having caught the
//! target program doing something wrong. Routed to the host's
//! `EventReporter` rather than logged directly, since rendering (with
//! symbolized callstacks, suppression rules, dedup) is a Non-goal of this
//! crate (`spec.md` §1).

use crate::callstack::CallstackHandle;

#[derive(Clone, Copy, Debug)]
pub enum ReportEvent {
    /// Access to memory with no addressable backing: out-of-bounds heap
    /// access, use of a freed block no longer in quarantine, wild pointer.
    UnaddressableAccess { addr: u64, size: u64, pc: u64 },

    /// Access to addressable-but-undefined memory (uninitialized read).
    UndefinedRead { addr: u64, size: u64, pc: u64 },

    /// An allocator entry point was called with an argument it rejects:
    /// free/realloc of a non-allocation pointer, negative/overflowing size.
    InvalidHeapArgument { pc: u64 },

    /// Access landed inside a quarantined block's still-redzoned or
    /// still-app-visible body: a use-after-free or heap-corruption proxy.
    DelayedFreeOverlap { addr: u64, size: u64, freed_at: Option<CallstackHandle> },

    /// An allocation reachable at process exit (or at an explicit
    /// mid-run check) with no remaining pointer to it.
    Leak { base: u64, size: u64, allocated_at: Option<CallstackHandle> },

    /// The underlying allocator returned NULL / failed to satisfy a
    /// request; reported rather than silently propagated so the target's
    /// own NULL-handling (or lack of it) can be attributed.
    AllocationFailure { requested_size: u64, pc: u64 },

    /// `realloc(NULL, n)` — valid per the C standard (equivalent to
    /// `malloc(n)`) but a common unintentional-NULL symptom worth flagging
    /// when `warn_null_ptr` is set.
    ReallocOfNull { requested_size: u64, pc: u64 },
}
