//! Invariant-violation errors (`spec.md` §7, "internal consistency failures").
//!
//! These are bugs in this crate or in the host's event delivery, not
//! program-under-test bugs — for the latter see [`crate::report`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InternalError {
    #[error("double free of untracked heap id {0:#x}")]
    DoubleFree(u64),

    #[error("free of address {0:#x} not owned by any tracked allocation")]
    UnknownFree(u64),

    #[error("shadow memory range [{0:#x}, {1:#x}) crosses an unmapped page with no allocator event to explain it")]
    UnexplainedShadowGap(u64, u64),

    #[error("callstack handle used after its last reference was released")]
    DanglingCallstackHandle,

    #[error("heap id {0:#x} destroyed twice")]
    DoubleHeapDestroy(u64),

    #[error("signal state machine saw {event} while in state {state}")]
    BadSignalTransition { state: &'static str, event: &'static str },
}

impl InternalError {
    /// Reports the error the way `spec.md` §7 asks for: an assertion
    /// failure in debug builds (so test suites and CI catch it
    /// immediately), a logged error in release builds (so a deployed tool
    /// degrades instead of crashing the host process it is attached to).
    pub fn handle(self) {
        debug_assert!(false, "{self}");
        log::error!("internal invariant violated: {self}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_offending_address() {
        let e = InternalError::UnknownFree(0x1000);
        assert!(e.to_string().contains("1000"));
    }
}
