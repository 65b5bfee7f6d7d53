//! Allocator-aware shadow-memory coordinator.
//!
//! This crate is the core of a dynamic memory-error detector: it keeps a
//! per-byte shadow tag of the target process's address space consistent
//! with allocator, memory-map and signal events delivered by an
//! instrumentation host, and recognizes a handful of known-benign
//! unaddressable-access patterns so they aren't misreported as bugs.
//!
//! Instruction-level dataflow instrumentation, symbolization, leak-graph
//! traversal and report rendering are *not* part of this crate: they are
//! modeled as the [`host`] traits the rest of the product implements.

#![allow(clippy::too_many_arguments)]

pub mod anonmap;
pub mod callstack;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod exception;
pub mod host;
pub mod interval_tree;
pub mod quarantine;
pub mod report;
pub mod shadow;
pub mod tag;

pub use config::{Config, ConfigBuilder};
pub use context::Context;
pub use tag::ShadowTag;

use std::sync::atomic::{AtomicBool, Ordering};

/// Mirrors `ykrt`'s env-gated `print_jit_state`: when set, the signal and
/// quarantine-slot state machines narrate their transitions to stderr.
static TRACE_STATE_TRANSITIONS: AtomicBool = AtomicBool::new(false);

/// Enable or disable narration of internal state-machine transitions.
///
/// Intended for tests and interactive debugging, not for production use
/// (use the `log` crate's usual filtering for that).
pub fn set_trace_state_transitions(on: bool) {
    TRACE_STATE_TRANSITIONS.store(on, Ordering::Relaxed);
}

pub(crate) fn trace_state_transitions() -> bool {
    TRACE_STATE_TRANSITIONS.load(Ordering::Relaxed)
}
