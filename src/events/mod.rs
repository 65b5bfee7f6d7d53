//! Event handlers: the three places the instrumentation host calls into
//! this crate with something that actually happened in the target
//! process. Each submodule owns one of `spec.md` §4.6/§4.7/§4.8; all three
//! share the same [`crate::Context`] for the structures they mutate.

pub mod alloc;
pub mod mmap;
pub mod signal;
