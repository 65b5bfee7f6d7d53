//! C8: the signal / callback handler.
//!
//! Maintains shadow across Unix signal delivery and sigreturn, altstack
//! changes, and the Windows kernel-callback/`NtContinue` equivalents
//! (`spec.md` §4.8). Grounded on Dr. Memory's `handle_pre_alloc_signal` /
//! `handle_Ki_callback` pair across `alloc_drmem.c` and `callback.c`
//! (`original_source/drmemory`); modeled here, per the Design Notes, as
//! two variants of one per-thread state machine rather than a
//! preprocessor fork — [`UnixSignals`] and [`WindowsCallbacks`] share
//! [`crate::context::ThreadClientState`] and both compile unconditionally
//! so either can be exercised in tests on any host.

use crate::context::{Context, SignalState, ThreadClientState};
use crate::error::InternalError;
use crate::host::MachineContextSource;
use crate::tag::{RegShadow, ShadowTag, REG_BYTES};

fn trace(what: &str, thread_id: u64, state: &ThreadClientState) {
    if crate::trace_state_transitions() {
        eprintln!("signal[{thread_id}]: {what} (state={:?})", state.signal_state);
    }
}

/// Unix-style signal delivery, handler entry, and `sigreturn`.
pub struct UnixSignals<'c> {
    ctx: &'c Context,
}

impl<'c> UnixSignals<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self { ctx }
    }

    /// The signal event itself, before the handler runs: captures the
    /// interrupted stack pointer. A thread already `InHandler` is a
    /// legitimate nested signal (e.g. one delivered while running on an
    /// altstack); only a thread stuck `AwaitingHandler` — a delivery with
    /// no intervening handler-entry instrumentation call — is a real
    /// protocol violation.
    pub fn signal_delivery(&self, thread_id: u64, interrupt_xsp: u64) {
        self.ctx.with_thread_state_mut(thread_id, |s| {
            if s.signal_state == SignalState::AwaitingHandler {
                InternalError::BadSignalTransition {
                    state: "awaiting_handler",
                    event: "signal_delivery",
                }
                .handle();
            }
            s.signal_state = SignalState::AwaitingHandler;
            s.signal_xsp = interrupt_xsp;
            trace("signal delivered", thread_id, s);
        });
    }

    /// Handler-entry instrumentation calling back in once the handler's
    /// prologue has run, with the handler's own current `xsp`.
    pub fn handler_entry(&self, thread_id: u64, xsp: u64) {
        let (frame_top, interrupt_xsp) = self.ctx.with_thread_state_mut(thread_id, |s| {
            let interrupt_xsp = s.signal_xsp;
            let altstack_top = s.sigaltstack_base + s.sigaltstack_size;
            let in_altstack = s.sigaltstack_size > 0 && xsp >= s.sigaltstack_base && xsp < altstack_top;
            let frame_top = if in_altstack {
                let nested = interrupt_xsp != ThreadClientState::SIGNAL_XSP_UNSET
                    && interrupt_xsp > xsp
                    && interrupt_xsp < altstack_top;
                if nested {
                    interrupt_xsp
                } else {
                    altstack_top
                }
            } else {
                interrupt_xsp
            };
            s.sigframe_top = frame_top;
            s.signal_state = SignalState::InHandler;
            s.signal_xsp = ThreadClientState::SIGNAL_XSP_UNSET;
            trace("handler entered", thread_id, s);
            (frame_top, interrupt_xsp)
        });
        let _ = interrupt_xsp;
        self.ctx.shadow().set_range(xsp, frame_top, ShadowTag::Defined);
    }

    /// `sigreturn`: the handler has finished, control returns to the
    /// interrupted context.
    pub fn sigreturn(&self, thread_id: u64, xsp: u64) {
        let frame_top = self.ctx.with_thread_state_mut(thread_id, |s| {
            s.signal_state = SignalState::Idle;
            trace("sigreturn", thread_id, s);
            s.sigframe_top
        });
        self.ctx.shadow().set_range(xsp, frame_top, ShadowTag::Unaddressable);
    }

    /// `sigaltstack`: `new_base`/`new_size` of 0 disables the altstack.
    /// Returns the snapshot needed to roll back on syscall failure.
    pub fn sigaltstack_pre(&self, thread_id: u64) -> (u64, u64) {
        self.ctx.with_thread_state_mut(thread_id, |s| {
            s.prev_sigaltstack_base = s.sigaltstack_base;
            s.prev_sigaltstack_size = s.sigaltstack_size;
            (s.prev_sigaltstack_base, s.prev_sigaltstack_size)
        })
    }

    pub fn sigaltstack_post_success(&self, thread_id: u64, new_base: u64, new_size: u64) {
        self.ctx.with_thread_state_mut(thread_id, |s| {
            s.sigaltstack_base = new_base;
            s.sigaltstack_size = new_size;
        });
        if new_size > 0 {
            self.ctx
                .shadow()
                .set_range(new_base, new_base + new_size, ShadowTag::Unaddressable);
        }
    }

    pub fn sigaltstack_post_failure(&self, thread_id: u64) {
        self.ctx.with_thread_state_mut(thread_id, |s| {
            s.sigaltstack_base = s.prev_sigaltstack_base;
            s.sigaltstack_size = s.prev_sigaltstack_size;
        });
    }
}

/// Whether a `sigaction`/`signal` call installs a real handler, as opposed
/// to `SIG_IGN`/`SIG_DFL`.
pub fn is_real_handler(handler_addr: u64, sig_ign: u64, sig_dfl: u64) -> bool {
    handler_addr != sig_ign && handler_addr != sig_dfl && handler_addr != 0
}

/// The process-wide set of addresses the instrumenter should recognize as
/// signal-handler entry points. Entries are never removed: `spec.md` §4.8
/// calls this a safe over-approximation (a handler later replaced by
/// `SIG_DFL` just means the set holds one address that will never fire
/// again).
#[derive(Default)]
pub struct SignalHandlerSet {
    addrs: parking_lot::Mutex<std::collections::HashSet<u64>>,
}

impl SignalHandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sigaction(&self, handler_addr: u64, sig_ign: u64, sig_dfl: u64) {
        if is_real_handler(handler_addr, sig_ign, sig_dfl) {
            self.addrs.lock().insert(handler_addr);
        }
    }

    pub fn is_handler_entry(&self, pc: u64) -> bool {
        self.addrs.lock().contains(&pc)
    }
}

/// Windows kernel-dispatched callback entry/return and `NtContinue`.
pub struct WindowsCallbacks<'c> {
    ctx: &'c Context,
}

impl<'c> WindowsCallbacks<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self { ctx }
    }

    /// First entry of a `Ki...` kernel callback. Walks up from `xsp`
    /// marking consecutive `UNADDRESSABLE` bytes `DEFINED`, capped at
    /// `stack_min_bytes` (a typical-stack-minimum bound, `spec.md` §4.8).
    pub fn callback_entry(&self, thread_id: u64, xsp: u64, stack_min_bytes: u64) {
        let shadow = self.ctx.shadow();
        let mut top = xsp;
        let cap = xsp + stack_min_bytes;
        while top < cap && shadow.get(top) == ShadowTag::Unaddressable {
            shadow.set(top, ShadowTag::Defined);
            top += 1;
        }
        self.ctx.with_thread_state_mut(thread_id, |s| {
            if s.callback_depth == 0 {
                s.pre_callback_esp = top;
            }
            s.push_callback_frame();
            trace("Ki callback entry", thread_id, s);
        });
    }

    /// Callback return (`cbret`): shadow `[xsp, pre_callback_esp)` →
    /// `UNADDRESSABLE`.
    pub fn callback_return(&self, thread_id: u64, xsp: u64) {
        let pre_callback_esp = self.ctx.with_thread_state_mut(thread_id, |s| {
            s.pop_callback_frame();
            trace("Ki callback return", thread_id, s);
            s.pre_callback_esp
        });
        self.ctx.shadow().set_range(xsp, pre_callback_esp, ShadowTag::Unaddressable);
    }

    /// `NtContinue`: first copies the eight general-register shadows named
    /// by `gprs` out of `context_image` — for each, the byte-shadow
    /// already recorded at that register field's own address, not the
    /// register's value — into the thread's active register shadow
    /// (`spec.md` §4.8). Then, `new_esp` being the stack pointer in that
    /// same image, the gap between it and `current_esp` becomes
    /// `UNDEFINED` (new esp below current, within threshold) or
    /// `UNADDRESSABLE` (new esp above current, within threshold).
    pub fn nt_continue(
        &self,
        thread_id: u64,
        current_esp: u64,
        new_esp: u64,
        stack_swap_threshold: u64,
        context_image: &dyn MachineContextSource,
        gprs: &[u16],
    ) {
        let shadow = self.ctx.shadow();
        let mut copied = Vec::with_capacity(gprs.len());
        for &reg in gprs {
            let addr = context_image.register_field_addr(reg);
            let mut bytes = [ShadowTag::Undefined; REG_BYTES];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = shadow.get(addr + i as u64);
            }
            copied.push((reg, RegShadow::from_bytes(bytes)));
        }
        self.ctx.with_thread_state_mut(thread_id, |s| {
            let active = s.active_regs_mut();
            for (reg, reg_shadow) in copied {
                active.set(reg, reg_shadow);
            }
        });

        if new_esp < current_esp && current_esp - new_esp <= stack_swap_threshold {
            shadow.set_range(new_esp, current_esp, ShadowTag::Undefined);
        } else if new_esp > current_esp && new_esp - current_esp <= stack_swap_threshold {
            shadow.set_range(current_esp, new_esp, ShadowTag::Unaddressable);
        }
    }
}
