//! The process-wide registry tying C1–C5 together and exposing the
//! interfaces of `spec.md` §6.
//!
//! Grounded on `ykrt::mt::MT`/`MTInner`: a cloneable front-end
//! (`Context`) wrapping a single shared inner value, built via a
//! `ContextBuilder` rather than a bare constructor so a host can wire in
//! its own `EventReporter`/`ModuleLookup`/`AddressSpaceProbe`
//! implementations before anything runs. Unlike `MT`, nothing here
//! enforces a process-wide singleton — a host embedding multiple
//! independent coordinators (e.g. one per sandboxed child) is free to.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::anonmap::AnonMapTracker;
use crate::callstack::CallstackPool;
use crate::config::Config;
use crate::host::{AddressSpaceProbe, EventReporter, LeakTracker, ModuleLookup, ModuleWalker};
use crate::quarantine::DelayedFreeQuarantine;
use crate::shadow::ShadowMemory;
use crate::tag::{RegShadow, RegisterShadow};

/// The per-thread signal lifecycle (`spec.md` §4.9 state machines):
/// `Idle → AwaitingHandler (on signal event) → InHandler (on handler
/// entry) → Idle (on sigreturn)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignalState {
    #[default]
    Idle,
    AwaitingHandler,
    InHandler,
}

/// Per-thread state the signal/callback machinery (C8) needs, kept
/// separately from the shared structures above since it's only ever
/// touched by its owning thread outside of cross-thread leak scans.
#[derive(Clone, Debug)]
pub struct ThreadClientState {
    pub signal_state: SignalState,
    /// Unset sentinel is `u64::MAX`: a real stack pointer of all-ones
    /// isn't reachable on any supported platform.
    pub signal_xsp: u64,
    pub sigframe_top: u64,
    pub sigaltstack_base: u64,
    pub sigaltstack_size: u64,
    pub prev_sigaltstack_base: u64,
    pub prev_sigaltstack_size: u64,
    pub pre_callback_esp: u64,
    pub callback_depth: u32,
    /// The register shadow at the thread's outermost nesting level
    /// (`spec.md` §3's first mandated C8 field).
    pub shadow_regs: RegisterShadow,
    /// Per-nested-callback-depth register shadow, indexed by
    /// `callback_depth - 1`. Slots at or beyond the current depth are
    /// stale state left behind by a callback that already returned —
    /// `spec.md` §4.8's "allocate or reuse per-depth client state".
    pub callback_frames: Vec<RegisterShadow>,
}

impl ThreadClientState {
    pub const SIGNAL_XSP_UNSET: u64 = u64::MAX;

    /// The register shadow visible at the current nesting depth: the
    /// innermost active callback frame, or the thread-level shadow if no
    /// callback is active.
    pub fn active_regs(&self) -> &RegisterShadow {
        match self.callback_depth.checked_sub(1) {
            Some(depth) => self.callback_frames.get(depth as usize).unwrap_or(&self.shadow_regs),
            None => &self.shadow_regs,
        }
    }

    pub fn active_regs_mut(&mut self) -> &mut RegisterShadow {
        if self.callback_depth == 0 {
            &mut self.shadow_regs
        } else {
            &mut self.callback_frames[(self.callback_depth - 1) as usize]
        }
    }

    /// Enters one more level of nested-callback state (`spec.md` §4.8: "on
    /// nested callback entry, allocate or reuse per-depth client state; on
    /// reuse, zero all except the register-shadow fields, which are
    /// inherited from the parent"). The new frame's register shadow is a
    /// copy of whatever was active one level up; a stale frame left behind
    /// by an earlier callback at the same depth is overwritten wholesale
    /// rather than merged with.
    pub fn push_callback_frame(&mut self) {
        let parent = self.active_regs().clone();
        let depth = self.callback_depth as usize;
        if depth < self.callback_frames.len() {
            self.callback_frames[depth] = parent;
        } else {
            self.callback_frames.push(parent);
        }
        self.callback_depth += 1;
    }

    /// Leaves one level of nested-callback state. The frame itself is left
    /// in place (not truncated) so a later callback at the same depth can
    /// reuse its storage, per `push_callback_frame`'s doc.
    pub fn pop_callback_frame(&mut self) {
        self.callback_depth = self.callback_depth.saturating_sub(1);
    }
}

impl Default for ThreadClientState {
    fn default() -> Self {
        Self {
            signal_state: SignalState::Idle,
            signal_xsp: Self::SIGNAL_XSP_UNSET,
            sigframe_top: 0,
            sigaltstack_base: 0,
            sigaltstack_size: 0,
            prev_sigaltstack_base: 0,
            prev_sigaltstack_size: 0,
            pre_callback_esp: 0,
            callback_depth: 0,
            shadow_regs: RegisterShadow::new(),
            callback_frames: Vec::new(),
        }
    }
}

struct Inner {
    config: Config,
    shadow: ShadowMemory,
    anon_maps: AnonMapTracker,
    quarantine: Mutex<DelayedFreeQuarantine>,
    callstacks: CallstackPool,
    threads: Mutex<FxHashMap<u64, ThreadClientState>>,
    reporter: Box<dyn EventReporter + Send + Sync>,
    modules: Box<dyn ModuleLookup + Send + Sync>,
    probe: Box<dyn AddressSpaceProbe + Send + Sync>,
    leak_tracker: Box<dyn LeakTracker + Send + Sync>,
    module_walker: Box<dyn ModuleWalker + Send + Sync>,
}

/// The shared coordinator handle. Cheap to clone (an `Arc` bump); every
/// clone refers to the same shadow memory, quarantine, anon-map tree and
/// callstack pool.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

pub struct ContextBuilder {
    config: Config,
    reporter: Option<Box<dyn EventReporter + Send + Sync>>,
    modules: Option<Box<dyn ModuleLookup + Send + Sync>>,
    probe: Option<Box<dyn AddressSpaceProbe + Send + Sync>>,
    leak_tracker: Option<Box<dyn LeakTracker + Send + Sync>>,
    module_walker: Option<Box<dyn ModuleWalker + Send + Sync>>,
}

impl ContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reporter: None,
            modules: None,
            probe: None,
            leak_tracker: None,
            module_walker: None,
        }
    }

    pub fn reporter(mut self, r: impl EventReporter + Send + Sync + 'static) -> Self {
        self.reporter = Some(Box::new(r));
        self
    }

    pub fn modules(mut self, m: impl ModuleLookup + Send + Sync + 'static) -> Self {
        self.modules = Some(Box::new(m));
        self
    }

    pub fn probe(mut self, p: impl AddressSpaceProbe + Send + Sync + 'static) -> Self {
        self.probe = Some(Box::new(p));
        self
    }

    pub fn leak_tracker(mut self, l: impl LeakTracker + Send + Sync + 'static) -> Self {
        self.leak_tracker = Some(Box::new(l));
        self
    }

    pub fn module_walker(mut self, w: impl ModuleWalker + Send + Sync + 'static) -> Self {
        self.module_walker = Some(Box::new(w));
        self
    }

    pub fn build(self) -> Context {
        let quarantine = DelayedFreeQuarantine::new(self.config.delay_frees);
        Context(Arc::new(Inner {
            config: self.config,
            shadow: ShadowMemory::new(),
            anon_maps: AnonMapTracker::new(),
            quarantine: Mutex::new(quarantine),
            callstacks: CallstackPool::new(),
            threads: Mutex::new(FxHashMap::default()),
            reporter: self
                .reporter
                .expect("ContextBuilder::build called without a reporter"),
            modules: self
                .modules
                .expect("ContextBuilder::build called without a module lookup"),
            probe: self
                .probe
                .expect("ContextBuilder::build called without an address-space probe"),
            leak_tracker: self
                .leak_tracker
                .expect("ContextBuilder::build called without a leak tracker"),
            module_walker: self
                .module_walker
                .expect("ContextBuilder::build called without a module walker"),
        }))
    }
}

impl Context {
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn shadow(&self) -> &ShadowMemory {
        &self.0.shadow
    }

    pub fn anon_maps(&self) -> &AnonMapTracker {
        &self.0.anon_maps
    }

    pub fn callstacks(&self) -> &CallstackPool {
        &self.0.callstacks
    }

    pub(crate) fn reporter(&self) -> &(dyn EventReporter + Send + Sync) {
        self.0.reporter.as_ref()
    }

    pub(crate) fn modules(&self) -> &(dyn ModuleLookup + Send + Sync) {
        self.0.modules.as_ref()
    }

    pub(crate) fn probe(&self) -> &(dyn AddressSpaceProbe + Send + Sync) {
        self.0.probe.as_ref()
    }

    pub(crate) fn leak_tracker(&self) -> &(dyn LeakTracker + Send + Sync) {
        self.0.leak_tracker.as_ref()
    }

    pub(crate) fn module_walker(&self) -> &(dyn ModuleWalker + Send + Sync) {
        self.0.module_walker.as_ref()
    }

    pub fn thread_state(&self, thread_id: u64) -> ThreadClientState {
        self.0
            .threads
            .lock()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn with_thread_state_mut<R>(&self, thread_id: u64, f: impl FnOnce(&mut ThreadClientState) -> R) -> R {
        let mut threads = self.0.threads.lock();
        let state = threads.entry(thread_id).or_default();
        f(state)
    }

    /// `spec.md` §4.1 register operations: the shadow of register `reg` at
    /// the thread's current nesting depth (the active callback frame's, if
    /// any — see [`ThreadClientState::active_regs`]).
    pub fn register_shadow(&self, thread_id: u64, reg: u16) -> RegShadow {
        self.0
            .threads
            .lock()
            .get(&thread_id)
            .map(|s| s.active_regs().get(reg))
            .unwrap_or_else(RegShadow::undefined)
    }

    pub fn set_register_shadow(&self, thread_id: u64, reg: u16, shadow: RegShadow) {
        self.with_thread_state_mut(thread_id, |s| s.active_regs_mut().set(reg, shadow));
    }

    pub fn set_register_defined(&self, thread_id: u64, reg: u16) {
        self.with_thread_state_mut(thread_id, |s| s.active_regs_mut().set_defined(reg));
    }

    /// `spec.md` §6 exposed interface: `overlaps_delayed_free(lo, hi) →
    /// (free_lo, free_hi)?`.
    pub fn overlaps_delayed_free(&self, lo: u64, hi: u64) -> Option<(u64, u64)> {
        self.0
            .quarantine
            .lock()
            .overlaps(lo, hi, self.0.config.redzone_size)
    }

    /// `spec.md` §6 exposed interface: `mmap_anon_lookup(addr) → (base,
    /// size)?`.
    pub fn mmap_anon_lookup(&self, addr: u64) -> Option<(u64, u64)> {
        self.0.anon_maps.lookup(addr)
    }

    pub(crate) fn quarantine_lock(&self) -> parking_lot::MutexGuard<'_, DelayedFreeQuarantine> {
        self.0.quarantine.lock()
    }

    /// `spec.md` §6 exposed interface: `check_unaddressable_exceptions(write?,
    /// loc, addr, size) → bool`, the C9 gate. Thin forward to
    /// [`crate::exception::check_unaddressable_exceptions`], which needs no
    /// `Context` access beyond the host traits already threaded through
    /// this builder.
    pub fn check_unaddressable_exceptions(
        &self,
        heap: &crate::exception::HeapSelfAccess,
        tls: Option<&crate::exception::TlsBitmap<'_>>,
        addr: u64,
        pc: u64,
        window: &crate::exception::FaultWindow<'_>,
    ) -> Option<bool> {
        crate::exception::check_unaddressable_exceptions(
            heap,
            tls,
            addr,
            pc,
            window,
            self.probe(),
            self.modules(),
        )
    }
}
