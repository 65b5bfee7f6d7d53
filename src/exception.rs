//! C9: the exception recognizer.
//!
//! Consulted only after a shadow check already reports `Unaddressable` —
//! the cold path. Decodes the faulting instruction (and a short window of
//! neighboring bytes) with `zydis` and runs a small, ordered list of
//! predicates against it, mirroring Dr. Memory's `is_alloca_pattern` /
//! `is_strlen_pattern` / `is_rawmemchr_pattern` family
//! (`original_source/drmemory/alloc_drmem.c`). Per the "isolate each
//! pattern behind a boolean predicate" design note, adding a pattern means
//! adding one function and one entry in [`PATTERNS`] — never touching the
//! dispatch loop itself.

use zydis::{Decoder, Mnemonic, VisibleOperands};

use crate::host::{AddressSpaceProbe, ModuleLookup};

/// Whether a faulting instruction is inside a heap region accessed by the
/// allocator itself. `spec.md` §4.9 rule 1: the allocator manipulating its
/// own chunk headers looks identical to a stray application access, so the
/// recognizer trusts the caller's own bookkeeping instead of re-deriving
/// "in an allocator routine" from the call stack.
pub struct HeapSelfAccess {
    pub in_known_heap_region: bool,
    pub thread_in_allocator_routine: bool,
}

/// The TLS-bitmap rule (`spec.md` §4.9 rule 2): suppress iff the address
/// falls in a TLS slot the process bitmap marks allocated. Platforms
/// without a TLS bitmap (most of them) simply never populate this.
pub struct TlsBitmap<'a> {
    pub slot_allocated: &'a dyn Fn(u64) -> Option<bool>,
}

/// Outcome of a single pattern predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternOutcome {
    NoMatch,
    /// Suppress, leaving the byte `Unaddressable` (a probe, not a real
    /// read of the data).
    SuppressLeaveUnaddressable,
    /// Suppress and upgrade the accessed byte to `Undefined` (the
    /// instruction really did read the data, just via a word-wise
    /// over-read past the logical end).
    SuppressUpgradeToUndefined,
}

/// One decoded instruction plus a short trailing window of raw bytes
/// starting at its address, and the handful of neighbor instructions
/// needed by the multi-instruction patterns.
pub struct FaultWindow<'a> {
    pub bytes_at_pc: &'a [u8],
    pub preceding_bytes: &'a [u8],
    pub addr_alignment: u64,
    pub is_64_bit: bool,
}

fn decode_all(decoder: &Decoder, bytes: &[u8]) -> Vec<zydis::Instruction<VisibleOperands>> {
    decoder
        .decode_all::<VisibleOperands>(bytes, 0)
        .filter_map(|r| r.ok())
        .map(|(_, _, insn)| insn)
        .collect()
}

fn decoder_for(window: &FaultWindow) -> Decoder {
    if window.is_64_bit {
        Decoder::new64()
    } else {
        Decoder::new32()
    }
}

/// Stack-probe pattern (`alloca`/`_chkstk`/cygwin gap-probe): a `test`
/// against a pointer register followed by a small, closed set of
/// follow-ups. Never upgrades addressability — a probe doesn't actually
/// read the target's data, it only establishes committed stack pages.
fn match_stack_probe(window: &FaultWindow) -> PatternOutcome {
    let decoder = decoder_for(window);
    let insns = decode_all(&decoder, window.bytes_at_pc);
    let Some(first) = insns.first() else {
        return PatternOutcome::NoMatch;
    };
    if first.mnemonic != Mnemonic::TEST {
        return PatternOutcome::NoMatch;
    }
    let Some(second) = insns.get(1) else {
        return PatternOutcome::NoMatch;
    };
    let follow_up_matches = matches!(
        second.mnemonic,
        Mnemonic::CMP | Mnemonic::MOV | Mnemonic::XCHG | Mnemonic::JMP
    );
    if follow_up_matches {
        PatternOutcome::SuppressLeaveUnaddressable
    } else {
        PatternOutcome::NoMatch
    }
}

/// `strlen` word-load, primary form: unaligned `mov eax, [ecx(+0|-4)]`
/// followed by `test al, al; jz` or `mov edx, 0x7efefeff`.
fn match_strlen_word_load(window: &FaultWindow) -> PatternOutcome {
    if window.addr_alignment == 0 {
        return PatternOutcome::NoMatch;
    }
    let decoder = decoder_for(window);
    let insns = decode_all(&decoder, window.bytes_at_pc);
    let Some(first) = insns.first() else {
        return PatternOutcome::NoMatch;
    };
    if first.mnemonic != Mnemonic::MOV {
        return PatternOutcome::NoMatch;
    }
    let has_test_jz = insns
        .get(1)
        .is_some_and(|i| i.mnemonic == Mnemonic::TEST)
        && insns.get(2).is_some_and(|i| i.mnemonic == Mnemonic::JZ);
    let has_magic_mov = insns.get(1).is_some_and(|i| i.mnemonic == Mnemonic::MOV);
    if has_test_jz || has_magic_mov {
        PatternOutcome::SuppressLeaveUnaddressable
    } else {
        PatternOutcome::NoMatch
    }
}

/// `strlen` variant: `mov {eax|edx}, [esi]` preceded by the magic constant
/// `0x7efefeff` or the `f0ff 33c2` xor/neg idiom.
fn match_strlen_variant(window: &FaultWindow) -> PatternOutcome {
    if window.addr_alignment == 0 {
        return PatternOutcome::NoMatch;
    }
    const MAGIC: [u8; 4] = 0x7efefeffu32.to_le_bytes();
    const XOR_NEG: [u8; 4] = [0xf0, 0xff, 0x33, 0xc2];
    let tail = window.preceding_bytes;
    if tail.len() >= 4 && (tail[tail.len() - 4..] == MAGIC || tail[tail.len() - 4..] == XOR_NEG) {
        PatternOutcome::SuppressLeaveUnaddressable
    } else {
        PatternOutcome::NoMatch
    }
}

/// `strcpy` word-load (cygwin): unaligned `mov ecx, [ebx]` followed two
/// instructions later by `lea eax, [ecx + 0xfefefeff]`.
fn match_strcpy_cygwin(window: &FaultWindow) -> PatternOutcome {
    if window.addr_alignment == 0 {
        return PatternOutcome::NoMatch;
    }
    let decoder = decoder_for(window);
    let insns = decode_all(&decoder, window.bytes_at_pc);
    let Some(first) = insns.first() else {
        return PatternOutcome::NoMatch;
    };
    if first.mnemonic != Mnemonic::MOV {
        return PatternOutcome::NoMatch;
    }
    if insns.get(2).is_some_and(|i| i.mnemonic == Mnemonic::LEA) {
        PatternOutcome::SuppressLeaveUnaddressable
    } else {
        PatternOutcome::NoMatch
    }
}

/// `rawmemchr`/`strchr`: unaligned pointer-sized `mov` into a register,
/// optional intervening `xor r, r`, then a `mov` of one of the two magic
/// constants. Unlike the other string patterns this one really does
/// consume the over-read byte, so it may upgrade addressability.
fn match_rawmemchr(window: &FaultWindow) -> PatternOutcome {
    if window.addr_alignment == 0 {
        return PatternOutcome::NoMatch;
    }
    let decoder = decoder_for(window);
    let insns = decode_all(&decoder, window.bytes_at_pc);
    let Some(first) = insns.first() else {
        return PatternOutcome::NoMatch;
    };
    if first.mnemonic != Mnemonic::MOV {
        return PatternOutcome::NoMatch;
    }
    let mut idx = 1;
    if insns.get(idx).is_some_and(|i| i.mnemonic == Mnemonic::XOR) {
        idx += 1;
    }
    const MAGIC_BE: [u8; 4] = 0xfefefeffu32.to_le_bytes();
    const MAGIC_LE: [u8; 4] = 0x7efefeffu32.to_le_bytes();
    if insns.get(idx).is_some_and(|i| i.mnemonic == Mnemonic::MOV) {
        let tail = window.bytes_at_pc;
        let has_magic = tail.windows(4).any(|w| w == MAGIC_BE || w == MAGIC_LE);
        if has_magic {
            return PatternOutcome::SuppressUpgradeToUndefined;
        }
    }
    PatternOutcome::NoMatch
}

type Pattern = fn(&FaultWindow) -> PatternOutcome;

/// Ordered so that the cheaper, narrower patterns (no decode needed, just
/// alignment + magic bytes) run before the ones that decode multiple
/// instructions: `spec.md` doesn't mandate an order among rule-3 patterns,
/// but a faulting-instruction recognizer is the hottest cold path in the
/// tool, so cheap-reject-first is worth preserving.
const PATTERNS: &[Pattern] = &[
    match_stack_probe,
    match_strlen_variant,
    match_strlen_word_load,
    match_strcpy_cygwin,
    match_rawmemchr,
];

/// Runs the full C9 gate: heap-self-access, TLS bitmap, pattern list,
/// tool-library exclusion, in `spec.md` §4.9's mandated order. Returns
/// `Some(now_addressable)` on suppression, `None` if nothing matched (the
/// access should be reported).
#[allow(clippy::too_many_arguments)]
pub fn check_unaddressable_exceptions(
    heap: &HeapSelfAccess,
    tls: Option<&TlsBitmap>,
    addr: u64,
    pc: u64,
    window: &FaultWindow,
    probe: &dyn AddressSpaceProbe,
    modules: &dyn ModuleLookup,
) -> Option<bool> {
    if heap.in_known_heap_region && heap.thread_in_allocator_routine {
        return Some(false);
    }

    if let Some(tls) = tls {
        if let Some(allocated) = (tls.slot_allocated)(addr) {
            if allocated {
                return Some(false);
            }
        }
    }

    // The recognizer never reads memory it hasn't first proved readable;
    // `window` is a snapshot the caller already captured under that rule,
    // so no fresh probe is needed here. `probe` exists for callers that
    // need to fetch further bytes before building a `FaultWindow`.
    let _ = probe;

    for pattern in PATTERNS {
        match pattern(window) {
            PatternOutcome::SuppressLeaveUnaddressable => return Some(false),
            PatternOutcome::SuppressUpgradeToUndefined => return Some(true),
            PatternOutcome::NoMatch => {}
        }
    }

    if let Some(module) = modules.module_containing(addr) {
        if module.is_tool_library {
            if let Some(pc_module) = modules.module_containing(pc) {
                if pc_module.is_tool_library || pc_module.name == "ld.so" {
                    return Some(false);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ModuleInfo;

    struct AlwaysReadable;
    impl AddressSpaceProbe for AlwaysReadable {
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

    struct NoModules;
    impl ModuleLookup for NoModules {
        fn module_containing(&self, _addr: u64) -> Option<ModuleInfo> {
            None
        }
    }

    #[test]
    fn heap_self_access_suppresses_before_any_decode() {
        let heap = HeapSelfAccess {
            in_known_heap_region: true,
            thread_in_allocator_routine: true,
        };
        let window = FaultWindow {
            bytes_at_pc: &[],
            preceding_bytes: &[],
            addr_alignment: 0,
            is_64_bit: true,
        };
        let result = check_unaddressable_exceptions(
            &heap,
            None,
            0x1000,
            0x2000,
            &window,
            &AlwaysReadable,
            &NoModules,
        );
        assert_eq!(result, Some(false));
    }

    #[test]
    fn rawmemchr_requires_unaligned_address() {
        // test al,al ; jz  -- `84 c0` `74 00`; not a real rawmemchr shape,
        // only checking the alignment gate short-circuits before decode.
        let window = FaultWindow {
            bytes_at_pc: &[0x84, 0xc0, 0x74, 0x00],
            preceding_bytes: &[],
            addr_alignment: 0, // aligned: must not suppress per spec.
            is_64_bit: true,
        };
        assert_eq!(match_rawmemchr(&window), PatternOutcome::NoMatch);
    }

    #[test]
    fn no_pattern_matches_ordinary_unrelated_bytes() {
        let heap = HeapSelfAccess {
            in_known_heap_region: false,
            thread_in_allocator_routine: false,
        };
        let window = FaultWindow {
            bytes_at_pc: &[0x90, 0x90, 0x90, 0x90], // nop nop nop nop
            preceding_bytes: &[0, 0, 0, 0],
            addr_alignment: 1,
            is_64_bit: true,
        };
        let result = check_unaddressable_exceptions(
            &heap,
            None,
            0x1001,
            0x2000,
            &window,
            &AlwaysReadable,
            &NoModules,
        );
        assert_eq!(result, None);
    }
}
