//! Recognition of the translator's own mangling idioms.
//!
//! Every instruction the translator inserts around an application
//! instruction falls into one of a handful of shapes. Classifying them lets
//! the region tracker know which ones leave registers or the stack pointer
//! in a recoverable state.

use crate::core::instr::Instr;
use crate::x64::spill::{SpillLayout, SpillOp};
use iced_x86::{Code, Mnemonic, OpKind, Register};
use std::ops::Range;

/// What a mangling instruction does, as far as recovery cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MangleIdiom {
    /// Move to or from one of the spill slots.
    SpillRestore(SpillOp),
    /// Emulated push/pop or explicit stack-pointer arithmetic; carries the
    /// forward change of `rsp`.
    StackAdjust(i64),
    /// Part of the trace-exit comparison sequence.
    TraceCmp,
    /// Short jump over an inlined system call.
    InlineSyscallJmp,
    /// Load or application of an application segment base.
    SegRefLoad,
    /// Rewritten application instruction marked as mangling.
    MangledApp,
    Unsupported,
}

impl MangleIdiom {
    pub fn is_supported(&self) -> bool {
        !matches!(self, MangleIdiom::Unsupported)
    }
}

/// Classify a mangling instruction. `span` is the cache span of the
/// fragment being walked.
pub fn classify(layout: &SpillLayout, instr: &Instr, span: &Range<u64>) -> MangleIdiom {
    if let Some(op) = layout.spill_or_restore(instr) {
        MangleIdiom::SpillRestore(op)
    } else if let Some(delta) = check_xsp_mangling(instr) {
        MangleIdiom::StackAdjust(delta)
    } else if is_trace_cmp(instr) {
        MangleIdiom::TraceCmp
    } else if is_inline_syscall_jmp(instr, span) {
        MangleIdiom::InlineSyscallJmp
    } else if layout.is_seg_ref_load(instr) {
        MangleIdiom::SegRefLoad
    } else if instr.is_app() {
        MangleIdiom::MangledApp
    } else {
        MangleIdiom::Unsupported
    }
}

/// Stack-pointer effect of a push, pop or `rsp` adjustment, or `None` if the
/// instruction is not stack mangling. Stores through `rsp`, loads from the
/// stack and indirect-branch target loads into `rcx` leave `rsp` unchanged.
pub fn check_xsp_mangling(instr: &Instr) -> Option<i64> {
    let inner = instr.inner()?;
    match inner.mnemonic() {
        Mnemonic::Push | Mnemonic::Pop | Mnemonic::Popfq => {
            Some(i64::from(inner.stack_pointer_increment()))
        }
        Mnemonic::Lea
            if inner.op0_register() == Register::RSP
                && inner.memory_base() == Register::RSP
                && inner.memory_index() == Register::None =>
        {
            Some(inner.memory_displacement64() as i64)
        }
        Mnemonic::Add
            if inner.op0_kind() == OpKind::Register
                && inner.op0_register() == Register::RSP
                && is_immediate(inner.op1_kind()) =>
        {
            Some(inner.immediate(1) as i64)
        }
        // indirect branch target loads
        Mnemonic::Movzx
            if inner.op0_kind() == OpKind::Register
                && inner.op0_register().full_register() == Register::RCX =>
        {
            Some(0)
        }
        Mnemonic::Mov
            if inner.op0_kind() == OpKind::Register
                && inner.op0_register().full_register() == Register::RCX
                && inner.op1_kind() == OpKind::Memory =>
        {
            Some(0)
        }
        Mnemonic::Mov
            if inner.op0_kind() == OpKind::Memory
                && inner.memory_base() == Register::RSP
                && inner.memory_index() == Register::None =>
        {
            Some(0)
        }
        Mnemonic::Mov
            if inner.op0_kind() == OpKind::Register
                && inner.op1_kind() == OpKind::Memory
                && inner.memory_base() == Register::RSP
                && inner.memory_index() == Register::None =>
        {
            Some(0)
        }
        _ => None,
    }
}

/// Member of the trace-exit comparison: `mov reg, imm`, a store, `lahf`,
/// `seto`, `cmp`, `jne`, `add` or `sahf`.
pub fn is_trace_cmp(instr: &Instr) -> bool {
    let Some(inner) = instr.inner() else {
        return false;
    };
    match inner.mnemonic() {
        Mnemonic::Mov => {
            (inner.op0_kind() == OpKind::Register && is_immediate(inner.op1_kind()))
                || inner.op0_kind() == OpKind::Memory
        }
        Mnemonic::Lahf
        | Mnemonic::Seto
        | Mnemonic::Cmp
        | Mnemonic::Jne
        | Mnemonic::Add
        | Mnemonic::Sahf => true,
        _ => false,
    }
}

/// `jmp rel8` landing inside the fragment.
pub fn is_inline_syscall_jmp(instr: &Instr, span: &Range<u64>) -> bool {
    instr.inner().is_some_and(|inner| {
        inner.code() == Code::Jmp_rel8_64 && span.contains(&inner.near_branch_target())
    })
}

/// Whether a control transfer inside a region invalidates the spill markers.
///
/// `jecxz`/`jrcxz` never do. A `jmp` or `jne` only does when it stays inside
/// the fragment or is indirect; exits leave linearity intact.
pub fn resets_spills(instr: &Instr, span: &Range<u64>) -> bool {
    let Some(inner) = instr.inner() else {
        return false;
    };
    if !instr.is_cti() {
        return false;
    }
    match inner.mnemonic() {
        Mnemonic::Jecxz | Mnemonic::Jrcxz => false,
        Mnemonic::Jmp | Mnemonic::Jne => match direct_target(inner) {
            Some(target) => span.contains(&target),
            None => true,
        },
        _ => true,
    }
}

fn direct_target(inner: &iced_x86::Instruction) -> Option<u64> {
    match inner.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(inner.near_branch_target())
        }
        _ => None,
    }
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instr::InstrOrigin;
    use crate::x64::decode::decode_one;

    const SPAN: Range<u64> = 0x1000..0x1100;

    fn ours_at(bytes: &[u8], pc: u64) -> Instr {
        let (instr, _) = decode_one(bytes, pc).unwrap();
        instr.with_origin(InstrOrigin::Mangling).with_translation(Some(0x40_0000))
    }

    fn ours(bytes: &[u8]) -> Instr {
        ours_at(bytes, 0x1000)
    }

    #[test]
    fn test_push_pop_adjust() {
        assert_eq!(check_xsp_mangling(&ours(&[0x50])), Some(-8));
        assert_eq!(check_xsp_mangling(&ours(&[0x68, 0x10, 0x20, 0x30, 0x00])), Some(-8));
        assert_eq!(check_xsp_mangling(&ours(&[0x58])), Some(8));
        // popfq
        assert_eq!(check_xsp_mangling(&ours(&[0x9d])), Some(8));
    }

    #[test]
    fn test_explicit_rsp_arithmetic() {
        // lea rsp, [rsp-8]
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x8d, 0x64, 0x24, 0xf8])), Some(-8));
        // add rsp, 0x10
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x83, 0xc4, 0x10])), Some(16));
        // mov qword [rsp], 0x1234
        assert_eq!(
            check_xsp_mangling(&ours(&[0x48, 0xc7, 0x04, 0x24, 0x34, 0x12, 0, 0])),
            Some(0)
        );
        // mov rcx, [rax+8]
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x8b, 0x48, 0x08])), Some(0));
        // add rax, 1
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x83, 0xc0, 0x01])), None);
    }

    #[test]
    fn test_rcx_and_stack_moves_need_plain_memory() {
        // movzx ecx, byte [rax]
        assert_eq!(check_xsp_mangling(&ours(&[0x0f, 0xb6, 0x08])), Some(0));
        // mov rcx, 0x11223344 and mov rcx, rax are not target loads
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0xc7, 0xc1, 0x44, 0x33, 0x22, 0x11])), None);
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x89, 0xc1])), None);
        // mov [rsp+rax*8], rbx
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x89, 0x1c, 0xc4])), None);
        // mov rbx, [rsp+rax*8]
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x8b, 0x1c, 0xc4])), None);
        // mov rbx, [rsp+8]
        assert_eq!(check_xsp_mangling(&ours(&[0x48, 0x8b, 0x5c, 0x24, 0x08])), Some(0));
    }

    #[test]
    fn test_classify_order() {
        let layout = SpillLayout::default();
        // mov gs:[0x10], rcx is a spill even though it is also a store
        let spill = ours(&[0x65, 0x48, 0x89, 0x0c, 0x25, 0x10, 0, 0, 0]);
        assert!(matches!(classify(&layout, &spill, &SPAN), MangleIdiom::SpillRestore(_)));
        // lahf
        assert_eq!(classify(&layout, &ours(&[0x9f]), &SPAN), MangleIdiom::TraceCmp);
        // nop is not a recognized idiom
        assert_eq!(classify(&layout, &ours(&[0x90]), &SPAN), MangleIdiom::Unsupported);
        let mangled_app = ours(&[0x90]).with_origin(InstrOrigin::MangledApp);
        assert_eq!(classify(&layout, &mangled_app, &SPAN), MangleIdiom::MangledApp);
    }

    #[test]
    fn test_inline_syscall_jmp() {
        // jmp +2 from 0x1000 lands at 0x1004
        let inside = ours(&[0xeb, 0x02]);
        assert!(is_inline_syscall_jmp(&inside, &SPAN));
        // jmp rel32 is not the short form
        let near = ours(&[0xe9, 0x02, 0, 0, 0]);
        assert!(!is_inline_syscall_jmp(&near, &SPAN));
    }

    #[test]
    fn test_cti_reset_rule() {
        // jrcxz never resets
        assert!(!resets_spills(&ours(&[0xe3, 0x10]), &SPAN));
        // jmp leaving the fragment
        assert!(!resets_spills(&ours(&[0xe9, 0x00, 0x10, 0x00, 0x00]), &SPAN));
        // jne inside the fragment
        assert!(resets_spills(&ours(&[0x75, 0x10]), &SPAN));
        // jmp rcx
        assert!(resets_spills(&ours(&[0xff, 0xe1]), &SPAN));
        // ret
        assert!(resets_spills(&ours(&[0xc3]), &SPAN));
        // not a cti
        assert!(!resets_spills(&ours(&[0x90]), &SPAN));
    }
}
