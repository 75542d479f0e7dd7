//! Register spill slots and their recognition.
//!
//! The translator frees scratch registers by moving them to thread-local
//! slots addressed through a segment register, or (rarely) to save-slots in
//! the thread's context structure at fixed absolute addresses. Only the four
//! legacy registers in [`SpillReg`] are ever spilled by mangling.

use crate::core::context::Gpr;
use crate::core::instr::Instr;
use iced_x86::{Code, Instruction, Mnemonic, OpKind, Register};
use std::fmt;

/// Registers whose spills mangling tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpillReg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
}

impl SpillReg {
    pub const COUNT: usize = 4;

    pub const ALL: [SpillReg; SpillReg::COUNT] =
        [SpillReg::Rax, SpillReg::Rcx, SpillReg::Rdx, SpillReg::Rbx];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn gpr(self) -> Gpr {
        match self {
            SpillReg::Rax => Gpr::Rax,
            SpillReg::Rcx => Gpr::Rcx,
            SpillReg::Rdx => Gpr::Rdx,
            SpillReg::Rbx => Gpr::Rbx,
        }
    }

    pub fn from_gpr(gpr: Gpr) -> Option<SpillReg> {
        SpillReg::ALL.into_iter().find(|r| r.gpr() == gpr)
    }
}

impl fmt::Display for SpillReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.gpr().name())
    }
}

/// Set of spill registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillSet {
    bits: u8,
}

impl SpillSet {
    /// Create empty set.
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    pub fn contains(&self, reg: SpillReg) -> bool {
        self.bits & (1 << reg.index()) != 0
    }

    pub fn set(&mut self, reg: SpillReg) {
        self.bits |= 1 << reg.index();
    }

    pub fn clear(&mut self, reg: SpillReg) {
        self.bits &= !(1 << reg.index());
    }

    pub fn clear_all(&mut self) {
        self.bits = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Members in register order.
    pub fn iter(&self) -> impl Iterator<Item = SpillReg> + '_ {
        SpillReg::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

/// Where a spilled value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillSlot {
    /// Thread-local slot at this segment offset.
    Tls { offset: u64 },
    /// The register's own save-slot in the thread context.
    Mcontext,
}

/// A recognized spill (register to slot) or restore (slot to register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillOp {
    pub reg: SpillReg,
    pub spill: bool,
    pub slot: SpillSlot,
}

/// Layout of the translator's scratch storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillLayout {
    /// Segment register addressing thread-local storage.
    pub tls_segment: Register,
    /// Offsets of the spill slots; mangling may use any of them for any register.
    pub tls_spill_slots: [u64; SpillReg::COUNT],
    /// Slot holding the thread's context pointer; loading it is not a restore.
    pub dcontext_slot: u64,
    /// Slots holding the application's own FS and GS bases.
    pub app_fs_base_slot: u64,
    pub app_gs_base_slot: u64,
    /// Absolute addresses of the context save-slots, by [`SpillReg`].
    pub mcontext_slots: [u64; SpillReg::COUNT],
}

impl Default for SpillLayout {
    fn default() -> Self {
        Self {
            tls_segment: Register::GS,
            tls_spill_slots: [0x08, 0x10, 0x18, 0x20],
            dcontext_slot: 0x00,
            app_fs_base_slot: 0x28,
            app_gs_base_slot: 0x30,
            mcontext_slots: [0x6000_0000, 0x6000_0008, 0x6000_0010, 0x6000_0018],
        }
    }
}

impl SpillLayout {
    /// Natural TLS slot for `reg`.
    pub fn tls_slot_of(&self, reg: SpillReg) -> u64 {
        self.tls_spill_slots[reg.index()]
    }

    pub fn mcontext_slot_of(&self, reg: SpillReg) -> u64 {
        self.mcontext_slots[reg.index()]
    }

    /// Recognize a move between a spill register and one of our slots.
    pub fn spill_or_restore(&self, instr: &Instr) -> Option<SpillOp> {
        let inner = instr.inner()?;
        let (spill, reg_op, mem_op) = match inner.code() {
            Code::Mov_rm64_r64 | Code::Mov_moffs64_RAX => (true, 1, 0),
            Code::Mov_r64_rm64 | Code::Mov_RAX_moffs64 => (false, 0, 1),
            // xchg restores in place
            Code::Xchg_rm64_r64 => (false, 1, 0),
            _ => return None,
        };
        if inner.op_kind(mem_op) != OpKind::Memory || inner.op_kind(reg_op) != OpKind::Register {
            return None;
        }
        if !is_absolute(inner) {
            return None;
        }
        let reg = SpillReg::from_gpr(Gpr::from_iced(inner.op_register(reg_op))?)?;
        let disp = inner.memory_displacement64();

        if inner.segment_prefix() == self.tls_segment {
            if inner.code() == Code::Xchg_rm64_r64 || !self.tls_spill_slots.contains(&disp) {
                return None;
            }
            return Some(SpillOp {
                reg,
                spill,
                slot: SpillSlot::Tls { offset: disp },
            });
        }
        if inner.segment_prefix() == Register::None && disp == self.mcontext_slot_of(reg) {
            return Some(SpillOp {
                reg,
                spill,
                slot: SpillSlot::Mcontext,
            });
        }
        None
    }

    /// Load of an application segment base, or the `lea` that adds it to an
    /// address. Never faults, so it needs no tracking.
    pub fn is_seg_ref_load(&self, instr: &Instr) -> bool {
        if !instr.is_our_mangling() {
            return false;
        }
        let Some(inner) = instr.inner() else {
            return false;
        };
        if self.is_tls_load_from(inner, self.app_fs_base_slot)
            || self.is_tls_load_from(inner, self.app_gs_base_slot)
        {
            return true;
        }
        inner.mnemonic() == Mnemonic::Lea
            && inner.memory_index_scale() == 1
            && inner.memory_index() != Register::None
            && inner.memory_index() == inner.op0_register()
    }

    fn is_tls_load_from(&self, inner: &Instruction, slot: u64) -> bool {
        inner.mnemonic() == Mnemonic::Mov
            && inner.op0_kind() == OpKind::Register
            && inner.op1_kind() == OpKind::Memory
            && inner.segment_prefix() == self.tls_segment
            && is_absolute(inner)
            && inner.memory_displacement64() == slot
    }
}

fn is_absolute(inner: &Instruction) -> bool {
    inner.memory_base() == Register::None && inner.memory_index() == Register::None
}
