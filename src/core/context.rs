//! Machine context captured at an interruption point.
//!
//! The register file mirrors the x86-64 general-purpose registers in hardware
//! encoding order (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15), the same
//! order ModRM and REX select them in.

use iced_x86::Register;
use std::fmt;

/// General-purpose register, indexed by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub const COUNT: usize = 16;

    pub const ALL: [Gpr; Gpr::COUNT] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    const NAMES: [&'static str; Gpr::COUNT] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
        "r12", "r13", "r14", "r15",
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        Self::NAMES[self.index()]
    }

    /// Map any width of a general-purpose register (`ecx`, `cx`, `cl`) to its
    /// 64-bit container.
    pub fn from_iced(reg: Register) -> Option<Gpr> {
        let full = reg.full_register();
        Gpr::ALL.into_iter().find(|gpr| gpr.to_iced() == full)
    }

    pub fn to_iced(self) -> Register {
        const GP64_REGS: [Register; Gpr::COUNT] = [
            Register::RAX,
            Register::RCX,
            Register::RDX,
            Register::RBX,
            Register::RSP,
            Register::RBP,
            Register::RSI,
            Register::RDI,
            Register::R8,
            Register::R9,
            Register::R10,
            Register::R11,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::R15,
        ];
        GP64_REGS[self.index()]
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register file plus program counter.
///
/// For full-state recovery the recreator mutates this in place; for pc-only
/// recovery only `pc` is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineContext {
    regs: [u64; Gpr::COUNT],
    pub rflags: u64,
    pub pc: u64,
}

impl MachineContext {
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }

    pub fn reg(&self, reg: Gpr) -> u64 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Gpr, value: u64) {
        self.regs[reg.index()] = value;
    }

    pub fn with_reg(mut self, reg: Gpr, value: u64) -> Self {
        self.set_reg(reg, value);
        self
    }

    pub fn sp(&self) -> u64 {
        self.reg(Gpr::Rsp)
    }

    pub fn set_sp(&mut self, value: u64) {
        self.set_reg(Gpr::Rsp, value);
    }
}

impl fmt::Display for MachineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  pc     = {:#018x}", self.pc)?;
        writeln!(f, "  rflags = {:#018x}", self.rflags)?;
        for reg in Gpr::ALL {
            writeln!(f, "  {:<6} = {:#018x}", reg.name(), self.reg(reg))?;
        }
        Ok(())
    }
}
