//! Cache instructions with their source translations.
//!
//! An [`Instr`] wraps an iced-x86 [`Instruction`] decoded at its cache address
//! together with the source address it stands for and who put it there. Lists
//! are produced transiently by the decoder or the fragment store and owned by
//! the caller for one recovery attempt.

use iced_x86::{FlowControl, Instruction, Mnemonic};
use std::fmt;

/// Who an instruction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrOrigin {
    /// Original application instruction, copied unchanged.
    App,
    /// Application instruction rewritten by the translator and marked as part
    /// of its mangling so spills can surround it in one region.
    MangledApp,
    /// Inserted by the translator.
    Mangling,
    /// Client meta code; never a relocation point.
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstrKind {
    Label,
    Machine(Instruction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    kind: InstrKind,
    translation: Option<u64>,
    origin: InstrOrigin,
}

impl Instr {
    pub fn new(inner: Instruction, translation: Option<u64>, origin: InstrOrigin) -> Self {
        Self {
            kind: InstrKind::Machine(inner),
            translation,
            origin,
        }
    }

    /// Zero-length marker; skipped by every walk.
    pub fn label() -> Self {
        Self {
            kind: InstrKind::Label,
            translation: None,
            origin: InstrOrigin::Meta,
        }
    }

    pub fn with_translation(mut self, translation: Option<u64>) -> Self {
        self.translation = translation;
        self
    }

    pub fn with_origin(mut self, origin: InstrOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn inner(&self) -> Option<&Instruction> {
        match &self.kind {
            InstrKind::Machine(inner) => Some(inner),
            InstrKind::Label => None,
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstrKind::Label)
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> u32 {
        self.inner().map_or(0, |i| i.len() as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache address the instruction was decoded at.
    pub fn cache_pc(&self) -> Option<u64> {
        self.inner().map(|i| i.ip())
    }

    pub fn translation(&self) -> Option<u64> {
        self.translation
    }

    pub fn set_translation(&mut self, translation: Option<u64>) {
        self.translation = translation;
    }

    pub fn origin(&self) -> InstrOrigin {
        self.origin
    }

    pub fn is_our_mangling(&self) -> bool {
        matches!(self.origin, InstrOrigin::Mangling | InstrOrigin::MangledApp)
    }

    pub fn is_app(&self) -> bool {
        matches!(self.origin, InstrOrigin::App | InstrOrigin::MangledApp)
    }

    pub fn is_meta(&self) -> bool {
        !self.is_app()
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.inner().map_or(Mnemonic::INVALID, |i| i.mnemonic())
    }

    /// Control transfer instruction; system calls are not counted.
    pub fn is_cti(&self) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        let branches = matches!(
            inner.flow_control(),
            FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::ConditionalBranch
                | FlowControl::Return
                | FlowControl::Call
                | FlowControl::IndirectCall
        );
        branches
            && !matches!(
                inner.mnemonic(),
                Mnemonic::Syscall | Mnemonic::Sysenter | Mnemonic::Sysexit | Mnemonic::Sysret
            )
    }

    /// `rep ins`/`rep movs`/`rep stos`.
    pub fn is_rep_string(&self) -> bool {
        let Some(inner) = self.inner() else {
            return false;
        };
        inner.has_rep_prefix()
            && matches!(
                inner.mnemonic(),
                Mnemonic::Insb
                    | Mnemonic::Insw
                    | Mnemonic::Insd
                    | Mnemonic::Movsb
                    | Mnemonic::Movsw
                    | Mnemonic::Movsd
                    | Mnemonic::Movsq
                    | Mnemonic::Stosb
                    | Mnemonic::Stosw
                    | Mnemonic::Stosd
                    | Mnemonic::Stosq
            )
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstrKind::Label => write!(f, "<label>")?,
            InstrKind::Machine(inner) => write!(f, "{:#x}  {}", inner.ip(), inner)?,
        }
        match self.translation {
            Some(app) => write!(f, "  ; xl8 {app:#x} {:?}", self.origin),
            None => write!(f, "  ; xl8 none {:?}", self.origin),
        }
    }
}

/// Ordered list of cache instructions for one fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrList {
    instrs: Vec<Instr>,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.instrs.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Instr> {
        self.instrs.iter_mut()
    }

    pub fn as_slice(&self) -> &[Instr] {
        &self.instrs
    }

    /// Total encoded bytes.
    pub fn encoded_size(&self) -> u64 {
        self.instrs.iter().map(|i| u64::from(i.len())).sum()
    }
}

impl From<Vec<Instr>> for InstrList {
    fn from(instrs: Vec<Instr>) -> Self {
        Self { instrs }
    }
}

impl FromIterator<Instr> for InstrList {
    fn from_iter<T: IntoIterator<Item = Instr>>(iter: T) -> Self {
        Self {
            instrs: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a InstrList {
    type Item = &'a Instr;
    type IntoIter = std::slice::Iter<'a, Instr>;

    fn into_iter(self) -> Self::IntoIter {
        self.instrs.iter()
    }
}

impl fmt::Display for InstrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in &self.instrs {
            writeln!(f, "  {instr}")?;
        }
        Ok(())
    }
}
