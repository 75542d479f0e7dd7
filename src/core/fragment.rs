// This module models the code-cache fragment as seen by fault translation. A Fragment is
// owned by the fragment store and shared through Arc; translation only borrows it. The
// attributes consulted are its source tag, cache start and size, the size of the entry
// prefix that precedes the logical body, flags (trace, self-modifying sandboxed, pending
// deletion), its exit stubs, and the address of the retained snapshot copy for
// self-modifying fragments. The translation table is published once through a OnceLock
// so concurrent recoveries can read it without further synchronisation.

//! Fragment metadata consumed by the recorder and the recreator.

use crate::translate::TranslationTable;
use std::sync::OnceLock;

/// Fragment flags relevant to translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentFlags {
    /// Built from multiple basic blocks.
    pub is_trace: bool,
    /// Sandboxed self-modifying code; source bytes may differ from the snapshot.
    pub selfmod_sandboxed: bool,
    /// Flushed and awaiting deletion; the source may be gone.
    pub pending_deletion: bool,
}

/// One exit of a fragment: the branch in the body and its out-of-line stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStub {
    /// Cache pc of the exit branch inside the body.
    pub cti_pc: u64,
    /// Cache pc of the first stub instruction.
    pub stub_pc: u64,
    /// Whether the stub lives inside this fragment's cache span.
    pub has_local_stub: bool,
}

/// A translated unit of originally sequential code in the cache.
#[derive(Debug, Default)]
pub struct Fragment {
    pub id: u32,
    /// Source address of the fragment entry.
    pub tag: u64,
    /// Cache address of the first byte, prefix included.
    pub start_pc: u64,
    /// Cache bytes spanned, body and stubs.
    pub size: u32,
    /// Entry-stub bytes before the logical body.
    pub prefix_size: u32,
    pub flags: FragmentFlags,
    pub exit_stubs: Vec<ExitStub>,
    /// Retained copy of the source bytes for self-modifying fragments.
    pub selfmod_copy: Option<u64>,
    translation: OnceLock<TranslationTable>,
}

impl Fragment {
    pub fn new(id: u32, tag: u64, start_pc: u64, size: u32) -> Self {
        Self {
            id,
            tag,
            start_pc,
            size,
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix_size: u32) -> Self {
        self.prefix_size = prefix_size;
        self
    }

    pub fn with_flags(mut self, flags: FragmentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_exit_stubs(mut self, exit_stubs: Vec<ExitStub>) -> Self {
        self.exit_stubs = exit_stubs;
        self
    }

    pub fn with_selfmod_copy(mut self, copy: u64) -> Self {
        self.selfmod_copy = Some(copy);
        self
    }

    /// Cache pc where the logical body begins.
    pub fn entry_pc(&self) -> u64 {
        self.start_pc + u64::from(self.prefix_size)
    }

    pub fn end_pc(&self) -> u64 {
        self.start_pc + u64::from(self.size)
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix_size > 0
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start_pc && pc < self.end_pc()
    }

    /// Whether the source bytes are still known to match what was translated.
    pub fn app_code_consistent(&self) -> bool {
        !self.flags.pending_deletion && !self.flags.selfmod_sandboxed
    }

    pub fn translation_table(&self) -> Option<&TranslationTable> {
        self.translation.get()
    }

    /// Publish the table. Fails, handing the table back, if one is already attached.
    pub fn attach_translation_table(
        &self,
        table: TranslationTable,
    ) -> Result<(), TranslationTable> {
        self.translation.set(table)
    }

    /// Exit branch for a pc that lies inside one of the local exit stubs.
    pub fn exit_cti_for_stub_pc(&self, pc: u64) -> Option<u64> {
        let mut cti_pc = None;
        for stub in self.exit_stubs.iter().filter(|s| s.has_local_stub) {
            if pc < stub.stub_pc {
                break;
            }
            cti_pc = Some(stub.cti_pc);
        }
        cti_pc
    }
}
