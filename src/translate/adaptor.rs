// This module defines the traits that connect the recreator to the runtime around it. The
// fragment store owns fragments and can regenerate their instruction lists, either from
// source memory or from the retained snapshot of a self-modifying fragment. The classifier
// knows the runtime's address map: which pcs lie in the code cache, which belong to the
// generated dispatch and lookup routines, and which are fixed landmarks whose source pc is
// known without any walk. Thread state gives access to the interrupted thread's spill slots
// and, for clean calls, to the application context saved on entry. The restore hook lets a
// client adjust or veto a translated context. All are injected as trait objects.

//! Adaptor traits between the recreator and its host runtime.
//!
//! The recreator never owns fragments or threads. It consults:
//! - [`FragmentStore`] for fragments and regenerated instruction lists.
//! - [`Classifier`] for what kind of address a captured pc is.
//! - [`ThreadState`] for the values hidden in spill slots.
//! - [`RestoreHook`] for client veto and adjustment of the result.

use crate::core::context::MachineContext;
use crate::core::fragment::Fragment;
use crate::core::instr::InstrList;
use crate::x64::spill::{SpillReg, SpillSlot};
use std::sync::Arc;

/// What to rebuild an instruction list for.
#[derive(Debug, Clone, Copy)]
pub enum RebuildTarget<'a> {
    /// A known fragment.
    Fragment(&'a Fragment),
    /// Whatever fragment contains this cache pc, if the store can still tell.
    CachePc(u64),
}

/// Owner of fragments and their instruction-list builder.
pub trait FragmentStore {
    fn lookup_fragment(&self, tag: u64) -> Option<Arc<Fragment>>;

    fn lookup_by_cache_pc(&self, pc: u64) -> Option<Arc<Fragment>>;

    /// Regenerate the mangled instruction list from current source memory.
    /// The list starts at the fragment's entry pc and carries the same
    /// translations the fragment was built with.
    fn rebuild_instruction_list(&self, target: RebuildTarget<'_>) -> Option<(InstrList, Arc<Fragment>)>;

    /// Regenerate a self-modifying fragment's list from its snapshot copy.
    /// Translations point into the copy, not at the tag.
    fn rebuild_selfmod_snapshot_list(&self, fragment: &Fragment) -> Option<InstrList>;
}

/// Fixed return points whose source pc is known directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkKind {
    /// Return point of a system call made from generated code.
    AfterSyscall,
    /// Exit stub used by cache resets; resumes at the dispatcher's next tag.
    ResetExitStub,
    /// Return point of a vsyscall-style system call.
    VsyscallReturn,
}

impl LandmarkKind {
    /// Whether a pc just before this landmark sits on the system call itself.
    pub fn follows_syscall(self) -> bool {
        matches!(self, LandmarkKind::AfterSyscall | LandmarkKind::VsyscallReturn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landmark {
    pub kind: LandmarkKind,
    /// Source pc to resume at.
    pub app_pc: u64,
}

/// Address-space classification of the runtime.
pub trait Classifier {
    fn in_fcache(&self, pc: u64) -> bool;

    /// Generated dispatch, lookup and system call routines.
    fn in_generated_routine(&self, pc: u64) -> bool;

    fn landmark(&self, pc: u64) -> Option<Landmark>;
}

/// The interrupted thread's runtime-private state.
pub trait ThreadState {
    /// Value held in a spill slot on behalf of `reg`.
    fn spill_slot(&self, reg: SpillReg, slot: SpillSlot) -> u64;

    /// Application context saved when the thread entered a clean call.
    fn saved_app_context(&self) -> Option<MachineContext> {
        None
    }

    /// Recovery requested on behalf of another thread (synchronization)
    /// rather than for a fault on the thread itself.
    fn is_synch_request(&self) -> bool {
        true
    }
}

/// Fragment attributes handed to a [`RestoreHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub tag: u64,
    /// Cache pc of the fragment body, past any prefix.
    pub cache_start_pc: u64,
    pub is_trace: bool,
    /// Source bytes still match what the fragment was built from.
    pub app_code_consistent: bool,
}

impl FragmentInfo {
    pub fn of(fragment: &Fragment) -> Self {
        Self {
            tag: fragment.tag,
            cache_start_pc: fragment.entry_pc(),
            is_trace: fragment.flags.is_trace,
            app_code_consistent: fragment.app_code_consistent(),
        }
    }
}

/// Context handed to a [`RestoreHook`].
#[derive(Debug)]
pub struct RestoreStateInfo<'a> {
    /// Translated context; the hook may adjust it.
    pub mcontext: &'a mut MachineContext,
    /// Context as captured, before translation.
    pub raw_mcontext: MachineContext,
    pub fragment_info: FragmentInfo,
}

/// Client callback run after a successful translation.
pub trait RestoreHook {
    /// Returning false marks the translation as failed.
    fn restore_state(&self, info: &mut RestoreStateInfo<'_>, restore_memory: bool) -> bool;
}

impl<F> RestoreHook for F
where
    F: Fn(&mut RestoreStateInfo<'_>, bool) -> bool,
{
    fn restore_state(&self, info: &mut RestoreStateInfo<'_>, restore_memory: bool) -> bool {
        self(info, restore_memory)
    }
}
