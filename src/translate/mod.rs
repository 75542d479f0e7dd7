// This module is the heart of fcache-xl8: turning an interrupted code-cache context back
// into the context the original program would have had. The recorder builds a compact table
// of cache offsets to source addresses when a fragment must outlive its source. The walk
// tracks the translator's own inserted sequences (spills, emulated pushes and pops) so
// their effects can be undone. Replay steps through a fragment to the captured pc using
// either the stored table or a rebuilt instruction list, and the recreator dispatches a
// captured pc to landmarks, replay or failure and applies the client restore hook.

//! Fault translation from cache state to source state.
//!
//! # Key Components
//!
//! ## Recording (`recorder`, `table`)
//! - One-pass compression of an instruction list into change points
//! - Identical and contiguous strides, our-mangling runs
//!
//! ## Tracking (`walk`)
//! - Spilled registers and emulated stack adjustment inside one region
//!
//! ## Recreation (`replay`, `recreate`, `verify`)
//! - Table and list replay behind one driver
//! - Landmarks, exit stubs, clean calls and the restore hook

pub mod adaptor;
pub mod recorder;
pub mod recreate;
pub mod replay;
pub mod table;
pub mod verify;
pub mod walk;

pub use adaptor::{
    Classifier, FragmentInfo, FragmentStore, Landmark, LandmarkKind, RebuildTarget, RestoreHook,
    RestoreStateInfo, ThreadState,
};
pub use recorder::record_translation;
pub use recreate::{StateRecreator, SYSCALL_LENGTH};
pub use replay::{ListReplay, ReplayEnv, ReplaySource, TableReplay};
pub use table::{TranslationEntry, TranslationTable};
pub use verify::{MismatchKind, VerifyMismatch};
pub use walk::MangleWalk;

use std::fmt;

/// How much of a captured context could be translated, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryOutcome {
    /// Nothing could be produced.
    Failed,
    /// The pc is trustworthy, the registers are not.
    PcOnly,
    /// Exact source state at an instruction boundary.
    FullState,
}

impl RecoveryOutcome {
    pub fn is_success(self) -> bool {
        self != RecoveryOutcome::Failed
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryOutcome::Failed => "failed",
            RecoveryOutcome::PcOnly => "pc-only",
            RecoveryOutcome::FullState => "full-state",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_order() {
        assert!(RecoveryOutcome::Failed < RecoveryOutcome::PcOnly);
        assert!(RecoveryOutcome::PcOnly < RecoveryOutcome::FullState);
        assert_eq!(
            RecoveryOutcome::FullState.min(RecoveryOutcome::PcOnly),
            RecoveryOutcome::PcOnly
        );
        assert!(!RecoveryOutcome::Failed.is_success());
    }
}
