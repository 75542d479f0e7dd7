// This module serves as the central hub for fcache-xl8's shared data model: the fragment
// metadata borrowed from the fragment store, cache instructions with their source
// translations, the machine context being translated, the error type for the plumbing
// that can fail, the recreator's policy configuration, and its statistics counters.
// Architecture-specific recognition lives in x64; the algorithms live in translate.

//! Core data model.
//!
//! # Key Components
//!
//! ## Fragments (`fragment`)
//! - Cache span, prefix, flags and exit stubs of a translated unit
//! - Publish-once slot for the fragment's translation table
//!
//! ## Instructions (`instr`)
//! - iced-x86 instructions decoded at their cache address
//! - Source translation and origin (application, mangling, client meta)
//!
//! ## Machine Context (`context`)
//! - General-purpose registers, flags and pc of an interrupted thread

pub mod config;
pub mod context;
pub mod error;
pub mod fragment;
pub mod instr;
pub mod stats;

pub use config::XlateConfig;
pub use context::{Gpr, MachineContext};
pub use error::{XlateError, XlateResult};
pub use fragment::{ExitStub, Fragment, FragmentFlags};
pub use instr::{Instr, InstrList, InstrOrigin};
pub use stats::{StatsSnapshot, XlateStats};
