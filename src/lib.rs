//! fcache-xl8 - fault translation for a code-cache binary translator.
//!
//! A dynamic binary translator runs the application out of a code cache of
//! rewritten fragments. When a thread is interrupted inside that cache (a
//! fault, a signal, a suspend request) its context describes cache code,
//! not the application. This crate maps such a context back to the one the
//! original program would have had at the same point.
//!
//! # Primary Usage
//!
//! ```ignore
//! use fcache_xl8::frag_listing::{parse_listing, MemoryStore, SimThread};
//! use fcache_xl8::translate::StateRecreator;
//! use fcache_xl8::core::MachineContext;
//!
//! let listing = parse_listing(&text)?;
//! let thread = SimThread::from_listing(&listing);
//! let store = MemoryStore::from_listing(listing)?;
//! let recreator = StateRecreator::new(&store, &store, &store);
//!
//! let mut mc = MachineContext::new(fault_pc);
//! let outcome = recreator.recreate_state(&thread, &mut mc, false, None);
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Fragments, instructions, machine context, errors, config, stats
//! - [`x64`] - Decoding and recognition of spills and other mangling idioms
//! - [`translate`] - Translation tables, the mangling-region walk and the state recreator
//! - [`frag_listing`] - Text listings of fragments and an in-memory host for them

pub mod core;
pub mod frag_listing;
pub mod translate;
pub mod x64;

pub use core::{
    Fragment, FragmentFlags, Gpr, Instr, InstrList, InstrOrigin, MachineContext, XlateConfig,
    XlateError, XlateResult, XlateStats,
};
pub use translate::{
    record_translation, RecoveryOutcome, StateRecreator, TranslationEntry, TranslationTable,
};
