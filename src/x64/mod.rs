//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction decoding using iced-x86
//! - Spill slot layout and spill/restore recognition
//! - Classification of the translator's mangling idioms

pub mod decode;
pub mod mangle;
pub mod spill;

pub use decode::{decode_one, CacheDecoder, CodeCache, MAX_INSTR_LENGTH};
pub use mangle::{classify, MangleIdiom};
pub use spill::{SpillLayout, SpillOp, SpillReg, SpillSet, SpillSlot};
