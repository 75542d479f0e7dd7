// This module defines error types for fcache-xl8 using the thiserror crate for idiomatic
// Rust error handling. XlateError covers the plumbing that can genuinely fail: decoding
// cache or source bytes that are unmapped or malformed, fragments whose body does not fit
// the 16-bit cache offsets of a translation table, corrupt serialized tables, and missing
// fragments. Recovery outcomes themselves are never errors: the recreator folds every
// degradation into a RecoveryOutcome. XlateResult<T> is the convenience alias.

//! Error types for fault translation.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for translation plumbing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XlateError {
    #[error("no code mapped at {pc:#x}")]
    Unmapped { pc: u64 },

    #[error("invalid instruction at {pc:#x}")]
    InvalidInstruction { pc: u64 },

    #[error("fragment body is {size} bytes, beyond the 16-bit translation offset range")]
    FragmentTooLarge { size: u64 },

    #[error("corrupt translation table: {reason}")]
    CorruptTable { reason: String },

    #[error("fragment not found for {pc:#x}")]
    FragmentNotFound { pc: u64 },

    #[error("cannot rebuild instruction list for fragment {tag:#x}")]
    RebuildFailed { tag: u64 },
}

/// Result type alias for translation operations.
pub type XlateResult<T> = Result<T, XlateError>;
