//! Fragment listings: a text format for code-cache fragments and the
//! runtime around them, and an in-memory host built from one.
//!
//! Listings drive the integration tests and the `xl8dump` tool without a
//! live translator behind them.
//!
//! # Listing Format
//!
//! ```text
//! ; comments start with a semicolon
//! source 0x401000 : 48 01 d8 c3
//! routine 0x20000 0x20100
//! landmark after-syscall 0x20010 0x401020
//! tls 0x08 = 0x1111
//! mcontext rbx = 0x2222
//!
//! fragment id=1 tag=0x401000 cache=0x10000 trace table
//!   prefix : 65 48 8b 0c 25 08 00 00 00
//!   app 0x401000 : 48 01 d8
//!   ours 0x401003 : 65 48 89 0c 25 08 00 00 00
//!   mangled 0x401003 : 48 89 c1
//!   meta - : 90
//!   label
//!   app 0x401003 exit : e9 00 00 00 00
//!   stub : 48 89 c0
//! end
//! ```
//!
//! Instruction lines carry one encoded instruction each, laid out at
//! consecutive cache addresses starting at `cache`: prefix first, then the
//! body, then the exit stubs. `stub` lines pair in order with the body
//! instructions marked `exit`. Header flags are `trace`, `selfmod copy=ADDR`,
//! `deleted` (pending deletion) and `table` (record a translation table at
//! load time).

pub mod parser;
pub mod store;

pub use parser::{parse_listing, ParseError};
pub use store::{MemoryStore, SimThread};

use crate::core::fragment::Fragment;
use crate::core::instr::InstrList;
use crate::translate::adaptor::Landmark;
use crate::x64::spill::SpillReg;
use std::ops::Range;

/// One fragment of a listing with everything needed to host it.
#[derive(Debug)]
pub struct ListedFragment {
    pub fragment: Fragment,
    /// Body instructions as the translator emitted them, from the entry pc.
    pub list: InstrList,
    /// Cache bytes from the fragment start, prefix and stubs included.
    pub cache_bytes: Vec<u8>,
    /// Record and attach a translation table when loaded.
    pub record_table: bool,
}

/// A parsed listing.
#[derive(Debug, Default)]
pub struct Listing {
    pub fragments: Vec<ListedFragment>,
    /// Source images as `(base, bytes)`.
    pub sources: Vec<(u64, Vec<u8>)>,
    pub routines: Vec<Range<u64>>,
    pub landmarks: Vec<(u64, Landmark)>,
    pub tls_slots: Vec<(u64, u64)>,
    pub mcontext_slots: Vec<(SpillReg, u64)>,
}
