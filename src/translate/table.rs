// This module defines the per-fragment translation table: the compact, immutable record of
// how cache offsets map back to source addresses once the source may no longer be
// decodable. Each entry marks a change point; between change points the source address
// either stays put (identical stride, used for the translator's own inserted sequences) or
// advances by each cache instruction's length (contiguous stride, plain copied code). An
// entry with no source address keeps client meta code from ever being treated as a
// relocation point. A run of the translator's instructions also records whether it holds
// a rewritten application instruction, which the region tracker must not mistake for an
// unknown idiom. Tables are built once by the recorder, published into the fragment,
// and may be persisted with a fixed little record per entry.

//! Stored translation tables.

use crate::core::error::{XlateError, XlateResult};
use std::fmt;

const FLAG_IDENTICAL: u8 = 0x1;
const FLAG_OUR_MANGLING: u8 = 0x2;
const FLAG_MANGLED_APP: u8 = 0x4;

const COUNT_BYTES: usize = 4;
const ENTRY_BYTES: usize = 2 + 8 + 1;

/// One change point in a [`TranslationTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Offset from the fragment's cache start.
    pub cache_offset: u16,
    /// Source address at this offset; `None` for client meta code.
    pub app: Option<u64>,
    /// The source address does not advance until the next entry.
    pub identical: bool,
    /// Instructions in this run were inserted by the translator.
    pub our_mangling: bool,
    /// The run is a rewritten application instruction inside a mangling
    /// region. Only set together with `our_mangling`.
    pub mangled_app: bool,
}

impl TranslationEntry {
    pub fn new(cache_offset: u16, app: Option<u64>, identical: bool, our_mangling: bool) -> Self {
        Self {
            cache_offset,
            app,
            identical,
            our_mangling,
            mangled_app: false,
        }
    }

    pub fn with_mangled_app(mut self, mangled_app: bool) -> Self {
        debug_assert!(!mangled_app || self.our_mangling);
        self.mangled_app = mangled_app;
        self
    }

    pub fn is_contiguous(&self) -> bool {
        !self.identical
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.identical {
            flags |= FLAG_IDENTICAL;
        }
        if self.our_mangling {
            flags |= FLAG_OUR_MANGLING;
        }
        if self.mangled_app {
            flags |= FLAG_MANGLED_APP;
        }
        flags
    }
}

/// Immutable, exactly-sized sequence of change points with strictly
/// increasing offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationTable {
    entries: Box<[TranslationEntry]>,
}

impl TranslationTable {
    pub fn new(entries: Box<[TranslationEntry]>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].cache_offset < w[1].cache_offset),
            "translation offsets must increase"
        );
        Self { entries }
    }

    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TranslationEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TranslationEntry> {
        self.entries.iter()
    }

    /// First entry at or after `index` that carries a source address.
    pub fn next_translated(&self, index: usize) -> Option<u64> {
        self.entries.get(index..)?.iter().find_map(|e| e.app)
    }

    /// Serialize: entry count as `u32`, then per entry the offset (`u16`),
    /// source address (`u64`, zero for none) and flags (`u8`), all in native
    /// byte order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COUNT_BYTES + self.entries.len() * ENTRY_BYTES);
        out.extend_from_slice(&(self.entries.len() as u32).to_ne_bytes());
        for entry in self.entries.iter() {
            out.extend_from_slice(&entry.cache_offset.to_ne_bytes());
            out.extend_from_slice(&entry.app.unwrap_or(0).to_ne_bytes());
            out.push(entry.flags());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> XlateResult<Self> {
        let corrupt = |reason: String| XlateError::CorruptTable { reason };

        let count_bytes: [u8; COUNT_BYTES] = bytes
            .get(..COUNT_BYTES)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| corrupt(format!("{} bytes is too short for a count", bytes.len())))?;
        let count = u32::from_ne_bytes(count_bytes) as usize;
        let expected = count
            .checked_mul(ENTRY_BYTES)
            .and_then(|n| n.checked_add(COUNT_BYTES))
            .ok_or_else(|| corrupt(format!("entry count {count} overflows")))?;
        if bytes.len() != expected {
            return Err(corrupt(format!(
                "{count} entries need {expected} bytes, got {}",
                bytes.len()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for (i, record) in bytes[COUNT_BYTES..].chunks_exact(ENTRY_BYTES).enumerate() {
            let cache_offset = u16::from_ne_bytes([record[0], record[1]]);
            let mut app = [0u8; 8];
            app.copy_from_slice(&record[2..10]);
            let app = u64::from_ne_bytes(app);
            let flags = record[10];
            if flags & !(FLAG_IDENTICAL | FLAG_OUR_MANGLING | FLAG_MANGLED_APP) != 0 {
                return Err(corrupt(format!("entry {i} has unknown flags {flags:#x}")));
            }
            if flags & FLAG_MANGLED_APP != 0 && flags & FLAG_OUR_MANGLING == 0 {
                return Err(corrupt(format!("entry {i} is a mangled app run outside mangling")));
            }
            if let Some(prev) = entries.last().map(|e: &TranslationEntry| e.cache_offset) {
                if cache_offset <= prev {
                    return Err(corrupt(format!(
                        "entry {i} offset {cache_offset} does not follow {prev}"
                    )));
                }
            }
            entries.push(TranslationEntry {
                cache_offset,
                app: (app != 0).then_some(app),
                identical: flags & FLAG_IDENTICAL != 0,
                our_mangling: flags & FLAG_OUR_MANGLING != 0,
                mangled_app: flags & FLAG_MANGLED_APP != 0,
            });
        }
        Ok(Self::new(entries.into_boxed_slice()))
    }

    /// Printable view with absolute cache addresses.
    pub fn display_at(&self, cache_start: u64) -> TableDisplay<'_> {
        TableDisplay {
            table: self,
            cache_start,
        }
    }
}

/// See [`TranslationTable::display_at`].
pub struct TableDisplay<'a> {
    table: &'a TranslationTable,
    cache_start: u64,
}

impl fmt::Display for TableDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "translation info ({} entries)", self.table.len())?;
        for (i, entry) in self.table.iter().enumerate() {
            let app = match entry.app {
                Some(app) => format!("{app:#x}"),
                None => "none".to_string(),
            };
            writeln!(
                f,
                "\t{} +{:5} == {:#x} => {} {}{}{}",
                i,
                entry.cache_offset,
                self.cache_start + u64::from(entry.cache_offset),
                app,
                if entry.identical { "identical" } else { "contiguous" },
                if entry.our_mangling { " ours" } else { "" },
                if entry.mangled_app { " app" } else { "" }
            )?;
        }
        Ok(())
    }
}
