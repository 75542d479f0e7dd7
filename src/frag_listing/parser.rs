//! Fragment listing parser implementation.

use super::*;
use crate::core::error::XlateError;
use crate::core::fragment::{ExitStub, FragmentFlags};
use crate::core::instr::{Instr, InstrOrigin};
use crate::translate::adaptor::LandmarkKind;
use crate::x64::decode::decode_one;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected {expected}, found {found}")]
    Unexpected {
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("line {line}: {message}")]
    Invalid { line: usize, message: String },
    #[error("line {line}: {source}")]
    Decode { line: usize, source: XlateError },
}

pub fn parse_listing(text: &str) -> Result<Listing, ParseError> {
    let parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    listing: Listing,
}

/// Body line of a fragment before it is placed in the cache.
enum BodyLine {
    Label,
    Instr {
        origin: InstrOrigin,
        translation: Option<u64>,
        exit: bool,
        bytes: Vec<u8>,
        line: usize,
    },
}

#[derive(Default)]
struct FragmentHeader {
    id: Option<u32>,
    tag: Option<u64>,
    cache: Option<u64>,
    flags: FragmentFlags,
    selfmod_copy: Option<u64>,
    record_table: bool,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            listing: Listing::default(),
        }
    }

    fn parse(mut self) -> Result<Listing, ParseError> {
        self.skip_whitespace(true);

        while !self.is_eof() {
            let keyword = self.read_word("directive")?;
            match keyword {
                "source" => {
                    let base = self.read_number()?;
                    self.expect(':')?;
                    let bytes = self.read_bytes()?;
                    self.listing.sources.push((base, bytes));
                }
                "routine" => {
                    let start = self.read_number()?;
                    let end = self.read_number()?;
                    if end <= start {
                        return Err(self.invalid(format!("empty routine range {start:#x}..{end:#x}")));
                    }
                    self.listing.routines.push(start..end);
                }
                "landmark" => {
                    let kind = match self.read_word("landmark kind")? {
                        "after-syscall" => LandmarkKind::AfterSyscall,
                        "reset-exit-stub" => LandmarkKind::ResetExitStub,
                        "vsyscall-return" => LandmarkKind::VsyscallReturn,
                        other => return Err(self.unexpected("landmark kind", other)),
                    };
                    let pc = self.read_number()?;
                    let app_pc = self.read_number()?;
                    self.listing.landmarks.push((pc, Landmark { kind, app_pc }));
                }
                "tls" => {
                    let offset = self.read_number()?;
                    self.expect('=')?;
                    let value = self.read_number()?;
                    self.listing.tls_slots.push((offset, value));
                }
                "mcontext" => {
                    let name = self.read_word("register")?;
                    let Some(reg) = SpillReg::ALL.into_iter().find(|r| r.to_string() == name) else {
                        return Err(self.unexpected("spill register", name));
                    };
                    self.expect('=')?;
                    let value = self.read_number()?;
                    self.listing.mcontext_slots.push((reg, value));
                }
                "fragment" => {
                    let fragment = self.parse_fragment()?;
                    self.listing.fragments.push(fragment);
                }
                other => return Err(self.unexpected("directive", other)),
            }
            self.skip_whitespace(true);
        }

        Ok(self.listing)
    }

    fn parse_fragment(&mut self) -> Result<ListedFragment, ParseError> {
        let header = self.parse_header()?;
        let (Some(tag), Some(cache)) = (header.tag, header.cache) else {
            return Err(self.invalid("fragment needs tag= and cache=".to_string()));
        };
        if header.flags.selfmod_sandboxed && header.selfmod_copy.is_none() {
            return Err(self.invalid("selfmod fragment needs copy=".to_string()));
        }

        let mut prefix: Vec<(Vec<u8>, usize)> = Vec::new();
        let mut body: Vec<BodyLine> = Vec::new();
        let mut stubs: Vec<(Vec<u8>, usize)> = Vec::new();
        loop {
            self.skip_whitespace(true);
            if self.is_eof() {
                return Err(self.unexpected("'end'", "end of input"));
            }
            let line = self.line();
            let keyword = self.read_word("fragment line")?;
            let origin = match keyword {
                "end" => break,
                "prefix" => {
                    if !body.is_empty() {
                        return Err(self.invalid("prefix after body instructions".to_string()));
                    }
                    self.expect(':')?;
                    prefix.push((self.read_bytes()?, line));
                    continue;
                }
                "stub" => {
                    self.expect(':')?;
                    stubs.push((self.read_bytes()?, line));
                    continue;
                }
                "label" => {
                    if !stubs.is_empty() {
                        return Err(self.invalid("body line after exit stubs".to_string()));
                    }
                    body.push(BodyLine::Label);
                    continue;
                }
                "app" => InstrOrigin::App,
                "mangled" => InstrOrigin::MangledApp,
                "ours" => InstrOrigin::Mangling,
                "meta" => InstrOrigin::Meta,
                other => return Err(self.unexpected("fragment line", other)),
            };
            if !stubs.is_empty() {
                return Err(self.invalid("body line after exit stubs".to_string()));
            }

            let translation = match self.read_word("translation")? {
                "-" => None,
                word => Some(self.parse_number(word)?),
            };
            let exit = if self.try_read(':') {
                false
            } else {
                let word = self.read_word("'exit' or ':'")?;
                if word != "exit" {
                    return Err(self.unexpected("'exit' or ':'", word));
                }
                self.expect(':')?;
                true
            };
            let bytes = self.read_bytes()?;
            body.push(BodyLine::Instr {
                origin,
                translation,
                exit,
                bytes,
                line,
            });
        }

        self.place_fragment(header, tag, cache, prefix, body, stubs)
    }

    fn parse_header(&mut self) -> Result<FragmentHeader, ParseError> {
        let mut header = FragmentHeader::default();
        loop {
            self.skip_whitespace(false);
            if self.is_eof() || self.current_char() == Some('\n') {
                break;
            }
            match self.read_word("fragment attribute")? {
                "id" => {
                    self.expect('=')?;
                    let id = self.read_number()?;
                    header.id = Some(
                        u32::try_from(id).map_err(|_| self.invalid(format!("id {id} out of range")))?,
                    );
                }
                "tag" => {
                    self.expect('=')?;
                    header.tag = Some(self.read_number()?);
                }
                "cache" => {
                    self.expect('=')?;
                    header.cache = Some(self.read_number()?);
                }
                "trace" => header.flags.is_trace = true,
                "deleted" => header.flags.pending_deletion = true,
                "table" => header.record_table = true,
                "selfmod" => header.flags.selfmod_sandboxed = true,
                "copy" => {
                    self.expect('=')?;
                    header.selfmod_copy = Some(self.read_number()?);
                }
                other => return Err(self.unexpected("fragment attribute", other)),
            }
        }
        Ok(header)
    }

    /// Lay the fragment out at consecutive cache pcs and decode each line.
    fn place_fragment(
        &self,
        header: FragmentHeader,
        tag: u64,
        cache: u64,
        prefix: Vec<(Vec<u8>, usize)>,
        body: Vec<BodyLine>,
        stubs: Vec<(Vec<u8>, usize)>,
    ) -> Result<ListedFragment, ParseError> {
        let mut cache_bytes = Vec::new();
        let mut pc = cache;

        for (bytes, line) in &prefix {
            decode_exact(bytes, pc, *line)?;
            pc += bytes.len() as u64;
            cache_bytes.extend_from_slice(bytes);
        }
        let prefix_size = cache_bytes.len() as u32;

        let mut list = InstrList::new();
        let mut exit_ctis = Vec::new();
        for entry in body {
            match entry {
                BodyLine::Label => list.push(Instr::label()),
                BodyLine::Instr {
                    origin,
                    translation,
                    exit,
                    bytes,
                    line,
                } => {
                    let instr = decode_exact(&bytes, pc, line)?
                        .with_translation(translation)
                        .with_origin(origin);
                    if exit {
                        if !instr.is_cti() {
                            return Err(ParseError::Invalid {
                                line,
                                message: format!("exit at {pc:#x} is not a branch"),
                            });
                        }
                        exit_ctis.push(pc);
                    }
                    list.push(instr);
                    pc += bytes.len() as u64;
                    cache_bytes.extend_from_slice(&bytes);
                }
            }
        }

        if stubs.len() > exit_ctis.len() {
            return Err(self.invalid(format!(
                "{} exit stubs for {} exits",
                stubs.len(),
                exit_ctis.len()
            )));
        }
        let mut exit_stubs = Vec::with_capacity(exit_ctis.len());
        for (i, cti_pc) in exit_ctis.into_iter().enumerate() {
            match stubs.get(i) {
                Some((bytes, line)) => {
                    decode_exact(bytes, pc, *line)?;
                    exit_stubs.push(ExitStub {
                        cti_pc,
                        stub_pc: pc,
                        has_local_stub: true,
                    });
                    pc += bytes.len() as u64;
                    cache_bytes.extend_from_slice(bytes);
                }
                None => exit_stubs.push(ExitStub {
                    cti_pc,
                    stub_pc: cti_pc,
                    has_local_stub: false,
                }),
            }
        }

        let size = u32::try_from(cache_bytes.len())
            .map_err(|_| self.invalid("fragment larger than 4GiB".to_string()))?;
        let id = header
            .id
            .unwrap_or(self.listing.fragments.len() as u32 + 1);
        let mut fragment = Fragment::new(id, tag, cache, size)
            .with_prefix(prefix_size)
            .with_flags(header.flags)
            .with_exit_stubs(exit_stubs);
        if let Some(copy) = header.selfmod_copy {
            fragment = fragment.with_selfmod_copy(copy);
        }

        Ok(ListedFragment {
            fragment,
            list,
            cache_bytes,
            record_table: header.record_table,
        })
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    /// Comments run to the end of the line; the newline itself is left for
    /// the caller unless `skip_newlines` is set.
    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), ParseError> {
        if !self.try_read(ch) {
            let found = self
                .current_char()
                .map_or_else(|| "end of input".to_string(), |c| format!("{c:?}"));
            return Err(ParseError::Unexpected {
                line: self.line(),
                expected: match ch {
                    ':' => "':'",
                    '=' => "'='",
                    _ => "punctuation",
                },
                found,
            });
        }
        Ok(())
    }

    /// Next run of characters up to whitespace, punctuation or a comment,
    /// staying on the current line.
    fn read_word(&mut self, expected: &'static str) -> Result<&'a str, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_whitespace() || matches!(ch, ':' | '=' | ';') {
                break;
            }
            self.advance();
        }
        if start == self.pos {
            let found = match self.current_char() {
                None => "end of input".to_string(),
                Some('\n') => "end of line".to_string(),
                Some(c) => format!("{c:?}"),
            };
            return Err(ParseError::Unexpected {
                line: self.line(),
                expected,
                found,
            });
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_number(&mut self) -> Result<u64, ParseError> {
        let word = self.read_word("number")?;
        self.parse_number(word)
    }

    fn parse_number(&self, word: &str) -> Result<u64, ParseError> {
        let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => word.replace('_', "").parse(),
        };
        parsed.map_err(|_| self.unexpected("number", word))
    }

    /// Hex bytes to the end of the line.
    fn read_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Vec::new();
        loop {
            self.skip_whitespace(false);
            if self.is_eof() || self.current_char() == Some('\n') {
                break;
            }
            let word = self.read_word("hex byte")?;
            if word.len() != 2 {
                return Err(self.unexpected("hex byte", word));
            }
            let byte = u8::from_str_radix(word, 16).map_err(|_| self.unexpected("hex byte", word))?;
            bytes.push(byte);
        }
        if bytes.is_empty() {
            return Err(self.unexpected("hex bytes", "end of line"));
        }
        Ok(bytes)
    }

    fn unexpected(&self, expected: &'static str, found: &str) -> ParseError {
        ParseError::Unexpected {
            line: self.line(),
            expected,
            found: found.to_string(),
        }
    }

    fn invalid(&self, message: String) -> ParseError {
        ParseError::Invalid {
            line: self.line(),
            message,
        }
    }
}

/// Decode `bytes` at `pc` as exactly one instruction.
fn decode_exact(bytes: &[u8], pc: u64, line: usize) -> Result<Instr, ParseError> {
    let (instr, next) = decode_one(bytes, pc).map_err(|source| ParseError::Decode { line, source })?;
    let used = next - pc;
    if used != bytes.len() as u64 {
        return Err(ParseError::Invalid {
            line,
            message: format!(
                "{} bytes at {pc:#x} hold a {used}-byte instruction",
                bytes.len()
            ),
        });
    }
    Ok(instr)
}
