// This module provides instruction decoding for fault translation using the iced-x86
// decoder in 64-bit mode. CacheDecoder is the one-instruction-at-a-time contract the
// recreator uses to walk live cache bytes when replaying a stored translation table, and
// to measure source instructions when guessing the pc after the last translated
// instruction. CodeCache is the in-process implementation: a set of mapped byte regions
// (code cache units, source images, snapshot copies) that instructions are decoded from
// at their true addresses, so branch targets come out as absolute pcs.

//! x86-64 instruction decoding using iced-x86.

use crate::core::error::{XlateError, XlateResult};
use crate::core::instr::{Instr, InstrOrigin};
use iced_x86::{Decoder, DecoderOptions};

/// Longest legal x86 instruction.
pub const MAX_INSTR_LENGTH: usize = 15;

/// Decodes one instruction at an address.
pub trait CacheDecoder {
    /// Decode the instruction at `pc`, returning it (as an application
    /// instruction without translation) and the address after it.
    fn decode(&self, pc: u64) -> XlateResult<(Instr, u64)>;

    /// Address of the instruction following the one at `pc`.
    fn next_pc(&self, pc: u64) -> XlateResult<u64> {
        self.decode(pc).map(|(_, next)| next)
    }
}

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc - self.base < self.bytes.len() as u64
    }
}

/// Mapped code regions decodable by address.
#[derive(Debug, Clone, Default)]
pub struct CodeCache {
    regions: Vec<Region>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`. Later mappings shadow earlier overlapping ones.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push(Region { base, bytes });
    }

    /// Overwrite mapped bytes in place, e.g. to simulate self-modifying code.
    pub fn write(&mut self, pc: u64, data: &[u8]) -> XlateResult<()> {
        let region = self
            .regions
            .iter_mut()
            .rev()
            .find(|r| r.contains(pc))
            .ok_or(XlateError::Unmapped { pc })?;
        let start = (pc - region.base) as usize;
        let end = start + data.len();
        if end > region.bytes.len() {
            return Err(XlateError::Unmapped { pc: region.base + region.bytes.len() as u64 });
        }
        region.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn is_mapped(&self, pc: u64) -> bool {
        self.regions.iter().any(|r| r.contains(pc))
    }

    fn bytes_at(&self, pc: u64) -> Option<&[u8]> {
        let region = self.regions.iter().rev().find(|r| r.contains(pc))?;
        let start = (pc - region.base) as usize;
        let end = (start + MAX_INSTR_LENGTH).min(region.bytes.len());
        Some(&region.bytes[start..end])
    }
}

impl CacheDecoder for CodeCache {
    fn decode(&self, pc: u64) -> XlateResult<(Instr, u64)> {
        let bytes = self.bytes_at(pc).ok_or(XlateError::Unmapped { pc })?;
        decode_one(bytes, pc)
    }
}

/// Decode the first instruction of `bytes`, which sit at address `pc`.
pub fn decode_one(bytes: &[u8], pc: u64) -> XlateResult<(Instr, u64)> {
    let mut decoder = Decoder::with_ip(64, bytes, pc, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(XlateError::Unmapped { pc });
    }
    let inner = decoder.decode();
    if inner.is_invalid() {
        return Err(XlateError::InvalidInstruction { pc });
    }
    let next = inner.next_ip();
    Ok((Instr::new(inner, None, InstrOrigin::App), next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Mnemonic;

    #[test]
    fn test_decode_advances_by_length() {
        let mut cache = CodeCache::new();
        // add rax, rbx ; nop
        cache.map(0x1000, vec![0x48, 0x01, 0xd8, 0x90]);

        let (first, next) = cache.decode(0x1000).unwrap();
        assert_eq!(first.mnemonic(), Mnemonic::Add);
        assert_eq!(first.len(), 3);
        assert_eq!(next, 0x1003);

        let (second, next) = cache.decode(next).unwrap();
        assert_eq!(second.mnemonic(), Mnemonic::Nop);
        assert_eq!(next, 0x1004);
    }

    #[test]
    fn test_decode_unmapped_and_truncated() {
        let mut cache = CodeCache::new();
        // mov rcx, [rax+8] with the displacement byte missing
        cache.map(0x2000, vec![0x48, 0x8b, 0x48]);
        assert_eq!(cache.decode(0x3000), Err(XlateError::Unmapped { pc: 0x3000 }));
        assert_eq!(
            cache.decode(0x2000),
            Err(XlateError::InvalidInstruction { pc: 0x2000 })
        );
    }

    #[test]
    fn test_write_shadows_bytes() {
        let mut cache = CodeCache::new();
        cache.map(0x1000, vec![0x90, 0x90]);
        cache.write(0x1001, &[0xc3]).unwrap();
        let (ret, _) = cache.decode(0x1001).unwrap();
        assert_eq!(ret.mnemonic(), Mnemonic::Ret);
        assert!(cache.write(0x1001, &[0x90, 0x90]).is_err());
    }
}
