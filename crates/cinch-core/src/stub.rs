//! Loader stub collaborator.
//!
//! The engine only needs the [`StubLinker`] contract: assemble named
//! loader sections, define symbols, report section offsets, and patch
//! the pack header into the assembled image.  [`BaselineStub`] is the
//! deterministic built-in provider; emitting real machine code is the
//! job of an external stub assembler wired in through the same trait.

use std::collections::BTreeMap;

use crate::codec::{PackHeader, PACK_HEADER_SIZE};
use crate::error::{PeError, Result};

/// Section holding the decompressor entry code.
pub const SECT_ENTRY: &str = "ENTRY";
/// Section holding the TLS callback trampoline.
pub const SECT_TLSC: &str = "PETLSC";
/// Identification string.
pub const SECT_IDENTSTR: &str = "IDENTSTR";
/// Reserved space the pack header is patched into.
pub const SECT_PACKHDR: &str = "UPX1HEAD";

/// Symbol naming the TLS callback handler inside the loader.
pub const SYM_TLS_HANDLER: &str = "PETLSC2";

/// Byte sequence at the start of the loader entry; the unpacker uses it
/// to recognize images whose stub was tampered with.
pub const ENTRY_FINGERPRINT: &[u8] = &[0x8b, 0x1e, 0x83, 0xee, 0xfc, 0x11, 0xdb];

const IDENT: &[u8] = b"$Info: This file is packed with the cinch executable packer $\n\0";

pub trait StubLinker {
    /// Append a named section to the loader image.
    fn add_loader(&mut self, section: &str) -> Result<()>;
    fn define_symbol(&mut self, name: &str, value: u64) -> Result<()>;
    fn symbol_offset(&self, name: &str) -> Result<u64>;
    /// Resolve symbol references inside the assembled loader.
    fn relocate(&mut self) -> Result<()>;
    fn loader(&self) -> Result<&[u8]>;
    fn loader_size(&self) -> usize;
    /// `(offset, size)` of a named section inside the loader image.
    fn loader_section(&self, name: &str) -> Result<(u32, u32)>;
    /// Patch the pack header into its reserved section.
    fn patch_pack_header(&mut self, ph: &PackHeader) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Baseline implementation
// ---------------------------------------------------------------------------

const ENTRY_SIZE: usize = 128;
const TLSC_SIZE: usize = 16;
/// Offset of the handler entry point inside the TLS trampoline.
const TLSC_HANDLER_OFF: u64 = 8;

pub struct BaselineStub {
    image: Vec<u8>,
    sections: Vec<(String, u32, u32)>,
    symbols: BTreeMap<String, u64>,
}

impl BaselineStub {
    pub fn new() -> BaselineStub {
        BaselineStub {
            image: Vec::new(),
            sections: Vec::new(),
            symbols: BTreeMap::new(),
        }
    }

    fn section_bytes(&self, name: &str) -> Result<Vec<u8>> {
        match name {
            SECT_ENTRY => {
                let mut code = vec![0u8; ENTRY_SIZE];
                code[..ENTRY_FINGERPRINT.len()].copy_from_slice(ENTRY_FINGERPRINT);
                Ok(code)
            }
            SECT_TLSC => Ok(vec![0u8; TLSC_SIZE]),
            SECT_IDENTSTR => Ok(IDENT.to_vec()),
            SECT_PACKHDR => Ok(vec![0u8; PACK_HEADER_SIZE]),
            other => Err(PeError::Internal(format!("unknown stub section {other}"))),
        }
    }
}

impl Default for BaselineStub {
    fn default() -> Self {
        BaselineStub::new()
    }
}

impl StubLinker for BaselineStub {
    fn add_loader(&mut self, section: &str) -> Result<()> {
        let bytes = self.section_bytes(section)?;
        let offset = self.image.len() as u32;
        self.sections
            .push((section.to_string(), offset, bytes.len() as u32));
        self.image.extend_from_slice(&bytes);
        Ok(())
    }

    fn define_symbol(&mut self, name: &str, value: u64) -> Result<()> {
        self.symbols.insert(name.to_string(), value);
        Ok(())
    }

    fn symbol_offset(&self, name: &str) -> Result<u64> {
        if name == SYM_TLS_HANDLER {
            let (off, _) = self.loader_section(SECT_TLSC)?;
            return Ok(u64::from(off) + TLSC_HANDLER_OFF);
        }
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| PeError::Internal(format!("undefined stub symbol {name}")))
    }

    fn relocate(&mut self) -> Result<()> {
        // embed the defined symbol values into the entry code so the
        // loader bytes are a pure function of the layout
        let (entry_off, entry_size) = self.loader_section(SECT_ENTRY)?;
        let mut at = entry_off as usize + ENTRY_FINGERPRINT.len() + 1;
        let end = (entry_off + entry_size) as usize;
        for value in self.symbols.values() {
            if at + 8 > end {
                break;
            }
            self.image[at..at + 8].copy_from_slice(&value.to_le_bytes());
            at += 8;
        }
        Ok(())
    }

    fn loader(&self) -> Result<&[u8]> {
        if self.image.is_empty() {
            return Err(PeError::internal("stub loader not assembled"));
        }
        Ok(&self.image)
    }

    fn loader_size(&self) -> usize {
        self.image.len()
    }

    fn loader_section(&self, name: &str) -> Result<(u32, u32)> {
        self.sections
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|&(_, off, size)| (off, size))
            .ok_or_else(|| PeError::Internal(format!("missing stub section {name}")))
    }

    fn patch_pack_header(&mut self, ph: &PackHeader) -> Result<()> {
        let (off, size) = self.loader_section(SECT_PACKHDR)?;
        if (size as usize) < PACK_HEADER_SIZE {
            return Err(PeError::internal("pack header section too small"));
        }
        let off = off as usize;
        self.image[off..off + PACK_HEADER_SIZE].copy_from_slice(&ph.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PACK_VERSION;

    fn assembled() -> BaselineStub {
        let mut stub = BaselineStub::new();
        stub.add_loader(SECT_ENTRY).unwrap();
        stub.add_loader(SECT_IDENTSTR).unwrap();
        stub.add_loader(SECT_PACKHDR).unwrap();
        stub
    }

    #[test]
    fn sections_are_located() {
        let stub = assembled();
        let (entry_off, entry_size) = stub.loader_section(SECT_ENTRY).unwrap();
        assert_eq!(entry_off, 0);
        assert_eq!(entry_size as usize, ENTRY_SIZE);
        let (id_off, id_size) = stub.loader_section(SECT_IDENTSTR).unwrap();
        assert_eq!(id_off as usize, ENTRY_SIZE);
        assert_eq!(id_size as usize, IDENT.len());
        assert_eq!(
            stub.loader_size(),
            ENTRY_SIZE + IDENT.len() + PACK_HEADER_SIZE
        );
    }

    #[test]
    fn entry_carries_fingerprint() {
        let stub = assembled();
        let loader = stub.loader().unwrap();
        assert_eq!(&loader[..ENTRY_FINGERPRINT.len()], ENTRY_FINGERPRINT);
    }

    #[test]
    fn pack_header_is_patched() {
        let mut stub = assembled();
        let ph = PackHeader {
            version: PACK_VERSION,
            u_len: 0x1234,
            ..PackHeader::default()
        };
        stub.patch_pack_header(&ph).unwrap();
        let (off, _) = stub.loader_section(SECT_PACKHDR).unwrap();
        let decoded = PackHeader::decode(&stub.loader().unwrap()[off as usize..]).unwrap();
        assert_eq!(decoded.u_len, 0x1234);
    }

    #[test]
    fn tls_handler_symbol() {
        let mut stub = BaselineStub::new();
        stub.add_loader(SECT_ENTRY).unwrap();
        stub.add_loader(SECT_TLSC).unwrap();
        stub.add_loader(SECT_IDENTSTR).unwrap();
        stub.add_loader(SECT_PACKHDR).unwrap();
        assert_eq!(
            stub.symbol_offset(SYM_TLS_HANDLER).unwrap(),
            ENTRY_SIZE as u64 + TLSC_HANDLER_OFF
        );
    }

    #[test]
    fn symbols_resolve_after_definition() {
        let mut stub = assembled();
        assert!(stub.symbol_offset("SRCADDR").is_err());
        stub.define_symbol("SRCADDR", 0x4000).unwrap();
        assert_eq!(stub.symbol_offset("SRCADDR").unwrap(), 0x4000);
        stub.relocate().unwrap();
        // value embedded into the entry code
        let loader = stub.loader().unwrap();
        let at = ENTRY_FINGERPRINT.len() + 1;
        assert_eq!(&loader[at..at + 8], &0x4000u64.to_le_bytes());
    }
}
