//! Loading and validating the input image.
//!
//! `PeImage` carries the parsed headers, the section table and the
//! sparse RVA-indexed image buffer through a pack or unpack run.  The
//! methods here are the front half of the pack pipeline: MZ→PE chain
//! walk, header checks, relocation-stripping policy, section loading
//! and debug-directory trimming.

use crate::buffer::ImageBuf;
use crate::config::PackConfig;
use crate::error::{PeError, Result};
use crate::io::InputSource;
use crate::pe::headers::{
    check_machine, MachineKind, PeHeader, PeSection, DDIRS_ENTRIES,
    IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA,
    IMAGE_FILE_DLL, IMAGE_FILE_EXECUTABLE_IMAGE, IMAGE_FILE_RELOCS_STRIPPED,
    IMAGE_SCN_CNT_UNINITIALIZED_DATA, IMAGE_SCN_LNK_INFO, IMAGE_SCN_MEM_SHARED,
    IMAGE_SCN_MEM_WRITE, IMAGE_SUBSYSTEM_EFI_APPLICATION,
    IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER, IMAGE_SUBSYSTEM_EFI_ROM,
    IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER, PEDIR_BASERELOC, PEDIR_BOUND_IMPORT,
    PEDIR_COM_DESCRIPTOR, PEDIR_DEBUG, PEDIR_DELAY_IMPORT, PEDIR_IAT, PEDIR_IMPORT,
    PE_HEADER_SIZE_32, PE_HEADER_SIZE_64, PE_SECTION_SIZE,
};
use crate::util::{align_up, get_u16, get_u32};

const EFI_SUBSYSTEMS: u32 = (1 << IMAGE_SUBSYSTEM_EFI_APPLICATION)
    | (1 << IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER)
    | (1 << IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER)
    | (1 << IMAGE_SUBSYSTEM_EFI_ROM);

#[derive(Debug)]
pub struct PeImage {
    pub machine: MachineKind,
    pub pe_offset: u32,
    pub ih: PeHeader,
    pub isection: Vec<PeSection>,
    pub rvamin: u32,
    pub ibuf: ImageBuf,
    pub isdll: bool,
    pub isefi: bool,
    pub file_size: u64,
}

impl PeImage {
    /// Follow the MZ chain to the PE header and parse it.  `Ok(None)`
    /// means the file is not a PE image at all.
    pub fn load(fi: &mut dyn InputSource) -> Result<Option<PeImage>> {
        let file_size = fi.size();
        let Some(pe_offset) = find_pe_offset(fi, file_size)? else {
            return Ok(None);
        };

        fi.seek(u64::from(pe_offset))?;
        let mut hdr_bytes = vec![0u8; PE_HEADER_SIZE_64];
        let got = fi.read(&mut hdr_bytes)?;
        if got < PE_HEADER_SIZE_32 {
            return Err(PeError::cant_pack("truncated PE header"));
        }
        hdr_bytes.truncate(got);
        let ih = PeHeader::parse(&hdr_bytes)?;
        let machine = check_machine(ih.cpu)?;
        match machine {
            MachineKind::Amd64 if !ih.is64 => {
                return Err(PeError::cant_pack("AMD64 image with a PE32 header"))
            }
            MachineKind::I386 | MachineKind::Arm if ih.is64 => {
                return Err(PeError::cant_pack("32-bit machine with a PE32+ header"))
            }
            _ => {}
        }

        let isefi = ih.subsystem < 32 && (1u32 << ih.subsystem) & EFI_SUBSYSTEMS != 0;
        let isdll = !isefi && ih.flags & IMAGE_FILE_DLL != 0;
        Ok(Some(PeImage {
            machine,
            pe_offset,
            ih,
            isection: Vec::new(),
            rvamin: 0,
            ibuf: ImageBuf::alloc(0),
            isdll,
            isefi,
            file_size,
        }))
    }

    pub fn sizeof_ih(&self) -> usize {
        if self.ih.is64 {
            PE_HEADER_SIZE_64
        } else {
            PE_HEADER_SIZE_32
        }
    }

    pub fn read_section_headers(&mut self, fi: &mut dyn InputSource) -> Result<()> {
        let objs = self.ih.objects as usize;
        if objs == 0 {
            return Ok(());
        }
        let table_off = u64::from(self.pe_offset) + self.sizeof_ih() as u64;
        if self.file_size < table_off + (PE_SECTION_SIZE * objs) as u64 {
            return Err(PeError::CantPack(format!("too many sections {objs}")));
        }
        fi.seek(table_off)?;
        let mut raw = vec![0u8; PE_SECTION_SIZE * objs];
        fi.read_exact(&mut raw)?;
        self.isection = raw
            .chunks_exact(PE_SECTION_SIZE)
            .map(PeSection::parse)
            .collect::<Result<Vec<_>>>()?;

        self.rvamin = self.isection[0].vaddr;
        let last = &self.isection[objs - 1];
        let rvalast = last.vaddr.wrapping_add(last.vsize);
        // expect: first is min, last is max
        for (j, sec) in self.isection.iter().enumerate() {
            let lo = sec.vaddr;
            let hi = lo.wrapping_add(sec.vsize);
            if hi < lo {
                return Err(PeError::CantPack(format!(
                    "bad section[{j}] wrap-around {lo:#x} {:#x}",
                    sec.vsize
                )));
            }
            if lo < self.rvamin {
                return Err(PeError::CantPack(format!(
                    "bad section .rva [{j}] {lo:#x} < [0] {:#x}",
                    self.rvamin
                )));
            }
            if rvalast < hi {
                return Err(PeError::CantPack(format!(
                    "bad section .rva+.vsize [{j}] {hi:#x} > [{}] {rvalast:#x}",
                    objs - 1
                )));
            }
        }
        Ok(())
    }

    /// Header oddities that are probably fine but deserve `--force`.
    pub fn needs_force(&self) -> bool {
        let expected_opthdr = if self.ih.is64 { 240 } else { 224 } as u16;
        self.ih.opthdrsize != expected_opthdr
            || self.ih.flags & IMAGE_FILE_EXECUTABLE_IMAGE == 0
            || (self.ih.entry == 0 && !self.isdll)
            || self.ih.ddirsentries != DDIRS_ENTRIES as u32
    }

    pub fn check_header_values(&self, cfg: &PackConfig, subsystem_mask: u32) -> Result<()> {
        let subsystem = u32::from(self.ih.subsystem);
        if subsystem >= 32 || (1u32 << subsystem) & subsystem_mask == 0 {
            return Err(PeError::CantPack(format!(
                "PE: subsystem {subsystem} is not supported"
            )));
        }
        // CLR runtime header means a .NET image
        if self.ih.ddir(PEDIR_COM_DESCRIPTOR).size != 0 {
            return Err(PeError::cant_pack(".NET files are not yet supported"));
        }
        if self.isection.is_empty() {
            return Err(PeError::cant_pack("No section was found"));
        }
        if &self.isection[0].name[..3] == b"UPX" {
            return Err(PeError::AlreadyPacked);
        }
        if !cfg.force && self.ih.ddir(15).size != 0 {
            return Err(PeError::cant_pack(
                "file is possibly packed/protected (try --force)",
            ));
        }
        if self.ih.entry != 0 && self.ih.entry < self.rvamin {
            return Err(PeError::cant_pack("run a virus scanner on this file!"));
        }
        if self.ih.filealign == 0 || !self.ih.filealign.is_power_of_two() {
            return Err(PeError::CantPack(format!(
                "bad file alignment {:#x}",
                self.ih.filealign
            )));
        }
        Ok(())
    }

    /// Decide whether the output drops the relocation directory.
    /// May clear ASLR flags in the header when forced.
    pub fn handle_strip_relocs(
        &mut self,
        cfg: &PackConfig,
        default_imagebase: u64,
    ) -> Result<bool> {
        let aslr = self.ih.dllflags & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE != 0;
        let strip = cfg.strip_relocs.unwrap_or(
            !(self.isdll || self.isefi || aslr) && self.ih.imagebase >= default_imagebase,
        );
        if !strip {
            tracing::info!("Base relocations stripping is disabled for this image");
            return Ok(false);
        }
        if self.isdll || self.isefi {
            return Err(PeError::cant_pack(
                "--strip-relocs is not allowed with DLL and EFI images",
            ));
        }
        if aslr {
            if cfg.force {
                // clearing DYNAMIC_BASE; HIGH_ENTROPY_VA has no effect
                // without it
                self.ih.dllflags ^= IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE;
                self.ih.dllflags &= !IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA;
            } else {
                return Err(PeError::cant_pack(
                    "--strip-relocs is not allowed with ASLR (use with --force to remove)",
                ));
            }
        }
        if !cfg.force && self.ih.imagebase < default_imagebase {
            return Err(PeError::cant_pack(
                "--strip-relocs may not support this imagebase (try with --force)",
            ));
        }
        Ok(true)
    }

    /// Load raw section bytes into the RVA-indexed image buffer.
    /// Returns the file offset where the overlay starts.
    pub fn read_sections(&mut self, fi: &mut dyn InputSource, cfg: &PackConfig) -> Result<u32> {
        let ih = &self.ih;
        let usize_ = ih.imagesize as usize;
        let xtrasize = u64::from(ih.datasize.max(65536))
            + u64::from(ih.ddir(PEDIR_IMPORT).size)
            + u64::from(ih.ddir(PEDIR_BOUND_IMPORT).size)
            + u64::from(ih.ddir(PEDIR_IAT).size)
            + u64::from(ih.ddir(PEDIR_DELAY_IMPORT).size)
            + u64::from(ih.ddir(PEDIR_BASERELOC).size);
        let total = usize_ as u64 + xtrasize;
        if total > crate::buffer::MAX_ALLOC as u64 {
            return Err(PeError::cant_pack("image too large"));
        }
        self.ibuf = ImageBuf::alloc(total as usize);
        self.ibuf.raise_good(self.isection[0].rawdataptr as usize);

        let filealign = ih.filealign;
        let mut overlaystart = 0u32;
        let mut prev_end = 0u32;
        for ic in 0..self.isection.len() {
            let sec = self.isection[ic].clone();
            if sec.rawdataptr != 0 && overlaystart < sec.rawdataptr.wrapping_add(sec.size) {
                overlaystart = align_up(sec.rawdataptr.wrapping_add(sec.size), filealign);
            }
            if self.isection[ic].vsize == 0 {
                self.isection[ic].vsize = sec.size;
            }
            if sec.flags & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0
                || sec.rawdataptr == 0
                || sec.flags & IMAGE_SCN_LNK_INFO != 0
            {
                continue;
            }
            if sec.vaddr as usize + sec.size as usize > usize_ {
                return Err(PeError::cant_pack("section size problem"));
            }
            if sec.flags & (IMAGE_SCN_MEM_WRITE | IMAGE_SCN_MEM_SHARED)
                == (IMAGE_SCN_MEM_WRITE | IMAGE_SCN_MEM_SHARED)
                && !cfg.force
            {
                return Err(PeError::cant_pack(
                    "writable shared sections not supported (try --force)",
                ));
            }
            if prev_end != 0 && sec.rawdataptr.wrapping_sub(prev_end) > filealign && !cfg.force {
                return Err(PeError::cant_pack(
                    "superfluous data between sections (try --force)",
                ));
            }
            fi.seek(u64::from(sec.rawdataptr))?;
            let take = sec.size.min(self.isection[ic].vsize);
            let dst = self
                .ibuf
                .subref_mut("section", sec.vaddr as usize, take as usize)
                .map_err(|_| PeError::internal("buffer too small 1"))?;
            fi.read_exact(dst)?;
            self.ibuf.raise_good((sec.vaddr + take) as usize);
            prev_end = sec.rawdataptr.wrapping_add(take);
        }
        Ok(overlaystart)
    }

    /// Trim debug data hanging past the sections and zero the debug
    /// directory.
    pub fn strip_debug(&mut self, mut overlaystart: u32) -> Result<u32> {
        let dir = self.ih.ddir(PEDIR_DEBUG);
        if dir.vaddr == 0 {
            return Ok(overlaystart);
        }
        const DEBUG_DIR_SIZE: usize = 28;
        let raw = self
            .ibuf
            .subref("debug", dir.vaddr as usize, dir.size as usize)?
            .to_vec();
        for dd in raw.chunks_exact(DEBUG_DIR_SIZE) {
            let size = get_u32(dd, 16).unwrap();
            let fpos = get_u32(dd, 24).unwrap();
            if overlaystart == fpos {
                overlaystart += size;
            }
        }
        self.ibuf
            .fill("debug", dir.vaddr as usize, dir.size as usize, 0)?;
        Ok(overlaystart)
    }

    /// Section index containing `addr`, or the section count when none
    /// does.
    pub fn virta2objnum(&self, addr: u32) -> usize {
        for (ic, sec) in self.isection.iter().enumerate() {
            if sec.vaddr <= addr && addr < sec.vaddr.wrapping_add(sec.vsize) {
                return ic;
            }
        }
        self.isection.len()
    }

    /// Drop the trailing section if the stripped directory at `vaddr`
    /// was the only thing in it.
    pub fn tryremove(&self, vaddr: u32, objs: u16) -> u16 {
        let ic = self.virta2objnum(vaddr);
        if ic != 0 && ic as u16 == objs - 1 {
            tracing::info!(
                "removed section: {ic} size: {:#x}",
                self.isection[ic].size
            );
            return objs - 1;
        }
        objs
    }

    /// True when relocations are already stripped by the header flag.
    pub fn relocs_stripped(&self) -> bool {
        self.ih.flags & IMAGE_FILE_RELOCS_STRIPPED != 0
    }
}

/// Walk the MZ chain (bounded, overlap- and wrap-checked) to the PE
/// signature.
fn find_pe_offset(fi: &mut dyn InputSource, file_size: u64) -> Result<Option<u32>> {
    let mut pe_offset = 0u32;
    for _ in 0..20 {
        fi.seek(u64::from(pe_offset))?;
        let mut h = [0u8; 64];
        if fi.read(&mut h)? < 64 {
            return Ok(None);
        }
        if get_u16(&h, 0) == Some(0x5a4d) {
            // dos exe
            let m512 = u32::from(get_u16(&h, 2).unwrap());
            let p512 = u32::from(get_u16(&h, 4).unwrap());
            let relocoffs = get_u16(&h, 24).unwrap();
            let nexepos = get_u32(&h, 60).unwrap();
            if nexepos != 0 && nexepos < 64 {
                // overlapping MZ and PE headers by 'leanify', etc.
                return Err(PeError::CantPack(format!(
                    "PE and MZ header overlap: {nexepos:#x} < 0x40"
                )));
            }
            let delta = if relocoffs >= 0x40 {
                nexepos // new format exe
            } else if p512 * 512 + m512 - m512 != 0 {
                512
            } else {
                nexepos
            };
            let next = pe_offset.checked_add(delta);
            match next {
                Some(n) if u64::from(n) <= file_size => pe_offset = n,
                _ => {
                    return Err(PeError::CantPack(format!(
                        "bad PE delta {delta:#x} at offset {pe_offset:#x}"
                    )))
                }
            }
        } else if get_u32(&h, 0) == Some(0x0000_4550) {
            return Ok(Some(pe_offset));
        } else {
            return Ok(None);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemSource;
    use crate::util::{put_u16, put_u32};

    fn minimal_pe32(sections: &[(u32, u32, u32, u32)]) -> Vec<u8> {
        // (vaddr, vsize, rawptr, rawsize)
        let pe_offset = 0x80usize;
        let opt_size = 224u16;
        let sect_off = pe_offset + 24 + opt_size as usize;
        let total = sections
            .iter()
            .map(|s| (s.2 + s.3) as usize)
            .max()
            .unwrap_or(0)
            .max(0x400);
        let mut buf = vec![0u8; total];
        put_u16(&mut buf, 0, 0x5a4d);
        put_u16(&mut buf, 24, 0x40); // relocoffs: new format
        put_u32(&mut buf, 60, pe_offset as u32);
        put_u32(&mut buf, pe_offset, 0x0000_4550);
        put_u16(&mut buf, pe_offset + 4, 0x014c);
        put_u16(&mut buf, pe_offset + 6, sections.len() as u16);
        put_u16(&mut buf, pe_offset + 20, opt_size);
        put_u16(&mut buf, pe_offset + 22, 0x0102); // EXECUTABLE | 32BIT
        put_u16(&mut buf, pe_offset + 24, 0x010b);
        put_u32(&mut buf, pe_offset + 40, 0x1000); // entry
        put_u32(&mut buf, pe_offset + 52, 0x0040_0000); // imagebase
        put_u32(&mut buf, pe_offset + 56, 0x1000); // objectalign
        put_u32(&mut buf, pe_offset + 60, 0x200); // filealign
        put_u32(&mut buf, pe_offset + 80, 0x10000); // imagesize
        put_u32(&mut buf, pe_offset + 84, 0x400); // headersize
        put_u16(&mut buf, pe_offset + 92, 3); // subsystem CUI
        put_u32(&mut buf, pe_offset + 116, 16); // ddirs
        for (i, &(vaddr, vsize, rawptr, rawsize)) in sections.iter().enumerate() {
            let off = sect_off + i * 40;
            buf[off..off + 5].copy_from_slice(b".sect");
            put_u32(&mut buf, off + 8, vsize);
            put_u32(&mut buf, off + 12, vaddr);
            put_u32(&mut buf, off + 16, rawsize);
            put_u32(&mut buf, off + 20, rawptr);
            put_u32(&mut buf, off + 36, 0x6000_0020);
        }
        buf
    }

    #[test]
    fn loads_minimal_image() {
        let data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        assert_eq!(img.machine, MachineKind::I386);
        assert!(!img.ih.is64);
        assert!(!img.isdll);
        img.read_section_headers(&mut src).unwrap();
        assert_eq!(img.rvamin, 0x1000);
        assert!(!img.needs_force());
    }

    #[test]
    fn not_pe_is_none() {
        let mut src = MemSource::new(vec![0u8; 256], "t");
        assert!(PeImage::load(&mut src).unwrap().is_none());
        let mut short = MemSource::new(vec![0x4d, 0x5a], "t");
        assert!(PeImage::load(&mut short).unwrap().is_none());
    }

    #[test]
    fn overlapping_mz_pe_rejected() {
        let mut data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200)]);
        put_u32(&mut data, 60, 0x20); // nexepos inside the MZ header
        let mut src = MemSource::new(data, "t");
        match PeImage::load(&mut src) {
            Err(PeError::CantPack(msg)) => assert!(msg.contains("overlap")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn section_monotonicity_enforced() {
        let data = minimal_pe32(&[(0x2000, 0x200, 0x400, 0x200), (0x1000, 0x200, 0x600, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        match img.read_section_headers(&mut src) {
            Err(PeError::CantPack(msg)) => assert!(msg.contains("bad section")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn upx_marker_detected() {
        let data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        img.read_section_headers(&mut src).unwrap();
        img.isection[0].set_name("UPX0");
        let cfg = PackConfig::default();
        match img.check_header_values(&cfg, 1 << 3) {
            Err(PeError::AlreadyPacked) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn strip_relocs_policy() {
        let data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        let cfg = PackConfig::default();
        // auto: plain exe at the default base strips
        assert!(img.handle_strip_relocs(&cfg, 0x0040_0000).unwrap());
        // ASLR without force refuses an explicit strip
        img.ih.dllflags |= IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE;
        let mut cfg2 = PackConfig::default();
        cfg2.strip_relocs = crate::config::Tristate::Yes;
        assert!(img.handle_strip_relocs(&cfg2, 0x0040_0000).is_err());
        // auto with ASLR: keep relocs
        assert!(!img.handle_strip_relocs(&cfg, 0x0040_0000).unwrap());
        // forced: ASLR flags cleared
        cfg2.force = true;
        assert!(img.handle_strip_relocs(&cfg2, 0x0040_0000).unwrap());
        assert_eq!(img.ih.dllflags & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, 0);
    }

    #[test]
    fn dll_strip_refused() {
        let data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        img.isdll = true;
        let mut cfg = PackConfig::default();
        cfg.strip_relocs = crate::config::Tristate::Yes;
        match img.handle_strip_relocs(&cfg, 0x0040_0000) {
            Err(PeError::CantPack(msg)) => {
                assert!(msg.contains("--strip-relocs is not allowed with DLL"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn superfluous_padding_rejected() {
        // second section's raw data starts far past the first's end
        let data = minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200), (0x2000, 0x200, 0x1000, 0x200)]);
        let mut src = MemSource::new(data, "t");
        let mut img = PeImage::load(&mut src).unwrap().unwrap();
        img.read_section_headers(&mut src).unwrap();
        let cfg = PackConfig::default();
        match img.read_sections(&mut src, &cfg) {
            Err(PeError::CantPack(msg)) => assert!(msg.contains("superfluous")),
            other => panic!("unexpected: {other:?}"),
        }
        let mut forced = PackConfig::default();
        forced.force = true;
        let mut src2 = MemSource::new(
            minimal_pe32(&[(0x1000, 0x200, 0x400, 0x200), (0x2000, 0x200, 0x1000, 0x200)]),
            "t",
        );
        let mut img2 = PeImage::load(&mut src2).unwrap().unwrap();
        img2.read_section_headers(&mut src2).unwrap();
        assert!(img2.read_sections(&mut src2, &forced).is_ok());
    }
}
