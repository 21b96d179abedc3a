//! Load-configuration directory preprocessing.
//!
//! The table is copied aside uncompressed (its first dword gives its own
//! size), together with any relocations that point into it; pass 2
//! re-registers those relocations against the copy's final RVA.

use crate::buffer::ImageBuf;
use crate::error::Result;
use crate::pe::headers::{PeHeader, PEDIR_BASERELOC, PEDIR_LOAD_CONFIG};
use crate::reloc::{RelocBuilder, RelocReader};

/// Larger tables are unusual enough to mention, but not refused.
const MAX_SOLOADCONF: u32 = 256;

#[derive(Debug, Default)]
pub struct LoadConfInfo {
    pub soloadconf: u32,
    pub oloadconf: Vec<u8>,
    /// Relocations into the table, as `(offset within table, type)`.
    relocs: Vec<(u32, u32)>,
}

impl LoadConfInfo {
    pub fn has_relocs(&self) -> bool {
        !self.relocs.is_empty()
    }
}

/// Pass 1.
pub fn process_loadconf1(buf: &ImageBuf, ih: &PeHeader, force: bool) -> Result<LoadConfInfo> {
    let mut info = LoadConfInfo::default();
    let dir = ih.ddir(PEDIR_LOAD_CONFIG);
    if dir.size == 0 {
        return Ok(info);
    }
    let lcaddr = dir.vaddr;
    let soloadconf = buf.read_u32("loadconf", lcaddr as usize)?;
    if soloadconf == 0 {
        return Ok(info);
    }
    if soloadconf > MAX_SOLOADCONF {
        tracing::info!("Load Configuration directory {soloadconf} > {MAX_SOLOADCONF}");
    }

    // relocation entries referring to the table are needed for the copy
    let rdir = ih.ddir(PEDIR_BASERELOC);
    let rstream = buf.subref("loadconf reloc", rdir.vaddr as usize, rdir.size as usize)?;
    let mut rel = RelocReader::new(rstream, force)?;
    while let Some((pos, ty)) = rel.next()? {
        if pos >= lcaddr && pos < lcaddr + soloadconf {
            info.relocs.push((pos - lcaddr, ty));
        }
    }

    info.oloadconf = buf
        .subref("loadconf", lcaddr as usize, soloadconf as usize)?
        .to_vec();
    info.soloadconf = soloadconf;
    Ok(info)
}

/// Pass 2: the copy's address is known now, emit its relocations.
pub fn process_loadconf2(info: &LoadConfInfo, rel: &mut RelocBuilder, newaddr: u32) -> Result<()> {
    for &(off, ty) in &info.relocs {
        rel.add(off + newaddr, ty)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::headers::{DataDir, IMAGE_FILE_MACHINE_I386, PE32_COFFMAGIC};
    use crate::reloc::RelocReader;
    use crate::util::put_u32;

    fn header(lc: DataDir, rel: DataDir) -> PeHeader {
        let mut h = PeHeader {
            is64: false,
            cpu: IMAGE_FILE_MACHINE_I386,
            objects: 1,
            time_stamp: 0,
            symtab_ptr: 0,
            symbols: 0,
            opthdrsize: 224,
            flags: 2,
            coffmagic: PE32_COFFMAGIC,
            linkerversion: [0; 2],
            codesize: 0,
            datasize: 0,
            bsssize: 0,
            entry: 0,
            codebase: 0,
            database: 0,
            imagebase: 0x40_0000,
            objectalign: 0x1000,
            filealign: 0x200,
            osversion: [0; 2],
            imageversion: [0; 2],
            subsystemversion: [0; 2],
            win32version: 0,
            imagesize: 0x8000,
            headersize: 0x400,
            chksum: 0,
            subsystem: 3,
            dllflags: 0,
            stackreserve: 0,
            stackcommit: 0,
            heapreserve: 0,
            heapcommit: 0,
            loaderflags: 0,
            ddirsentries: 16,
            ddirs: [DataDir::default(); 16],
        };
        h.ddirs[PEDIR_LOAD_CONFIG] = lc;
        h.ddirs[PEDIR_BASERELOC] = rel;
        h
    }

    #[test]
    fn copies_table_and_relocs() {
        let mut img = vec![0u8; 0x8000];
        put_u32(&mut img, 0x4000, 0x48); // table declares its own size
        put_u32(&mut img, 0x4020, 0xaabbccdd);
        // a reloc block with one entry inside and one outside the table
        put_u32(&mut img, 0x5000, 0x4000);
        put_u32(&mut img, 0x5004, 12);
        img[0x5008..0x500a].copy_from_slice(&((3u16 << 12) | 0x020).to_le_bytes());
        img[0x500a..0x500c].copy_from_slice(&((3u16 << 12) | 0x800).to_le_bytes());

        let ih = header(
            DataDir { vaddr: 0x4000, size: 0x48 },
            DataDir { vaddr: 0x5000, size: 12 },
        );
        let buf = ImageBuf::from_vec(img);
        let info = process_loadconf1(&buf, &ih, false).unwrap();
        assert_eq!(info.soloadconf, 0x48);
        assert_eq!(info.oloadconf.len(), 0x48);
        assert_eq!(&info.oloadconf[0x20..0x24], &0xaabbccddu32.to_le_bytes());
        assert_eq!(info.relocs, vec![(0x20, 3)]);

        let mut rb = RelocBuilder::new(false);
        process_loadconf2(&info, &mut rb, 0x9000).unwrap();
        let (blocks, _) = rb.finish().unwrap();
        let mut rd = RelocReader::new(&blocks, false).unwrap();
        assert_eq!(rd.next().unwrap(), Some((0x9020, 3)));
    }

    #[test]
    fn absent_table_is_empty() {
        let buf = ImageBuf::alloc(0x1000);
        let ih = header(DataDir::default(), DataDir::default());
        let info = process_loadconf1(&buf, &ih, false).unwrap();
        assert_eq!(info.soloadconf, 0);
    }
}
