//! TLS directory preprocessing.
//!
//! Pass 1 copies the directory and its init data aside (the PE loader
//! wants this uncompressed), detects callbacks, and collects the
//! relocations that land inside the data range — this must run before
//! the relocation pass consumes the original stream.  Pass 2 rebases
//! the copy to its final RVA, emits fresh relocations for the moved
//! pointers, and appends the two callback handler slots.

use crate::buffer::ImageBuf;
use crate::error::{PeError, Result};
use crate::pe::headers::{PeHeader, WidthSpec, PEDIR_BASERELOC, PEDIR_TLS};
use crate::reloc::{RelocBuilder, RelocReader};

fn read_ptr(data: &[u8], off: usize, cb_size: u32) -> u64 {
    if cb_size == 4 {
        u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]) as u64
    } else {
        let mut b = [0u8; 8];
        b.copy_from_slice(&data[off..off + 8]);
        u64::from_le_bytes(b)
    }
}

fn write_ptr(data: &mut [u8], off: usize, cb_size: u32, value: u64) {
    if cb_size == 4 {
        data[off..off + 4].copy_from_slice(&(value as u32).to_le_bytes());
    } else {
        data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Debug, Default)]
pub struct TlsInfo {
    /// Emitted size including the callback handler slots; 0 when the
    /// image has no TLS.
    pub sotls: u32,
    /// `sotls` rounded up to the pointer size.
    pub aligned_sotls: u32,
    pub otls: Vec<u8>,
    /// RVA of the TLS index slot, zeroed in the image.
    pub tlsindex: u32,
    pub use_callbacks: bool,
    /// Relocations found inside the TLS data range: `(site rva, type)`.
    in_data_relocs: Vec<(u32, u32)>,
    /// Original init data range as RVAs.
    data_rva: u32,
    data_size: u32,
    datastart_va: u64,
    dataend_va: u64,
}

/// Pass 1.
pub fn process_tls1(
    buf: &mut ImageBuf,
    ih: &PeHeader,
    width: &WidthSpec,
    isefi: bool,
    force: bool,
) -> Result<TlsInfo> {
    let mut info = TlsInfo::default();
    let dir = ih.ddir(PEDIR_TLS);
    if isefi && dir.size != 0 {
        return Err(PeError::cant_pack("TLS not supported on EFI"));
    }
    let take = (dir.size + 3) & !3;
    if take == 0 {
        return Ok(info);
    }
    let cb = width.cb_size;
    let dirsize = width.sotls as usize;
    let tlsp = buf.subref("tls", dir.vaddr as usize, dirsize)?;
    let datastart = read_ptr(tlsp, 0, cb);
    let dataend = read_ptr(tlsp, cb as usize, cb);
    let tlsindex_va = read_ptr(tlsp, 2 * cb as usize, cb);
    let callbacks = read_ptr(tlsp, 3 * cb as usize, cb);

    // TLS callbacks are not implemented on ancient Windows, but when the
    // chain is non-empty the stub must preserve it
    if callbacks != 0 {
        if callbacks < ih.imagebase
            || callbacks - ih.imagebase + 4 >= u64::from(ih.imagesize)
        {
            return Err(PeError::cant_pack("invalid TLS callback"));
        }
        let cb_rva = (callbacks - ih.imagebase) as usize;
        let first = read_ptr(buf.subref("tls", cb_rva, cb as usize)?, 0, cb);
        if first != 0 {
            let mut num_callbacks = 0u32;
            let mut off = cb_rva;
            while read_ptr(buf.subref("tls", off, cb as usize)?, 0, cb) != 0 {
                num_callbacks += 1;
                off += cb as usize;
            }
            tracing::info!("TLS: {num_callbacks} callback(s) found, adding TLS callback handler");
            info.use_callbacks = true;
        }
    }

    let data_rva = datastart
        .checked_sub(ih.imagebase)
        .ok_or_else(|| PeError::cant_pack("invalid TLS data start"))? as u32;
    let data_end_rva = dataend
        .checked_sub(ih.imagebase)
        .filter(|&e| e >= u64::from(data_rva))
        .ok_or_else(|| PeError::cant_pack("invalid TLS data end"))? as u32;
    info.data_rva = data_rva;
    info.data_size = data_end_rva - data_rva;
    info.datastart_va = datastart;
    info.dataend_va = dataend;

    // find the relocation entries inside the tls data area
    let rdir = ih.ddir(PEDIR_BASERELOC);
    let rstream = buf.subref("tls reloc", rdir.vaddr as usize, rdir.size as usize)?;
    let mut rel = RelocReader::new(rstream, force)?;
    while let Some((pos, ty)) = rel.next()? {
        if pos >= data_rva && pos < data_end_rva {
            info.in_data_relocs.push((pos, ty));
        }
    }

    info.sotls = dirsize as u32 + info.data_size;
    // two more pointer slots at the end for the callback handler chain
    if info.use_callbacks {
        info.sotls = ((info.sotls + cb - 1) & !(cb - 1)) + 2 * cb;
    }
    info.aligned_sotls = (info.sotls + cb - 1) & !(cb - 1);

    info.otls = vec![0u8; info.aligned_sotls as usize];
    let header = buf.subref("tls", dir.vaddr as usize, dirsize)?;
    info.otls[..dirsize].copy_from_slice(header);
    // this can reach into BSS slack past the init data
    let take_data = (info.sotls as usize) - dirsize;
    let data = buf.subref("tls", data_rva as usize, take_data)?;
    info.otls[dirsize..dirsize + take_data].copy_from_slice(data);

    info.tlsindex = tlsindex_va.wrapping_sub(ih.imagebase) as u32;
    tracing::info!(
        "TLS: {} bytes tls data and {} relocations added",
        info.data_size,
        info.in_data_relocs.len()
    );

    // makes sure the tls index reads zero after decompression
    if info.tlsindex != 0 && info.tlsindex < ih.imagesize {
        buf.write_u32("tlsindex", info.tlsindex as usize, 0)?;
    }
    Ok(info)
}

/// Pass 2: rebase the copy to `newaddr` and register the relocations
/// the moved directory needs.
pub fn process_tls2(
    info: &mut TlsInfo,
    rel: &mut RelocBuilder,
    newaddr: u32,
    imagebase: u64,
    width: &WidthSpec,
    tls_handler_offset: u32,
) -> Result<()> {
    if info.sotls == 0 {
        return Ok(());
    }
    let cb = width.cb_size;
    let dirsize = width.sotls;

    if tls_handler_offset > 0 && width.tls_handler_offset_reloc > 0 {
        rel.add(
            tls_handler_offset + width.tls_handler_offset_reloc as u32,
            width.reloc_type,
        )?;
    }

    // the directory's own pointers: data start, data end, index slot,
    // plus the callback chain pointer when present
    let ptr_slots = if info.use_callbacks { 4 } else { 3 };
    for ic in 0..ptr_slots {
        rel.add(newaddr + ic * cb, width.reloc_type)?;
    }

    // pointers inside the moved init data
    for &(site, ty) in &info.in_data_relocs {
        let copy_off = (dirsize + site - info.data_rva) as usize;
        if copy_off + cb as usize > info.otls.len() {
            return Err(PeError::cant_pack("TLS relocation outside the data range"));
        }
        let new_site = newaddr + dirsize + (site - info.data_rva);
        let value = read_ptr(&info.otls, copy_off, cb);
        if value >= info.datastart_va && value < info.dataend_va {
            // self-referential: retarget into the moved copy
            let new_target_rva =
                (value - info.datastart_va) as u32 + newaddr + dirsize;
            write_ptr(
                &mut info.otls,
                copy_off,
                cb,
                u64::from(new_target_rva) + imagebase,
            );
        }
        rel.add(new_site, ty)?;
    }

    let data_size = u64::from(info.data_size);
    let new_datastart = u64::from(newaddr + dirsize) + imagebase;
    write_ptr(&mut info.otls, 0, cb, new_datastart);
    write_ptr(&mut info.otls, cb as usize, cb, new_datastart + data_size);

    // point at the new one-entry callback chain (or clear it)
    let cb_chain = if info.use_callbacks {
        u64::from(newaddr + info.sotls - 2 * cb) + imagebase
    } else {
        0
    };
    write_ptr(&mut info.otls, 3 * cb as usize, cb, cb_chain);

    if info.use_callbacks {
        let handler_at = (info.sotls - 2 * cb) as usize;
        write_ptr(
            &mut info.otls,
            handler_at,
            cb,
            u64::from(tls_handler_offset) + imagebase,
        );
        // end of the one-item list
        write_ptr(&mut info.otls, handler_at + cb as usize, cb, 0);
        rel.add(newaddr + info.sotls - 2 * cb, width.reloc_type)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::headers::{DataDir, WIDTH32};
    use crate::util::{get_u32, put_u32};

    const IMAGEBASE: u64 = 0x40_0000;

    fn header_with(tls: DataDir, reloc: DataDir) -> PeHeader {
        {
            let mut h = crate::pe::headers::PeHeader {
                is64: false,
                cpu: crate::pe::headers::IMAGE_FILE_MACHINE_I386,
                objects: 1,
                time_stamp: 0,
                symtab_ptr: 0,
                symbols: 0,
                opthdrsize: 224,
                flags: 2,
                coffmagic: crate::pe::headers::PE32_COFFMAGIC,
                linkerversion: [0; 2],
                codesize: 0,
                datasize: 0,
                bsssize: 0,
                entry: 0x1000,
                codebase: 0x1000,
                database: 0,
                imagebase: IMAGEBASE,
                objectalign: 0x1000,
                filealign: 0x200,
                osversion: [0; 2],
                imageversion: [0; 2],
                subsystemversion: [0; 2],
                win32version: 0,
                imagesize: 0x10000,
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
            h.ddirs[PEDIR_TLS] = tls;
            h.ddirs[PEDIR_BASERELOC] = reloc;
            h
        }
    }

    /// 32-bit image with a TLS directory at 0x2000, 16 bytes of init
    /// data at 0x3000 holding one self-referential pointer, a callback
    /// chain at 0x3100, and a reloc block covering the data pointer.
    fn build_image() -> (ImageBuf, PeHeader) {
        let mut img = vec![0u8; 0x10000];
        // directory
        put_u32(&mut img, 0x2000, (IMAGEBASE + 0x3000) as u32); // datastart
        put_u32(&mut img, 0x2004, (IMAGEBASE + 0x3010) as u32); // dataend
        put_u32(&mut img, 0x2008, (IMAGEBASE + 0x5000) as u32); // index slot
        put_u32(&mut img, 0x200c, (IMAGEBASE + 0x3100) as u32); // callbacks
        // init data: a pointer back into the data range at +8
        put_u32(&mut img, 0x3008, (IMAGEBASE + 0x300c) as u32);
        // callback chain: one callback, then the terminator
        put_u32(&mut img, 0x3100, (IMAGEBASE + 0x1400) as u32);
        // reloc block: one entry for the in-data pointer at 0x3008
        put_u32(&mut img, 0x6000, 0x3000);
        put_u32(&mut img, 0x6004, 12);
        img[0x6008..0x600a].copy_from_slice(&((3u16 << 12) | 0x008).to_le_bytes());
        let ih = header_with(
            DataDir {
                vaddr: 0x2000,
                size: 24,
            },
            DataDir {
                vaddr: 0x6000,
                size: 12,
            },
        );
        (ImageBuf::from_vec(img), ih)
    }

    #[test]
    fn pass1_copies_and_indexes() {
        let (mut buf, ih) = build_image();
        let info = process_tls1(&mut buf, &ih, &WIDTH32, false, false).unwrap();
        assert!(info.use_callbacks);
        // 24 dir + 16 data, aligned, + 2*4 callback slots
        assert_eq!(info.sotls, 24 + 16 + 8);
        assert_eq!(info.tlsindex, 0x5000);
        // the index site was zeroed in the image
        assert_eq!(buf.read_u32("t", 0x5000).unwrap(), 0);
        // the init data made it into the copy
        assert_eq!(
            get_u32(&info.otls, 24 + 8),
            Some((IMAGEBASE + 0x300c) as u32)
        );
        assert_eq!(info.in_data_relocs, vec![(0x3008, 3)]);
    }

    #[test]
    fn pass1_rejects_tls_on_efi() {
        let (mut buf, ih) = build_image();
        match process_tls1(&mut buf, &ih, &WIDTH32, true, false) {
            Err(PeError::CantPack(msg)) => assert!(msg.contains("EFI")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pass1_rejects_bad_callback_pointer() {
        let (mut buf, ih) = build_image();
        buf.write_u32("t", 0x200c, 0x100).unwrap(); // below imagebase
        assert!(process_tls1(&mut buf, &ih, &WIDTH32, false, false).is_err());
    }

    #[test]
    fn pass2_rebases_and_relocates() {
        let (mut buf, ih) = build_image();
        let mut info = process_tls1(&mut buf, &ih, &WIDTH32, false, false).unwrap();
        let mut rel = RelocBuilder::new(false);
        let newaddr = 0x8000;
        let handler = 0x7100;
        process_tls2(&mut info, &mut rel, newaddr, IMAGEBASE, &WIDTH32, handler).unwrap();

        // data pointers retargeted to the copy
        let datastart = get_u32(&info.otls, 0).unwrap() as u64;
        let dataend = get_u32(&info.otls, 4).unwrap() as u64;
        assert_eq!(datastart, IMAGEBASE + 0x8000 + 24);
        assert_eq!(dataend, datastart + 16);
        // self-referential pointer moved with the data
        let moved = get_u32(&info.otls, 24 + 8).unwrap() as u64;
        assert_eq!(moved, IMAGEBASE + 0x8000 + 24 + 0xc);
        // callback chain points at the handler slot pair
        let chain = get_u32(&info.otls, 12).unwrap() as u64;
        assert_eq!(chain, IMAGEBASE + u64::from(newaddr + info.sotls - 8));
        let handler_slot = get_u32(&info.otls, (info.sotls - 8) as usize).unwrap() as u64;
        assert_eq!(handler_slot, IMAGEBASE + 0x7100);
        assert_eq!(get_u32(&info.otls, (info.sotls - 4) as usize), Some(0));

        let (blocks, size) = rel.finish().unwrap();
        assert!(size > 0);
        let mut rd = RelocReader::new(&blocks, false).unwrap();
        let mut sites = Vec::new();
        while let Some((pos, _)) = rd.next().unwrap() {
            sites.push(pos);
        }
        // handler-offset patch site, 4 directory pointers, the moved
        // in-data site, and the handler slot
        assert!(sites.contains(&(handler + 4)));
        for slot in 0..4 {
            assert!(sites.contains(&(newaddr + 4 * slot)));
        }
        assert!(sites.contains(&(newaddr + 24 + 8)));
        assert!(sites.contains(&(newaddr + info.sotls - 8)));
    }

    #[test]
    fn no_tls_is_empty() {
        let mut img = ImageBuf::alloc(0x1000);
        let ih = header_with(DataDir::default(), DataDir::default());
        let info = process_tls1(&mut img, &ih, &WIDTH32, false, false).unwrap();
        assert_eq!(info.sotls, 0);
        assert!(info.otls.is_empty());
    }
}
