//! The unpack path: locate the compressed blob, decompress, recover the
//! saved headers from the trailing extra-info, run every preprocessing
//! pass in reverse and emit the reconstructed image.

use crate::buffer::ImageBuf;
use crate::codec::{Compressor, PackHeader, PACK_HEADER_SIZE};
use crate::error::{PeError, Result};
use crate::export::Export;
use crate::filter::Filter;
use crate::imports::rebuild_imports;
use crate::io::{InputSource, OutputSink};
use crate::packer::copy_overlay;
use crate::pe::headers::{
    DataDir, MachineKind, PeHeader, PeSection, WidthSpec, IMAGE_FILE_RELOCS_STRIPPED,
    PEDIR_BASERELOC, PEDIR_BOUND_IMPORT, PEDIR_DEBUG, PEDIR_EXPORT, PEDIR_IAT, PEDIR_IMPORT,
    PEDIR_RESOURCE, PE_SECTION_SIZE, RT_GROUP_ICON,
};
use crate::pe::image::PeImage;
use crate::reloc::{unoptimize_reloc, RelocBuilder};
use crate::resource::ResourceTree;
use crate::stub::ENTRY_FINGERPRINT;
use crate::util::{adler32, align_up, get_u32};

#[derive(Debug, Clone, Copy)]
pub struct UnpackOutcome {
    pub u_len: u32,
    pub c_len: u32,
    pub out_size: u64,
}

struct PackedFile {
    image: PeImage,
    ph: PackHeader,
    /// File offset of the compressed payload.
    payload_off: u64,
}

fn scan_for_header(fi: &mut dyn InputSource, start: u64) -> Result<Option<(u64, PackHeader)>> {
    fi.seek(start)?;
    let mut window = vec![0u8; 1024 + PACK_HEADER_SIZE];
    let got = fi.read(&mut window)?;
    window.truncate(got);
    Ok(PackHeader::scan(&window).map(|(off, ph)| (start + off as u64, ph)))
}

/// Recognize one of our packed files and locate its pack header.
fn can_unpack(fi: &mut dyn InputSource) -> Result<PackedFile> {
    let not_packed = || PeError::cant_unpack("file is not packed with this packer");
    let mut image = PeImage::load(fi)?.ok_or_else(not_packed)?;
    image.read_section_headers(fi)?;

    let min_sections = if image.isefi { 2 } else { 3 };
    let objs = image.isection.len();
    if objs < min_sections {
        return Err(not_packed());
    }
    let max_sections = if image.machine == MachineKind::Arm { 4 } else { 3 };
    let is_packed = objs <= max_sections
        && (image.ih.ddir(15).size != 0 || image.ih.entry > image.isection[1].vaddr);

    let mut found = None;
    if &image.isection[0].name[..3] == b"UPX" {
        let start = u64::from(image.isection[1].rawdataptr).saturating_sub(64);
        found = scan_for_header(fi, start)?;
        if found.is_none() && objs > 2 {
            // layouts with the header at the start of the aux section
            found = scan_for_header(fi, u64::from(image.isection[2].rawdataptr))?;
        }
    }

    match (is_packed, found) {
        (true, Some((header_off, ph))) => {
            ph.check_version()?;
            Ok(PackedFile {
                image,
                ph,
                payload_off: header_off + PACK_HEADER_SIZE as u64,
            })
        }
        (false, None) => Err(not_packed()),
        (true, None) if objs > 2 && image.ih.entry < image.isection[2].vaddr => {
            // the marker is there but the header is not: look for the
            // stub fingerprint to tell tampering from coincidence
            let entry_fpos = u64::from(image.ih.entry)
                .wrapping_sub(u64::from(image.isection[1].vaddr))
                .wrapping_add(u64::from(image.isection[1].rawdataptr));
            let mut buf = [0u8; 256];
            let mut hits = 0;
            if fi.seek(entry_fpos).is_ok() {
                if let Ok(got) = fi.read(&mut buf) {
                    hits = buf[..got]
                        .windows(ENTRY_FINGERPRINT.len())
                        .filter(|w| *w == ENTRY_FINGERPRINT)
                        .count();
                }
            }
            if hits >= 2 {
                Err(PeError::cant_unpack(
                    "file is modified/hacked/protected; take care!!!",
                ))
            } else {
                Err(PeError::cant_unpack(
                    "file is possibly modified/hacked/protected; take care!",
                ))
            }
        }
        _ => Err(not_packed()),
    }
}

// ---------------------------------------------------------------------------
// Rebuild passes
// ---------------------------------------------------------------------------

fn rebuild_relocs(
    obuf: &mut ImageBuf,
    oh: &mut PeHeader,
    rvamin: u32,
    orig_crelocs: u32,
    big: u8,
    width: &WidthSpec,
    force: bool,
) -> Result<()> {
    let dir = oh.ddir(PEDIR_BASERELOC);
    if dir.vaddr == 0 || dir.size == 0 || oh.flags & IMAGE_FILE_RELOCS_STRIPPED != 0 {
        return Ok(());
    }
    let dir_off = dir
        .vaddr
        .checked_sub(rvamin)
        .ok_or_else(|| PeError::cant_unpack("bad reloc directory address"))?;
    if dir.size == 8 {
        // some tricky dlls carry a lone empty block
        obuf.copy_in("reloc", dir_off as usize, &[0, 0, 0, 0, 8, 0, 0, 0])?;
        return Ok(());
    }

    let bits = if width.reloc_type == 3 { 32 } else { 64 };
    // the stream lives inside the image the decoder mutates, and the
    // reloc sites never overlap it, so decode from a snapshot
    let stream_off = orig_crelocs as usize;
    let stream_copy = obuf
        .subref("reloc stream", stream_off, obuf.len() - stream_off.min(obuf.len()))?
        .to_vec();
    let mut stream_ref: &[u8] = &stream_copy;
    let positions = unoptimize_reloc(&mut stream_ref, obuf.bytes_mut(), bits, true)?;
    let tail_off = stream_off + (stream_copy.len() - stream_ref.len());

    // 16-bit relocation tables follow the delta stream
    let mut low16: Vec<u32> = Vec::new();
    let mut high16: Vec<u32> = Vec::new();
    let mut off = tail_off;
    if big & 6 != 0 {
        let first_is_low = big & 4 != 0;
        let first = if first_is_low { &mut low16 } else { &mut high16 };
        loop {
            let v = obuf.read_u32("reloc table", off)?;
            off += 4;
            if v == 0 {
                break;
            }
            first.push(v);
        }
        if big & 6 == 6 {
            loop {
                let v = obuf.read_u32("reloc table", off)?;
                off += 4;
                if v == 0 {
                    break;
                }
                high16.push(v);
            }
        }
    }

    let mut rel = RelocBuilder::new(force);
    for &v in &low16 {
        rel.add(v + rvamin, 2)?;
    }
    for &v in &high16 {
        rel.add(v + rvamin, 1)?;
    }
    for &pos in &positions {
        if width.reloc_type == 3 {
            let w = obuf.read_u32("reloc site", pos as usize)?;
            obuf.write_u32(
                "reloc site",
                pos as usize,
                w.wrapping_add(oh.imagebase as u32).wrapping_add(rvamin),
            )?;
        } else {
            let w = obuf.read_u64("reloc site", pos as usize)?;
            obuf.write_u64(
                "reloc site",
                pos as usize,
                w.wrapping_add(oh.imagebase).wrapping_add(u64::from(rvamin)),
            )?;
        }
        rel.add(rvamin + pos, width.reloc_type)?;
    }
    let (blocks, soxrelocs) = rel.finish()?;
    obuf.copy_in("reloc", dir_off as usize, &blocks)?;
    oh.set_ddir(PEDIR_BASERELOC, dir.vaddr, soxrelocs);
    Ok(())
}

fn rebuild_exports(
    obuf: &mut ImageBuf,
    oh: &PeHeader,
    packed_export: DataDir,
    rvamin: u32,
    aux: &mut ImageBuf,
    aux_bias: u32,
) -> Result<()> {
    let orig = oh.ddir(PEDIR_EXPORT);
    if orig.size == 0 || orig.vaddr == packed_export.vaddr {
        return Ok(()); // nothing to do
    }
    let at = orig
        .vaddr
        .checked_sub(rvamin)
        .ok_or_else(|| PeError::cant_unpack("bad export directory address"))?;
    let mut xport = Export::new(aux_bias);
    xport.convert(aux, packed_export.vaddr, packed_export.size)?;
    let soexport = align_up(xport.size(), 4);
    let mut out = vec![0u8; soexport as usize];
    xport.build(&mut out, orig.vaddr)?;
    obuf.copy_in("export", at as usize, &out)?;
    Ok(())
}

fn rebuild_resources(
    obuf: &mut ImageBuf,
    oh: &PeHeader,
    packed_resource: DataDir,
    rvamin: u32,
    aux: &ImageBuf,
    lastvaddr: u32,
    mut icondir_count: u16,
) -> Result<()> {
    let orig = oh.ddir(PEDIR_RESOURCE);
    if orig.size == 0 || packed_resource.size == 0 {
        return Ok(());
    }
    let vaddr = packed_resource.vaddr;
    if vaddr < lastvaddr || (vaddr - lastvaddr) as usize > aux.len() {
        return Err(PeError::cant_unpack("corrupted PE header"));
    }
    let root_off = (vaddr - lastvaddr) as usize;
    let mut tree = ResourceTree::init(aux, root_off)?;
    for idx in 0..tree.leaves().len() {
        let (offs, size, tid) = {
            let leaf = &tree.leaves()[idx];
            (leaf.offset, leaf.size_aligned(), leaf.tid)
        };
        if offs > vaddr {
            // a kept blob: its original RVA sits right in front of it
            let blob_off = (offs - lastvaddr) as usize;
            if blob_off < 4 {
                return Err(PeError::cant_unpack("corrupted resources"));
            }
            let origoffs = aux.read_u32("res origoffs", blob_off - 4)?;
            let dst = origoffs
                .checked_sub(rvamin)
                .ok_or_else(|| PeError::cant_unpack("corrupted resources"))?;
            tree.leaves_mut()[idx].newoffset = origoffs;
            let blob = aux.subref("res blob", blob_off, size as usize)?.to_vec();
            obuf.copy_in("res blob", dst as usize, &blob)?;
            if icondir_count != 0 && tid == RT_GROUP_ICON {
                // restore the icon count the packer clamped to one
                obuf.write_u16("icondir", dst as usize + 4, icondir_count)?;
                icondir_count = 0;
            }
        }
    }
    if tree.dirsize() != 0 {
        let dir = tree.build()?;
        let at = orig
            .vaddr
            .checked_sub(rvamin)
            .ok_or_else(|| PeError::cant_unpack("corrupted resources"))?
            as usize;
        // write back only when the original directory was zeroed away
        if obuf.read_u32("res dir", at + 12)? == 0 {
            obuf.copy_in("res dir", at, &dir)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The unpack driver
// ---------------------------------------------------------------------------

pub fn unpack(
    fi: &mut dyn InputSource,
    fo: &mut dyn OutputSink,
    force: bool,
    codec: &mut dyn Compressor,
) -> Result<UnpackOutcome> {
    let PackedFile {
        image,
        ph,
        payload_off,
    } = can_unpack(fi)?;
    let set_oft = image.machine == MachineKind::Arm;

    // copy the original MZ stub
    let mut mz = vec![0u8; image.pe_offset as usize];
    fi.seek(0)?;
    fi.read_exact(&mut mz)?;
    fo.write_all(&mz)?;

    if image.ih.filealign == 0 {
        return Err(PeError::cant_unpack("unexpected value in the PE header"));
    }
    let iobjs = image.isection.len();
    let last = &image.isection[iobjs - 1];
    let raw_end = u64::from(last.rawdataptr) + u64::from(last.size);
    let fam = u64::from(image.ih.filealign);
    let overlay = image
        .file_size
        .saturating_sub((raw_end + fam - 1) & !(fam - 1));

    if ph.u_len < 8
        || ph.u_len as usize > crate::buffer::MAX_ALLOC
        || ph.c_len as usize > crate::buffer::MAX_ALLOC
    {
        return Err(PeError::cant_unpack("bad length in pack header"));
    }

    // read and decompress the payload
    let mut cdata = vec![0u8; ph.c_len as usize];
    fi.seek(payload_off)?;
    fi.read_exact(&mut cdata)?;
    if adler32(1, &cdata) != ph.c_adler {
        return Err(PeError::cant_unpack("compressed data checksum mismatch"));
    }
    let mut obuf = ImageBuf::alloc(ph.u_len as usize);
    let produced = codec.decompress(ph.method, &cdata, obuf.bytes_mut())?;
    if produced != ph.u_len as usize {
        return Err(PeError::cant_unpack("decompressed size mismatch"));
    }
    if adler32(1, obuf.bytes()) != ph.u_adler {
        return Err(PeError::cant_unpack("uncompressed data checksum mismatch"));
    }

    // the last dword points at the extra-info blob
    let mut skip = obuf.read_u32("extra_info offset", ph.u_len as usize - 4)? as usize;
    let hdr_bytes = obuf.subref("extra_info", skip, crate::pe::headers::PE_HEADER_SIZE_32)?;
    let is64 = get_u32(hdr_bytes, 0) == Some(0x0000_4550) && hdr_bytes[24] == 0x0b && hdr_bytes[25] == 0x02;
    let take = if is64 {
        crate::pe::headers::PE_HEADER_SIZE_64
    } else {
        crate::pe::headers::PE_HEADER_SIZE_32
    };
    let mut oh = PeHeader::parse(obuf.subref("extra_info", skip, take)?)
        .map_err(|_| PeError::cant_unpack("bad extra_info header"))?;
    if !oh.filealign.is_power_of_two() {
        return Err(PeError::cant_unpack("bad extra_info header"));
    }
    skip += take;

    let objs = oh.objects as usize;
    if objs == 0 || (iobjs > 2 && image.isection[2].size == 0) {
        return Err(PeError::cant_unpack("unexpected value in the PE header"));
    }
    let mut osection = Vec::with_capacity(objs);
    for _ in 0..objs {
        let raw = obuf.subref("extra section", skip, PE_SECTION_SIZE)?;
        osection.push(
            PeSection::parse(raw).map_err(|_| PeError::cant_unpack("bad extra section"))?,
        );
        skip += PE_SECTION_SIZE;
    }
    let rvamin = osection[0].vaddr;
    let width = *WidthSpec::for_header(oh.is64);

    // the non-compressed aux section
    let mut aux = ImageBuf::alloc(0);
    if iobjs > 2 {
        let sec = &image.isection[2];
        if sec.size as usize > crate::buffer::MAX_ALLOC {
            return Err(PeError::cant_unpack("bad aux section size"));
        }
        let mut raw = vec![0u8; sec.size as usize];
        fi.seek(u64::from(sec.rawdataptr))?;
        fi.read_exact(&mut raw)?;
        aux = ImageBuf::from_vec(raw);
    }

    // unfilter
    if ph.filter_id != 0 {
        let mut ft = Filter::new();
        ft.init(ph.filter_id, oh.codebase.wrapping_sub(rvamin));
        ft.cto = ph.filter_cto;
        ft.buf_len = oh.codesize;
        let start = oh.codebase.wrapping_sub(rvamin) as usize;
        let window = obuf.subref_mut("filtered code", start, oh.codesize as usize)?;
        ft.unfilter(window)?;
    }

    // a bug in ancient versions: trust the packed file's flag too
    if image.ih.flags & IMAGE_FILE_RELOCS_STRIPPED != 0 {
        oh.flags |= IMAGE_FILE_RELOCS_STRIPPED;
        oh.set_ddir(PEDIR_BASERELOC, 0, 0);
    }

    // imports
    if iobjs > 2
        && oh.ddir(PEDIR_IMPORT).vaddr != 0
        && oh.ddir(PEDIR_IMPORT).size > crate::linker::IMPORT_DESC_SIZE as u32
    {
        let cimports = obuf.read_u32("extra_info imports", skip)?;
        let inamespos = obuf.read_u32("extra_info imports", skip + 4)?;
        skip += 8;
        rebuild_imports(
            &mut obuf,
            rvamin,
            cimports,
            inamespos,
            &aux,
            image.isection[2].vaddr,
            image.ih.ddir(PEDIR_IMPORT),
            oh.ddir(PEDIR_IMPORT),
            &width,
            set_oft,
        )?;
    }

    // relocations
    let rdir = oh.ddir(PEDIR_BASERELOC);
    if rdir.vaddr != 0 && rdir.size != 0 && oh.flags & IMAGE_FILE_RELOCS_STRIPPED == 0 {
        if rdir.size == 8 {
            rebuild_relocs(&mut obuf, &mut oh, rvamin, 0, 0, &width, force)?;
        } else {
            let orig_crelocs = obuf.read_u32("extra_info relocs", skip)?;
            let big = obuf.read_u8("extra_info relocs", skip + 4)?;
            skip += 5;
            rebuild_relocs(&mut obuf, &mut oh, rvamin, orig_crelocs, big, &width, force)?;
        }
    }

    // exports
    if iobjs > 2 {
        rebuild_exports(
            &mut obuf,
            &oh,
            image.ih.ddir(PEDIR_EXPORT),
            rvamin,
            &mut aux,
            image.isection[2].vaddr,
        )?;
    }

    // resources, possibly from their own final section
    let mut res_aux = &aux;
    let res_holder;
    if iobjs > 3 {
        let sec = &image.isection[3];
        let mut raw = vec![0u8; sec.size as usize];
        fi.seek(u64::from(sec.rawdataptr))?;
        fi.read_exact(&mut raw)?;
        res_holder = ImageBuf::from_vec(raw);
        res_aux = &res_holder;
    }
    if iobjs > 2 && oh.ddir(PEDIR_RESOURCE).size != 0 {
        let icondir_count = obuf.read_u16("extra_info icons", skip)?;
        skip += 2;
        rebuild_resources(
            &mut obuf,
            &oh,
            image.ih.ddir(PEDIR_RESOURCE),
            rvamin,
            res_aux,
            image.isection[iobjs - 1].vaddr,
            icondir_count,
        )?;
    }
    let _ = skip;

    // fill the data directory
    oh.set_ddir(PEDIR_DEBUG, 0, 0);
    oh.set_ddir(PEDIR_IAT, 0, 0);
    oh.set_ddir(PEDIR_BOUND_IMPORT, 0, 0);
    oh.headersize = align_up(
        image.pe_offset + oh.sizeof() as u32 + (objs * PE_SECTION_SIZE) as u32,
        oh.filealign,
    );
    oh.chksum = 0;

    // write the reconstructed image
    let mut first_raw = 0usize;
    while first_raw < objs && osection[first_raw].rawdataptr == 0 {
        first_raw += 1;
    }
    fo.write_all(&oh.write())?;
    for sec in &osection {
        fo.write_all(&sec.write())?;
    }
    if first_raw < objs {
        let pos = fo.bytes_written();
        let want = u64::from(osection[first_raw].rawdataptr);
        if want < pos {
            return Err(PeError::cant_unpack("bad section layout"));
        }
        fo.write_all(&vec![0u8; (want - pos) as usize])?;
        for sec in &osection {
            if sec.rawdataptr == 0 {
                continue;
            }
            let len = align_up(sec.size, oh.filealign) as usize;
            let start = sec
                .vaddr
                .checked_sub(rvamin)
                .ok_or_else(|| PeError::cant_unpack("bad section layout"))?
                as usize;
            let avail = obuf.len().saturating_sub(start).min(len);
            fo.write_all(obuf.subref("section", start, avail)?)?;
            if avail < len {
                fo.write_all(&vec![0u8; len - avail])?;
            }
        }
    }
    copy_overlay(fi, fo, image.file_size, overlay)?;

    Ok(UnpackOutcome {
        u_len: ph.u_len,
        c_len: ph.c_len,
        out_size: fo.bytes_written(),
    })
}
