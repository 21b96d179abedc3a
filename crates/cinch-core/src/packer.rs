//! The pack path: preprocessing passes, compression, output layout and
//! file emission.
//!
//! Pass 1 rewrites the image buffer: imports, TLS, load config,
//! resources, exports and relocations are each pulled out into compact
//! side buffers and their source bytes zeroed where possible.  The bulk
//! `[image || preprocessed imports || preprocessed relocs || extra
//! info]` is compressed, the new two-to-four section layout is fixed,
//! and pass 2 re-emits every directory against its final RVA.

use crate::codec::{CompressResult, Compressor, PackHeader, PACK_VERSION};
use crate::config::{PackConfig, RT_LAST};
use crate::error::{PeError, Result};
use crate::export::Export;
use crate::filter::{Filter, STRATEGY_NO_FILTER};
use crate::imports::{process_imports1, process_imports2, ImportInfo};
use crate::io::{InputSource, OutputSink};
use crate::loadconf::{process_loadconf1, process_loadconf2, LoadConfInfo};
use crate::pe::headers::{
    MachineKind, PeSection, WidthSpec, IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY,
    IMAGE_DLLCHARACTERISTICS_GUARD_CF, IMAGE_FILE_RELOCS_STRIPPED, IMAGE_SCN_CNT_CODE,
    IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE,
    IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE, IMAGE_SUBSYSTEM_EFI_APPLICATION,
    IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER, IMAGE_SUBSYSTEM_EFI_ROM,
    IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER, IMAGE_SUBSYSTEM_NATIVE, IMAGE_SUBSYSTEM_WINDOWS_CE_GUI,
    IMAGE_SUBSYSTEM_WINDOWS_CUI, IMAGE_SUBSYSTEM_WINDOWS_GUI, PEDIR_BASERELOC, PEDIR_BOUND_IMPORT,
    PEDIR_DEBUG, PEDIR_EXPORT, PEDIR_IAT, PEDIR_IMPORT, PEDIR_LOAD_CONFIG, PEDIR_RESOURCE,
    PEDIR_SECURITY, PEDIR_TLS, PE_SECTION_SIZE,
};
use crate::pe::image::PeImage;
use crate::reloc::{optimize_reloc, RelocBuilder, RelocReader};
use crate::resource::{keep_matches, ResourceTree};
use crate::stub::{StubLinker, SECT_ENTRY, SECT_IDENTSTR, SECT_PACKHDR, SECT_TLSC, SYM_TLS_HANDLER};
use crate::tls::{process_tls1, process_tls2, TlsInfo};
use crate::util::{align_up, get_u16};
use crate::codec::{FORMAT_W32PE, FORMAT_W64PE, FORMAT_WINCE_ARM};
use crate::pe::headers::{RT_GROUP_ICON, RT_ICON};

/// Resources nobody wants compressed, ever.
const ALWAYS_KEPT_RESOURCES: &str = "TYPELIB,REGISTRY,16";

#[derive(Debug, Clone, Copy)]
pub struct PackOutcome {
    pub u_len: u32,
    pub c_len: u32,
    pub in_size: u64,
    pub out_size: u64,
}

struct FormatSpec {
    format: u8,
    default_imagebase: u64,
    subsystem_mask: u32,
    /// WinCE/ARM convention: `.rsrc` goes into its own final section.
    last_section_rsrc_only: bool,
}

fn format_spec(machine: MachineKind) -> FormatSpec {
    match machine {
        MachineKind::Amd64 => FormatSpec {
            format: FORMAT_W64PE,
            default_imagebase: 0x1_4000_0000,
            subsystem_mask: (1 << IMAGE_SUBSYSTEM_WINDOWS_GUI)
                | (1 << IMAGE_SUBSYSTEM_WINDOWS_CUI)
                | (1 << IMAGE_SUBSYSTEM_EFI_APPLICATION)
                | (1 << IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER)
                | (1 << IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER)
                | (1 << IMAGE_SUBSYSTEM_EFI_ROM),
            last_section_rsrc_only: false,
        },
        MachineKind::I386 => FormatSpec {
            format: FORMAT_W32PE,
            default_imagebase: 0x0040_0000,
            subsystem_mask: (1 << IMAGE_SUBSYSTEM_NATIVE)
                | (1 << IMAGE_SUBSYSTEM_WINDOWS_GUI)
                | (1 << IMAGE_SUBSYSTEM_WINDOWS_CUI),
            last_section_rsrc_only: false,
        },
        MachineKind::Arm => FormatSpec {
            format: FORMAT_WINCE_ARM,
            default_imagebase: 0x1_0000,
            subsystem_mask: (1 << IMAGE_SUBSYSTEM_WINDOWS_CE_GUI)
                | (1 << IMAGE_SUBSYSTEM_WINDOWS_GUI)
                | (1 << IMAGE_SUBSYSTEM_WINDOWS_CUI),
            last_section_rsrc_only: true,
        },
    }
}

// ---------------------------------------------------------------------------
// Relocation pass 1
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RelocState {
    sorelocs: u32,
    orelocs: Vec<u8>,
    big_relocs: u32,
}

fn process_relocs1(
    image: &mut PeImage,
    cfg: &PackConfig,
    width: &WidthSpec,
    strip_relocs: bool,
) -> Result<RelocState> {
    let mut state = RelocState::default();
    let dir = image.ih.ddir(PEDIR_BASERELOC);
    let stream = image
        .ibuf
        .subref("reloc", dir.vaddr as usize, dir.size as usize)?
        .to_vec();
    let mut rel = RelocReader::new(&stream, cfg.force)?;
    let counts = *rel.counts();
    let relocnum: u32 = counts[1..].iter().sum();

    if strip_relocs || relocnum == 0 {
        if dir.size != 0 {
            image
                .ibuf
                .fill("reloc", dir.vaddr as usize, dir.size as usize, 0)?;
            image.ih.objects = image.tryremove(dir.vaddr, image.ih.objects);
            image.isection.truncate(image.ih.objects as usize);
        }
        return Ok(state);
    }

    for (ty, &count) in counts.iter().enumerate() {
        let supported = if width.reloc_type == 3 {
            (1..4).contains(&ty)
        } else {
            ty == 10
        };
        if !supported && ty != 0 && count != 0 {
            tracing::warn!("skipping unsupported relocation type {ty} ({count})");
        }
    }

    // collect, rvamin-relative, per type
    let mut fix: Vec<Vec<u32>> = vec![Vec::new(); 16];
    while let Some((pos, ty)) = rel.next()? {
        if pos >= image.ih.imagesize {
            continue; // skip out-of-bounds record
        }
        fix[ty as usize].push(pos - image.rvamin);
    }
    for list in fix.iter_mut() {
        list.sort_unstable();
        let before = list.len();
        list.dedup();
        if list.len() != before && !cfg.force {
            return Err(PeError::cant_pack("duplicate relocs (try --force)"));
        }
    }

    // make the rebasable values imagebase-free before delta coding
    let main = width.reloc_type as usize;
    for &rel_pos in &fix[main] {
        let pos = (rel_pos + image.rvamin) as usize;
        if width.reloc_type == 3 {
            let w = image.ibuf.read_u32("reloc type 3", pos)?;
            image.ibuf.write_u32(
                "reloc type 3",
                pos,
                w.wrapping_sub(image.ih.imagebase as u32)
                    .wrapping_sub(image.rvamin),
            )?;
        } else {
            let w = image.ibuf.read_u64("reloc type 10", pos)?;
            image.ibuf.write_u64(
                "reloc type 10",
                pos,
                w.wrapping_sub(image.ih.imagebase)
                    .wrapping_sub(u64::from(image.rvamin)),
            )?;
        }
    }

    image
        .ibuf
        .fill("reloc", dir.vaddr as usize, dir.size as usize, 0)?;

    let rvamin = image.rvamin as usize;
    let good = image.ibuf.good().max(rvamin);
    let window = image.ibuf.subref_mut("reloc image", rvamin, good - rvamin)?;
    let bits = if width.reloc_type == 3 { 32 } else { 64 };
    state.orelocs = optimize_reloc(&fix[main], window, bits, true, &mut state.big_relocs)?;
    state.sorelocs = state.orelocs.len() as u32;

    // append the 16-bit tables, LOW then HIGH (32-bit only)
    if width.reloc_type == 3 {
        for ty in [2usize, 1] {
            if fix[ty].is_empty() {
                continue;
            }
            for &pos in &fix[ty] {
                state.orelocs.extend_from_slice(&pos.to_le_bytes());
            }
            state.orelocs.extend_from_slice(&0u32.to_le_bytes());
            state.big_relocs |= 2 * ty as u32;
        }
        state.sorelocs = state.orelocs.len() as u32;
    }
    tracing::info!(
        "Relocations: original size: {} bytes, preprocessed size: {}",
        dir.size,
        state.sorelocs
    );
    Ok(state)
}

// ---------------------------------------------------------------------------
// Resource pass 1
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ResState {
    soresources: u32,
    oresources: Vec<u8>,
    icondir_offset: u32,
    icondir_count: u16,
    tree: Option<ResourceTree>,
}

fn resolve_rt_policy(cfg: &PackConfig, isefi: bool, input_name: &str) -> (bool, u8, [bool; RT_LAST]) {
    let compress_resources = cfg.compress_resources.unwrap_or(!isefi);
    let mut icons = cfg.compress_icons;
    let mut rt = [true; RT_LAST];
    for (i, t) in cfg.compress_rt.iter().enumerate() {
        rt[i] = t.unwrap_or(true);
    }
    // by default, don't compress RT_STRINGs of screensavers
    if cfg.compress_rt[crate::pe::headers::RT_STRING as usize].is_auto() {
        rt[crate::pe::headers::RT_STRING as usize] =
            !input_name.to_ascii_lowercase().ends_with(".scr");
    }
    if !compress_resources {
        icons = 0;
        rt = [false; RT_LAST];
    }
    (compress_resources, icons, rt)
}

fn process_resources1(image: &mut PeImage, cfg: &PackConfig, input_name: &str) -> Result<ResState> {
    let mut state = ResState::default();
    let dir = image.ih.ddir(PEDIR_RESOURCE);
    if dir.size == 0 {
        return Ok(state);
    }
    let (compress_resources, icons, rt) = resolve_rt_policy(cfg, image.isefi, input_name);

    let mut tree = ResourceTree::init(&image.ibuf, dir.vaddr as usize)?;

    let mut soresources = u64::from(tree.dirsize());
    for leaf in tree.leaves() {
        soresources += 4 + u64::from(leaf.size_aligned());
    }
    if soresources > crate::buffer::MAX_ALLOC as u64 {
        return Err(PeError::cant_pack("resources too large"));
    }
    let mut ores = vec![0u8; soresources as usize];
    let mut cursor = tree.dirsize() as usize;

    // icon ids belonging to the first icon group
    let mut keep_icons = String::new();
    if icons == 2 {
        for leaf in tree.leaves() {
            if leaf.tid == RT_GROUP_ICON {
                let count = image.ibuf.read_u16("resoff", leaf.offset as usize + 4)?;
                for ic in 0..count as usize {
                    let id = image
                        .ibuf
                        .read_u16("resoff", leaf.offset as usize + 6 + ic * 14 + 12)?;
                    if !keep_icons.is_empty() {
                        keep_icons.push(',');
                    }
                    keep_icons.push_str(&format!("3/{id}"));
                }
                break;
            }
        }
    }

    // the icon id which stays uncompressed when compress_icons == 1
    let mut first_icon_id: Option<u32> = None;
    if icons == 1 {
        for leaf in tree.leaves() {
            if leaf.tid == RT_GROUP_ICON {
                first_icon_id = Some(u32::from(
                    image.ibuf.read_u16("resoff", leaf.offset as usize + 6 + 12)?,
                ));
                break;
            }
        }
    }

    let mut compress_icon = icons > 1;
    let mut compress_idir = icons == 3;

    let mut usize_total = 0u32;
    let mut csize_total = 0u32;
    let mut unum = 0u32;
    let mut cnum = 0u32;

    for idx in 0..tree.leaves().len() {
        let (tid, tname, nid, nname, offs, size_aligned) = {
            let leaf = &tree.leaves()[idx];
            (
                leaf.tid,
                leaf.tname.clone(),
                leaf.nid,
                leaf.nname.clone(),
                leaf.offset,
                leaf.size_aligned(),
            )
        };
        let mut do_compress = true;
        if !compress_resources {
            do_compress = false;
        } else if tid == RT_ICON {
            if icons == 0 {
                do_compress = false;
            } else if icons == 1 && first_icon_id.map_or(true, |id| id == nid) {
                do_compress = compress_icon;
            }
        } else if tid == RT_GROUP_ICON {
            do_compress = compress_idir && icons != 0;
        } else if tid > 0 && tid < RT_LAST as u32 {
            do_compress = rt[tid as usize];
        }

        if do_compress && !keep_icons.is_empty() {
            do_compress &= !keep_matches(tid, tname.as_deref(), nid, nname.as_deref(), &keep_icons);
        }
        if do_compress {
            do_compress &= !keep_matches(
                tid,
                tname.as_deref(),
                nid,
                nname.as_deref(),
                ALWAYS_KEPT_RESOURCES,
            );
        }
        if do_compress && !cfg.keep_resource.is_empty() {
            do_compress &= !keep_matches(
                tid,
                tname.as_deref(),
                nid,
                nname.as_deref(),
                &cfg.keep_resource,
            );
        }

        if do_compress {
            csize_total += size_aligned;
            cnum += 1;
            continue;
        }
        usize_total += size_aligned;
        unum += 1;

        // save the original RVA in front of the copied blob
        ores[cursor..cursor + 4].copy_from_slice(&offs.to_le_bytes());
        cursor += 4;
        let blob = image
            .ibuf
            .subref("resoff", offs as usize, size_aligned as usize)?;
        ores[cursor..cursor + size_aligned as usize].copy_from_slice(blob);
        image
            .ibuf
            .fill("resoff", offs as usize, size_aligned as usize, 0)?;
        tree.leaves_mut()[idx].newoffset = cursor as u32;
        if tid == RT_ICON && icons == 1 {
            compress_icon = true;
        } else if tid == RT_GROUP_ICON {
            if icons == 1 {
                state.icondir_offset = cursor as u32 + 4;
                state.icondir_count =
                    get_u16(&ores, state.icondir_offset as usize).unwrap_or(0);
                let off = state.icondir_offset as usize;
                ores[off..off + 2].copy_from_slice(&1u16.to_le_bytes());
            }
            compress_idir = true;
        }
        cursor += size_aligned as usize;
    }
    state.soresources = cursor as u32;
    ores.truncate(cursor);
    state.oresources = ores;

    if !tree.clear(&mut image.ibuf)? {
        // scattered directory, it has to survive in the compressed bulk
        tracing::warn!("can't remove unneeded resource directory");
    }
    tracing::info!(
        "Resources: compressed {cnum} ({csize_total} bytes), not compressed {unum} ({usize_total} bytes)"
    );
    state.tree = Some(tree);
    Ok(state)
}

fn process_resources2(state: &mut ResState, newaddr: u32) -> Result<()> {
    let Some(tree) = state.tree.as_mut() else {
        return Ok(());
    };
    for leaf in tree.leaves_mut() {
        if leaf.newoffset != 0 {
            leaf.newoffset += newaddr;
        }
    }
    let dir = tree.build()?;
    state.oresources[..dir.len()].copy_from_slice(&dir);
    Ok(())
}

// ---------------------------------------------------------------------------
// Export pass 1
// ---------------------------------------------------------------------------

struct ExportState {
    soexport: u32,
    xport: Export,
}

fn process_exports1(image: &mut PeImage, cfg: &PackConfig) -> Result<ExportState> {
    let dir = image.ih.ddir(PEDIR_EXPORT);
    let mut state = ExportState {
        soexport: align_up(dir.size, 4),
        xport: Export::new(0),
    };
    if state.soexport == 0 {
        return Ok(state);
    }
    if !image.isdll && cfg.compress_exports {
        tracing::warn!("exports compressed, --compress-exports=0 might be needed");
        state.soexport = 0;
        return Ok(state);
    }
    state.xport.convert(&mut image.ibuf, dir.vaddr, dir.size)?;
    state.soexport = align_up(state.xport.size(), 4);
    Ok(state)
}

// ---------------------------------------------------------------------------
// The pack driver
// ---------------------------------------------------------------------------

pub fn pack(
    fi: &mut dyn InputSource,
    fo: &mut dyn OutputSink,
    cfg: &PackConfig,
    codec: &mut dyn Compressor,
    stub: &mut dyn StubLinker,
) -> Result<PackOutcome> {
    // FIXME: we need to think about better support for --exact
    if cfg.exact {
        return Err(PeError::CantPackExact);
    }

    let mut image = PeImage::load(fi)?
        .ok_or_else(|| PeError::cant_pack("not a Portable Executable file"))?;
    let spec = format_spec(image.machine);
    let width = *WidthSpec::for_header(image.ih.is64);

    image.read_section_headers(fi)?;
    if !cfg.force && image.needs_force() {
        return Err(PeError::cant_pack("unexpected value in PE header (try --force)"));
    }

    if image.ih.dllflags & IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY != 0 {
        if cfg.force {
            image.ih.dllflags &= !IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY;
        } else {
            return Err(PeError::cant_pack(
                "image forces integrity check (use --force to remove)",
            ));
        }
    }
    image.check_header_values(cfg, spec.subsystem_mask)?;

    // drop the certificate directory
    image.ih.set_ddir(PEDIR_SECURITY, 0, 0);

    let mut strip_relocs = image.relocs_stripped();
    if !strip_relocs {
        strip_relocs = image.handle_strip_relocs(cfg, spec.default_imagebase)?;
        if strip_relocs {
            image.ih.flags |= IMAGE_FILE_RELOCS_STRIPPED;
        }
    }

    let mut use_stub_relocs = true;
    let mut pe_offset = image.pe_offset;
    if image.isefi {
        // PIC for EFI only; a fixed address is smaller
        if !strip_relocs {
            use_stub_relocs = false;
        }
        // EFI build tools already clear the DOS stub
        let mut stub_bytes = [0u8; 0x40];
        stub_bytes[0] = b'M';
        stub_bytes[1] = b'Z';
        stub_bytes[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        fo.write_all(&stub_bytes)?;
        pe_offset = 0x40;
    } else {
        // copy the original MZ stub
        let mut mz = vec![0u8; image.pe_offset as usize];
        fi.seek(0)?;
        fi.read_exact(&mut mz)?;
        fo.write_all(&mz)?;
    }

    let overlaystart = image.read_sections(fi, cfg)?;
    let stripped = image.strip_debug(overlaystart)?;
    let mut overlay = image.file_size.saturating_sub(u64::from(stripped));
    if overlay >= image.file_size {
        overlay = 0;
    }

    if image.ih.dllflags & IMAGE_DLLCHARACTERISTICS_GUARD_CF != 0 {
        if cfg.force {
            let lc = image.ih.ddir(PEDIR_LOAD_CONFIG);
            let gfpos = 14 * if image.ih.is64 { 8 } else { 4 } + 6 * 4 + 4 * 2;
            if lc.vaddr != 0 && lc.size >= gfpos as u32 + 4 {
                // GuardFlags: set IMAGE_GUARD_SECURITY_COOKIE_UNUSED
                image
                    .ibuf
                    .write_u32("guard flags", lc.vaddr as usize + gfpos, 0x0000_0800)?;
            }
            image.ih.dllflags &= !IMAGE_DLLCHARACTERISTICS_GUARD_CF;
        } else {
            return Err(PeError::cant_pack(
                "GUARD_CF enabled PE files are not supported (use --force to disable)",
            ));
        }
    }

    // ----- pass 1 ----------------------------------------------------------
    let mut imports: ImportInfo = process_imports1(
        &mut image.ibuf,
        &image.ih,
        &width,
        image.machine,
        image.rvamin,
        image.isefi,
        image.isdll,
    )?;
    // TLS before relocs: it feeds on the original relocation stream
    let mut tls: TlsInfo = {
        let ih = image.ih.clone();
        process_tls1(&mut image.ibuf, &ih, &width, image.isefi, cfg.force)?
    };
    let loadconf: LoadConfInfo = process_loadconf1(&image.ibuf, &image.ih, cfg.force)?;
    let mut res = process_resources1(&mut image, cfg, fi.name())?;
    let mut exports = process_exports1(&mut image, cfg)?;
    let relocs = process_relocs1(&mut image, cfg, &width, strip_relocs)?;

    // some checks for broken linkers - disable filter if necessary
    let codesec = image.virta2objnum(image.ih.codebase);
    let mut allow_filter = true;
    if image.ih.codebase.wrapping_add(image.ih.codesize) > image.ih.imagesize
        || codesec >= image.isection.len()
        || image.isection[codesec].flags & IMAGE_SCN_CNT_CODE == 0
    {
        allow_filter = false;
    }

    if image.ih.objectalign == 0
        || !image.ih.objectalign.is_power_of_two()
        || image.ih.objectalign > 0x0100_0000
    {
        return Err(PeError::CantPack(format!(
            "bad object alignment {:#x}",
            image.ih.objectalign
        )));
    }
    let oam1 = image.ih.objectalign - 1;

    let objs = image.ih.objects as usize;
    let last = &image.isection[objs - 1];
    let vend = u64::from(last.vaddr) + u64::from(last.vsize) + u64::from(oam1);
    if vend > u64::from(u32::MAX) {
        return Err(PeError::cant_pack("bad section layout"));
    }
    let mut newvsize = vend as u32 & !oam1;

    let soimport = imports.soimport as usize;
    let sorelocs = relocs.sorelocs as usize;
    if newvsize as usize + soimport + sorelocs > image.ibuf.len() {
        return Err(PeError::internal("buffer too small 2"));
    }
    image
        .ibuf
        .copy_in("imports", newvsize as usize, &imports.oimport[..soimport])?;
    image
        .ibuf
        .copy_in("relocs", newvsize as usize + soimport, &relocs.orelocs[..sorelocs])?;

    let cimports = newvsize - image.rvamin; // rva of preprocessed imports
    let crelocs = cimports + soimport as u32; // rva of preprocessed fixups

    let mut u_len = newvsize + soimport as u32 + sorelocs as u32;

    // extra info for the unpacker
    let extra_start = u_len as usize;
    {
        let mut blob = Vec::new();
        blob.extend_from_slice(&image.ih.write());
        for sec in &image.isection[..image.ih.objects as usize] {
            blob.extend_from_slice(&sec.write());
        }
        if imports.soimport != 0 {
            blob.extend_from_slice(&cimports.to_le_bytes());
            blob.extend_from_slice(&imports.dllstrings.to_le_bytes());
        }
        if relocs.sorelocs != 0 {
            blob.extend_from_slice(&crelocs.to_le_bytes());
            blob.push((relocs.big_relocs & 6) as u8);
        }
        if res.soresources != 0 {
            blob.extend_from_slice(&res.icondir_count.to_le_bytes());
        }
        blob.extend_from_slice(&(u_len - image.rvamin).to_le_bytes());
        image.ibuf.copy_in("extra info", extra_start, &blob)?;
        u_len += blob.len() as u32;
    }

    if u_len < image.rvamin {
        return Err(PeError::internal("bad PE header layout"));
    }
    u_len -= image.rvamin;

    // ----- compression -----------------------------------------------------
    let mut ft = Filter::new();
    ft.buf_len = image.ih.codesize;
    ft.addvalue = image.ih.codebase.wrapping_sub(image.rvamin);
    let mut strategy = if allow_filter { 0 } else { STRATEGY_NO_FILTER };
    if image.ih.codebase + image.ih.codesize > u_len + image.rvamin {
        ft.buf_len = 1;
        strategy = STRATEGY_NO_FILTER;
    }
    let rvamin = image.rvamin as usize;
    let (mut cdata, cres): (Vec<u8>, CompressResult) = {
        let src = image.ibuf.subref_mut("bulk", rvamin, u_len as usize)?;
        codec.compress(src, &mut ft, strategy)?
    };

    newvsize = (u_len + image.rvamin + cres.overlap_overhead + oam1) & !oam1;
    if tls.tlsindex != 0
        && ((newvsize.wrapping_sub(cres.c_len).wrapping_sub(1024) + oam1) & !oam1)
            > tls.tlsindex + 4
    {
        tls.tlsindex = 0;
    }

    let oh_filealign = image.ih.filealign.min(0x200);
    let fam1 = oh_filealign - 1;

    // ----- stub assembly ---------------------------------------------------
    stub.add_loader(SECT_ENTRY)?;
    if tls.use_callbacks {
        stub.add_loader(SECT_TLSC)?;
    }
    stub.add_loader(SECT_IDENTSTR)?;
    stub.add_loader(SECT_PACKHDR)?;
    let (stub_codesize, identstr_size) = stub.loader_section(SECT_IDENTSTR)?;
    let (_, packhdr_size) = stub.loader_section(SECT_PACKHDR)?;
    let identsize = identstr_size + packhdr_size;
    let ic_ident = identsize;

    let c_len = if (cres.c_len + ic_ident) & 15 == 0 {
        cres.c_len
    } else {
        cres.c_len + 16 - ((cres.c_len + ic_ident) & 15)
    };
    cdata.resize(c_len as usize, 0);

    let ptr_size = width.cb_size;
    let aligned_sotls = tls.aligned_sotls;
    let soloadconf = loadconf.soloadconf;
    let s1size = ((ic_ident + c_len + stub_codesize + ptr_size - 1) & !(ptr_size - 1))
        + aligned_sotls
        + soloadconf;
    let s1addr = (newvsize.wrapping_sub(ic_ident + c_len) + oam1) & !oam1;
    let ncsection = (s1addr + s1size + oam1) & !oam1;
    let upxsection = s1addr + ic_ident + c_len;

    let mut rel = RelocBuilder::new(cfg.force);
    if use_stub_relocs && !strip_relocs {
        // the loader patches its own image base through this one
        rel.add(upxsection + 1, width.reloc_type)?;
    }

    // ----- new PE header ----------------------------------------------------
    let mut oh = image.ih.clone();
    oh.filealign = oh_filealign;
    oh.entry = upxsection;
    oh.chksum = 0;
    oh.set_ddir(PEDIR_DEBUG, 0, 0);
    oh.set_ddir(PEDIR_IAT, 0, 0);
    oh.set_ddir(PEDIR_BOUND_IMPORT, 0, 0);

    // tls & loadconf live at the tail of section 1
    let mut ic = s1addr + s1size - aligned_sotls - soloadconf;

    let mut tls_handler_offset = 0u32;
    if tls.use_callbacks {
        tls_handler_offset = stub.symbol_offset(SYM_TLS_HANDLER)? as u32 + upxsection;
    }
    process_tls2(
        &mut tls,
        &mut rel,
        ic,
        image.ih.imagebase,
        &width,
        tls_handler_offset,
    )?;
    oh.set_ddir(
        PEDIR_TLS,
        if aligned_sotls != 0 { ic } else { 0 },
        if aligned_sotls != 0 {
            if width.cb_size == 4 {
                0x18
            } else {
                0x28
            }
        } else {
            0
        },
    );
    ic += aligned_sotls;

    process_loadconf2(&loadconf, &mut rel, ic)?;
    oh.set_ddir(
        PEDIR_LOAD_CONFIG,
        if soloadconf != 0 { ic } else { 0 },
        soloadconf,
    );
    ic += soloadconf;

    let has_oxrelocs =
        !strip_relocs && (use_stub_relocs || tls.sotls != 0 || loadconf.has_relocs());
    let has_ncsection =
        has_oxrelocs || imports.soimpdlls != 0 || exports.soexport != 0 || res.soresources != 0;
    let oobjs = if spec.last_section_rsrc_only {
        4u16
    } else if has_ncsection {
        3
    } else {
        2
    };

    // ----- pass 2 -----------------------------------------------------------
    ic = ncsection;
    let mut rel = Some(rel);
    let mut oxrelocs: Vec<u8> = Vec::new();
    let mut soxrelocs = 0u32;

    let finish_stub_relocs =
        |rel: RelocBuilder, ic: &mut u32, oh: &mut crate::pe::headers::PeHeader| -> Result<Vec<u8>> {
            let (bytes, mut size) = rel.finish()?;
            if strip_relocs {
                size = 0;
            }
            oh.set_ddir(PEDIR_BASERELOC, if size != 0 { *ic } else { 0 }, size);
            *ic += size;
            Ok(if size != 0 { bytes } else { Vec::new() })
        };

    if !spec.last_section_rsrc_only {
        if res.soresources != 0 {
            process_resources2(&mut res, ic)?;
        }
        oh.set_ddir(
            PEDIR_RESOURCE,
            if res.soresources != 0 { ic } else { 0 },
            res.soresources,
        );
        ic += res.soresources;
    } else {
        // WinCE wants relocation data at the beginning of a section
        let builder = rel
            .take()
            .ok_or_else(|| PeError::internal("stub relocs finished twice"))?;
        oxrelocs = finish_stub_relocs(builder, &mut ic, &mut oh)?;
        soxrelocs = oxrelocs.len() as u32;
    }

    process_imports2(&mut imports, ic)?;
    oh.set_ddir(
        PEDIR_IMPORT,
        if imports.soimpdlls != 0 { ic } else { 0 },
        imports.soimpdlls,
    );
    ic += imports.soimpdlls;

    let mut oexport = vec![0u8; exports.soexport as usize];
    if exports.soexport != 0 {
        exports.xport.build(&mut oexport, ic)?;
    }
    oh.set_ddir(
        PEDIR_EXPORT,
        if exports.soexport != 0 { ic } else { 0 },
        exports.soexport,
    );
    if !image.isdll && cfg.compress_exports {
        let orig = image.ih.ddir(PEDIR_EXPORT);
        oh.set_ddir(PEDIR_EXPORT, orig.vaddr, orig.size);
    }
    ic += exports.soexport;

    if !spec.last_section_rsrc_only {
        let builder = rel
            .take()
            .ok_or_else(|| PeError::internal("stub relocs finished twice"))?;
        oxrelocs = finish_stub_relocs(builder, &mut ic, &mut oh)?;
        soxrelocs = oxrelocs.len() as u32;
    }

    let res_start = (ic + oam1) & !oam1;
    if spec.last_section_rsrc_only {
        ic = res_start;
        if res.soresources != 0 {
            process_resources2(&mut res, ic)?;
        }
        oh.set_ddir(
            PEDIR_RESOURCE,
            if res.soresources != 0 { ic } else { 0 },
            res.soresources,
        );
        ic += res.soresources;
    }
    let _ = ic;

    // ----- loader symbols & pack header -------------------------------------
    stub.define_symbol("NCSECTION", u64::from(ncsection))?;
    stub.define_symbol("UPXSECTION", u64::from(upxsection))?;
    stub.define_symbol("S1ADDR", u64::from(s1addr))?;
    stub.define_symbol("CIMPORTS", u64::from(cimports))?;
    stub.define_symbol("CRELOCS", u64::from(crelocs))?;
    stub.define_symbol("FILTER", u64::from(cres.filter_id))?;
    stub.relocate()?;

    let ph = PackHeader {
        version: PACK_VERSION,
        format: spec.format,
        method: cres.method,
        level: cres.level,
        u_adler: cres.u_adler,
        c_adler: cres.c_adler,
        u_len,
        c_len: cres.c_len,
        u_file_size: image.file_size as u32,
        filter_id: cres.filter_id,
        filter_cto: cres.filter_cto,
    };
    stub.patch_pack_header(&ph)?;
    let loader = stub.loader()?.to_vec();
    let stub_codesize = stub_codesize as usize;

    // ----- output sections ---------------------------------------------------
    let ncsize = soxrelocs
        + imports.soimpdlls
        + exports.soexport
        + if !spec.last_section_rsrc_only {
            res.soresources
        } else {
            0
        };
    if (soxrelocs == 0) == has_oxrelocs {
        return Err(PeError::internal("stub reloc layout drifted"));
    }
    if (ncsize == 0) == has_ncsection {
        return Err(PeError::internal("aux section layout drifted"));
    }
    // windows touches a few bytes past the end of the relocation data
    let ncsize_virt_increase = if soxrelocs != 0 && (ncsize & oam1) == 0 { 8 } else { 0 };

    let mut osection = vec![PeSection::default(); 4];
    osection[0].set_name("UPX0");
    osection[1].set_name("UPX1");
    // .rsrc name matters: oleaut32 and friends locate resources by
    // section name, not by the data directory
    osection[2].set_name(if !spec.last_section_rsrc_only && res.soresources != 0 {
        ".rsrc"
    } else {
        "UPX2"
    });

    osection[0].vaddr = image.rvamin;
    osection[1].vaddr = s1addr;
    osection[2].vaddr = ncsection;

    osection[0].size = 0;
    osection[1].size = (s1size + fam1) & !fam1;
    osection[2].size = (ncsize + fam1) & !fam1;

    osection[0].vsize = osection[1].vaddr - osection[0].vaddr;
    let sizeof_osection = PE_SECTION_SIZE as u32 * u32::from(oobjs);
    let header_end = pe_offset + image.sizeof_ih() as u32 + sizeof_osection;
    if !spec.last_section_rsrc_only {
        osection[1].vsize = (osection[1].size + oam1) & !oam1;
        osection[2].vsize = (osection[2].size + ncsize_virt_increase + oam1) & !oam1;
        oh.imagesize = osection[2].vaddr + osection[2].vsize;
        osection[0].rawdataptr = (header_end + fam1) & !fam1;
        osection[1].rawdataptr = osection[0].rawdataptr;
    } else {
        osection[1].vsize = osection[1].size;
        osection[2].vsize = osection[2].size;
        osection[0].rawdataptr = 0;
        osection[1].rawdataptr = (header_end + fam1) & !fam1;
    }
    osection[2].rawdataptr = osection[1].rawdataptr + osection[1].size;

    osection[0].flags = IMAGE_SCN_CNT_UNINITIALIZED_DATA
        | IMAGE_SCN_MEM_READ
        | IMAGE_SCN_MEM_WRITE
        | IMAGE_SCN_MEM_EXECUTE;
    osection[1].flags = IMAGE_SCN_CNT_INITIALIZED_DATA
        | IMAGE_SCN_MEM_READ
        | IMAGE_SCN_MEM_WRITE
        | IMAGE_SCN_MEM_EXECUTE;
    osection[2].flags = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

    oh.objects = oobjs;
    if spec.last_section_rsrc_only {
        osection[3].set_name(".rsrc");
        osection[3].vaddr = res_start;
        osection[3].size = (res.soresources + fam1) & !fam1;
        osection[3].vsize = osection[3].size;
        osection[3].rawdataptr = osection[2].rawdataptr + osection[2].size;
        osection[2].flags = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
        osection[3].flags = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
        oh.imagesize = (osection[3].vaddr + osection[3].vsize + oam1) & !oam1;
        if res.soresources == 0 {
            oh.objects = 3;
            osection[3] = PeSection::default();
        }
    }

    oh.bsssize = osection[0].vsize;
    oh.datasize = osection[2].vsize
        + if oh.objects > 3 {
            osection[3].vsize
        } else {
            0
        };
    if !oh.is64 {
        oh.database = osection[2].vaddr;
    }
    oh.codesize = osection[1].vsize;
    oh.codebase = osection[1].vaddr;
    oh.headersize = align_up(header_end, oh_filealign);
    let first_raw = if spec.last_section_rsrc_only { 1 } else { 0 };
    if image.rvamin < osection[first_raw].rawdataptr {
        return Err(PeError::CantPack(format!(
            "object alignment too small rvamin={:#x} oraw={:#x}",
            image.rvamin, osection[first_raw].rawdataptr
        )));
    }

    if strip_relocs {
        oh.flags |= IMAGE_FILE_RELOCS_STRIPPED;
    }

    tracing::info!(
        "Image size change: {} -> {} KiB",
        image.ih.imagesize / 1024,
        oh.imagesize / 1024
    );

    // ----- write the compressed file -----------------------------------------
    let pad_to = |fo: &mut dyn OutputSink, boundary: u64| -> Result<()> {
        let pos = fo.bytes_written();
        let rem = pos % boundary;
        if rem != 0 {
            fo.write_all(&vec![0u8; (boundary - rem) as usize])?;
        }
        Ok(())
    };

    // a reduced section count still writes the zeroed trailing record;
    // it lands in header padding
    fo.write_all(&oh.write())?;
    for sec in &osection[..oobjs as usize] {
        fo.write_all(&sec.write())?;
    }
    pad_to(fo, u64::from(oh_filealign))?;
    debug_assert_eq!(
        fo.bytes_written(),
        u64::from(osection[first_raw].rawdataptr)
    );
    fo.write_all(&loader[stub_codesize..stub_codesize + identsize as usize])?;
    fo.write_all(&cdata)?;
    fo.write_all(&loader[..stub_codesize])?;
    pad_to(fo, u64::from(ptr_size))?;
    fo.write_all(&tls.otls[..aligned_sotls as usize])?;
    fo.write_all(&loadconf.oloadconf[..soloadconf as usize])?;
    pad_to(fo, u64::from(oh_filealign))?;
    if !spec.last_section_rsrc_only {
        fo.write_all(&res.oresources[..res.soresources as usize])?;
    } else {
        fo.write_all(&oxrelocs)?;
    }
    if let Some(linker) = imports.linker.as_ref() {
        if imports.soimpdlls != 0 {
            fo.write_all(linker.loader()?)?;
        }
    }
    fo.write_all(&oexport)?;
    if !spec.last_section_rsrc_only {
        fo.write_all(&oxrelocs)?;
    }
    pad_to(fo, u64::from(oh_filealign))?;
    if spec.last_section_rsrc_only {
        fo.write_all(&res.oresources[..res.soresources as usize])?;
        pad_to(fo, u64::from(oh_filealign))?;
    }

    // copy the overlay
    copy_overlay(fi, fo, image.file_size, overlay)?;

    let out_size = fo.bytes_written();
    if out_size >= image.file_size {
        return Err(PeError::NotCompressible);
    }
    Ok(PackOutcome {
        u_len,
        c_len: cres.c_len,
        in_size: image.file_size,
        out_size,
    })
}

pub(crate) fn copy_overlay(
    fi: &mut dyn InputSource,
    fo: &mut dyn OutputSink,
    file_size: u64,
    overlay: u64,
) -> Result<()> {
    if overlay == 0 {
        return Ok(());
    }
    if overlay > file_size {
        return Err(PeError::cant_pack("invalid overlay size"));
    }
    fi.seek(file_size - overlay)?;
    let mut remaining = overlay as usize;
    let mut chunk = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        fi.read_exact(&mut chunk[..take])?;
        fo.write_all(&chunk[..take])?;
        remaining -= take;
    }
    Ok(())
}
