//! Import directory preprocessing and its unpack-time inverse.
//!
//! Pass 1 scans the original descriptors, sorts the DLLs into a
//! canonical order, feeds them to the [`ImportLinker`] (which emits the
//! new, compact import table) and produces the preprocessed stream the
//! stub and the unpacker share: per DLL a `{dllname_offset: u32,
//! iat_rva - rvamin: u32}` pair followed by entry records — `0x01 name
//! NUL` for imports by name, `0xff ord16` for ordinals, `0xfe rva32`
//! for kernel32 ordinals resolved through the new table — closed by a
//! zero byte.  `rebuild_imports` walks the same stream to reconstruct
//! descriptors, name strings and IAT contents.

use crate::buffer::ImageBuf;
use crate::error::{PeError, Result};
use crate::interval::Interval;
use crate::linker::{ImportLinker, IMPORT_DESC_SIZE};
use crate::pe::headers::{DataDir, MachineKind, PeHeader, WidthSpec, PEDIR_IMPORT};

/// The DLL whose imports the decompression stub itself needs.
pub fn kernel_dll(machine: MachineKind) -> &'static [u8] {
    match machine {
        MachineKind::Arm => b"COREDLL.dll",
        _ => b"kernel32.dll",
    }
}

fn read_thunk(buf: &ImageBuf, off: usize, width: &WidthSpec) -> Result<u64> {
    if width.thunk_size == 4 {
        Ok(u64::from(buf.read_u32("import thunk", off)?))
    } else {
        buf.read_u64("import thunk", off)
    }
}

#[derive(Default)]
pub struct ImportInfo {
    /// The preprocessed stream (compressed with the bulk).
    pub oimport: Vec<u8>,
    pub soimport: u32,
    /// The linker that built the new import table; `None` on EFI.
    pub linker: Option<ImportLinker>,
    /// Size of the new import table.
    pub soimpdlls: u32,
    pub import_by_ordinal: bool,
    pub kernel32_ordinal: bool,
    /// RVA of the (contiguous) original name area, or 0 when the names
    /// were scattered and had to stay in place.
    pub dllstrings: u32,
}

struct UDll {
    name: Vec<u8>,
    name_rva: u32,
    shname: Option<Vec<u8>>,
    ordinal: u16,
    iat: u32,
    lookup_rva: u32,
    first_thunk_nonzero: bool,
    original_position: usize,
    isk32: bool,
}

fn lower(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.to_ascii_lowercase()).collect()
}

/// Pass 1.  Mutates `buf`: contiguous IAT/lookup/name areas are zeroed,
/// scattered descriptors are reduced to their dll-name field.
#[allow(clippy::too_many_arguments)]
pub fn process_imports1(
    buf: &mut ImageBuf,
    ih: &PeHeader,
    width: &WidthSpec,
    machine: MachineKind,
    rvamin: u32,
    isefi: bool,
    isdll: bool,
) -> Result<ImportInfo> {
    let mut info = ImportInfo::default();
    let dir = ih.ddir(PEDIR_IMPORT);
    if isefi {
        if dir.size != 0 {
            return Err(PeError::cant_pack("imports not supported on EFI"));
        }
        return Ok(info);
    }
    let kdll = kernel_dll(machine);
    let kdll_lower = lower(kdll);

    // count the descriptors
    let mut dllnum = 0usize;
    if dir.vaddr != 0 {
        loop {
            let off = dir.vaddr as usize + dllnum * IMPORT_DESC_SIZE;
            let dllname = buf.read_u32("import", off + 12)?;
            if dllname == 0 {
                break;
            }
            dllnum += 1;
        }
    }
    // just some arbitrary limit/sanity check
    if dllnum > 4096 {
        return Err(PeError::CantPack(format!("too many DLL imports {dllnum}")));
    }

    let mut dlls: Vec<UDll> = Vec::with_capacity(dllnum);
    for ic in 0..dllnum {
        let off = dir.vaddr as usize + ic * IMPORT_DESC_SIZE;
        let oft = buf.read_u32("import", off)?;
        let iat = buf.read_u32("import", off + 16)?;
        let name_rva = buf.read_u32("import", off + 12)?;
        let name = buf.cstr("dllname", name_rva as usize)?.to_vec();
        let lookup_rva = if oft != 0 { oft } else { iat };

        let mut dll = UDll {
            isk32: lower(&name) == kdll_lower,
            name,
            name_rva,
            shname: None,
            ordinal: 0,
            iat,
            lookup_rva,
            first_thunk_nonzero: read_thunk(buf, lookup_rva as usize, width)? != 0,
            original_position: ic,
        };

        let mut toff = lookup_rva as usize;
        loop {
            let thunk = read_thunk(buf, toff, width)?;
            if thunk == 0 {
                break;
            }
            if thunk & width.ord_mask != 0 {
                info.import_by_ordinal = true;
                dll.ordinal = (thunk & 0xffff) as u16;
            } else {
                let name = buf.cstr("import name", thunk as usize + 2)?;
                let better = match &dll.shname {
                    None => true,
                    Some(s) => name.len() < s.len(),
                };
                if better {
                    dll.shname = Some(name.to_vec());
                }
            }
            toff += width.thunk_size as usize;
        }
        dlls.push(dll);
    }

    // canonical order: kernel32 first, live lookup tables before empty
    // ones, then by case-folded name; stable sort keeps the original
    // descriptor order on full ties
    let mut order: Vec<usize> = (0..dllnum).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (&dlls[a], &dlls[b]);
        b.isk32
            .cmp(&a.isk32)
            .then(b.first_thunk_nonzero.cmp(&a.first_thunk_nonzero))
            .then_with(|| lower(&a.name).cmp(&lower(&b.name)))
            .then((b.ordinal != 0).cmp(&(a.ordinal != 0)))
            .then_with(|| match (&a.shname, &b.shname) {
                (Some(sa), Some(sb)) => sa.len().cmp(&sb.len()).then(sa.cmp(sb)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then(a.original_position.cmp(&b.original_position))
    });

    tracing::info!("Processing imports: {dllnum} DLLs");

    let mut linker = ImportLinker::new(width.thunk_size);
    // the stub's own imports
    linker.add_proc(kdll, b"LoadLibraryA");
    linker.add_proc(kdll, b"GetProcAddress");
    if !isdll {
        linker.add_proc(kdll, b"ExitProcess");
    }
    linker.add_proc(kdll, b"VirtualProtect");

    for &idx in &order {
        let dll = &dlls[idx];
        if dll.isk32 {
            // kernel32 ordinals must stay resolvable through the new
            // import table; GetProcAddress does not handle them on
            // every Windows version
            if lower(&dll.name) != b"kernel32.dll".to_vec() {
                continue;
            }
            if dll.ordinal != 0 {
                let mut toff = dll.lookup_rva as usize;
                loop {
                    let thunk = read_thunk(buf, toff, width)?;
                    if thunk == 0 {
                        break;
                    }
                    if thunk & width.ord_mask != 0 {
                        linker.add_ordinal(kdll, (thunk & 0xffff) as u16);
                        info.kernel32_ordinal = true;
                    }
                    toff += width.thunk_size as usize;
                }
            }
        } else if !linker.has_dll(&dll.name) {
            match (&dll.shname, dll.ordinal) {
                (Some(sh), 0) => linker.add_proc(&dll.name, sh),
                _ => linker.add_ordinal(&dll.name, dll.ordinal),
            }
        }
    }

    info.soimpdlls = linker.build()?;

    let mut names = Interval::new();
    let mut iats = Interval::new();
    let mut lookups = Interval::new();

    // the preprocessed stream
    let mut ppi: Vec<u8> = Vec::new();
    for &idx in &order {
        let dll = &dlls[idx];
        ppi.extend_from_slice(&linker.address_of_dll(&dll.name)?.to_le_bytes());
        ppi.extend_from_slice(&dll.iat.wrapping_sub(rvamin).to_le_bytes());

        let mut toff = dll.lookup_rva as usize;
        loop {
            let thunk = read_thunk(buf, toff, width)?;
            if thunk == 0 {
                break;
            }
            if thunk & width.ord_mask != 0 {
                let ord = (thunk & 0xffff) as u16;
                if dll.isk32 && info.kernel32_ordinal {
                    ppi.push(0xfe); // resolved through the new table
                    ppi.extend_from_slice(
                        &linker.address_of_ordinal(kdll, ord)?.to_le_bytes(),
                    );
                } else {
                    ppi.push(0xff);
                    ppi.extend_from_slice(&ord.to_le_bytes());
                }
            } else {
                ppi.push(0x01);
                let name = buf.cstr("import name", thunk as usize + 2)?;
                ppi.extend_from_slice(name);
                ppi.push(0);
                names.add(thunk as u32, 2 + name.len() as u32 + 1);
            }
            toff += width.thunk_size as usize;
        }
        ppi.push(0);

        let esize = (toff - dll.lookup_rva as usize) as u32;
        lookups.add(dll.lookup_rva, esize);
        if dll.iat != dll.lookup_rva {
            // mirror the lookup table into the IAT so both resolve alike
            let lookup = buf.subref("import lookup", dll.lookup_rva as usize, esize as usize)?;
            let copy = lookup.to_vec();
            buf.copy_in("import iat", dll.iat as usize, &copy)?;
            iats.add(dll.iat, esize);
        }
        names.add(dll.name_rva, dll.name.len() as u32 + 1 + 1);
    }
    ppi.extend_from_slice(&[0u8; 4]);
    info.soimport = ppi.len() as u32;
    if info.soimport == 4 {
        info.soimport = 0;
    }
    info.oimport = ppi;

    let mut ilen = 0u32;
    names.flatten();
    if names.count() > 1 {
        // scattered names: the unpacker needs the descriptor array in
        // place, only the dll name survives in each
        tracing::warn!("can't remove unneeded imports");
        ilen += (IMPORT_DESC_SIZE * dllnum) as u32;
        for dll in &dlls {
            let off = dir.vaddr as usize + dll.original_position * IMPORT_DESC_SIZE;
            buf.fill("import", off, IMPORT_DESC_SIZE, 0)?;
            buf.write_u32("import", off + 12, dll.name_rva)?;
        }
    } else {
        iats.add(dir.vaddr, (IMPORT_DESC_SIZE * dllnum) as u32);
        iats.flatten();
        iats.clear_in("import", buf)?;
        lookups.flatten();
        lookups.clear_in("import", buf)?;
    }
    names.clear_in("import", buf)?;

    info.dllstrings = if names.count() == 1 {
        names.entries()[0].start
    } else {
        0
    };

    iats.add_interval(&names);
    iats.add_interval(&lookups);
    iats.flatten();
    ilen += iats.covered();
    tracing::info!(
        "Imports: original size: {ilen} bytes, preprocessed size: {}",
        info.soimport
    );
    info.linker = Some(linker);
    Ok(info)
}

/// Pass 2: resolve the linker against the final import table RVA.
pub fn process_imports2(info: &mut ImportInfo, myimport: u32) -> Result<()> {
    if let Some(linker) = info.linker.as_mut() {
        linker.relocate_import(myimport)?;
        let len = linker.loader()?.len() as u32;
        if len != info.soimpdlls {
            return Err(PeError::internal("import table size drifted"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unpack side
// ---------------------------------------------------------------------------

/// Rebuild descriptors, names and IAT contents from the preprocessed
/// stream.  `aux` holds the packed file's non-compressed section (where
/// the new import table lives) based at `aux_bias`.
#[allow(clippy::too_many_arguments)]
pub fn rebuild_imports(
    obuf: &mut ImageBuf,
    rvamin: u32,
    cimports: u32,
    inamespos: u32,
    aux: &ImageBuf,
    aux_bias: u32,
    new_import: DataDir,
    orig_import: DataDir,
    width: &WidthSpec,
    set_oft: bool,
) -> Result<()> {
    if orig_import.vaddr == 0 || new_import.size <= IMPORT_DESC_SIZE as u32 {
        return Ok(());
    }
    let import_off = new_import
        .vaddr
        .checked_sub(aux_bias)
        .ok_or_else(|| PeError::cant_unpack("bad import table address"))? as usize;
    let ob = |rva: u32| -> usize { rva.wrapping_sub(rvamin) as usize };

    // first walk: total dll-name bytes, to place the imported names
    let mut sdllnames = 0u32;
    let mut p = cimports as usize;
    while obuf.read_u32("import stream", p)? != 0 {
        let noff = obuf.read_u32("import stream", p)?;
        let dname = aux.cstr("dllname", import_off + noff as usize)?;
        sdllnames += dname.len() as u32 + 1;
        p += 8;
        loop {
            match obuf.read_u8("import stream", p)? {
                0 => break,
                1 => {
                    let name = obuf.cstr("import name", p + 1)?;
                    p += 1 + name.len() + 1;
                }
                0xff => p += 3,
                _ => p += 5,
            }
        }
        p += 1;
    }
    sdllnames = (sdllnames + 1) & !1;

    let mut im = ob(orig_import.vaddr);
    let mut dllnames = ob(inamespos);
    let importednames_start = dllnames + sdllnames as usize;
    let mut importednames = importednames_start;

    let mut p = cimports as usize;
    while obuf.read_u32("import stream", p)? != 0 {
        // restore the name of the dll
        let noff = obuf.read_u32("import stream", p)?;
        let dname = aux.cstr("dllname", import_off + noff as usize)?.to_vec();
        let iatoffs = obuf.read_u32("import stream", p + 4)?.wrapping_add(rvamin);
        if inamespos != 0 {
            // rebuild the dll name and a fresh descriptor
            obuf.copy_in("dllnames", dllnames, &dname)?;
            obuf.write_u32("import desc", im + 12, (dllnames + rvamin as usize) as u32)?;
            dllnames += dname.len() + 1;
        } else {
            let name_rva = obuf.read_u32("import desc", im + 12)?;
            obuf.copy_in("dllname", ob(name_rva), &dname)?;
        }
        obuf.write_u32("import desc", im + 16, iatoffs)?;
        if set_oft {
            obuf.write_u32("import desc", im, iatoffs)?;
        }

        let mut newiat = ob(iatoffs);
        p += 8;
        // restore the imported names and ordinals
        loop {
            match obuf.read_u8("import stream", p)? {
                0 => break,
                1 => {
                    let name = obuf.cstr("import name", p + 1)?.to_vec();
                    let ilen = name.len() + 1;
                    if inamespos != 0 {
                        if (importednames - importednames_start) & 1 != 0 {
                            importednames -= 1;
                        }
                        obuf.copy_in("importednames", importednames + 2, &name)?;
                        write_iat_thunk(
                            obuf,
                            newiat,
                            width,
                            (importednames + rvamin as usize) as u64,
                        )?;
                        importednames += 2 + ilen;
                    } else {
                        // the thunk still holds the original hint/name
                        // RVA; put the name back behind it
                        let hint = read_iat_thunk(obuf, newiat, width)?;
                        obuf.copy_in("import name", ob(hint as u32) + 2, &name)?;
                    }
                    p += 1 + ilen;
                }
                0xff => {
                    let ord = obuf.read_u16("import stream", p + 1)?;
                    write_iat_thunk(obuf, newiat, width, u64::from(ord) | width.ord_mask)?;
                    p += 3;
                }
                _ => {
                    let toff = obuf.read_u32("import stream", p + 1)?;
                    let value = if width.thunk_size == 4 {
                        u64::from(aux.read_u32("import thunk", import_off + toff as usize)?)
                    } else {
                        aux.read_u64("import thunk", import_off + toff as usize)?
                    };
                    if value & width.ord_mask == 0 {
                        return Err(PeError::cant_unpack("bad forwarded ordinal thunk"));
                    }
                    write_iat_thunk(obuf, newiat, width, value)?;
                    p += 5;
                }
            }
            newiat += width.thunk_size as usize;
        }
        write_iat_thunk(obuf, newiat, width, 0)?;
        p += 1;
        im += IMPORT_DESC_SIZE;
    }
    Ok(())
}

fn read_iat_thunk(buf: &ImageBuf, off: usize, width: &WidthSpec) -> Result<u64> {
    if width.thunk_size == 4 {
        Ok(u64::from(buf.read_u32("iat", off)?))
    } else {
        buf.read_u64("iat", off)
    }
}

fn write_iat_thunk(buf: &mut ImageBuf, off: usize, width: &WidthSpec, value: u64) -> Result<()> {
    if width.thunk_size == 4 {
        buf.write_u32("iat", off, value as u32)
    } else {
        buf.write_u64("iat", off, value)
    }
}
