//! Export directory: parse into an owned model, rebuild at a new RVA.
//!
//! `convert` clones the directory header, the function-pointer array,
//! the ordinal table and every string (including forwarder strings,
//! recognized by a function RVA that lies inside the export blob), and
//! marks every byte range the directory occupied.  `build` re-emits the
//! whole thing at a different RVA with all internal pointers patched.

use crate::buffer::ImageBuf;
use crate::error::{PeError, Result};
use crate::interval::Interval;
use crate::util::{get_u32, put_u32};

// ---------------------------------------------------------------------------
// Directory header
// ---------------------------------------------------------------------------

pub const EXPORT_DIR_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, Default)]
struct ExportDir {
    flags: u32,
    timedate: u32,
    version: u32,
    name: u32,
    base: u32,
    functions: u32,
    names: u32,
    addrtable: u32,
    nameptrtable: u32,
    ordinaltable: u32,
}

impl ExportDir {
    fn parse(data: &[u8]) -> ExportDir {
        ExportDir {
            flags: get_u32(data, 0).unwrap(),
            timedate: get_u32(data, 4).unwrap(),
            version: get_u32(data, 8).unwrap(),
            name: get_u32(data, 12).unwrap(),
            base: get_u32(data, 16).unwrap(),
            functions: get_u32(data, 20).unwrap(),
            names: get_u32(data, 24).unwrap(),
            addrtable: get_u32(data, 28).unwrap(),
            nameptrtable: get_u32(data, 32).unwrap(),
            ordinaltable: get_u32(data, 36).unwrap(),
        }
    }

    fn write(&self, out: &mut [u8]) {
        put_u32(out, 0, self.flags);
        put_u32(out, 4, self.timedate);
        put_u32(out, 8, self.version);
        put_u32(out, 12, self.name);
        put_u32(out, 16, self.base);
        put_u32(out, 20, self.functions);
        put_u32(out, 24, self.names);
        put_u32(out, 28, self.addrtable);
        put_u32(out, 32, self.nameptrtable);
        put_u32(out, 36, self.ordinaltable);
    }
}

// ---------------------------------------------------------------------------
// Export model
// ---------------------------------------------------------------------------

pub struct Export {
    /// RVA of the first byte of the backing buffer; accesses go through
    /// `rva - bias`.  Zero while packing (the image buffer is
    /// RVA-indexed), the aux section RVA while unpacking.
    bias: u32,
    edir: ExportDir,
    ename: Vec<u8>,
    functionptrs: Vec<u8>,
    ordinals: Vec<u8>,
    /// Export names first (`edir.names` of them), then one optional
    /// forwarder string per function.
    names: Vec<Option<Vec<u8>>>,
    size: u32,
}

impl Export {
    pub fn new(bias: u32) -> Export {
        Export {
            bias,
            edir: ExportDir::default(),
            ename: Vec::new(),
            functionptrs: Vec::new(),
            ordinals: Vec::new(),
            names: Vec::new(),
            size: 0,
        }
    }

    /// Total bytes `build` will emit; stable once `convert` ran.
    pub fn size(&self) -> u32 {
        self.size
    }

    fn off(&self, rva: u32) -> usize {
        rva.wrapping_sub(self.bias) as usize
    }

    /// Parse the directory at `eoffs` and zero its source bytes when
    /// they form one contiguous region.
    pub fn convert(&mut self, buf: &mut ImageBuf, eoffs: u32, esize: u32) -> Result<()> {
        let mut iv = Interval::new();
        let dir = buf.subref("export", self.off(eoffs), EXPORT_DIR_SIZE)?;
        self.edir = ExportDir::parse(dir);
        self.size = EXPORT_DIR_SIZE as u32;
        iv.add(self.off(eoffs) as u32, EXPORT_DIR_SIZE as u32);

        if self.edir.name == 0 || eoffs.wrapping_add(esize) <= self.edir.name {
            return Err(PeError::CantPack(format!(
                "bad export directory name RVA {:#x}",
                self.edir.name
            )));
        }
        self.ename = buf.cstr("export name", self.off(self.edir.name))?.to_vec();
        self.size += self.ename.len() as u32 + 1;
        iv.add(self.off(self.edir.name) as u32, self.ename.len() as u32 + 1);

        let fplen = 4 * self.edir.functions as usize;
        self.functionptrs = buf
            .subref("export addrtable", self.off(self.edir.addrtable), fplen)?
            .to_vec();
        self.size += fplen as u32;
        iv.add(self.off(self.edir.addrtable) as u32, fplen as u32);

        self.names.clear();
        for ic in 0..self.edir.names {
            let nameptr = buf.read_u32(
                "export nameptrtable",
                self.off(self.edir.nameptrtable) + 4 * ic as usize,
            )?;
            let name = buf.cstr("export name string", self.off(nameptr))?;
            self.size += name.len() as u32 + 1;
            iv.add(self.off(nameptr) as u32, name.len() as u32 + 1);
            self.names.push(Some(name.to_vec()));
        }
        iv.add(
            self.off(self.edir.nameptrtable) as u32,
            4 * self.edir.names,
        );
        self.size += 4 * self.edir.names;

        // forwarders: function RVAs pointing back into the export blob
        for ic in 0..self.edir.functions as usize {
            let fp = get_u32(&self.functionptrs, 4 * ic).unwrap();
            if fp >= eoffs && fp < eoffs + esize {
                let forw = buf.cstr("export forwarder", self.off(fp))?;
                self.size += forw.len() as u32 + 1;
                iv.add(self.off(fp) as u32, forw.len() as u32 + 1);
                self.names.push(Some(forw.to_vec()));
            } else {
                self.names.push(None);
            }
        }

        let ordlen = 2 * self.edir.names as usize;
        self.ordinals = buf
            .subref("export ordinaltable", self.off(self.edir.ordinaltable), ordlen)?
            .to_vec();
        self.size += ordlen as u32;
        iv.add(self.off(self.edir.ordinaltable) as u32, ordlen as u32);

        iv.flatten();
        if iv.count() == 1 {
            iv.clear_in("export", buf)?;
        } else {
            iv.dump();
        }
        Ok(())
    }

    /// Emit the directory into `out`, patching every table pointer to
    /// `newoffs`-based RVAs.
    pub fn build(&self, out: &mut [u8], newoffs: u32) -> Result<()> {
        if out.len() < self.size as usize {
            return Err(PeError::internal("export build buffer too small"));
        }
        let nnames = self.edir.names as usize;
        let nfuncs = self.edir.functions as usize;
        let functionp = EXPORT_DIR_SIZE;
        let namep = functionp + 4 * nfuncs;
        let ordinalp = namep + 4 * nnames;
        let enamep = ordinalp + 2 * nnames;
        let mut exports = enamep + self.ename.len() + 1;

        let mut edir = self.edir;
        edir.addrtable = newoffs + functionp as u32;
        edir.ordinaltable = newoffs + ordinalp as u32;
        out[ordinalp..ordinalp + 2 * nnames].copy_from_slice(&self.ordinals);

        edir.name = newoffs + enamep as u32;
        out[enamep..enamep + self.ename.len()].copy_from_slice(&self.ename);
        out[enamep + self.ename.len()] = 0;

        edir.nameptrtable = newoffs + namep as u32;
        for ic in 0..nnames {
            let name = self.names[ic].as_deref().unwrap_or(&[]);
            out[exports..exports + name.len()].copy_from_slice(name);
            out[exports + name.len()] = 0;
            put_u32(out, namep + 4 * ic, newoffs + exports as u32);
            exports += name.len() + 1;
        }

        out[functionp..functionp + 4 * nfuncs].copy_from_slice(&self.functionptrs);
        for ic in 0..nfuncs {
            if let Some(forw) = &self.names[nnames + ic] {
                out[exports..exports + forw.len()].copy_from_slice(forw);
                out[exports + forw.len()] = 0;
                put_u32(out, functionp + 4 * ic, newoffs + exports as u32);
                exports += forw.len() + 1;
            }
        }

        edir.write(&mut out[0..EXPORT_DIR_SIZE]);
        if exports != self.size as usize {
            return Err(PeError::internal("export size drifted between passes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::put_u16;

    /// Lay out a small export directory at RVA 0x1000 inside a 0x2000
    /// byte image: two named exports, one of them a forwarder.  All
    /// pieces are packed back to back so the source region is one
    /// contiguous interval.
    fn build_source() -> (ImageBuf, u32, u32) {
        let eoffs = 0x1000u32;
        let mut buf = vec![0u8; 0x2000];
        let d = eoffs as usize;
        // header
        put_u32(&mut buf, d + 20, 2); // functions
        put_u32(&mut buf, d + 24, 2); // names
        put_u32(&mut buf, d + 16, 1); // ordinal base
        put_u32(&mut buf, d + 28, eoffs + 0x28); // addrtable
        put_u32(&mut buf, d + 32, eoffs + 0x30); // nameptrtable
        put_u32(&mut buf, d + 36, eoffs + 0x38); // ordinaltable
        put_u32(&mut buf, d + 12, eoffs + 0x3c); // dll name
        // function RVAs: one real export, one forwarder into the blob
        put_u32(&mut buf, d + 0x28, 0x4010);
        put_u32(&mut buf, d + 0x2c, eoffs + 0x4e);
        // name pointers
        put_u32(&mut buf, d + 0x30, eoffs + 0x43);
        put_u32(&mut buf, d + 0x34, eoffs + 0x49);
        // ordinals
        put_u16(&mut buf, d + 0x38, 0);
        put_u16(&mut buf, d + 0x3a, 1);
        buf[d + 0x3c..d + 0x42].copy_from_slice(b"ex.dll");
        buf[d + 0x43..d + 0x48].copy_from_slice(b"alpha");
        buf[d + 0x49..d + 0x4d].copy_from_slice(b"beta");
        buf[d + 0x4e..d + 0x5b].copy_from_slice(b"other.fwdproc");
        (ImageBuf::from_vec(buf), eoffs, 0x100)
    }

    #[test]
    fn convert_collects_everything() {
        let (mut buf, eoffs, esize) = build_source();
        let mut xport = Export::new(0);
        xport.convert(&mut buf, eoffs, esize).unwrap();
        // 40 header + 7 dllname + 8 fptrs + 6 + 5 names + 8 nameptrs
        // + 14 forwarder + 4 ordinals
        assert_eq!(xport.size(), 40 + 7 + 8 + 6 + 5 + 8 + 14 + 4);
    }

    #[test]
    fn build_patches_rvas() {
        let (mut buf, eoffs, esize) = build_source();
        let mut xport = Export::new(0);
        xport.convert(&mut buf, eoffs, esize).unwrap();
        let newoffs = 0x8000u32;
        let mut out = vec![0u8; xport.size() as usize];
        xport.build(&mut out, newoffs).unwrap();

        let addrtable = get_u32(&out, 28).unwrap();
        let nameptrtable = get_u32(&out, 32).unwrap();
        let ordinaltable = get_u32(&out, 36).unwrap();
        let namerva = get_u32(&out, 12).unwrap();
        assert_eq!(addrtable, newoffs + 40);
        assert_eq!(nameptrtable, newoffs + 48);
        assert_eq!(ordinaltable, newoffs + 56);
        assert!(namerva > ordinaltable);
        // first export name resolves within the rebuilt blob
        let n0 = get_u32(&out, (nameptrtable - newoffs) as usize).unwrap();
        let n0_off = (n0 - newoffs) as usize;
        assert_eq!(&out[n0_off..n0_off + 5], b"alpha");
        // the non-forwarded function RVA is untouched
        assert_eq!(get_u32(&out, 40), Some(0x4010));
        // the forwarder now points at its relocated string
        let fwd = get_u32(&out, 44).unwrap();
        let fwd_off = (fwd - newoffs) as usize;
        assert_eq!(&out[fwd_off..fwd_off + 13], b"other.fwdproc");
    }

    #[test]
    fn contiguous_source_is_zeroed() {
        let (mut buf, eoffs, esize) = build_source();
        let mut xport = Export::new(0);
        xport.convert(&mut buf, eoffs, esize).unwrap();
        // the whole 0x1000..0x105c region was one flattened interval
        assert!(buf.bytes()[0x1000..0x105c].iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_name_rva_refused() {
        let (mut buf, eoffs, esize) = build_source();
        buf.write_u32("t", eoffs as usize + 12, 0).unwrap();
        let mut xport = Export::new(0);
        match xport.convert(&mut buf, eoffs, esize) {
            Err(PeError::CantPack(msg)) => assert!(msg.contains("name RVA")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bias_shifts_accesses() {
        let (buf, eoffs, esize) = build_source();
        // simulate the unpack case: the blob sits in a buffer whose
        // first byte corresponds to RVA 0x800
        let shifted = buf.bytes()[0x800..].to_vec();
        let mut sbuf = ImageBuf::from_vec(shifted);
        let mut xport = Export::new(0x800);
        xport.convert(&mut sbuf, eoffs, esize).unwrap();
        assert_eq!(xport.size(), 40 + 7 + 8 + 6 + 5 + 8 + 14 + 4);
    }
}
