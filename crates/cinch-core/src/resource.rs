//! The three-level PE resource tree (Type / Name / Language).
//!
//! `init` walks the on-disk tree into owned nodes, recording each
//! leaf's blob location and its Type/Name ancestry (copied down instead
//! of the original's parent back pointers).  `build` re-emits the tree
//! into a contiguous buffer, directories first, UTF-16 name strings
//! after, with blob offsets replaced by per-leaf overrides where set.
//! `clear` zeroes the source directory area when it forms a single
//! contiguous region.

use crate::buffer::ImageBuf;
use crate::error::{PeError, Result};
use crate::interval::Interval;
use crate::util::{get_u16, get_u32, put_u16, put_u32};

const RES_DIR_FIXED: usize = 16;
const RES_ENTRY_SIZE: usize = 8;
const RES_DATA_SIZE: usize = 16;

fn corrupt() -> PeError {
    PeError::cant_unpack("corrupted resources")
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum NodeRef {
    Branch(usize),
    Leaf(usize),
}

/// One directory entry: the id (or copied UTF-16 name) plus the child it
/// points at.
#[derive(Debug)]
struct ChildEntry {
    id: u32,
    name: Option<Vec<u8>>,
    node: NodeRef,
}

#[derive(Debug)]
struct RBranch {
    /// Flags, timedate, version: carried opaque.
    header: [u8; 12],
    namedentr: u16,
    identr: u16,
    children: Vec<ChildEntry>,
    src_off: u32,
}

impl RBranch {
    fn sizeof(&self) -> usize {
        RES_DIR_FIXED + RES_ENTRY_SIZE * self.children.len()
    }
}

/// A resource blob reference plus the ancestry the selection policy
/// needs.
#[derive(Debug)]
pub struct RLeaf {
    /// RVA of the resource blob.
    pub offset: u32,
    pub size: u32,
    /// Codepage + reserved, carried opaque.
    misc: [u8; 8],
    /// Replacement blob RVA; 0 leaves the original in place.
    pub newoffset: u32,
    src_off: u32,
    /// Type id and name (level 0 ancestor).
    pub tid: u32,
    pub tname: Option<Vec<u8>>,
    /// Name id and name (level 1 ancestor).
    pub nid: u32,
    pub nname: Option<Vec<u8>>,
}

impl RLeaf {
    /// Blob size rounded up to 4.
    pub fn size_aligned(&self) -> u32 {
        self.size.wrapping_add(3) & !3
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ResourceTree {
    branches: Vec<RBranch>,
    leaves: Vec<RLeaf>,
    root: Option<NodeRef>,
    dsize: u32,
    ssize: u32,
    start_off: usize,
}

impl ResourceTree {
    /// Parse the tree whose root directory sits at `root_off` in `buf`.
    pub fn init(buf: &ImageBuf, root_off: usize) -> Result<ResourceTree> {
        let mut tree = ResourceTree {
            start_off: root_off,
            ..ResourceTree::default()
        };
        tree.check(buf, 0, 0)?;
        tree.root = tree.convert(buf, 0, 0, (0, None), (0, None))?;
        Ok(tree)
    }

    /// Directory area size: nodes plus name strings, 4-aligned.
    pub fn dirsize(&self) -> u32 {
        (self.dsize + self.ssize + 3) & !3
    }

    /// Leaves in document order.
    pub fn leaves(&self) -> &[RLeaf] {
        &self.leaves
    }

    pub fn leaves_mut(&mut self) -> &mut [RLeaf] {
        &mut self.leaves
    }

    // -- parsing ------------------------------------------------------------

    fn dir_counts(&self, buf: &ImageBuf, off: u32) -> Result<(u16, u16)> {
        let base = self.start_off + off as usize;
        let hdr = buf
            .subref("res", base, RES_DIR_FIXED)
            .map_err(|_| corrupt())?;
        Ok((get_u16(hdr, 12).unwrap(), get_u16(hdr, 14).unwrap()))
    }

    fn dir_entry(&self, buf: &ImageBuf, off: u32, index: usize) -> Result<(u32, u32)> {
        let base = self.start_off + off as usize + RES_DIR_FIXED + index * RES_ENTRY_SIZE;
        let raw = buf
            .subref("res", base, RES_ENTRY_SIZE)
            .map_err(|_| corrupt())?;
        Ok((get_u32(raw, 0).unwrap(), get_u32(raw, 4).unwrap()))
    }

    /// Pre-validate the shape: internal entries (levels 0 and 1) must
    /// carry the subdirectory bit, level-2 entries must not.
    fn check(&self, buf: &ImageBuf, off: u32, level: u32) -> Result<()> {
        let (named, ids) = self.dir_counts(buf, off)?;
        let count = named as usize + ids as usize;
        for ic in 0..count {
            let (_, child) = self.dir_entry(buf, off, ic)?;
            if ((child & 0x8000_0000) == 0) != (level == 2) {
                return Err(PeError::cant_pack("unsupported resource structure"));
            }
            if level != 2 {
                self.check(buf, child & 0x7fff_ffff, level + 1)?;
            }
        }
        Ok(())
    }

    fn read_name(&mut self, buf: &ImageBuf, tnl: u32) -> Result<(u32, Option<Vec<u8>>)> {
        if tnl & 0x8000_0000 == 0 {
            return Ok((tnl, None));
        }
        let off = self.start_off + (tnl & 0x7fff_ffff) as usize;
        let len = buf.subref("res", off, 2).map_err(|_| corrupt())?;
        let units = get_u16(len, 0).unwrap() as usize;
        let total = 2 + 2 * units;
        let name = buf.subref("res", off, total).map_err(|_| corrupt())?;
        self.ssize += total as u32;
        Ok((tnl, Some(name.to_vec())))
    }

    fn convert(
        &mut self,
        buf: &ImageBuf,
        off: u32,
        level: u32,
        tinfo: (u32, Option<Vec<u8>>),
        ninfo: (u32, Option<Vec<u8>>),
    ) -> Result<Option<NodeRef>> {
        let (named, ids) = self.dir_counts(buf, off)?;
        let count = named as usize + ids as usize;
        if count == 0 {
            return Ok(None);
        }
        let hdr = buf
            .subref("res", self.start_off + off as usize, RES_DIR_FIXED)
            .map_err(|_| corrupt())?;
        let mut header = [0u8; 12];
        header.copy_from_slice(&hdr[0..12]);
        let branch_idx = self.branches.len();
        self.branches.push(RBranch {
            header,
            namedentr: named,
            identr: ids,
            children: Vec::with_capacity(count),
            src_off: off,
        });
        self.dsize += (RES_DIR_FIXED + RES_ENTRY_SIZE * count) as u32;

        for ic in 0..count {
            let (tnl, child) = self.dir_entry(buf, off, ic)?;
            let (id, name) = self.read_name(buf, tnl)?;
            let node = if level == 2 {
                let base = self.start_off + child as usize;
                let raw = buf
                    .subref("res", base, RES_DATA_SIZE)
                    .map_err(|_| corrupt())?;
                let mut misc = [0u8; 8];
                misc.copy_from_slice(&raw[8..16]);
                let leaf_idx = self.leaves.len();
                self.leaves.push(RLeaf {
                    offset: get_u32(raw, 0).unwrap(),
                    size: get_u32(raw, 4).unwrap(),
                    misc,
                    newoffset: 0,
                    src_off: child,
                    tid: tinfo.0,
                    tname: tinfo.1.clone(),
                    nid: ninfo.0,
                    nname: ninfo.1.clone(),
                });
                self.dsize += RES_DATA_SIZE as u32;
                NodeRef::Leaf(leaf_idx)
            } else {
                let (t, n) = if level == 0 {
                    ((id, name.clone()), (0, None))
                } else {
                    (tinfo.clone(), (id, name.clone()))
                };
                self.convert(buf, child & 0x7fff_ffff, level + 1, t, n)?
                    .ok_or_else(corrupt)?
            };
            self.branches[branch_idx]
                .children
                .push(ChildEntry { id, name, node });
        }
        Ok(Some(NodeRef::Branch(branch_idx)))
    }

    // -- rebuilding ---------------------------------------------------------

    fn build_node(
        &self,
        node: NodeRef,
        out: &mut [u8],
        bpos: &mut usize,
        spos: &mut usize,
    ) -> Result<()> {
        match node {
            NodeRef::Leaf(idx) => {
                if *bpos + RES_DATA_SIZE > out.len() {
                    return Err(corrupt());
                }
                let leaf = &self.leaves[idx];
                let offset = if leaf.newoffset != 0 {
                    leaf.newoffset
                } else {
                    leaf.offset
                };
                put_u32(out, *bpos, offset);
                put_u32(out, *bpos + 4, leaf.size);
                out[*bpos + 8..*bpos + 16].copy_from_slice(&leaf.misc);
                *bpos += RES_DATA_SIZE;
            }
            NodeRef::Branch(idx) => {
                let branch = &self.branches[idx];
                if *bpos + branch.sizeof() > out.len() {
                    return Err(corrupt());
                }
                let hdr = *bpos;
                out[hdr..hdr + 12].copy_from_slice(&branch.header);
                put_u16(out, hdr + 12, branch.namedentr);
                put_u16(out, hdr + 14, branch.identr);
                *bpos += branch.sizeof();
                for (ic, entry) in branch.children.iter().enumerate() {
                    let epos = hdr + RES_DIR_FIXED + ic * RES_ENTRY_SIZE;
                    let mut tnl = entry.id;
                    if let Some(name) = &entry.name {
                        tnl = *spos as u32 + 0x8000_0000;
                        if *spos + name.len() > out.len() {
                            return Err(corrupt());
                        }
                        out[*spos..*spos + name.len()].copy_from_slice(name);
                        *spos += name.len();
                    }
                    let subdir = match entry.node {
                        NodeRef::Branch(_) => 0x8000_0000u32,
                        NodeRef::Leaf(_) => 0,
                    };
                    put_u32(out, epos, tnl);
                    put_u32(out, epos + 4, *bpos as u32 | subdir);
                    self.build_node(entry.node, out, bpos, spos)?;
                }
            }
        }
        Ok(())
    }

    /// Emit the directory area into a fresh buffer of `dirsize()` bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.dirsize() as usize];
        if let Some(root) = self.root {
            let mut bpos = 0;
            let mut spos = self.dsize as usize;
            self.build_node(root, &mut out, &mut bpos, &mut spos)?;
        }
        Ok(out)
    }

    // -- source cleanup -----------------------------------------------------

    /// Zero the source directory area when it is one contiguous region.
    /// Returns whether it was.
    pub fn clear(&self, buf: &mut ImageBuf) -> Result<bool> {
        let mut iv = Interval::new();
        for branch in &self.branches {
            iv.add(
                self.start_off as u32 + branch.src_off,
                branch.sizeof() as u32,
            );
        }
        for leaf in &self.leaves {
            iv.add(self.start_off as u32 + leaf.src_off, RES_DATA_SIZE as u32);
        }
        iv.flatten();
        let contiguous = iv.count() == 1;
        if contiguous {
            iv.clear_in("res", buf)?;
        } else {
            iv.dump();
        }
        Ok(contiguous)
    }
}

// ---------------------------------------------------------------------------
// Keep-pattern matching
// ---------------------------------------------------------------------------

fn atoi(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Match one id-or-name against the head of a pattern fragment.
fn match_one(num: u32, unistr: Option<&[u8]>, mkeep: &str) -> bool {
    let Some(unistr) = unistr else {
        return atoi(mkeep) == num;
    };
    let units = get_u16(unistr, 0).unwrap_or(0) as usize;
    let keep = mkeep.as_bytes();
    for ic in 0..units {
        if keep.get(ic).copied() != Some(unistr[2 + ic * 2]) {
            return false;
        }
    }
    matches!(keep.get(units), None | Some(b',') | Some(b'/'))
}

/// Does the `"type[/name],..."` pattern select this leaf?  Numeric
/// fragments compare by value, anything else against the UTF-16 name.
pub fn keep_matches(
    itype: u32,
    ntype: Option<&[u8]>,
    iname: u32,
    nname: Option<&[u8]>,
    keep: &str,
) -> bool {
    let mut keep = keep;
    loop {
        let delim1 = keep.find('/');
        let delim2 = keep.find(',');
        if match_one(itype, ntype, keep) {
            match delim1 {
                None => return true,
                Some(d1) => {
                    if let Some(d2) = delim2 {
                        if d2 < d1 {
                            return true;
                        }
                    }
                    if match_one(iname, nname, &keep[d1 + 1..]) {
                        return true;
                    }
                }
            }
        }
        match delim2 {
            None => break,
            Some(d2) => keep = &keep[d2 + 1..],
        }
    }
    false
}
