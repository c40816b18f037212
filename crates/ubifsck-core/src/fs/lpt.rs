/// LEB properties tree (LPT)
///
/// Per-LEB free and dirty space of the main area, stored as a fanout-4 tree
/// of pnodes under nnodes in the LPT area, followed by the LPT's own LEB table
/// (ltab) and, in the big model, the lsave table. The tree is always written
/// from scratch here; incremental LPT commits are not needed for a checker.

use serde::Serialize;

use crate::error::{Corruption, FsckError, Result};
use crate::fs::tnc::Tnc;
use crate::fs::FsInfo;
use crate::media::lpt::*;
use crate::media::*;
use crate::volume::{scan_leb, Volume};

/// Properties of one main area LEB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lprops {
    pub free: u32,
    pub dirty: u32,
    pub index: bool,
}

impl Lprops {
    pub fn empty(leb_size: u32) -> Self {
        Self {
            free: leb_size,
            dirty: 0,
            index: false,
        }
    }

    pub fn used(&self, leb_size: u32) -> u32 {
        leb_size.saturating_sub(self.free + self.dirty)
    }

    /// Two records describe the same LEB usage
    pub fn same_as(&self, other: &Lprops, leb_size: u32) -> bool {
        self == other || (self.used(leb_size) == 0 && other.used(leb_size) == 0)
    }
}

/// Aggregate space statistics kept in the master node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LpStats {
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
}

impl LpStats {
    pub fn from_master(mst: &MstNode) -> Self {
        Self {
            empty_lebs: mst.empty_lebs,
            idx_lebs: mst.idx_lebs,
            total_free: mst.total_free,
            total_dirty: mst.total_dirty,
            total_used: mst.total_used,
            total_dead: mst.total_dead,
            total_dark: mst.total_dark,
        }
    }

    pub fn store(&self, mst: &mut MstNode) {
        mst.empty_lebs = self.empty_lebs;
        mst.idx_lebs = self.idx_lebs;
        mst.total_free = self.total_free;
        mst.total_dirty = self.total_dirty;
        mst.total_used = self.total_used;
        mst.total_dead = self.total_dead;
        mst.total_dark = self.total_dark;
    }
}

/// Sum up per-LEB properties into the master statistics
pub fn calc_stats(fs: &FsInfo, lprops: &[Lprops]) -> LpStats {
    let mut st = LpStats::default();
    for lp in lprops {
        st.total_free += lp.free as u64;
        st.total_dirty += lp.dirty as u64;
        if lp.free == fs.leb_size {
            st.empty_lebs += 1;
        }
        if lp.index {
            st.idx_lebs += 1;
            continue;
        }
        let spc = lp.free + lp.dirty;
        if spc < fs.dead_wm {
            st.total_dead += spc as u64;
        } else {
            st.total_dark += fs.calc_dark(spc) as u64;
        }
        st.total_used += (fs.leb_size - spc) as u64;
    }
    st
}

/// Positions of the LPT parts, as recorded in the master node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LptPositions {
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
}

impl LptPositions {
    pub fn store(&self, mst: &mut MstNode) {
        mst.lpt_lnum = self.lpt_lnum;
        mst.lpt_offs = self.lpt_offs;
        mst.nhead_lnum = self.nhead_lnum;
        mst.nhead_offs = self.nhead_offs;
        mst.ltab_lnum = self.ltab_lnum;
        mst.ltab_offs = self.ltab_offs;
        mst.lsave_lnum = self.lsave_lnum;
        mst.lsave_offs = self.lsave_offs;
    }
}

fn pnode_cnt(fs: &FsInfo) -> u32 {
    fs.main_lebs.div_ceil(LPT_FANOUT as u32)
}

/// Number of nnode levels above the pnodes
fn lpt_height(fs: &FsInfo) -> u32 {
    let cnt = pnode_cnt(fs);
    let mut height = 1;
    let mut n = LPT_FANOUT as u32;
    while n < cnt {
        height += 1;
        n <<= LPT_FANOUT_SHIFT;
    }
    height
}

fn bad(lnum: u32, offs: u32, detail: impl Into<String>) -> FsckError {
    FsckError::corrupted(Corruption::Lpt, lnum, offs, detail)
}

fn read_lpt_node(vol: &dyn Volume, fs: &FsInfo, lnum: u32, offs: u32, len: usize) -> Result<Vec<u8>> {
    if lnum < fs.lpt_first || lnum > fs.lpt_last || offs as usize + len > fs.leb_size as usize {
        return Err(bad(lnum, offs, "LPT node outside the LPT area"));
    }
    let mut buf = vec![0u8; len];
    vol.read(lnum, offs, &mut buf)?;
    Ok(buf)
}

/// Read the properties of every main area LEB from the on-flash LPT
pub fn read_lpt(vol: &dyn Volume, fs: &FsInfo, mst: &MstNode) -> Result<Vec<Lprops>> {
    let bits = &fs.lpt_bits;
    let height = lpt_height(fs);
    let mut lprops = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];

    // (lnum, offs, level, col); level 0 is a pnode
    let mut stack = vec![(mst.lpt_lnum, mst.lpt_offs, height, 0u32)];
    while let Some((lnum, offs, level, col)) = stack.pop() {
        if level == 0 {
            let buf = read_lpt_node(vol, fs, lnum, offs, bits.pnode_sz)?;
            let pnode = Pnode::unpack(bits, &buf).map_err(|e| bad(lnum, offs, e.to_string()))?;
            if bits.big_lpt && pnode.num != col {
                return Err(bad(lnum, offs, format!("pnode number {} where {} was expected", pnode.num, col)));
            }
            for (i, entry) in pnode.entries.iter().enumerate() {
                let index = col as usize * LPT_FANOUT + i;
                if let Some(lp) = lprops.get_mut(index) {
                    if entry.free + entry.dirty > fs.leb_size {
                        return Err(bad(lnum, offs, format!(
                            "LEB {} has free {} dirty {}",
                            fs.main_first as usize + index,
                            entry.free,
                            entry.dirty
                        )));
                    }
                    *lp = Lprops {
                        free: entry.free,
                        dirty: entry.dirty,
                        index: entry.index,
                    };
                }
            }
            continue;
        }

        let buf = read_lpt_node(vol, fs, lnum, offs, bits.nnode_sz)?;
        let nnode = Nnode::unpack(bits, &buf, fs.lpt_first).map_err(|e| bad(lnum, offs, e.to_string()))?;
        if bits.big_lpt {
            let expected = calc_nnode_num(height - level, col);
            if nnode.num != expected {
                return Err(bad(lnum, offs, format!("nnode number {} where {} was expected", nnode.num, expected)));
            }
        }
        // Pnodes below this branch must exist while they cover main LEBs
        let span = (LPT_FANOUT as u32).pow(level - 1);
        for (i, br) in nnode.branches.iter().enumerate() {
            let child_col = col * LPT_FANOUT as u32 + i as u32;
            let needed = child_col * span < pnode_cnt(fs);
            match (br.lnum, needed) {
                (0, true) => return Err(bad(lnum, offs, format!("missing LPT child {}", i))),
                (0, false) => {}
                (child, _) => stack.push((child, br.offs, level - 1, child_col)),
            }
        }
    }

    let buf = read_lpt_node(vol, fs, mst.ltab_lnum, mst.ltab_offs, bits.ltab_sz)?;
    let ltab = unpack_ltab(bits, &buf).map_err(|e| bad(mst.ltab_lnum, mst.ltab_offs, e.to_string()))?;
    if ltab.iter().any(|e| e.free + e.dirty > fs.leb_size) {
        return Err(bad(mst.ltab_lnum, mst.ltab_offs, "bad LPT LEB table"));
    }
    if fs.big_lpt {
        let buf = read_lpt_node(vol, fs, mst.lsave_lnum, mst.lsave_offs, bits.lsave_sz)?;
        unpack_lsave(bits, &buf).map_err(|e| bad(mst.lsave_lnum, mst.lsave_offs, e.to_string()))?;
    }
    Ok(lprops)
}

/// Accumulates LPT nodes into LPT LEBs
struct LptWriter<'a> {
    fs: &'a FsInfo,
    buf: Vec<u8>,
    lnum: u32,
    ltab: Vec<LtabEntry>,
}

impl<'a> LptWriter<'a> {
    fn new(fs: &'a FsInfo) -> Self {
        Self {
            fs,
            buf: Vec::with_capacity(fs.leb_size as usize),
            lnum: fs.lpt_first,
            ltab: vec![
                LtabEntry {
                    free: fs.leb_size,
                    dirty: 0,
                };
                fs.lpt_lebs as usize
            ],
        }
    }

    fn set_ltab(&mut self, len: usize) -> usize {
        let alen = align(len as u32, self.fs.min_io_size) as usize;
        self.ltab[(self.lnum - self.fs.lpt_first) as usize] = LtabEntry {
            free: self.fs.leb_size - alen as u32,
            dirty: (alen - len) as u32,
        };
        alen
    }

    fn write_out(&mut self, vol: &mut dyn Volume) -> Result<()> {
        let alen = self.set_ltab(self.buf.len());
        self.buf.resize(alen, EMPTY_BYTE);
        vol.change(self.lnum, &self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Make room for `len` bytes, moving to the next LPT LEB if needed
    fn reserve(&mut self, vol: &mut dyn Volume, len: usize) -> Result<()> {
        if self.buf.len() + len <= self.fs.leb_size as usize {
            return Ok(());
        }
        self.write_out(vol)?;
        if self.lnum >= self.fs.lpt_last {
            return Err(FsckError::NoSpace);
        }
        self.lnum += 1;
        Ok(())
    }

    fn add(&mut self, vol: &mut dyn Volume, node: &[u8]) -> Result<NnodeBranch> {
        self.reserve(vol, node.len())?;
        let pos = NnodeBranch {
            lnum: self.lnum,
            offs: self.buf.len() as u32,
        };
        self.buf.extend_from_slice(node);
        Ok(pos)
    }
}

/// Write a complete LPT describing `lprops` into the LPT area
pub fn create_lpt(vol: &mut dyn Volume, fs: &FsInfo, lprops: &[Lprops]) -> Result<LptPositions> {
    let bits = &fs.lpt_bits;
    let mut w = LptWriter::new(fs);
    let height = lpt_height(fs);

    let mut level: Vec<NnodeBranch> = Vec::new();
    for num in 0..pnode_cnt(fs) {
        let mut pnode = Pnode {
            num,
            ..Default::default()
        };
        for (i, entry) in pnode.entries.iter_mut().enumerate() {
            let lp = lprops
                .get(num as usize * LPT_FANOUT + i)
                .copied()
                .unwrap_or_else(|| Lprops::empty(fs.leb_size));
            *entry = PnodeEntry {
                free: lp.free,
                dirty: lp.dirty,
                index: lp.index,
            };
        }
        level.push(w.add(vol, &pnode.pack(bits))?);
    }

    let mut row = height;
    loop {
        row -= 1;
        let mut upper = Vec::with_capacity(level.len().div_ceil(LPT_FANOUT));
        for (col, children) in level.chunks(LPT_FANOUT).enumerate() {
            let mut nnode = Nnode {
                num: calc_nnode_num(row, col as u32),
                ..Default::default()
            };
            nnode.branches[..children.len()].copy_from_slice(children);
            upper.push(w.add(vol, &nnode.pack(bits, fs.lpt_first))?);
        }
        level = upper;
        if level.len() == 1 {
            break;
        }
    }
    let root = level[0];

    let mut pos = LptPositions {
        lpt_lnum: root.lnum,
        lpt_offs: root.offs,
        ..Default::default()
    };

    if fs.big_lpt {
        let lsave: Vec<u32> = (0..fs.lsave_cnt)
            .map(|i| {
                if i < fs.main_lebs {
                    fs.main_first + i
                } else {
                    fs.main_first
                }
            })
            .collect();
        let at = w.add(vol, &pack_lsave(bits, &lsave))?;
        pos.lsave_lnum = at.lnum;
        pos.lsave_offs = at.offs;
    }

    w.reserve(vol, bits.ltab_sz)?;
    pos.ltab_lnum = w.lnum;
    pos.ltab_offs = w.buf.len() as u32;
    // The table describes its own LEB, so account for it before packing
    let len = w.buf.len() + bits.ltab_sz;
    let alen = w.set_ltab(len);
    let ltab = pack_ltab(bits, &w.ltab);
    w.buf.extend_from_slice(&ltab);
    w.buf.resize(alen, EMPTY_BYTE);
    vol.change(w.lnum, &w.buf)?;
    pos.nhead_lnum = w.lnum;
    pos.nhead_offs = alen as u32;

    for lnum in w.lnum + 1..=fs.lpt_last {
        vol.unmap(lnum)?;
    }
    tracing::debug!(
        "Created LPT: root {}:{}, ltab {}:{}, {} pnodes",
        pos.lpt_lnum,
        pos.lpt_offs,
        pos.ltab_lnum,
        pos.ltab_offs,
        pnode_cnt(fs)
    );
    Ok(pos)
}

/// Derive the properties of every main area LEB from its contents
///
/// Bytes of nodes the index still references (and of the current index
/// nodes) are used; everything else written is dirty, even when the whole
/// LEB is. `gc_lnum` is the LEB reserved for garbage collection and counts
/// as empty.
pub fn calc_lprops(vol: &dyn Volume, fs: &FsInfo, tnc: &Tnc, gc_lnum: Option<u32>) -> Result<Vec<Lprops>> {
    let mut lprops = Vec::with_capacity(fs.main_lebs as usize);
    for lnum in fs.main_first..fs.leb_cnt {
        if gc_lnum == Some(lnum) || !vol.is_mapped(lnum)? {
            lprops.push(Lprops::empty(fs.leb_size));
            continue;
        }
        let sleb = scan_leb(vol, &fs.ranges, lnum, 0)?;
        let end = if sleb.is_corrupted() { fs.leb_size } else { sleb.endpt };
        let mut used = 0u32;
        let mut index = false;
        for node in &sleb.nodes {
            let live = match (node.node_type, node.key) {
                (NodeType::Idx, _) => {
                    index = true;
                    tnc.is_index_node(lnum, node.offs)
                }
                (NodeType::Trun, _) => false,
                (_, Some(key)) => tnc.is_authoritative(&key, lnum, node.offs),
                _ => false,
            };
            if live {
                used += align(node.len, 8);
            }
        }
        // Nothing live is still written space: it may hold deletion nodes
        // and is left to be reclaimed as dirty
        if end == 0 {
            lprops.push(Lprops::empty(fs.leb_size));
        } else {
            lprops.push(Lprops {
                free: fs.leb_size - end,
                dirty: end - used,
                index,
            });
        }
    }
    Ok(lprops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::test_sb;
    use crate::volume::MemVolume;

    fn fs() -> FsInfo {
        FsInfo::new(test_sb()).unwrap()
    }

    #[test]
    fn test_stats_conserve_space() {
        let fs = fs();
        let mut lprops = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        lprops[0] = Lprops { free: 8192, dirty: 1024, index: false };
        lprops[1] = Lprops { free: 16000, dirty: 0, index: true };
        lprops[2] = Lprops { free: 0, dirty: 16, index: false };
        let st = calc_stats(&fs, &lprops);

        assert_eq!(st.empty_lebs, fs.main_lebs - 3);
        assert_eq!(st.idx_lebs, 1);
        assert_eq!(st.total_dead, 16);
        assert_eq!(st.total_used, (16384 - 9216) + (16384 - 16));
        let sum: u64 = lprops.iter().map(|lp| (lp.free + lp.dirty + lp.used(fs.leb_size)) as u64).sum();
        assert_eq!(sum, fs.main_bytes());
    }

    #[test]
    fn test_create_then_read() {
        let fs = fs();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let lprops: Vec<Lprops> = (0..fs.main_lebs)
            .map(|i| Lprops {
                free: 16384 - i * 512,
                dirty: i * 8,
                index: i % 5 == 0 && i != 0,
            })
            .collect();
        let pos = create_lpt(&mut vol, &fs, &lprops).unwrap();
        let mut mst = MstNode::default();
        pos.store(&mut mst);
        assert_eq!(read_lpt(&vol, &fs, &mst).unwrap(), lprops);
        assert!(!vol.is_mapped(fs.lpt_last).unwrap());
    }

    #[test]
    fn test_corrupted_pnode() {
        let fs = fs();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let lprops = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        let pos = create_lpt(&mut vol, &fs, &lprops).unwrap();
        let mut mst = MstNode::default();
        pos.store(&mut mst);
        vol.raw_mut(fs.lpt_first)[3] ^= 0x10;
        let err = read_lpt(&vol, &fs, &mst).unwrap_err();
        assert_eq!(err.corruption(), Some(Corruption::Lpt));
    }

    #[test]
    fn test_same_as() {
        let a = Lprops { free: 100, dirty: 16284, index: false };
        let b = Lprops::empty(16384);
        assert!(a.same_as(&b, 16384));
        let c = Lprops { free: 100, dirty: 100, index: false };
        assert!(!c.same_as(&b, 16384));
    }
}
