/// Writing nodes and committing the index
///
/// A checker never appends to a partially written LEB: new nodes go to LEBs
/// nothing live points into, each written in one go with `change`. The index
/// is always rewritten as a whole, bottom-up, so the commit does not depend on
/// the shape of the old tree.

use crate::error::Result;
use crate::fs::log::{clean_log, clear_orphans};
use crate::fs::lpt::{calc_lprops, calc_stats, create_lpt, LpStats, Lprops};
use crate::fs::master::write_master;
use crate::fs::tnc::{IdxRef, Tnc, Zbranch};
use crate::fs::{FsInfo, UsedLebs};
use crate::media::*;
use crate::volume::Volume;

/// Packs nodes into free main area LEBs
#[derive(Debug, Default)]
pub struct NodeWriter {
    lnum: Option<u32>,
    buf: Vec<u8>,
}

impl NodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `node` for writing and return the position it will occupy
    pub fn add(
        &mut self,
        vol: &mut dyn Volume,
        fs: &FsInfo,
        used: &mut UsedLebs,
        node: &[u8],
    ) -> Result<(u32, u32)> {
        let lnum = match self.lnum {
            Some(lnum) if self.buf.len() + node.len() <= fs.leb_size as usize => lnum,
            _ => {
                self.flush(vol, fs)?;
                let lnum = used.get_free_leb()?;
                vol.unmap(lnum)?;
                self.lnum = Some(lnum);
                lnum
            }
        };
        let offs = self.buf.len() as u32;
        self.buf.extend_from_slice(node);
        let aligned = align(self.buf.len() as u32, 8) as usize;
        self.buf.resize(aligned, PADDING_BYTE);
        Ok((lnum, offs))
    }

    /// Current LEB and the min. I/O aligned end of what was queued
    pub fn head(&self, fs: &FsInfo) -> Option<(u32, u32)> {
        self.lnum
            .map(|lnum| (lnum, align(self.buf.len() as u32, fs.min_io_size)))
    }

    /// Write out the current LEB, padded to the min. I/O unit
    pub fn flush(&mut self, vol: &mut dyn Volume, fs: &FsInfo) -> Result<()> {
        if let Some(lnum) = self.lnum.take() {
            let start = self.buf.len();
            let len = align(start as u32, fs.min_io_size) as usize;
            self.buf.resize(len, 0);
            pad_space(&mut self.buf[start..]);
            vol.change(lnum, &self.buf)?;
            tracing::debug!("Wrote {} bytes of nodes to LEB {}", len, lnum);
        }
        self.buf.clear();
        Ok(())
    }
}

/// A freshly written index
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub root: IdxRef,
    pub nodes: Vec<IdxRef>,
    pub ihead_lnum: u32,
    pub ihead_offs: u32,
    pub index_size: u64,
}

/// Write an index over `leaves`, which must be in index order
pub fn write_index(
    vol: &mut dyn Volume,
    fs: &mut FsInfo,
    used: &mut UsedLebs,
    leaves: &[(Key, Zbranch)],
) -> Result<IndexInfo> {
    if leaves.is_empty() {
        return Err(anyhow::anyhow!("cannot write an index without leaves").into());
    }
    let mut writer = NodeWriter::new();
    let mut nodes = Vec::new();
    let mut level = 0u16;
    let mut branches: Vec<Branch> = leaves
        .iter()
        .map(|(key, zbr)| Branch {
            lnum: zbr.lnum,
            offs: zbr.offs,
            len: zbr.len,
            key: *key,
        })
        .collect();

    let root = loop {
        let mut upper = Vec::with_capacity(branches.len().div_ceil(fs.fanout as usize));
        for chunk in branches.chunks(fs.fanout as usize) {
            let idx = IdxNode {
                level,
                branches: chunk.to_vec(),
            };
            let node = idx.encode(fs.next_sqnum());
            let (lnum, offs) = writer.add(vol, fs, used, &node)?;
            let len = node.len() as u32;
            nodes.push(IdxRef { lnum, offs, len, level });
            upper.push(Branch {
                lnum,
                offs,
                len,
                key: chunk[0].key,
            });
        }
        if upper.len() == 1 {
            break IdxRef {
                lnum: upper[0].lnum,
                offs: upper[0].offs,
                len: upper[0].len,
                level,
            };
        }
        branches = upper;
        level += 1;
    };

    let (ihead_lnum, ihead_offs) = writer.head(fs).unwrap_or((root.lnum, fs.leb_size));
    writer.flush(vol, fs)?;
    let index_size = nodes.iter().map(|n| align(n.len, 8) as u64).sum();
    tracing::info!(
        "Wrote index: {} nodes, height {}, root at {}:{}",
        nodes.len(),
        level + 1,
        root.lnum,
        root.offs
    );
    Ok(IndexInfo {
        root,
        nodes,
        ihead_lnum,
        ihead_offs,
        index_size,
    })
}

/// Result of a commit
#[derive(Debug, Clone)]
pub struct Committed {
    pub master: MstNode,
    pub lprops: Vec<Lprops>,
    pub stats: LpStats,
}

/// Write the index, LPT and master node for the current state of `tnc`
///
/// `mst` supplies the fields that survive the commit (flags). The log is
/// emptied and the orphan area cleared, so the result needs no replay.
pub fn commit(vol: &mut dyn Volume, fs: &mut FsInfo, tnc: &mut Tnc, mst: &MstNode) -> Result<Committed> {
    let mut used = UsedLebs::from_volume(fs, vol)?;
    for lnum in tnc.used_lebs() {
        used.mark(lnum);
    }

    let leaves = tnc.sorted_leaves(vol, fs)?;
    let index = write_index(vol, fs, &mut used, &leaves)?;
    tnc.set_index(index.root, index.nodes);

    let gc_lnum = used.get_free_leb()?;
    vol.unmap(gc_lnum)?;

    let lprops = calc_lprops(vol, fs, tnc, Some(gc_lnum))?;
    let stats = calc_stats(fs, &lprops);
    let mut stale = Vec::new();
    for (i, lp) in lprops.iter().enumerate() {
        let lnum = fs.main_first + i as u32;
        if lp.free == fs.leb_size && vol.is_mapped(lnum)? {
            stale.push(lnum);
        }
    }

    let lpt = create_lpt(vol, fs, &lprops)?;
    fs.cmt_no += 1;
    clean_log(vol, fs)?;
    clear_orphans(vol, fs)?;

    let mut master = MstNode {
        highest_inum: fs.highest_inum,
        cmt_no: fs.cmt_no,
        flags: (mst.flags & !(MST_DIRTY | MST_RCVRY)) | MST_NO_ORPHS,
        log_lnum: LOG_LNUM,
        root_lnum: index.root.lnum,
        root_offs: index.root.offs,
        root_len: index.root.len,
        gc_lnum,
        ihead_lnum: index.ihead_lnum,
        ihead_offs: index.ihead_offs,
        index_size: index.index_size,
        lscan_lnum: fs.main_first,
        leb_cnt: fs.leb_cnt,
        ..Default::default()
    };
    lpt.store(&mut master);
    stats.store(&mut master);
    write_master(vol, fs, &master)?;

    for lnum in stale {
        vol.unmap(lnum)?;
    }
    Ok(Committed {
        master,
        lprops,
        stats,
    })
}
