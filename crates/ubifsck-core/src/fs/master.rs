/// Master node
///
/// Two copies live in LEBs 1 and 2; each LEB holds a sequence of master
/// nodes and the last one is current. The copy with the higher sequence
/// number wins. When the copies disagree, or one is damaged, the master is
/// rewritten at the end of the run.

use crate::error::{Corruption, FsckError, Result};
use crate::fs::FsInfo;
use crate::media::*;
use crate::volume::{scan_leb, Volume};

#[derive(Debug, Clone)]
pub struct Master {
    pub node: MstNode,
    /// Sequence number of the master node that was read
    pub sqnum: u64,
    /// The two on-flash copies disagree or one of them is damaged
    pub needs_write: bool,
}

fn last_master(vol: &dyn Volume, fs: &FsInfo, lnum: u32) -> Result<Option<(MstNode, u64, bool)>> {
    let sleb = scan_leb(vol, &fs.ranges, lnum, 0)?;
    let damaged = sleb.is_corrupted() || sleb.nodes.iter().any(|n| n.node_type != NodeType::Mst);
    match sleb.nodes.iter().rev().find(|n| n.node_type == NodeType::Mst) {
        Some(node) => Ok(Some((MstNode::parse(&node.data)?, node.sqnum, damaged))),
        None => Ok(None),
    }
}

/// Read both master copies and pick the current one
pub fn read_master(vol: &dyn Volume, fs: &FsInfo) -> Result<Master> {
    let first = last_master(vol, fs, MST_LNUM)?;
    let second = last_master(vol, fs, MST_LNUM + 1)?;

    let master = match (first, second) {
        (Some((m1, s1, d1)), Some((m2, s2, d2))) => {
            let differ = m1 != m2 || s1 != s2;
            if s2 > s1 {
                Master { node: m2, sqnum: s2, needs_write: differ || d1 || d2 }
            } else {
                Master { node: m1, sqnum: s1, needs_write: differ || d1 || d2 }
            }
        }
        (Some((node, sqnum, _)), None) | (None, Some((node, sqnum, _))) => {
            tracing::warn!("only one valid master node copy found");
            Master { node, sqnum, needs_write: true }
        }
        (None, None) => {
            return Err(FsckError::corrupted(
                Corruption::Master,
                MST_LNUM,
                0,
                "no valid master node",
            ))
        }
    };
    validate_master(fs, &master)?;
    Ok(master)
}

fn bad(detail: String) -> FsckError {
    FsckError::corrupted(Corruption::Master, MST_LNUM, 0, detail)
}

/// Range-check every master node field against the geometry
pub fn validate_master(fs: &FsInfo, master: &Master) -> Result<()> {
    let mst = &master.node;
    let main = fs.main_first..fs.leb_cnt;
    let lpt = fs.lpt_first..fs.lpt_last + 1;

    if mst.cmt_no >= master.sqnum {
        return Err(bad(format!(
            "commit number {} not below max. sqnum {}",
            mst.cmt_no, master.sqnum
        )));
    }
    if mst.highest_inum >= INUM_WATERMARK {
        return Err(bad(format!("bad highest inode number {}", mst.highest_inum)));
    }
    if mst.log_lnum < LOG_LNUM || mst.log_lnum > fs.log_last {
        return Err(bad(format!("bad log LEB {}", mst.log_lnum)));
    }
    if !main.contains(&mst.root_lnum)
        || mst.root_offs % 8 != 0
        || mst.root_offs + mst.root_len > fs.leb_size
        || !fs.ranges.check(NodeType::Idx, mst.root_len)
    {
        return Err(bad(format!(
            "bad index root {}:{} len {}",
            mst.root_lnum, mst.root_offs, mst.root_len
        )));
    }
    if !main.contains(&mst.gc_lnum) {
        return Err(bad(format!("bad GC LEB {}", mst.gc_lnum)));
    }
    if !main.contains(&mst.ihead_lnum)
        || mst.ihead_offs > fs.leb_size
        || mst.ihead_offs % fs.min_io_size != 0
    {
        return Err(bad(format!("bad index head {}:{}", mst.ihead_lnum, mst.ihead_offs)));
    }
    if mst.index_size > fs.main_bytes() || mst.index_size % 8 != 0 {
        return Err(bad(format!("bad index size {}", mst.index_size)));
    }
    let mut lpt_positions = vec![
        ("LPT root", mst.lpt_lnum, mst.lpt_offs),
        ("LPT head", mst.nhead_lnum, mst.nhead_offs),
        ("ltab", mst.ltab_lnum, mst.ltab_offs),
    ];
    if fs.big_lpt {
        lpt_positions.push(("lsave", mst.lsave_lnum, mst.lsave_offs));
    }
    for (what, lnum, offs) in lpt_positions {
        if !lpt.contains(&lnum) || offs > fs.leb_size {
            return Err(bad(format!("bad {} position {}:{}", what, lnum, offs)));
        }
    }
    if !main.contains(&mst.lscan_lnum) {
        return Err(bad(format!("bad LPT scan LEB {}", mst.lscan_lnum)));
    }
    if mst.empty_lebs > fs.main_lebs - 2 {
        return Err(bad(format!("bad empty LEB count {}", mst.empty_lebs)));
    }
    if mst.idx_lebs > fs.main_lebs - 1 {
        return Err(bad(format!("bad index LEB count {}", mst.idx_lebs)));
    }
    let main_bytes = fs.main_bytes();
    if mst.total_free > main_bytes
        || mst.total_dirty > main_bytes
        || mst.total_used > main_bytes
        || mst.total_free + mst.total_dirty + mst.total_used > main_bytes
        || mst.total_dead + mst.total_dark + mst.total_used + mst.index_size > main_bytes
        || mst.total_free % 8 != 0
        || mst.total_dirty % 8 != 0
    {
        return Err(bad("bad space statistics".into()));
    }
    if mst.leb_cnt != fs.leb_cnt {
        return Err(bad(format!(
            "LEB count {} differs from the superblock's {}",
            mst.leb_cnt, fs.leb_cnt
        )));
    }
    Ok(())
}

/// Replace both master copies with `mst`
pub fn write_master(vol: &mut dyn Volume, fs: &mut FsInfo, mst: &MstNode) -> Result<()> {
    let sqnum = fs.next_sqnum();
    let mut buf = mst.encode(sqnum);
    let len = align(buf.len() as u32, fs.min_io_size) as usize;
    let start = buf.len();
    buf.resize(len, 0);
    pad_space(&mut buf[start..]);

    for lnum in [MST_LNUM, MST_LNUM + 1] {
        vol.change(lnum, &buf)?;
    }
    tracing::info!(
        "Write master node: commit {}, index root {}:{}, highest inode {}",
        mst.cmt_no,
        mst.root_lnum,
        mst.root_offs,
        mst.highest_inum
    );
    Ok(())
}
