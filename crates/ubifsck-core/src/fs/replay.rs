/// Journal replay
///
/// The log names the buds: main area LEBs written since the last commit. Bud
/// nodes are applied to the index in sequence number order, after which the
/// in-memory index describes the filesystem as it was at the power cut.
/// Orphans left over from unlinked-but-open inodes are removed last.

use std::collections::HashMap;

use crate::error::{Corruption, FsckError, Result};
use crate::fs::tnc::{read_leaf, Tnc, Zbranch};
use crate::fs::FsInfo;
use crate::media::*;
use crate::volume::{scan_leb, ScannedLeb, ScannedNode, Volume};

/// A bud named by a reference node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bud {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

#[derive(Debug, Clone)]
pub struct BudScan {
    pub bud: Bud,
    pub sleb: ScannedLeb,
}

impl BudScan {
    /// End of the last intact node, where a recovered bud is cut
    pub fn good_end(&self) -> u32 {
        self.sleb
            .nodes
            .last()
            .map(|n| n.offs + align(n.len, 8))
            .unwrap_or(self.bud.offs)
    }
}

fn log_bad(lnum: u32, offs: u32, detail: impl Into<String>) -> FsckError {
    FsckError::corrupted(Corruption::Log, lnum, offs, detail)
}

/// Read the log and return the buds it names
pub fn read_log(vol: &dyn Volume, fs: &FsInfo, mst: &MstNode) -> Result<Vec<Bud>> {
    let mut buds: Vec<Bud> = Vec::new();
    let mut cs_sqnum = None;
    let mut lnum = mst.log_lnum;

    for i in 0..fs.log_lebs {
        let sleb = scan_leb(vol, &fs.ranges, lnum, 0)?;
        let Some(first) = sleb.nodes.first() else {
            if cs_sqnum.is_none() {
                return Err(log_bad(lnum, 0, "log head is empty"));
            }
            if sleb.is_corrupted() && i + 1 < fs.log_lebs {
                return Err(log_bad(lnum, sleb.corrupted_at.unwrap_or(0), "corrupted log LEB"));
            }
            break;
        };
        let cs = match cs_sqnum {
            None => {
                if first.node_type != NodeType::Cs {
                    return Err(log_bad(lnum, first.offs, "first log node is not a commit start node"));
                }
                let node = CsNode::parse(&first.data)?;
                if node.cmt_no != mst.cmt_no {
                    return Err(log_bad(
                        lnum,
                        first.offs,
                        format!("commit number {} where {} was expected", node.cmt_no, mst.cmt_no),
                    ));
                }
                *cs_sqnum.insert(first.sqnum)
            }
            // Older log contents that were committed but not erased
            Some(cs) if first.sqnum < cs => break,
            Some(cs) => cs,
        };
        if first.offs != 0 {
            return Err(log_bad(lnum, first.offs, "first log node is not at offset zero"));
        }

        for node in &sleb.nodes {
            if node.sqnum < cs {
                return Err(log_bad(lnum, node.offs, format!("bad sequence number {}", node.sqnum)));
            }
            match node.node_type {
                NodeType::Cs if node.offs == 0 => {}
                NodeType::Ref => {
                    let r = RefNode::parse(&node.data)?;
                    if r.jhead >= fs.jhead_cnt
                        || !fs.is_main(r.lnum)
                        || r.offs > fs.leb_size
                        || r.offs % fs.min_io_size != 0
                    {
                        return Err(log_bad(lnum, node.offs, format!("bad reference {}:{} head {}", r.lnum, r.offs, r.jhead)));
                    }
                    match buds.iter().find(|b| b.lnum == r.lnum) {
                        Some(b) if b.jhead == r.jhead && b.offs <= r.offs => {}
                        Some(_) => {
                            return Err(log_bad(lnum, node.offs, format!("bud LEB {} referred twice", r.lnum)));
                        }
                        None => buds.push(Bud {
                            lnum: r.lnum,
                            offs: r.offs,
                            jhead: r.jhead,
                        }),
                    }
                }
                _ => {
                    return Err(log_bad(
                        lnum,
                        node.offs,
                        format!("unexpected {} node in the log", node.node_type.name()),
                    ));
                }
            }
        }

        // A torn write is only tolerated at the end of the log
        if let Some(at) = sleb.corrupted_at {
            let next = if lnum == fs.log_last { LOG_LNUM } else { lnum + 1 };
            if i + 1 < fs.log_lebs && !scan_leb(vol, &fs.ranges, next, 0)?.nodes.is_empty() {
                return Err(log_bad(lnum, at, "corrupted log LEB"));
            }
            break;
        }
        lnum = if lnum == fs.log_last { LOG_LNUM } else { lnum + 1 };
    }

    tracing::debug!("Log names {} buds", buds.len());
    Ok(buds)
}

/// Scan the buds; non-leaf nodes in a bud count as corruption
pub fn scan_buds(vol: &dyn Volume, fs: &FsInfo, buds: &[Bud]) -> Result<Vec<BudScan>> {
    let mut scans = Vec::with_capacity(buds.len());
    for bud in buds {
        let mut sleb = scan_leb(vol, &fs.ranges, bud.lnum, bud.offs)?;
        if let Some(pos) = sleb.nodes.iter().position(|n| !n.node_type.has_key()) {
            tracing::debug!(
                "unexpected {} node in bud {}:{}",
                sleb.nodes[pos].node_type.name(),
                bud.lnum,
                sleb.nodes[pos].offs
            );
            sleb.corrupted_at = Some(sleb.nodes[pos].offs);
            sleb.nodes.truncate(pos);
        }
        scans.push(BudScan { bud: *bud, sleb });
    }
    Ok(scans)
}

/// Cut a corrupted bud after its last intact node
pub fn recover_bud(vol: &mut dyn Volume, fs: &FsInfo, scan: &BudScan) -> Result<()> {
    let end = scan.good_end();
    let len = align(end, fs.min_io_size) as usize;
    let mut buf = vec![0u8; len];
    vol.read(scan.bud.lnum, 0, &mut buf[..end as usize])?;
    pad_space(&mut buf[end as usize..]);
    vol.change(scan.bud.lnum, &buf)?;
    tracing::info!("Recovered bud LEB {}, cut at {}", scan.bud.lnum, end);
    Ok(())
}

fn zbranch(node: &ScannedNode) -> Zbranch {
    Zbranch {
        lnum: node.lnum,
        offs: node.offs,
        len: node.len,
    }
}

/// Apply the nodes of all buds to the index, oldest first
pub fn apply_buds(vol: &dyn Volume, fs: &mut FsInfo, tnc: &mut Tnc, scans: &[BudScan]) -> Result<usize> {
    let mut nodes: Vec<&ScannedNode> = scans.iter().flat_map(|s| s.sleb.nodes.iter()).collect();
    nodes.sort_by_key(|n| n.sqnum);

    for node in &nodes {
        fs.saw_sqnum(node.sqnum);
        let Some(key) = node.key else { continue };
        fs.highest_inum = fs.highest_inum.max(key.inum as u64);
        match node.node_type {
            NodeType::Ino => {
                let ino = InoNode::parse(&node.data)?;
                if ino.nlink == 0 {
                    tnc.remove_ino(vol, fs, key.inum)?;
                } else {
                    tnc.insert(key, zbranch(node));
                }
            }
            NodeType::Dent | NodeType::Xent => {
                let dent = DentNode::parse(&node.data)?;
                if dent.inum == 0 {
                    tnc.remove_dent(vol, fs, &key, &dent.name)?;
                } else {
                    tnc.insert_dent(vol, fs, key, zbranch(node), &dent.name)?;
                }
            }
            NodeType::Trun => {
                let trun = TrunNode::parse(&node.data)?;
                let first_block = trun.new_size.div_ceil(BLOCK_SIZE as u64);
                tnc.remove_data_from(trun.inum, first_block.min(key::KEY_BLOCK_MASK as u64) as u32);
            }
            _ => tnc.insert(key, zbranch(node)),
        }
    }
    tracing::info!("Replayed {} journal nodes from {} buds", nodes.len(), scans.len());
    Ok(nodes.len())
}

/// Orphans recorded in one orphan area LEB
#[derive(Debug, Clone)]
pub struct OrphanLeb {
    pub lnum: u32,
    pub inos: Vec<u64>,
    pub corrupted_at: Option<u32>,
}

/// Read the orphan area unless the master says it is empty
pub fn read_orphans(vol: &dyn Volume, fs: &FsInfo, mst: &MstNode) -> Result<Vec<OrphanLeb>> {
    if mst.flags & MST_NO_ORPHS != 0 {
        return Ok(Vec::new());
    }
    let mut lebs = Vec::new();
    for lnum in fs.orph_first..=fs.orph_last {
        let sleb = scan_leb(vol, &fs.ranges, lnum, 0)?;
        let mut inos = Vec::new();
        let mut corrupted_at = sleb.corrupted_at;
        for node in &sleb.nodes {
            if node.node_type != NodeType::Orph {
                corrupted_at = Some(node.offs);
                break;
            }
            inos.extend(OrphNode::parse(&node.data)?.inos);
        }
        if !inos.is_empty() || corrupted_at.is_some() {
            lebs.push(OrphanLeb {
                lnum,
                inos,
                corrupted_at,
            });
        }
    }
    Ok(lebs)
}

/// Delete orphan inodes that really have no links left
pub fn kill_orphans(vol: &dyn Volume, fs: &FsInfo, tnc: &mut Tnc, inos: &[u64]) -> Result<usize> {
    let mut seen = HashMap::new();
    let mut killed = 0;
    for &inum in inos {
        if inum >= INUM_WATERMARK || seen.insert(inum, ()).is_some() {
            continue;
        }
        let key = Key::ino(inum as u32);
        let Some(zbr) = tnc.lookup(&key).first().copied() else {
            continue;
        };
        let nlink = match read_leaf(vol, fs, &key, &zbr) {
            Ok(buf) => InoNode::parse(&buf)?.nlink,
            Err(FsckError::Corrupted { .. }) => continue,
            Err(e) => return Err(e),
        };
        if nlink == 0 {
            tracing::debug!("deleting orphaned inode {}", inum);
            tnc.remove_ino(vol, fs, inum as u32)?;
            killed += 1;
        }
    }
    Ok(killed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::test_sb;
    use crate::volume::MemVolume;

    fn write_leb(vol: &mut MemVolume, lnum: u32, nodes: &[Vec<u8>]) -> Vec<u32> {
        let mut buf = Vec::new();
        let mut offsets = Vec::new();
        for node in nodes {
            offsets.push(buf.len() as u32);
            buf.extend_from_slice(node);
            let aligned = align(buf.len() as u32, 8) as usize;
            buf.resize(aligned, PADDING_BYTE);
        }
        vol.change(lnum, &buf).unwrap();
        offsets
    }

    fn ino(inum: u32, nlink: u32, sqnum: u64) -> Vec<u8> {
        InoNode {
            key: Key::ino(inum),
            creat_sqnum: sqnum,
            size: 0,
            atime_sec: 0,
            ctime_sec: 0,
            mtime_sec: 0,
            atime_nsec: 0,
            ctime_nsec: 0,
            mtime_nsec: 0,
            nlink,
            uid: 0,
            gid: 0,
            mode: S_IFREG | 0o644,
            flags: 0,
            data_len: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            compr_type: 0,
            data: Vec::new(),
        }
        .encode(sqnum)
    }

    #[test]
    fn test_log_and_replay() {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let mst = MstNode {
            cmt_no: 4,
            log_lnum: LOG_LNUM,
            ..Default::default()
        };
        let bud = fs.main_first + 2;
        write_leb(
            &mut vol,
            LOG_LNUM,
            &[
                CsNode { cmt_no: 4 }.encode(100),
                RefNode { lnum: bud, offs: 0, jhead: BASEHD }.encode(101),
            ],
        );
        write_leb(&mut vol, bud, &[ino(70, 1, 102), ino(71, 1, 103), ino(70, 0, 104)]);

        let buds = read_log(&vol, &fs, &mst).unwrap();
        assert_eq!(buds, vec![Bud { lnum: bud, offs: 0, jhead: BASEHD }]);

        let scans = scan_buds(&vol, &fs, &buds).unwrap();
        let mut tnc = Tnc::new();
        assert_eq!(apply_buds(&vol, &mut fs, &mut tnc, &scans).unwrap(), 3);
        assert!(tnc.lookup(&Key::ino(70)).is_empty());
        assert_eq!(tnc.lookup(&Key::ino(71)).len(), 1);
        assert_eq!(fs.max_sqnum, 104);
    }

    #[test]
    fn test_wrong_commit_number() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        write_leb(&mut vol, LOG_LNUM, &[CsNode { cmt_no: 3 }.encode(10)]);
        let mst = MstNode {
            cmt_no: 4,
            log_lnum: LOG_LNUM,
            ..Default::default()
        };
        let err = read_log(&vol, &fs, &mst).unwrap_err();
        assert_eq!(err.corruption(), Some(Corruption::Log));
    }

    #[test]
    fn test_bud_cut_at_corruption() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let bud = fs.main_first;
        write_leb(&mut vol, bud, &[ino(70, 1, 5), ino(71, 1, 6)]);
        vol.raw_mut(bud)[200] ^= 0x01;

        let scans = scan_buds(&vol, &fs, &[Bud { lnum: bud, offs: 0, jhead: BASEHD }]).unwrap();
        assert!(scans[0].sleb.is_corrupted());
        assert_eq!(scans[0].good_end(), 160);

        recover_bud(&mut vol, &fs, &scans[0]).unwrap();
        let sleb = scan_leb(&vol, &fs.ranges, bud, 0).unwrap();
        assert!(!sleb.is_corrupted());
        assert_eq!(sleb.nodes.len(), 1);
    }

    #[test]
    fn test_kill_orphans() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let lnum = fs.main_first;
        let offs = write_leb(&mut vol, lnum, &[ino(80, 0, 5), ino(81, 1, 6)]);
        let mut tnc = Tnc::new();
        tnc.insert(Key::ino(80), Zbranch { lnum, offs: offs[0], len: 160 });
        tnc.insert(Key::ino(81), Zbranch { lnum, offs: offs[1], len: 160 });

        assert_eq!(kill_orphans(&vol, &fs, &mut tnc, &[80, 81, 80]).unwrap(), 1);
        assert!(tnc.lookup(&Key::ino(80)).is_empty());
        assert_eq!(tnc.lookup(&Key::ino(81)).len(), 1);
    }
}
