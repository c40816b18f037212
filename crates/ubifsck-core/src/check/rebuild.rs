/// Filesystem rebuild
///
/// Used when the index, the master node or the log cannot be trusted. The
/// main area is scanned node by node, deletion inodes and deletion entries
/// cancel the older records they supersede, and the survivors go through
/// the same validation and reconciliation as a normal check. The LEBs still
/// holding live nodes are rewritten without their corrupted tails, a fresh
/// index is built over the survivors, and the commit writes the LPT, log,
/// orphan area and master node from scratch.

use std::collections::BTreeMap;

use crate::check::file::{FileTree, Repair, ScannedFile};
use crate::check::parse::{invalid_problem, parse_leaf, parse_trun, DentRecord, InoRecord, LeafRecord, NodePos};
use crate::check::problem::{Policy, Problem};
use crate::check::{reconcile, validate};
use crate::error::Result;
use crate::fs::commit::{commit, Committed, NodeWriter};
use crate::fs::tnc::{Tnc, Zbranch};
use crate::fs::{FsInfo, UsedLebs};
use crate::media::*;
use crate::volume::{scan_leb, Volume};

/// Counters reported after a rebuild
#[derive(Debug, Clone, Default)]
pub struct Rebuilt {
    pub scanned_nodes: usize,
    pub files: usize,
    pub dropped_files: usize,
    pub created_root: bool,
    pub committed: Option<Committed>,
}

/// Records found by the raw scan, before deletions are applied
#[derive(Debug, Default)]
struct Scanned {
    valid_inos: BTreeMap<u64, InoRecord>,
    del_inos: BTreeMap<u64, InoRecord>,
    valid_dents: BTreeMap<(Key, Vec<u8>), DentRecord>,
    del_dents: BTreeMap<(Key, Vec<u8>), DentRecord>,
    others: Vec<LeafRecord>,
    /// End of the last intact node per LEB
    ends: BTreeMap<u32, u32>,
    nodes: usize,
}

/// Anything carrying a node position
trait HasPos {
    fn pos(&self) -> NodePos;
}

impl HasPos for InoRecord {
    fn pos(&self) -> NodePos {
        self.pos
    }
}

impl HasPos for DentRecord {
    fn pos(&self) -> NodePos {
        self.pos
    }
}

/// Insert `rec` unless a newer record with the same key is already there
fn insert_newer<K: Ord, R: HasPos>(map: &mut BTreeMap<K, R>, key: K, rec: R) {
    match map.get(&key) {
        Some(old) if old.pos().sqnum >= rec.pos().sqnum => {}
        _ => {
            map.insert(key, rec);
        }
    }
}

impl Scanned {
    fn add(&mut self, rec: LeafRecord) {
        match rec {
            LeafRecord::Ino(ino) => {
                let map = if ino.nlink == 0 { &mut self.del_inos } else { &mut self.valid_inos };
                insert_newer(map, ino.inum(), ino);
            }
            LeafRecord::Dent(dent) => {
                let map = if dent.inum == 0 { &mut self.del_dents } else { &mut self.valid_dents };
                insert_newer(map, (dent.key, dent.name.clone()), dent);
            }
            other => self.others.push(other),
        }
    }

    /// Drop every valid record a newer deletion record supersedes
    ///
    /// Returns where those deletion records are. They have to stay on flash
    /// for as long as the records they cancel do.
    fn remove_deleted(&mut self) -> Vec<NodePos> {
        let mut kept = Vec::new();
        for (inum, del) in std::mem::take(&mut self.del_inos) {
            if self.valid_inos.get(&inum).is_some_and(|v| del.pos.sqnum > v.pos.sqnum) {
                self.valid_inos.remove(&inum);
                kept.push(del.pos);
            }
        }
        for (key, del) in std::mem::take(&mut self.del_dents) {
            if self.valid_dents.get(&key).is_some_and(|v| del.pos.sqnum > v.pos.sqnum) {
                self.valid_dents.remove(&key);
                kept.push(del.pos);
            }
        }
        kept
    }

    fn into_tree(self) -> FileTree {
        let mut tree = FileTree::new();
        for rec in self.others {
            tree.insert(rec);
        }
        for (_, ino) in self.valid_inos {
            tree.insert(LeafRecord::Ino(ino));
        }
        for (_, dent) in self.valid_dents {
            tree.insert(LeafRecord::Dent(dent));
        }
        tree
    }
}

/// Scan every mapped main area LEB and collect the leaf records
fn scan_nodes(vol: &dyn Volume, fs: &mut FsInfo, policy: &mut Policy) -> Result<Scanned> {
    let mut si = Scanned::default();
    for lnum in fs.main_first..fs.leb_cnt {
        if !vol.is_mapped(lnum)? {
            continue;
        }
        let sleb = scan_leb(vol, &fs.ranges, lnum, 0)?;
        if let Some(at) = sleb.corrupted_at {
            tracing::debug!("LEB {} is corrupted at {}, keeping the nodes before", lnum, at);
        }
        for node in &sleb.nodes {
            fs.saw_sqnum(node.sqnum);
        }
        if sleb.is_index() {
            continue;
        }
        let mut end = 0;
        for node in &sleb.nodes {
            let parsed = match (node.node_type, node.key) {
                (NodeType::Trun, _) => parse_trun(&node.data, lnum, node.offs).map(LeafRecord::Trun),
                (NodeType::Ino | NodeType::Dent | NodeType::Xent | NodeType::Data, Some(key)) => {
                    match parse_leaf(fs, &node.data, &key, lnum, node.offs) {
                        Ok(rec) => Ok(rec),
                        Err(why) => {
                            let detail = format!("key {} at LEB {}:{}, {}", key, lnum, node.offs, why);
                            policy.fix_problem(invalid_problem(&key), Some(&detail))?;
                            continue;
                        }
                    }
                }
                _ => continue,
            };
            match parsed {
                Ok(rec) => {
                    si.nodes += 1;
                    end = end.max(align(node.offs + node.len, 8));
                    if let LeafRecord::Ino(ino) = &rec {
                        fs.highest_inum = fs.highest_inum.max(ino.inum());
                    }
                    si.add(rec);
                }
                Err(why) => {
                    let detail = format!("truncation node at LEB {}:{}, {}", lnum, node.offs, why);
                    policy.fix_problem(Problem::InvalidDataNode, Some(&detail))?;
                }
            }
        }
        if end > 0 {
            si.ends.insert(lnum, end);
        }
    }
    Ok(si)
}

/// Write a fresh, empty root directory
fn create_root(vol: &mut dyn Volume, fs: &mut FsInfo, used: &mut UsedLebs, tree: &mut FileTree) -> Result<()> {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let ino = InoNode::new(ROOT_INO as u32, S_IFDIR | 0o755, 2, INO_NODE_SZ as u64, now);
    fs.highest_inum = fs.highest_inum.max(FIRST_INO);
    let sqnum = fs.next_sqnum();
    let node = ino.encode(sqnum);

    let mut writer = NodeWriter::new();
    let (lnum, offs) = writer.add(vol, fs, used, &node)?;
    writer.flush(vol, fs)?;

    let mut root = ScannedFile::new(ROOT_INO);
    root.ino = Some(InoRecord {
        pos: NodePos {
            lnum,
            offs,
            len: node.len() as u32,
            sqnum,
        },
        key: ino.key,
        is_xattr: false,
        is_encrypted: false,
        mode: ino.mode,
        nlink: ino.nlink,
        xcnt: 0,
        xsz: 0,
        xnms: 0,
        size: ino.size,
    });
    tree.put(root);
    Ok(())
}

/// Rewrite `lnum` up to `end`, padding the rest of the last min. I/O unit
fn rewrite_leb(vol: &mut dyn Volume, fs: &FsInfo, lnum: u32, end: u32) -> Result<()> {
    let len = align(end, fs.min_io_size).min(fs.leb_size) as usize;
    let mut buf = vec![0u8; len];
    vol.read(lnum, 0, &mut buf)?;
    pad_space(&mut buf[end as usize..]);
    vol.change(lnum, &buf)
}

/// Index every node of `file`, nested xattr files included
fn index_file(vol: &dyn Volume, fs: &FsInfo, tnc: &mut Tnc, file: &ScannedFile) -> Result<()> {
    for (key, pos) in file.node_positions() {
        let zbr = Zbranch {
            lnum: pos.lnum,
            offs: pos.offs,
            len: pos.len,
        };
        match key.key_type() {
            Some(KeyType::Dent | KeyType::Xent) => {
                let name = file
                    .dents
                    .iter()
                    .chain(file.xattrs.values().flat_map(|x| x.dents.iter()))
                    .find(|d| d.pos == pos)
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                tnc.insert_dent(vol, fs, key, zbr, &name)?;
            }
            _ => tnc.insert(key, zbr),
        }
    }
    Ok(())
}

/// Rebuild the whole filesystem from a scan of the main area
pub fn rebuild_filesystem(vol: &mut dyn Volume, fs: &mut FsInfo, policy: &mut Policy) -> Result<Rebuilt> {
    tracing::info!("Start rebuilding filesystem");
    policy.escalate();
    let mut out = Rebuilt::default();

    tracing::info!("Scan nodes");
    let mut si = scan_nodes(vol, fs, policy)?;
    out.scanned_nodes = si.nodes;

    tracing::info!("Remove deleted nodes");
    let deletions = si.remove_deleted();
    tracing::debug!("{} records removed by deletion nodes", deletions.len());

    tracing::info!("Add valid nodes into file");
    let ends = std::mem::take(&mut si.ends);
    let mut tree = si.into_tree();

    tracing::info!("Filter invalid files");
    let mut validated = {
        let mut repair = Repair::new(policy, None);
        validate::filter_invalid_files(&mut repair, &mut tree)?
    };

    tracing::info!("Extract reachable files");
    {
        let mut repair = Repair::new(policy, None);
        validate::extract_dentry_tree(&mut repair, &mut tree, &mut validated)?;
    }
    // There is no lost+found to move nameless files into during a rebuild
    out.dropped_files = validated.removed + validated.disconnected.len();

    tracing::info!("Check and correct file information");
    {
        let mut repair = Repair::new(policy, None);
        reconcile::check_and_correct_files(&mut repair, Some(&mut *vol), &mut tree)?;
    }

    let mut used = UsedLebs::from_volume(fs, &*vol)?;
    for pos in &deletions {
        used.mark(pos.lnum);
    }
    for file in tree.iter() {
        for (_, pos) in file.node_positions() {
            used.mark(pos.lnum);
        }
        if let Some(trun) = &file.trun {
            used.mark(trun.pos.lnum);
        }
    }

    tracing::info!("Re-write data");
    for (&lnum, &end) in &ends {
        if used.is_used(lnum) {
            rewrite_leb(vol, fs, lnum, end)?;
        }
    }

    if tree.is_empty() {
        tracing::info!("No files found, create empty filesystem");
        create_root(vol, fs, &mut used, &mut tree)?;
        out.created_root = true;
    }
    out.files = tree.len();

    tracing::info!("Build TNC");
    let mut tnc = Tnc::new();
    for file in tree.iter() {
        index_file(vol, fs, &mut tnc, file)?;
    }

    tracing::info!("Build LPT and write master");
    let committed = commit(vol, fs, &mut tnc, &MstNode::default())?;
    out.committed = Some(committed);
    tracing::info!("Rebuilt filesystem with {} files", out.files);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::problem::Mode;
    use crate::fs::tests::test_sb;
    use crate::volume::MemVolume;

    fn dent(parent: u32, name: &[u8], inum: u64, fs: &FsInfo) -> DentNode {
        DentNode {
            key: Key::dent(parent, fs.name_hash(name)),
            inum,
            itype: ITYPE_REG,
            nlen: name.len() as u16,
            cookie: 0,
            name: name.to_vec(),
            name_terminated: true,
        }
    }

    fn write_nodes(vol: &mut MemVolume, lnum: u32, nodes: &[Vec<u8>]) {
        let mut buf = Vec::new();
        for node in nodes {
            buf.extend_from_slice(node);
            buf.resize(align(buf.len() as u32, 8) as usize, PADDING_BYTE);
        }
        vol.write(lnum, 0, &buf).unwrap();
    }

    #[test]
    fn test_empty_volume_gets_root() {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let mut policy = Policy::new(Mode::Danger1);
        let out = rebuild_filesystem(&mut vol, &mut fs, &mut policy).unwrap();
        assert!(out.created_root);
        assert_eq!(out.files, 1);
        assert_eq!(policy.mode(), Mode::Rebuild);
        let committed = out.committed.unwrap();
        assert_ne!(committed.master.root_len, 0);
    }

    #[test]
    fn test_deleted_inode_is_not_carried_forward() {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let lnum = fs.main_first;
        let mut nodes = Vec::new();
        nodes.extend(InoNode::new(1, S_IFDIR | 0o755, 2, 160 + calc_dent_size(1), 0).encode(1));
        nodes.resize(align(nodes.len() as u32, 8) as usize, 0);
        nodes.extend(InoNode::new(65, S_IFREG | 0o644, 1, 0, 0).encode(2));
        nodes.resize(align(nodes.len() as u32, 8) as usize, 0);
        nodes.extend(dent(1, b"a", 65, &fs).encode(NodeType::Dent, 3));
        nodes.resize(align(nodes.len() as u32, 8) as usize, 0);
        // unlinked later: a deletion inode and a deletion entry
        nodes.extend(InoNode::new(65, S_IFREG | 0o644, 0, 0, 0).encode(4));
        nodes.resize(align(nodes.len() as u32, 8) as usize, 0);
        nodes.extend(dent(1, b"a", 0, &fs).encode(NodeType::Dent, 5));
        nodes.resize(align(nodes.len() as u32, 8) as usize, 0);
        vol.write(lnum, 0, &nodes).unwrap();

        let mut policy = Policy::new(Mode::Rebuild);
        let out = rebuild_filesystem(&mut vol, &mut fs, &mut policy).unwrap();
        assert_eq!(out.files, 1);
        assert!(!out.created_root);

        let committed = out.committed.unwrap();
        let tnc = Tnc::load(&vol, &fs, &committed.master).unwrap();
        assert_eq!(tnc.leaf_count(), 1);
        assert!(tnc.lookup(&Key::ino(65)).is_empty());
        assert_eq!(policy.detected().get(&Problem::FileIsInconsistent), Some(&1));
    }

    #[test]
    fn test_deletions_in_their_own_leb_outlive_the_rebuild() {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let live = fs.main_first;
        let dead = fs.main_first + 1;
        write_nodes(
            &mut vol,
            live,
            &[
                InoNode::new(1, S_IFDIR | 0o755, 2, 160 + calc_dent_size(1), 0).encode(1),
                InoNode::new(65, S_IFREG | 0o644, 1, 0, 0).encode(2),
                dent(1, b"a", 65, &fs).encode(NodeType::Dent, 3),
            ],
        );
        write_nodes(
            &mut vol,
            dead,
            &[
                InoNode::new(65, S_IFREG | 0o644, 0, 0, 0).encode(4),
                dent(1, b"a", 0, &fs).encode(NodeType::Dent, 5),
            ],
        );

        let mut policy = Policy::new(Mode::Rebuild);
        let out = rebuild_filesystem(&mut vol, &mut fs, &mut policy).unwrap();
        assert_eq!(out.files, 1);
        assert!(vol.is_mapped(dead).unwrap());
        let master = out.committed.unwrap().master;
        assert_ne!(master.root_lnum, dead);
        assert_ne!(master.gc_lnum, dead);

        // a second rebuild still sees the deletions
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut policy = Policy::new(Mode::Rebuild);
        let out = rebuild_filesystem(&mut vol, &mut fs, &mut policy).unwrap();
        assert_eq!(out.files, 1);
        assert_eq!(policy.problem_count(), 0, "{:?}", policy.detected());

        let tnc = Tnc::load(&vol, &fs, &out.committed.unwrap().master).unwrap();
        assert_eq!(tnc.leaf_count(), 1);
        assert!(tnc.lookup(&Key::ino(65)).is_empty());
    }
}
