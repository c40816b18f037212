/// Disconnected file relocation
///
/// Regular files whose names were lost are given a new name in `lost+found`
/// under the root directory, which is created when missing. New nodes are
/// written to free LEBs and indexed; the commit that follows makes them
/// durable.

use std::collections::HashSet;

use crate::check::file::{FileTree, Repair, ScannedFile};
use crate::check::parse::{DentRecord, InoRecord, NodePos};
use crate::check::problem::{Policy, Problem};
use crate::check::reconcile;
use crate::error::{FsckError, Result};
use crate::fs::commit::NodeWriter;
use crate::fs::tnc::{read_leaf, Tnc, Zbranch};
use crate::fs::{FsInfo, UsedLebs};
use crate::media::node::{DentNode, InoNode};
use crate::media::*;
use crate::volume::Volume;

pub const LOST_AND_FOUND: &[u8] = b"lost+found";

/// Result of a relocation run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Relocated {
    pub recovered: usize,
    pub dropped: usize,
}

/// Writes and indexes new nodes
struct Writer<'a> {
    vol: &'a mut dyn Volume,
    fs: &'a mut FsInfo,
    tnc: &'a mut Tnc,
    used: UsedLebs,
    nodes: NodeWriter,
}

impl Writer<'_> {
    fn add(&mut self, node: &[u8], sqnum: u64) -> Result<NodePos> {
        let (lnum, offs) = self.nodes.add(&mut *self.vol, &*self.fs, &mut self.used, node)?;
        Ok(NodePos {
            lnum,
            offs,
            len: node.len() as u32,
            sqnum,
        })
    }

    fn write_dent(&mut self, parent: u64, name: &[u8], inum: u64, itype: u8) -> Result<DentRecord> {
        let key = Key::dent(parent as u32, self.fs.name_hash(name));
        let sqnum = self.fs.next_sqnum();
        let node = DentNode {
            key,
            inum,
            itype,
            nlen: name.len() as u16,
            cookie: 0,
            name: name.to_vec(),
            name_terminated: true,
        }
        .encode(NodeType::Dent, sqnum);
        let pos = self.add(&node, sqnum)?;
        let zbr = Zbranch {
            lnum: pos.lnum,
            offs: pos.offs,
            len: pos.len,
        };
        self.tnc.insert_dent(&*self.vol, &*self.fs, key, zbr, name)?;
        Ok(DentRecord {
            pos,
            key,
            is_xent: false,
            itype,
            name: name.to_vec(),
            inum,
        })
    }

    fn write_ino(&mut self, ino: &InoNode) -> Result<NodePos> {
        let sqnum = self.fs.next_sqnum();
        let node = ino.encode(sqnum);
        let pos = self.add(&node, sqnum)?;
        self.tnc.insert(
            ino.key,
            Zbranch {
                lnum: pos.lnum,
                offs: pos.offs,
                len: pos.len,
            },
        );
        Ok(pos)
    }

    /// Read back the current inode node of `inum` from the index
    fn read_ino(&self, inum: u64) -> Result<InoNode> {
        let key = Key::ino(inum as u32);
        let zbr = self
            .tnc
            .lookup(&key)
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("inode {} is not indexed", inum))?;
        let buf = read_leaf(&*self.vol, &*self.fs, &key, &zbr)?;
        Ok(InoNode::parse(&buf)?)
    }
}

fn ino_record(pos: NodePos, ino: &InoNode) -> InoRecord {
    InoRecord {
        pos,
        key: ino.key,
        is_xattr: ino.flags & XATTR_FL != 0,
        is_encrypted: ino.flags & CRYPT_FL != 0,
        mode: ino.mode,
        nlink: ino.nlink,
        xcnt: ino.xattr_cnt,
        xsz: ino.xattr_size,
        xnms: ino.xattr_names,
        size: ino.size,
    }
}

/// Inode number of the usable `lost+found`, `Err` if there is one that
/// cannot take files
fn find_lost_found(tree: &FileTree) -> std::result::Result<Option<u64>, &'static str> {
    let Some(root) = tree.get(ROOT_INO) else {
        return Err("no root directory");
    };
    if root.is_encrypted() {
        return Err("root directory is encrypted");
    }
    let found = tree
        .iter()
        .find(|f| f.dents.iter().any(|d| d.parent() == ROOT_INO && d.name == LOST_AND_FOUND));
    match found {
        None => Ok(None),
        Some(f) if !f.is_dir() => Err("lost+found is not a directory"),
        Some(f) if f.is_encrypted() => Err("lost+found is encrypted"),
        Some(f) => Ok(Some(f.inum)),
    }
}

fn drop_file(policy: &mut Policy, tnc: &mut Tnc, file: &ScannedFile, why: &str) -> Result<()> {
    let detail = format!("{}, {}", file.describe(), why);
    let mut repair = Repair::new(policy, Some(tnc));
    if repair.problem(Problem::DisconnectedFileCannotBeRecovered, &detail)? {
        repair.delete_file(file);
    }
    Ok(())
}

/// Name a new `lost+found` in the root and account for it there
///
/// The inode itself is written once all files were moved in.
fn create_lost_found(w: &mut Writer<'_>, tree: &mut FileTree, now: u64) -> Result<InoNode> {
    let inum = w.fs.highest_inum.max(FIRST_INO - 1) + 1;
    w.fs.highest_inum = inum;

    let dent = w.write_dent(ROOT_INO, LOST_AND_FOUND, inum, ITYPE_DIR)?;
    let mut root = w.read_ino(ROOT_INO)?;
    root.nlink += 1;
    root.size += calc_dent_size(LOST_AND_FOUND.len() as u32);
    root.mtime_sec = now;
    root.ctime_sec = now;
    let root_pos = w.write_ino(&root)?;
    if let Some(file) = tree.get_mut(ROOT_INO) {
        file.ino = Some(ino_record(root_pos, &root));
    }

    let mut file = ScannedFile::new(inum);
    file.dents.push(dent);
    tree.put(file);
    tracing::info!("Created lost+found, inode {}", inum);
    Ok(InoNode::new(inum as u32, S_IFDIR | 0o744, 2, INO_NODE_SZ as u64, now))
}

/// Give every disconnected file a name in `lost+found`
pub fn relocate(
    vol: &mut dyn Volume,
    fs: &mut FsInfo,
    tnc: &mut Tnc,
    policy: &mut Policy,
    tree: &mut FileTree,
    disconnected: Vec<ScannedFile>,
) -> Result<Relocated> {
    let mut out = Relocated::default();
    if disconnected.is_empty() {
        return Ok(out);
    }

    let existing = match find_lost_found(tree) {
        Ok(found) => found,
        Err(why) => {
            tracing::warn!("cannot use lost+found: {}", why);
            for file in &disconnected {
                drop_file(policy, tnc, file, why)?;
                out.dropped += 1;
            }
            return Ok(out);
        }
    };

    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let mut used = UsedLebs::from_volume(fs, &*vol)?;
    for lnum in tnc.used_lebs() {
        used.mark(lnum);
    }
    let mut w = Writer {
        vol,
        fs,
        tnc,
        used,
        nodes: NodeWriter::new(),
    };

    let (mut lf, created) = match existing {
        Some(inum) => (w.read_ino(inum)?, false),
        None => match create_lost_found(&mut w, tree, now) {
            Ok(ino) => (ino, true),
            Err(FsckError::NoSpace) => {
                for file in &disconnected {
                    drop_file(policy, &mut *w.tnc, file, "no space for lost+found")?;
                    out.dropped += 1;
                }
                return Ok(out);
            }
            Err(err) => return Err(err),
        },
    };

    let lf_inum = lf.key.inum as u64;
    let mut names: HashSet<Vec<u8>> = tree
        .iter()
        .flat_map(|f| f.dents.iter())
        .filter(|d| d.parent() == lf_inum)
        .map(|d| d.name.clone())
        .collect();
    let mut grown = 0u64;

    for mut file in disconnected {
        let name = (0u32..)
            .map(|n| format!("INO_{}_{}", file.inum, n).into_bytes())
            .find(|name| !names.contains(name))
            .unwrap_or_default();
        let itype = dent_type(file.mode()).unwrap_or(ITYPE_REG);
        let dent = match w.write_dent(lf_inum, &name, file.inum, itype) {
            Ok(dent) => dent,
            Err(FsckError::NoSpace) => {
                drop_file(policy, &mut *w.tnc, &file, "no space left")?;
                out.dropped += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        tracing::info!("Moved inode {} to lost+found/{}", file.inum, dent.name_lossy());
        grown += calc_dent_size(name.len() as u32);
        names.insert(name);
        file.dents.push(dent);

        let mut repair = Repair::new(policy, Some(&mut *w.tnc));
        reconcile::calculate_file(&mut repair, &mut file);
        file.calc.nlink = 1;
        reconcile::correct_file(&mut repair, Some(&mut *w.vol), &mut file)?;
        tree.put(file);
        out.recovered += 1;
    }

    if created || grown > 0 {
        lf.size += grown;
        lf.mtime_sec = now;
        lf.ctime_sec = now;
        let pos = w.write_ino(&lf)?;
        if let Some(file) = tree.get_mut(lf_inum) {
            file.ino = Some(ino_record(pos, &lf));
        }
    }
    w.nodes.flush(&mut *w.vol, &*w.fs)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::file::tests::{dent_rec, ino_rec};
    use crate::check::problem::Mode;
    use crate::fs::tests::test_sb;
    use crate::volume::MemVolume;

    /// Root inode on flash and in the tree, plus one disconnected file
    fn setup(with_lf: bool) -> (FsInfo, MemVolume, Tnc, FileTree, ScannedFile) {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let mut tnc = Tnc::new();
        let mut tree = FileTree::new();

        let lnum = fs.main_first;
        let mut offs = 0;
        let mut put = |vol: &mut MemVolume, tnc: &mut Tnc, ino: InoNode, sqnum: u64| {
            let buf = ino.encode(sqnum);
            vol.write(lnum, offs, &buf).unwrap();
            let zbr = Zbranch { lnum, offs, len: buf.len() as u32 };
            tnc.insert(ino.key, zbr);
            offs += align(buf.len() as u32, 8);
            zbr
        };
        put(&mut vol, &mut tnc, InoNode::new(1, S_IFDIR | 0o755, 2, 160, 0), 1);
        tree.insert(ino_rec(1, S_IFDIR | 0o755, 2, 160, 1));
        put(&mut vol, &mut tnc, InoNode::new(70, S_IFREG | 0o644, 3, 0, 0), 2);
        if with_lf {
            put(&mut vol, &mut tnc, InoNode::new(80, S_IFREG | 0o644, 1, 0, 0), 3);
            tree.insert(ino_rec(80, S_IFREG | 0o644, 1, 0, 3));
            tree.insert(dent_rec(1, "lost+found", 80, ITYPE_REG, 4));
        }
        fs.highest_inum = 80;
        fs.max_sqnum = 10;

        let mut file_tree = FileTree::new();
        file_tree.insert(ino_rec(70, S_IFREG | 0o644, 3, 0, 2));
        let mut file = file_tree.take(70).unwrap();
        if let Some(ino) = file.ino.as_mut() {
            ino.pos.lnum = lnum;
            ino.pos.offs = align(INO_NODE_SZ, 8);
        }
        (fs, vol, tnc, tree, file)
    }

    #[test]
    fn test_creates_lost_found() {
        let (mut fs, mut vol, mut tnc, mut tree, file) = setup(false);
        let mut policy = Policy::new(Mode::Danger0);
        let out = relocate(&mut vol, &mut fs, &mut tnc, &mut policy, &mut tree, vec![file]).unwrap();
        assert_eq!(out, Relocated { recovered: 1, dropped: 0 });

        let lf = tree
            .iter()
            .find(|f| f.dents.iter().any(|d| d.name == LOST_AND_FOUND))
            .unwrap();
        assert_eq!(lf.inum, 81);
        assert_eq!(lf.ino.as_ref().unwrap().size, 160 + calc_dent_size(8));

        let moved = tree.get(70).unwrap();
        assert_eq!(moved.dents[0].name, b"INO_70_0");
        assert_eq!(moved.dents[0].parent(), 81);
        assert_eq!(moved.ino.as_ref().unwrap().nlink, 1);

        let root = tree.get(1).unwrap().ino.as_ref().unwrap();
        assert_eq!(root.nlink, 3);
        assert_eq!(root.size, 160 + calc_dent_size(10));
        assert!(tnc.lookup(&Key::dent(81, fs.name_hash(b"INO_70_0"))).len() == 1);

        // the root inode in the index is the rewritten one
        let zbr = tnc.lookup(&Key::ino(1))[0];
        let buf = read_leaf(&vol, &fs, &Key::ino(1), &zbr).unwrap();
        assert_eq!(InoNode::parse(&buf).unwrap().nlink, 3);
    }

    #[test]
    fn test_unusable_lost_found_drops_files() {
        let (mut fs, mut vol, mut tnc, mut tree, file) = setup(true);
        let mut policy = Policy::new(Mode::Danger0);
        let out = relocate(&mut vol, &mut fs, &mut tnc, &mut policy, &mut tree, vec![file]).unwrap();
        assert_eq!(out, Relocated { recovered: 0, dropped: 1 });
        assert!(tnc.lookup(&Key::ino(70)).is_empty());
        assert_eq!(policy.detected()[&Problem::DisconnectedFileCannotBeRecovered], 1);
    }
}
