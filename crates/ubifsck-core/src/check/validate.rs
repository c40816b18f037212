/// File validation and reachability
///
/// Extended attribute files are checked first and moved into their hosts, so
/// that the second pass over the remaining files knows which encrypted files
/// carry an encryption context. Files that fail are taken out of the graph;
/// their nodes leave the index only when the fix is accepted. Regular files
/// that merely lost their names are set aside as disconnected instead.

use std::collections::HashSet;

use crate::check::file::{FileTree, Repair, ScannedFile};
use crate::check::problem::Problem;
use crate::error::Result;
use crate::media::*;

/// Longest directory chain followed towards the root
pub const MAX_PATH_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Valid,
    /// Out of the graph; `delete` when its nodes are to leave the index
    Invalid { delete: bool },
    Disconnected,
}

/// Outcome of validating the whole graph
#[derive(Debug, Default)]
pub struct Validated {
    /// Regular files without a usable name, to be relocated
    pub disconnected: Vec<ScannedFile>,
    pub removed: usize,
}

fn reject(repair: &mut Repair<'_>, problem: Problem, file: &ScannedFile) -> Result<Verdict> {
    let delete = repair.problem(problem, &file.describe())?;
    Ok(Verdict::Invalid { delete })
}

fn disconnect(repair: &mut Repair<'_>, file: &ScannedFile) -> Result<Verdict> {
    if repair.problem(Problem::FileIsDisconnected, &file.describe())? {
        Ok(Verdict::Disconnected)
    } else {
        Ok(Verdict::Invalid { delete: false })
    }
}

/// Checks that look at the nodes of `file` alone
///
/// Entries of the wrong type, surplus names of directories and xattrs, and
/// data of files that cannot have any are dropped here.
fn check_own_nodes(repair: &mut Repair<'_>, file: &mut ScannedFile) -> Result<Option<Verdict>> {
    let Some(ino) = file.ino.clone() else {
        return reject(repair, Problem::FileHasNoInode, file).map(Some);
    };
    if ino.nlink == 0 {
        return reject(repair, Problem::FileHas0NlinkInode, file).map(Some);
    }
    let itype = dent_type(ino.mode);

    let (keep, bad): (Vec<_>, Vec<_>) = std::mem::take(&mut file.dents)
        .into_iter()
        .partition(|d| d.is_xent == ino.is_xattr && Some(d.itype) == itype);
    file.dents = keep;
    for dent in bad {
        let detail = format!("{}, entry '{}' of type {}", file.describe(), dent.name_lossy(), type_name(dent.itype));
        if repair.problem(Problem::FileHasInconsistType, &detail)? {
            repair.delete_node(&dent.key, &dent.pos);
        }
    }

    if itype == Some(ITYPE_DIR) || ino.is_xattr {
        // Only the newest name survives
        while file.dents.len() > 1 {
            let dent = file.dents.remove(0);
            let detail = format!("{}, entry '{}'", file.describe(), dent.name_lossy());
            if repair.problem(Problem::FileHasTooManyDent, &detail)? {
                repair.delete_node(&dent.key, &dent.pos);
            }
        }
    }

    if itype != Some(ITYPE_REG) || ino.is_xattr {
        file.trun = None;
        let data = std::mem::take(&mut file.data);
        for rec in data.values() {
            let detail = format!("{}, data block {}", file.describe(), rec.key.block());
            if repair.problem(Problem::FileShouldntHaveData, &detail)? {
                repair.delete_node(&rec.key, &rec.pos);
            }
        }
    }
    Ok(None)
}

/// Validate an extended attribute file and attach it to its host
fn validate_xattr(repair: &mut Repair<'_>, tree: &mut FileTree, mut file: ScannedFile) -> Result<bool> {
    let verdict = match check_own_nodes(repair, &mut file)? {
        Some(verdict) => verdict,
        None => {
            let host = file.parent().and_then(|p| tree.get_mut(p));
            match host {
                _ if file.dents.is_empty() => reject(repair, Problem::FileHasNoDent, &file)?,
                None => reject(repair, Problem::XattrHasNoHost, &file)?,
                Some(host) if host.is_xattr() => reject(repair, Problem::XattrHasWrongHost, &file)?,
                Some(host) => {
                    let name = &file.dents[0].name;
                    let prefix = name.len().min(XATTR_NAME_ENCRYPTION_CONTEXT.len());
                    if host.is_encrypted() && name[..prefix] == XATTR_NAME_ENCRYPTION_CONTEXT[..prefix] {
                        host.has_encrypted_info = true;
                    }
                    host.xattrs.insert(file.inum, file);
                    return Ok(true);
                }
            }
        }
    };
    if verdict == (Verdict::Invalid { delete: true }) {
        repair.delete_file(&file);
    }
    Ok(false)
}

/// Validate a non-xattr file that stays in the tree while being checked
fn validate_file(repair: &mut Repair<'_>, tree: &mut FileTree, inum: u64) -> Result<Verdict> {
    let parent = {
        let Some(file) = tree.get_mut(inum) else {
            return Ok(Verdict::Invalid { delete: false });
        };
        if let Some(verdict) = check_own_nodes(repair, file)? {
            return Ok(verdict);
        }
        if !file.dents.is_empty() {
            if inum == ROOT_INO {
                return reject(repair, Problem::FileRootHasDent, file);
            }
        } else if inum != ROOT_INO {
            if file.is_reg() {
                return disconnect(repair, file);
            }
            return reject(repair, Problem::FileHasNoDent, file);
        }
        file.parent()
    };

    let parent_is_dir = parent.and_then(|p| tree.get(p)).map(ScannedFile::is_dir);
    let Some(file) = tree.get_mut(inum) else {
        return Ok(Verdict::Invalid { delete: false });
    };
    if parent_is_dir == Some(false) {
        if !file.is_reg() {
            return reject(repair, Problem::FileHasNoDent, file);
        }
        let verdict = disconnect(repair, file)?;
        if verdict == Verdict::Disconnected {
            for dent in std::mem::take(&mut file.dents) {
                repair.delete_node(&dent.key, &dent.pos);
            }
        }
        return Ok(verdict);
    }

    if file.is_encrypted() && !file.has_encrypted_info {
        return reject(repair, Problem::FileHasNoEncrypt, file);
    }
    Ok(Verdict::Valid)
}

/// Run both validation passes over `tree`
pub fn filter_invalid_files(repair: &mut Repair<'_>, tree: &mut FileTree) -> Result<Validated> {
    let mut out = Validated::default();

    let xattrs: Vec<u64> = tree.iter().filter(|f| f.is_xattr()).map(|f| f.inum).collect();
    for inum in xattrs {
        if let Some(file) = tree.take(inum) {
            if !validate_xattr(repair, tree, file)? {
                out.removed += 1;
            }
        }
    }

    let mut invalid = Vec::new();
    for inum in tree.inums() {
        match validate_file(repair, tree, inum)? {
            Verdict::Valid => {}
            verdict => invalid.push((inum, verdict)),
        }
    }
    for (inum, verdict) in invalid {
        let Some(file) = tree.take(inum) else { continue };
        match verdict {
            Verdict::Disconnected => out.disconnected.push(file),
            Verdict::Invalid { delete: true } => {
                repair.delete_file(&file);
                out.removed += 1;
            }
            _ => out.removed += 1,
        }
    }
    tracing::debug!(
        "Validated files: {} left, {} removed, {} disconnected",
        tree.len(),
        out.removed,
        out.disconnected.len()
    );
    Ok(out)
}

/// A directory entry on an ascent path: owner file and node position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DentRef {
    owner: u64,
    lnum: u32,
    offs: u32,
}

/// Outcome of an upward walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ascent {
    Root,
    /// Cycle or missing link: every entry walked is unreachable
    Broken,
    /// Gave up after `MAX_PATH_DEPTH` entries; only the start is dropped
    TooDeep,
}

/// Follow first names upwards from `start` until the root is reached
///
/// Entries already proven reachable are remembered in `found`. `path`
/// ends up holding the entries walked.
fn dentry_is_reachable(tree: &FileTree, start: DentRef, found: &mut HashSet<DentRef>, path: &mut Vec<DentRef>) -> Ascent {
    let mut cur = start;
    loop {
        if path.contains(&cur) {
            return Ascent::Broken;
        }
        if found.contains(&cur) {
            return Ascent::Root;
        }
        if path.len() >= MAX_PATH_DEPTH {
            return Ascent::TooDeep;
        }
        path.push(cur);

        let Some(owner) = tree.get(cur.owner) else {
            return Ascent::Broken;
        };
        let Some(dent) = owner.dents.iter().find(|d| d.pos.lnum == cur.lnum && d.pos.offs == cur.offs) else {
            return Ascent::Broken;
        };
        let Some(parent) = tree.get(dent.parent()) else {
            return Ascent::Broken;
        };
        if parent.inum == ROOT_INO {
            return Ascent::Root;
        }
        let Some(up) = parent.dents.first() else {
            return Ascent::Broken;
        };
        cur = DentRef {
            owner: parent.inum,
            lnum: up.pos.lnum,
            offs: up.pos.offs,
        };
    }
}

fn file_is_reachable(repair: &mut Repair<'_>, tree: &mut FileTree, found: &mut HashSet<DentRef>, inum: u64) -> Result<bool> {
    if inum == ROOT_INO {
        return Ok(true);
    }
    'retry: loop {
        let Some(file) = tree.get(inum) else {
            return Ok(false);
        };
        let dents: Vec<DentRef> = file
            .dents
            .iter()
            .map(|d| DentRef {
                owner: inum,
                lnum: d.pos.lnum,
                offs: d.pos.offs,
            })
            .collect();
        for start in dents {
            let mut path = Vec::new();
            match dentry_is_reachable(tree, start, found, &mut path) {
                Ascent::Root => {
                    found.extend(path);
                    continue;
                }
                Ascent::Broken => {}
                Ascent::TooDeep => path.truncate(1),
            }
            for r in path {
                let Some(owner) = tree.get_mut(r.owner) else { continue };
                let Some(at) = owner.dents.iter().position(|d| d.pos.lnum == r.lnum && d.pos.offs == r.offs) else {
                    continue;
                };
                let dent = owner.dents.remove(at);
                let detail = format!("{}, entry '{}'", owner.describe(), dent.name_lossy());
                if repair.problem(Problem::DentryIsUnreachable, &detail)? {
                    repair.delete_node(&dent.key, &dent.pos);
                }
                tracing::debug!("removed unreachable entry '{}' of inode {}", dent.name_lossy(), r.owner);
            }
            continue 'retry;
        }
        break;
    }
    Ok(tree.get(inum).is_some_and(|f| !f.dents.is_empty()))
}

/// Drop names that cannot be reached from the root, then the files left nameless
pub fn extract_dentry_tree(repair: &mut Repair<'_>, tree: &mut FileTree, out: &mut Validated) -> Result<()> {
    let mut found = HashSet::new();
    let mut unreachable = Vec::new();
    for inum in tree.inums() {
        if !file_is_reachable(repair, tree, &mut found, inum)? {
            unreachable.push(inum);
        }
    }
    for inum in unreachable {
        let Some(file) = tree.take(inum) else { continue };
        tracing::debug!("inode {} is unreachable", inum);
        let verdict = if file.is_reg() {
            disconnect(repair, &file)?
        } else {
            reject(repair, Problem::FileHasNoDent, &file)?
        };
        match verdict {
            Verdict::Disconnected => out.disconnected.push(file),
            Verdict::Invalid { delete: true } => {
                repair.delete_file(&file);
                out.removed += 1;
            }
            _ => out.removed += 1,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::file::tests::{data_rec, dent_rec, ino_rec, pos};
    use crate::check::parse::{DentRecord, InoRecord, LeafRecord};
    use crate::check::problem::{Mode, Policy};

    fn base_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert(ino_rec(1, S_IFDIR | 0o755, 3, 160, 1));
        tree.insert(ino_rec(65, S_IFDIR | 0o755, 2, 160, 2));
        tree.insert(dent_rec(1, "dir", 65, ITYPE_DIR, 3));
        tree.insert(ino_rec(66, S_IFREG | 0o644, 1, 5, 4));
        tree.insert(dent_rec(65, "file", 66, ITYPE_REG, 5));
        tree.insert(data_rec(66, 0, 5, 6));
        tree
    }

    fn run(tree: &mut FileTree, mode: Mode) -> (Validated, Policy) {
        let mut policy = Policy::new(mode);
        let mut out = {
            let mut repair = Repair::new(&mut policy, None);
            filter_invalid_files(&mut repair, tree).unwrap()
        };
        {
            let mut repair = Repair::new(&mut policy, None);
            extract_dentry_tree(&mut repair, tree, &mut out).unwrap();
        }
        (out, policy)
    }

    #[test]
    fn test_clean_tree_survives() {
        let mut tree = base_tree();
        let (out, policy) = run(&mut tree, Mode::Danger0);
        assert_eq!(tree.len(), 3);
        assert!(out.disconnected.is_empty());
        assert_eq!(policy.problem_count(), 0);
    }

    #[test]
    fn test_missing_inode_and_zero_nlink() {
        let mut tree = base_tree();
        tree.insert(dent_rec(1, "ghost", 80, ITYPE_REG, 10));
        tree.insert(ino_rec(81, S_IFREG | 0o644, 0, 0, 11));
        tree.insert(dent_rec(1, "dead", 81, ITYPE_REG, 12));
        let (out, policy) = run(&mut tree, Mode::Danger0);
        assert!(!tree.contains(80));
        assert!(!tree.contains(81));
        assert_eq!(out.removed, 2);
        assert_eq!(policy.detected()[&Problem::FileHasNoInode], 1);
        assert_eq!(policy.detected()[&Problem::FileHas0NlinkInode], 1);
    }

    #[test]
    fn test_dir_keeps_newest_name() {
        let mut tree = base_tree();
        tree.insert(dent_rec(1, "alias", 65, ITYPE_DIR, 20));
        let (_, policy) = run(&mut tree, Mode::Danger0);
        let dir = tree.get(65).unwrap();
        assert_eq!(dir.dents.len(), 1);
        assert_eq!(dir.dents[0].name, b"alias");
        assert_eq!(policy.detected()[&Problem::FileHasTooManyDent], 1);
        // the file below moved along with its directory
        assert!(tree.contains(66));
    }

    #[test]
    fn test_inconsistent_type_and_stray_data() {
        let mut tree = base_tree();
        tree.insert(dent_rec(1, "wrong", 66, ITYPE_DIR, 21));
        tree.insert(data_rec(65, 0, 100, 22));
        let (_, policy) = run(&mut tree, Mode::Danger0);
        assert_eq!(tree.get(66).unwrap().dents.len(), 1);
        assert!(tree.get(65).unwrap().data.is_empty());
        assert_eq!(policy.detected()[&Problem::FileHasInconsistType], 1);
        assert_eq!(policy.detected()[&Problem::FileShouldntHaveData], 1);
    }

    #[test]
    fn test_nameless_regular_file_is_disconnected() {
        let mut tree = base_tree();
        tree.insert(ino_rec(70, S_IFREG | 0o644, 1, 4096, 30));
        tree.insert(data_rec(70, 0, 4096, 31));
        tree.insert(ino_rec(71, S_IFLNK | 0o777, 1, 4, 32));
        let (out, policy) = run(&mut tree, Mode::Danger0);
        assert_eq!(out.disconnected.len(), 1);
        assert_eq!(out.disconnected[0].inum, 70);
        assert_eq!(out.disconnected[0].data.len(), 1);
        assert!(!tree.contains(70));
        assert!(!tree.contains(71));
        assert_eq!(policy.detected()[&Problem::FileHasNoDent], 1);
    }

    #[test]
    fn test_check_mode_does_not_collect_disconnected() {
        let mut tree = base_tree();
        tree.insert(ino_rec(70, S_IFREG | 0o644, 1, 0, 30));
        let (out, policy) = run(&mut tree, Mode::Check);
        assert!(out.disconnected.is_empty());
        assert_eq!(policy.detected()[&Problem::FileIsDisconnected], 1);
        assert_eq!(policy.fixed(), 0);
    }

    #[test]
    fn test_parent_must_be_directory() {
        let mut tree = base_tree();
        tree.insert(ino_rec(72, S_IFREG | 0o644, 1, 0, 40));
        tree.insert(dent_rec(66, "under-file", 72, ITYPE_REG, 41));
        let (out, _) = run(&mut tree, Mode::Danger0);
        assert_eq!(out.disconnected.len(), 1);
        assert!(out.disconnected[0].dents.is_empty());
    }

    #[test]
    fn test_cycle_is_unreachable() {
        let mut tree = base_tree();
        tree.insert(ino_rec(90, S_IFDIR | 0o755, 2, 160, 50));
        tree.insert(ino_rec(91, S_IFDIR | 0o755, 2, 160, 51));
        tree.insert(dent_rec(91, "a", 90, ITYPE_DIR, 52));
        tree.insert(dent_rec(90, "b", 91, ITYPE_DIR, 53));
        let (_, policy) = run(&mut tree, Mode::Danger0);
        assert!(!tree.contains(90));
        assert!(!tree.contains(91));
        assert!(policy.detected()[&Problem::DentryIsUnreachable] >= 2);
        assert!(tree.contains(66));
    }

    #[test]
    fn test_xattr_attached_to_host() {
        let mut tree = base_tree();
        tree.insert(LeafRecord::Ino(InoRecord {
            pos: pos(60),
            key: Key::ino(100),
            is_xattr: true,
            is_encrypted: false,
            mode: S_IFREG | 0o600,
            nlink: 1,
            xcnt: 0,
            xsz: 0,
            xnms: 0,
            size: 3,
        }));
        tree.insert(LeafRecord::Dent(DentRecord {
            pos: pos(61),
            key: Key::xent(66, 1234),
            is_xent: true,
            itype: ITYPE_REG,
            name: b"user.x".to_vec(),
            inum: 100,
        }));
        // xattr whose host is gone
        tree.insert(LeafRecord::Ino(InoRecord {
            pos: pos(62),
            key: Key::ino(101),
            is_xattr: true,
            is_encrypted: false,
            mode: S_IFREG | 0o600,
            nlink: 1,
            xcnt: 0,
            xsz: 0,
            xnms: 0,
            size: 0,
        }));
        tree.insert(LeafRecord::Dent(DentRecord {
            pos: pos(63),
            key: Key::xent(500, 1),
            is_xent: true,
            itype: ITYPE_REG,
            name: b"user.y".to_vec(),
            inum: 101,
        }));
        let (_, policy) = run(&mut tree, Mode::Danger0);
        assert!(!tree.contains(100));
        assert!(tree.get(66).unwrap().xattrs.contains_key(&100));
        assert_eq!(policy.detected()[&Problem::XattrHasNoHost], 1);
    }

    #[test]
    fn test_deep_chain_is_bounded() {
        let mut tree = FileTree::new();
        tree.insert(ino_rec(1, S_IFDIR | 0o755, 2, 160, 1));
        let depth = MAX_PATH_DEPTH as u32 + 10;
        for i in 0..depth {
            let inum = 1000 + i;
            let parent = if i == 0 { 1 } else { inum - 1 };
            tree.insert(ino_rec(inum, S_IFDIR | 0o755, 2, 160, 10 + i as u64 * 2));
            tree.insert(dent_rec(parent, "d", inum as u64, ITYPE_DIR, 11 + i as u64 * 2));
        }
        let deepest = 1000 + depth as u64 - 1;

        let mut policy = Policy::new(Mode::Danger0);
        let mut repair = Repair::new(&mut policy, None);
        let mut found = HashSet::new();
        assert!(!file_is_reachable(&mut repair, &mut tree, &mut found, deepest).unwrap());
        // only the name of the file that was too deep goes
        assert!(tree.get(deepest).unwrap().dents.is_empty());
        for inum in 1000..deepest {
            assert_eq!(tree.get(inum).unwrap().dents.len(), 1, "inode {}", inum);
        }
        assert!(file_is_reachable(&mut repair, &mut tree, &mut found, 1000).unwrap());
        drop(repair);
        assert_eq!(policy.detected()[&Problem::DentryIsUnreachable], 1);

        let (_, _) = run(&mut tree, Mode::Danger0);
        assert!(tree.contains(1000));
        assert!(tree.contains(1000 + MAX_PATH_DEPTH as u64 - 2));
    }
}
