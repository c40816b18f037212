/// Content index (TNC)
///
/// The on-flash index is a B+tree of index nodes whose level-0 branches point
/// at leaf nodes. In memory only the leaf level is kept, as an ordered map from
/// key to branches; a key carries several branches when directory entry names
/// collide on the same hash. The positions of the on-flash index nodes are
/// kept alongside so space accounting can tell live index nodes from stale ones.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Corruption, FsckError, Result};
use crate::fs::FsInfo;
use crate::media::key::KEY_BLOCK_MASK;
use crate::media::*;
use crate::volume::Volume;

/// Location of a leaf node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Zbranch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
}

/// Location of an on-flash index node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxRef {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub level: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Tnc {
    leaves: BTreeMap<Key, Vec<Zbranch>>,
    index: BTreeMap<(u32, u32), IdxRef>,
    root: Option<IdxRef>,
    dirty: bool,
}

/// Order of same-key entries: raw name bytes, then length
pub fn namecmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let n = a.len().min(b.len());
    a[..n].cmp(&b[..n]).then(a.len().cmp(&b.len()))
}

/// Read a node the index points at and check that it is intact
pub fn read_leaf(vol: &dyn Volume, fs: &FsInfo, key: &Key, zbr: &Zbranch) -> Result<Vec<u8>> {
    let bad = |detail: String| FsckError::corrupted(Corruption::Data, zbr.lnum, zbr.offs, detail);
    if !fs.is_main(zbr.lnum) || zbr.offs % 8 != 0 || zbr.offs + zbr.len > fs.leb_size {
        return Err(bad(format!("bad position, len {}", zbr.len)));
    }
    if zbr.len < CH_SZ {
        return Err(bad(format!("bad length {}", zbr.len)));
    }
    let mut buf = vec![0u8; zbr.len as usize];
    vol.read(zbr.lnum, zbr.offs, &mut buf)?;
    let ch = CommonHeader::parse(&buf)?;
    if ch.magic != NODE_MAGIC {
        return Err(bad(format!("bad magic {:#010x}", ch.magic)));
    }
    if ch.len != zbr.len {
        return Err(bad(format!("node length {} differs from index length {}", ch.len, zbr.len)));
    }
    let node_type = ch
        .node_type()
        .ok_or_else(|| bad(format!("bad node type {}", ch.node_type)))?;
    if !fs.ranges.check(node_type, ch.len) {
        return Err(bad(format!("bad {} node length {}", node_type.name(), ch.len)));
    }
    if node_crc(&buf) != ch.crc {
        return Err(bad("bad CRC".into()));
    }
    if !node_type.has_key() || node_type == NodeType::Trun {
        return Err(bad(format!("{} node is not a leaf", node_type.name())));
    }
    let node_key = Key::read(&buf[24..])?;
    if node_key != *key {
        return Err(bad(format!("node key {} differs from index key {}", node_key, key)));
    }
    Ok(buf)
}

/// Read and check the index node at `idx`
fn read_idx_node(vol: &dyn Volume, fs: &FsInfo, idx: &IdxRef) -> Result<IdxNode> {
    let bad = |detail: String| FsckError::corrupted(Corruption::Index, idx.lnum, idx.offs, detail);
    if !fs.is_main(idx.lnum) || idx.offs % 8 != 0 || idx.offs + idx.len > fs.leb_size {
        return Err(bad(format!("bad index node position, len {}", idx.len)));
    }
    if !fs.ranges.check(NodeType::Idx, idx.len) {
        return Err(bad(format!("bad index node length {}", idx.len)));
    }
    let mut buf = vec![0u8; idx.len as usize];
    vol.read(idx.lnum, idx.offs, &mut buf)?;
    let ch = CommonHeader::parse(&buf)?;
    if ch.magic != NODE_MAGIC || ch.node_type() != Some(NodeType::Idx) || ch.len != idx.len {
        return Err(bad("not an index node".into()));
    }
    if node_crc(&buf) != ch.crc {
        return Err(bad("bad CRC".into()));
    }
    let node = IdxNode::parse(&buf).map_err(|e| bad(e.to_string()))?;
    if node.branches.is_empty() || node.branches.len() > fs.fanout as usize {
        return Err(bad(format!("bad child count {}", node.branches.len())));
    }
    if node.level > MAX_LEVELS || node.level != idx.level {
        return Err(bad(format!("level {} where {} was expected", node.level, idx.level)));
    }
    if node.branches.windows(2).any(|w| w[0].key > w[1].key) {
        return Err(bad("keys out of order".into()));
    }
    Ok(node)
}

impl Tnc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index rooted at the master node's root
    pub fn load(vol: &dyn Volume, fs: &FsInfo, mst: &MstNode) -> Result<Self> {
        let root = IdxRef {
            lnum: mst.root_lnum,
            offs: mst.root_offs,
            len: mst.root_len,
            level: 0,
        };
        // The root decides the height of the tree
        let level = peek_level(vol, fs, &root)?;
        let root = IdxRef { level, ..root };

        let mut tnc = Self::new();
        let mut stack = vec![(root, None::<Key>)];
        while let Some((idx, bound)) = stack.pop() {
            if tnc.index.contains_key(&(idx.lnum, idx.offs)) {
                return Err(FsckError::corrupted(
                    Corruption::Index,
                    idx.lnum,
                    idx.offs,
                    "index node referenced twice",
                ));
            }
            let node = read_idx_node(vol, fs, &idx)?;
            if let (Some(bound), Some(first)) = (bound, node.branches.first()) {
                if first.key < bound {
                    return Err(FsckError::corrupted(
                        Corruption::Index,
                        idx.lnum,
                        idx.offs,
                        format!("first key {} below parent key {}", first.key, bound),
                    ));
                }
            }
            tnc.index.insert((idx.lnum, idx.offs), idx);

            if node.level == 0 {
                for br in &node.branches {
                    tnc.leaves.entry(br.key).or_default().push(Zbranch {
                        lnum: br.lnum,
                        offs: br.offs,
                        len: br.len,
                    });
                }
            } else {
                for br in node.branches.iter().rev() {
                    let child = IdxRef {
                        lnum: br.lnum,
                        offs: br.offs,
                        len: br.len,
                        level: node.level - 1,
                    };
                    stack.push((child, Some(br.key)));
                }
            }
        }
        tnc.root = Some(root);
        tracing::debug!(
            "Loaded index: {} index nodes, {} leaf keys",
            tnc.index.len(),
            tnc.leaves.len()
        );
        Ok(tnc)
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn root(&self) -> Option<IdxRef> {
        self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.values().map(Vec::len).sum()
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&Key, &Zbranch)> {
        self.leaves
            .iter()
            .flat_map(|(key, zbrs)| zbrs.iter().map(move |zbr| (key, zbr)))
    }

    /// Leaves with keys in `from..=to`
    pub fn range(&self, from: Key, to: Key) -> impl Iterator<Item = (&Key, &Zbranch)> {
        self.leaves
            .range(from..=to)
            .flat_map(|(key, zbrs)| zbrs.iter().map(move |zbr| (key, zbr)))
    }

    pub fn lookup(&self, key: &Key) -> &[Zbranch] {
        self.leaves.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if `key` at `lnum:offs` is the current version of that node
    pub fn is_authoritative(&self, key: &Key, lnum: u32, offs: u32) -> bool {
        self.lookup(key)
            .iter()
            .any(|zbr| zbr.lnum == lnum && zbr.offs == offs)
    }

    pub fn index_nodes(&self) -> impl Iterator<Item = &IdxRef> {
        self.index.values()
    }

    pub fn is_index_node(&self, lnum: u32, offs: u32) -> bool {
        self.index.contains_key(&(lnum, offs))
    }

    /// Bytes taken by the current on-flash index
    pub fn index_size(&self) -> u64 {
        self.index.values().map(|i| align(i.len, 8) as u64).sum()
    }

    /// Insert a leaf of a non-name key, replacing the old one
    pub fn insert(&mut self, key: Key, zbr: Zbranch) {
        self.leaves.insert(key, vec![zbr]);
        self.dirty = true;
    }

    /// Insert a directory entry, replacing an entry with the same name
    pub fn insert_dent(
        &mut self,
        vol: &dyn Volume,
        fs: &FsInfo,
        key: Key,
        zbr: Zbranch,
        name: &[u8],
    ) -> Result<()> {
        let slot = self.find_name(vol, fs, &key, name)?;
        let zbrs = self.leaves.entry(key).or_default();
        match slot {
            Some(i) => zbrs[i] = zbr,
            None => zbrs.push(zbr),
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove the directory entry `name` under `key`
    pub fn remove_dent(&mut self, vol: &dyn Volume, fs: &FsInfo, key: &Key, name: &[u8]) -> Result<bool> {
        match self.find_name(vol, fs, key, name)? {
            Some(i) => {
                let zbr = self.lookup(key)[i];
                Ok(self.remove_node(key, zbr.lnum, zbr.offs))
            }
            None => Ok(false),
        }
    }

    /// Find the entry called `name` among the branches of `key`
    pub fn find_name(&self, vol: &dyn Volume, fs: &FsInfo, key: &Key, name: &[u8]) -> Result<Option<usize>> {
        for (i, zbr) in self.lookup(key).iter().enumerate() {
            let buf = match read_leaf(vol, fs, key, zbr) {
                Ok(buf) => buf,
                Err(FsckError::Corrupted { .. }) => continue,
                Err(e) => return Err(e),
            };
            let dent = DentNode::parse(&buf)?;
            if dent.name == name {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Remove the leaf of `key` stored at `lnum:offs`
    pub fn remove_node(&mut self, key: &Key, lnum: u32, offs: u32) -> bool {
        let Some(zbrs) = self.leaves.get_mut(key) else {
            return false;
        };
        let before = zbrs.len();
        zbrs.retain(|zbr| !(zbr.lnum == lnum && zbr.offs == offs));
        let removed = zbrs.len() != before;
        if zbrs.is_empty() {
            self.leaves.remove(key);
        }
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Remove every leaf with a key in `from..=to`
    pub fn remove_range(&mut self, from: Key, to: Key) -> usize {
        let keys: Vec<Key> = self.leaves.range(from..=to).map(|(k, _)| *k).collect();
        for key in &keys {
            self.leaves.remove(key);
        }
        if !keys.is_empty() {
            self.dirty = true;
        }
        keys.len()
    }

    /// Remove an inode with all its nodes and extended attribute inodes
    pub fn remove_ino(&mut self, vol: &dyn Volume, fs: &FsInfo, inum: u32) -> Result<()> {
        let xents: Vec<(Key, Zbranch)> = self
            .range(Key::xent(inum, 0), Key::xent(inum, key::KEY_VALUE_MASK))
            .map(|(k, z)| (*k, *z))
            .collect();
        for (key, zbr) in xents {
            if let Ok(buf) = read_leaf(vol, fs, &key, &zbr) {
                let xent = DentNode::parse(&buf)?;
                if xent.inum != 0 && xent.inum < INUM_WATERMARK {
                    let xinum = xent.inum as u32;
                    self.remove_range(Key::lowest(xinum), Key::highest(xinum));
                }
            }
        }
        self.remove_range(Key::lowest(inum), Key::highest(inum));
        Ok(())
    }

    /// Remove data blocks of `inum` from `first_block` on
    pub fn remove_data_from(&mut self, inum: u32, first_block: u32) -> usize {
        self.remove_range(Key::data(inum, first_block), Key::data(inum, KEY_BLOCK_MASK))
    }

    /// Install a freshly written on-flash index
    pub fn set_index(&mut self, root: IdxRef, nodes: Vec<IdxRef>) {
        self.index = nodes.into_iter().map(|i| ((i.lnum, i.offs), i)).collect();
        self.root = Some(root);
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// LEBs holding live leaves or current index nodes
    pub fn used_lebs(&self) -> BTreeSet<u32> {
        self.leaves()
            .map(|(_, zbr)| zbr.lnum)
            .chain(self.index.values().map(|i| i.lnum))
            .collect()
    }

    /// Leaves in index order: by key, same-key entries by name
    pub fn sorted_leaves(&self, vol: &dyn Volume, fs: &FsInfo) -> Result<Vec<(Key, Zbranch)>> {
        let mut out = Vec::with_capacity(self.leaf_count());
        for (key, zbrs) in &self.leaves {
            if zbrs.len() == 1 {
                out.push((*key, zbrs[0]));
                continue;
            }
            let mut named = Vec::with_capacity(zbrs.len());
            for zbr in zbrs {
                let name = read_leaf(vol, fs, key, zbr)
                    .ok()
                    .and_then(|buf| DentNode::parse(&buf).ok())
                    .map(|d| d.name)
                    .unwrap_or_default();
                named.push((name, *zbr));
            }
            named.sort_by(|a, b| namecmp(&a.0, &b.0));
            out.extend(named.into_iter().map(|(_, zbr)| (*key, zbr)));
        }
        Ok(out)
    }
}

/// Level stored in the index node at `idx`, read before full validation
fn peek_level(vol: &dyn Volume, fs: &FsInfo, idx: &IdxRef) -> Result<u16> {
    if !fs.is_main(idx.lnum) || idx.offs as u64 + IdxNode::SIZE as u64 > fs.leb_size as u64 {
        return Err(FsckError::corrupted(
            Corruption::Index,
            idx.lnum,
            idx.offs,
            "bad index root position",
        ));
    }
    let mut buf = [0u8; 2];
    vol.read(idx.lnum, idx.offs + 26, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
