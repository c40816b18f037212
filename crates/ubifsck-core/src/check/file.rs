/// File graph
///
/// Valid leaf records are folded into one `ScannedFile` per inode number.
/// Directory entries are filed under the inode they point at, so a file knows
/// its own names and finds its parent through the key of an entry. Extended
/// attribute files end up nested in their host once validated.

use std::collections::BTreeMap;

use crate::check::parse::{DataRecord, DentRecord, InoRecord, LeafRecord, NodePos, TrunRecord};
use crate::check::problem::{Policy, Problem};
use crate::error::Result;
use crate::fs::tnc::Tnc;
use crate::media::*;

/// Values recomputed by the reconciler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calculated {
    pub nlink: u32,
    pub xcnt: u32,
    pub xsz: u64,
    pub xnms: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub inum: u64,
    pub ino: Option<InoRecord>,
    pub trun: Option<TrunRecord>,
    /// Entries naming this file, oldest first
    pub dents: Vec<DentRecord>,
    pub data: BTreeMap<u32, DataRecord>,
    pub xattrs: BTreeMap<u64, ScannedFile>,
    pub calc: Calculated,
    /// An encryption context xattr was found for this file
    pub has_encrypted_info: bool,
}

impl ScannedFile {
    pub fn new(inum: u64) -> Self {
        Self {
            inum,
            ino: None,
            trun: None,
            dents: Vec::new(),
            data: BTreeMap::new(),
            xattrs: BTreeMap::new(),
            calc: Calculated::default(),
            has_encrypted_info: false,
        }
    }

    pub fn is_xattr(&self) -> bool {
        self.ino.as_ref().is_some_and(|i| i.is_xattr)
    }

    pub fn is_encrypted(&self) -> bool {
        self.ino.as_ref().is_some_and(|i| i.is_encrypted)
    }

    pub fn mode(&self) -> u32 {
        self.ino.as_ref().map(|i| i.mode).unwrap_or(0)
    }

    pub fn is_dir(&self) -> bool {
        is_dir(self.mode())
    }

    pub fn is_reg(&self) -> bool {
        is_reg(self.mode())
    }

    /// Inode the oldest surviving entry lives in
    pub fn parent(&self) -> Option<u64> {
        self.dents.first().map(DentRecord::parent)
    }

    /// Fold one record into the file
    pub fn update(&mut self, rec: LeafRecord) {
        match rec {
            LeafRecord::Ino(ino) => {
                if self.ino.as_ref().map_or(true, |old| old.pos.sqnum <= ino.pos.sqnum) {
                    self.ino = Some(ino);
                }
            }
            LeafRecord::Trun(trun) => {
                if self.trun.as_ref().map_or(true, |old| old.pos.sqnum <= trun.pos.sqnum) {
                    self.trun = Some(trun);
                }
            }
            LeafRecord::Dent(dent) => {
                let at = self.dents.partition_point(|d| d.pos.sqnum <= dent.pos.sqnum);
                self.dents.insert(at, dent);
            }
            LeafRecord::Data(data) => {
                let block = data.key.block();
                match self.data.get(&block) {
                    Some(old) if old.pos.sqnum > data.pos.sqnum => {}
                    _ => {
                        self.data.insert(block, data);
                    }
                }
            }
        }
    }

    /// Short description used in problem reports
    pub fn describe(&self) -> String {
        match &self.ino {
            Some(ino) => {
                let kind = dent_type(ino.mode).map(type_name).unwrap_or("unknown/invalid type");
                format!(
                    "ino {}{}, type {}, nlink {}, size {}, xcnt {}, xsz {}, xnms {}",
                    self.inum,
                    if ino.is_xattr { " (xattr)" } else { "" },
                    kind,
                    ino.nlink,
                    ino.size,
                    ino.xcnt,
                    ino.xsz,
                    ino.xnms
                )
            }
            None => format!("ino {}, no inode", self.inum),
        }
    }

    /// Positions of every node of the file, nested xattr files included
    pub fn node_positions(&self) -> Vec<(Key, NodePos)> {
        let mut out = Vec::new();
        if let Some(ino) = &self.ino {
            out.push((ino.key, ino.pos));
        }
        out.extend(self.data.values().map(|d| (d.key, d.pos)));
        out.extend(self.dents.iter().map(|d| (d.key, d.pos)));
        for xattr in self.xattrs.values() {
            out.extend(xattr.node_positions());
        }
        out
    }
}

/// All files found, keyed by inode number
#[derive(Debug, Clone, Default)]
pub struct FileTree {
    files: BTreeMap<u64, ScannedFile>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a record under the inode it describes
    pub fn insert(&mut self, rec: LeafRecord) {
        let inum = match &rec {
            LeafRecord::Ino(ino) => ino.inum(),
            LeafRecord::Trun(trun) => trun.inum,
            LeafRecord::Data(data) => data.key.inum as u64,
            // Deletion entries never reach a file
            LeafRecord::Dent(dent) if dent.inum == 0 => return,
            LeafRecord::Dent(dent) => dent.inum,
        };
        self.files
            .entry(inum)
            .or_insert_with(|| ScannedFile::new(inum))
            .update(rec);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, inum: u64) -> Option<&ScannedFile> {
        self.files.get(&inum)
    }

    pub fn get_mut(&mut self, inum: u64) -> Option<&mut ScannedFile> {
        self.files.get_mut(&inum)
    }

    pub fn contains(&self, inum: u64) -> bool {
        self.files.contains_key(&inum)
    }

    pub fn take(&mut self, inum: u64) -> Option<ScannedFile> {
        self.files.remove(&inum)
    }

    pub fn put(&mut self, file: ScannedFile) {
        self.files.insert(file.inum, file);
    }

    pub fn inums(&self) -> Vec<u64> {
        self.files.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScannedFile> {
        self.files.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ScannedFile> {
        self.files.values_mut()
    }
}

/// Raises problems and, when a fix is accepted, prunes the index
///
/// In rebuild mode there is no index to prune: `tnc` is `None` and the
/// dropped nodes are simply not carried into the new filesystem.
pub struct Repair<'a> {
    pub policy: &'a mut Policy,
    pub tnc: Option<&'a mut Tnc>,
}

impl<'a> Repair<'a> {
    pub fn new(policy: &'a mut Policy, tnc: Option<&'a mut Tnc>) -> Self {
        Self { policy, tnc }
    }

    pub fn problem(&mut self, problem: Problem, detail: &str) -> Result<bool> {
        self.policy.fix_problem(problem, Some(detail))
    }

    /// Drop one node from the index
    pub fn delete_node(&mut self, key: &Key, pos: &NodePos) {
        if let Some(tnc) = self.tnc.as_deref_mut() {
            if !tnc.remove_node(key, pos.lnum, pos.offs) {
                tracing::debug!("node {} at {}:{} was not indexed", key, pos.lnum, pos.offs);
            }
        }
    }

    /// Drop every node of `file` from the index
    pub fn delete_file(&mut self, file: &ScannedFile) {
        for (key, pos) in file.node_positions() {
            self.delete_node(&key, &pos);
        }
    }
}
