/// Index traversal
///
/// Every leaf the index points at is read, parsed and folded into the file
/// graph. Leaves that cannot be trusted are reported and, when the fix is
/// accepted, dropped from the index after the walk.

use std::collections::HashMap;

use crate::check::file::FileTree;
use crate::check::parse::{invalid_problem, parse_leaf, LeafRecord};
use crate::check::problem::{Policy, Problem};
use crate::error::{Corruption, FsckError, Result};
use crate::fs::tnc::{read_leaf, Tnc, Zbranch};
use crate::fs::FsInfo;
use crate::media::*;
use crate::volume::{scan_leb, Volume};

/// What a scan of a leaf LEB found
#[derive(Debug, Clone, Copy)]
struct LebSummary {
    corrupted_at: Option<u32>,
    mixed: bool,
}

impl LebSummary {
    /// Whether the node at `zbr` lies in the intact part of a leaf-only LEB
    fn covers(&self, zbr: &Zbranch) -> bool {
        !self.mixed && self.corrupted_at.map_or(true, |at| zbr.offs + zbr.len <= at)
    }
}

#[derive(Debug, Default)]
pub struct Traversed {
    pub tree: FileTree,
    pub leaves: usize,
    /// Leaves dropped from the index
    pub dropped: usize,
}

fn node_type_of(key: &Key) -> Option<NodeType> {
    match key.key_type()? {
        KeyType::Ino => Some(NodeType::Ino),
        KeyType::Data => Some(NodeType::Data),
        KeyType::Dent => Some(NodeType::Dent),
        KeyType::Xent => Some(NodeType::Xent),
        KeyType::Trun => None,
    }
}

/// Walk all leaves of `tnc` and build the file graph
///
/// A leaf with an impossible key or length means the index itself is broken
/// and is returned as an index corruption.
pub fn traverse_tnc(vol: &dyn Volume, fs: &mut FsInfo, tnc: &mut Tnc, policy: &mut Policy) -> Result<Traversed> {
    let leaves: Vec<(Key, Zbranch)> = tnc.leaves().map(|(k, z)| (*k, *z)).collect();
    let mut out = Traversed {
        leaves: leaves.len(),
        ..Traversed::default()
    };
    let mut lebs: HashMap<u32, LebSummary> = HashMap::new();
    let mut drop = Vec::new();

    for (key, zbr) in leaves {
        let Some(node_type) = node_type_of(&key) else {
            return Err(FsckError::corrupted(
                Corruption::Index,
                zbr.lnum,
                zbr.offs,
                format!("bad leaf key {}", key),
            ));
        };
        if !fs.ranges.check(node_type, zbr.len) {
            return Err(FsckError::corrupted(
                Corruption::Index,
                zbr.lnum,
                zbr.offs,
                format!("bad {} leaf length {}", node_type.name(), zbr.len),
            ));
        }

        let summary = match lebs.get(&zbr.lnum) {
            Some(summary) => *summary,
            None => {
                let sleb = scan_leb(vol, &fs.ranges, zbr.lnum, 0)?;
                let summary = LebSummary {
                    corrupted_at: sleb.corrupted_at,
                    mixed: sleb.is_mixed() || sleb.is_index(),
                };
                lebs.insert(zbr.lnum, summary);
                summary
            }
        };
        if !summary.covers(&zbr) {
            let detail = format!("LEB {} holding key {}", zbr.lnum, key);
            if policy.fix_problem(Problem::ScanCorrupted, Some(&detail))? {
                drop.push((key, zbr));
            }
            continue;
        }

        let buf = match read_leaf(vol, fs, &key, &zbr) {
            Ok(buf) => buf,
            Err(err @ FsckError::Corrupted { .. }) => {
                if policy.fix_problem(Problem::TncDataCorrupted, Some(&err.to_string()))? {
                    drop.push((key, zbr));
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        match parse_leaf(fs, &buf, &key, zbr.lnum, zbr.offs) {
            Ok(rec) => {
                fs.saw_sqnum(rec.pos().sqnum);
                if let LeafRecord::Ino(ino) = &rec {
                    fs.highest_inum = fs.highest_inum.max(ino.inum());
                }
                out.tree.insert(rec);
            }
            Err(why) => {
                let detail = format!("key {} at LEB {}:{}, {}", key, zbr.lnum, zbr.offs, why);
                if policy.fix_problem(invalid_problem(&key), Some(&detail))? {
                    drop.push((key, zbr));
                }
            }
        }
    }

    for (key, zbr) in drop {
        if tnc.remove_node(&key, zbr.lnum, zbr.offs) {
            out.dropped += 1;
        }
    }
    tracing::debug!(
        "Traversed {} leaves into {} files, dropped {}",
        out.leaves,
        out.tree.len(),
        out.dropped
    );
    Ok(out)
}
