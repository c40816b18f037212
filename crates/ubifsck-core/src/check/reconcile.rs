/// Metadata reconciliation
///
/// Link counts, sizes and xattr totals are recomputed from the surviving
/// graph and compared with what the inodes claim. Data beyond a truncation
/// or beyond the size recorded by a newer inode is dropped first.

use byteorder::{ByteOrder, LittleEndian};

use crate::check::file::{Calculated, FileTree, Repair, ScannedFile};
use crate::check::parse::InoRecord;
use crate::check::problem::Problem;
use crate::error::Result;
use crate::media::node::InoNode;
use crate::media::*;
use crate::volume::Volume;

/// What a file adds to the directory its name lives in
#[derive(Debug, Clone, Copy)]
pub struct ParentShare {
    pub parent: u64,
    pub nlink: u32,
    pub size: u64,
}

/// Recompute the values of `file` alone
///
/// Returns the shares owed to parent directories. Data nodes made stale by
/// a truncation or a newer inode are dropped from the file and the index.
pub fn calculate_file(repair: &mut Repair<'_>, file: &mut ScannedFile) -> Vec<ParentShare> {
    file.calc = Calculated::default();
    let Some(ino) = file.ino.clone() else {
        return Vec::new();
    };

    for xattr in file.xattrs.values_mut() {
        let xsize = xattr.ino.as_ref().map_or(0, |i| i.size);
        xattr.calc = Calculated {
            nlink: 1,
            size: xsize,
            ..Calculated::default()
        };
        let nlen = xattr.dents.first().map_or(0, |d| d.name.len() as u32);
        file.calc.xcnt += 1;
        file.calc.xsz += calc_dent_size(nlen) + calc_xattr_bytes(xsize);
        file.calc.xnms += nlen;
    }

    if file.inum == ROOT_INO {
        file.calc.nlink += 2;
        file.calc.size += INO_NODE_SZ as u64;
        return Vec::new();
    }

    if file.is_dir() {
        file.calc.nlink += 2;
        file.calc.size += INO_NODE_SZ as u64;
        return file
            .dents
            .first()
            .map(|d| ParentShare {
                parent: d.parent(),
                nlink: 1,
                size: calc_dent_size(d.name.len() as u32),
            })
            .into_iter()
            .collect();
    }

    let shares = file
        .dents
        .iter()
        .map(|d| ParentShare {
            parent: d.parent(),
            nlink: 0,
            size: calc_dent_size(d.name.len() as u32),
        })
        .collect();
    file.calc.nlink = file.dents.len() as u32;

    if !file.is_reg() {
        file.calc.size = ino.size;
        return shares;
    }

    let (trun_size, trun_sqnum) = file.trun.as_ref().map_or((0, 0), |t| (t.new_size, t.pos.sqnum));
    let ino_sqnum = ino.pos.sqnum;
    let mut new_size = 0;
    let mut dropped = Vec::new();
    for (block, rec) in &file.data {
        let end = rec.end();
        if (trun_sqnum > rec.pos.sqnum && trun_size < end) || (ino_sqnum > rec.pos.sqnum && ino.size < end) {
            dropped.push(*block);
        } else {
            new_size = new_size.max(end);
        }
    }

    let mut corrupted_truncation = false;
    let truncated = trun_sqnum > ino_sqnum && trun_size < ino.size;
    if truncated && trun_size < new_size {
        corrupted_truncation = true;
    }
    file.calc.size = if truncated && !corrupted_truncation {
        trun_size
    } else if new_size > ino.size || corrupted_truncation {
        new_size
    } else {
        ino.size
    };

    for block in dropped {
        if let Some(rec) = file.data.remove(&block) {
            tracing::debug!("dropped data block {} of inode {}", block, file.inum);
            repair.delete_node(&rec.key, &rec.pos);
        }
    }
    shares
}

/// Recompute every file in `tree`
pub fn calculate_files(repair: &mut Repair<'_>, tree: &mut FileTree) {
    let mut shares = Vec::new();
    for file in tree.iter_mut() {
        shares.extend(calculate_file(repair, file));
    }
    for share in shares {
        if let Some(parent) = tree.get_mut(share.parent) {
            parent.calc.nlink += share.nlink;
            parent.calc.size += share.size;
        }
    }
}

fn differs(ino: &InoRecord, calc: &Calculated) -> bool {
    ino.nlink != calc.nlink
        || ino.xcnt != calc.xcnt
        || ino.xsz as u64 != calc.xsz
        || ino.xnms != calc.xnms
        || ino.size != calc.size
}

/// Write the calculated values into the inode node at `ino.pos`
fn patch_inode(vol: &mut dyn Volume, ino: &InoRecord, calc: &Calculated) -> Result<()> {
    let mut leb = vol.read_leb(ino.pos.lnum)?;
    let start = ino.pos.offs as usize;
    let node = &mut leb[start..start + ino.pos.len as usize];
    LittleEndian::write_u32(&mut node[InoNode::OFFS_NLINK..], calc.nlink);
    LittleEndian::write_u32(&mut node[InoNode::OFFS_XATTR_CNT..], calc.xcnt);
    LittleEndian::write_u32(&mut node[InoNode::OFFS_XATTR_SIZE..], calc.xsz as u32);
    LittleEndian::write_u32(&mut node[InoNode::OFFS_XATTR_NAMES..], calc.xnms);
    LittleEndian::write_u64(&mut node[InoNode::OFFS_SIZE..], calc.size);
    update_crc(node);
    vol.change(ino.pos.lnum, &leb)
}

fn correct_one(repair: &mut Repair<'_>, vol: Option<&mut (dyn Volume + '_)>, file: &mut ScannedFile) -> Result<bool> {
    let calc = file.calc;
    let detail = file.describe();
    let Some(ino) = file.ino.as_mut() else {
        return Ok(false);
    };
    if !differs(ino, &calc) {
        return Ok(false);
    }
    let detail = format!(
        "{}, should be nlink {}, size {}, xcnt {}, xsz {}, xnms {}",
        detail, calc.nlink, calc.size, calc.xcnt, calc.xsz, calc.xnms
    );
    if !repair.problem(Problem::FileIsInconsistent, &detail)? {
        return Ok(false);
    }
    if let Some(vol) = vol {
        patch_inode(vol, ino, &calc)?;
    }
    ino.nlink = calc.nlink;
    ino.xcnt = calc.xcnt;
    ino.xsz = calc.xsz as u32;
    ino.xnms = calc.xnms;
    ino.size = calc.size;
    Ok(true)
}

/// Bring the inode of `file`, and those of its xattrs, in line with the
/// calculated values
///
/// Without a volume only the in-memory records change; the rebuild writes
/// them out itself.
pub fn correct_file(repair: &mut Repair<'_>, mut vol: Option<&mut (dyn Volume + '_)>, file: &mut ScannedFile) -> Result<usize> {
    let mut corrected = 0;
    for xattr in file.xattrs.values_mut() {
        if correct_one(repair, vol.as_deref_mut(), xattr)? {
            corrected += 1;
        }
    }
    if correct_one(repair, vol, file)? {
        corrected += 1;
    }
    Ok(corrected)
}

/// Calculate and correct every file in `tree`, returning how many inodes changed
pub fn check_and_correct_files(repair: &mut Repair<'_>, mut vol: Option<&mut (dyn Volume + '_)>, tree: &mut FileTree) -> Result<usize> {
    calculate_files(repair, tree);
    let mut corrected = 0;
    for file in tree.iter_mut() {
        corrected += correct_file(repair, vol.as_deref_mut(), file)?;
    }
    if corrected > 0 {
        tracing::info!("Corrected {} inodes", corrected);
    }
    Ok(corrected)
}
