/// Filesystem-level structures
///
/// `FsInfo` is the per-run description of the filesystem: geometry derived
/// from the superblock plus the few counters that change while repairing
/// (highest sequence number, highest inode number, commit number). It is
/// owned by the run and passed by reference to every component.

pub mod commit;
pub mod log;
pub mod lpt;
pub mod master;
pub mod replay;
pub mod superblock;
pub mod tnc;

use crate::error::{FsckError, Result};
use crate::media::lpt::LptBits;
use crate::media::*;
use crate::volume::{NodeRanges, Volume};

#[derive(Debug, Clone)]
pub struct FsInfo {
    pub sb: SbNode,
    pub leb_size: u32,
    pub min_io_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub fanout: u32,
    pub jhead_cnt: u32,
    pub lsave_cnt: u32,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub main_lebs: u32,
    pub log_last: u32,
    pub lpt_first: u32,
    pub lpt_last: u32,
    pub orph_first: u32,
    pub orph_last: u32,
    pub main_first: u32,
    pub key_hash: KeyHash,
    pub big_lpt: bool,
    pub double_hash: bool,
    pub encrypted: bool,
    pub space_fixup: bool,
    pub dead_wm: u32,
    pub dark_wm: u32,
    pub ranges: NodeRanges,
    pub lpt_bits: LptBits,

    /// Highest sequence number seen or written so far
    pub max_sqnum: u64,
    pub highest_inum: u64,
    pub cmt_no: u64,
}

impl FsInfo {
    /// Derive the geometry from a superblock that passed validation
    pub fn new(sb: SbNode) -> Result<Self> {
        let key_hash = KeyHash::from_u8(sb.key_hash)
            .ok_or_else(|| FsckError::InvalidGeometry(format!("unknown key hash {}", sb.key_hash)))?;
        let leb_size = sb.leb_size;
        let min_io_size = sb.min_io_size;
        let log_last = LOG_LNUM + sb.log_lebs - 1;
        let lpt_first = log_last + 1;
        let lpt_last = lpt_first + sb.lpt_lebs - 1;
        let orph_first = lpt_last + 1;
        let orph_last = orph_first + sb.orph_lebs - 1;
        let fixed = SB_LNUM + 1 + MST_LEBS + sb.log_lebs + sb.lpt_lebs + sb.orph_lebs;
        let main_lebs = sb.leb_cnt.checked_sub(fixed).ok_or_else(|| {
            FsckError::InvalidGeometry(format!(
                "{} LEBs cannot hold {} LEBs of fixed areas",
                sb.leb_cnt, fixed
            ))
        })?;
        let big_lpt = sb.flags & FLG_BIGLPT != 0;
        let lpt_bits = LptBits::new(leb_size, sb.lpt_lebs, sb.max_leb_cnt, sb.lsave_cnt, big_lpt);

        Ok(Self {
            leb_size,
            min_io_size,
            leb_cnt: sb.leb_cnt,
            max_leb_cnt: sb.max_leb_cnt,
            fanout: sb.fanout,
            jhead_cnt: sb.jhead_cnt,
            lsave_cnt: sb.lsave_cnt,
            log_lebs: sb.log_lebs,
            lpt_lebs: sb.lpt_lebs,
            orph_lebs: sb.orph_lebs,
            main_lebs,
            log_last,
            lpt_first,
            lpt_last,
            orph_first,
            orph_last,
            main_first: sb.leb_cnt - main_lebs,
            key_hash,
            big_lpt,
            double_hash: sb.flags & FLG_DOUBLE_HASH != 0,
            encrypted: sb.flags & FLG_ENCRYPTION != 0,
            space_fixup: sb.flags & FLG_SPACE_FIXUP != 0,
            dead_wm: align(MIN_WRITE_SZ, min_io_size),
            dark_wm: align(MAX_NODE_SZ, min_io_size),
            ranges: NodeRanges::new(leb_size, sb.fanout),
            lpt_bits,
            max_sqnum: 0,
            highest_inum: 0,
            cmt_no: 0,
            sb,
        })
    }

    pub fn is_main(&self, lnum: u32) -> bool {
        lnum >= self.main_first && lnum < self.leb_cnt
    }

    pub fn main_bytes(&self) -> u64 {
        self.main_lebs as u64 * self.leb_size as u64
    }

    pub fn next_sqnum(&mut self) -> u64 {
        self.max_sqnum += 1;
        self.max_sqnum
    }

    /// Note a sequence number found on flash
    pub fn saw_sqnum(&mut self, sqnum: u64) {
        self.max_sqnum = self.max_sqnum.max(sqnum);
    }

    pub fn name_hash(&self, name: &[u8]) -> u32 {
        self.key_hash.hash(name)
    }

    /// Unreclaimable part of `spc` free-plus-dirty bytes of a LEB
    pub fn calc_dark(&self, spc: u32) -> u32 {
        if spc < self.dark_wm {
            return spc;
        }
        if spc - self.dark_wm < MIN_WRITE_SZ {
            return spc - MIN_WRITE_SZ;
        }
        self.dark_wm
    }
}

/// Main area LEBs taken while writing new nodes
#[derive(Debug, Clone)]
pub struct UsedLebs {
    main_first: u32,
    used: Vec<bool>,
    /// LEBs holding data, live or not
    written: Vec<bool>,
}

impl UsedLebs {
    pub fn new(fs: &FsInfo) -> Self {
        Self {
            main_first: fs.main_first,
            used: vec![false; fs.main_lebs as usize],
            written: vec![false; fs.main_lebs as usize],
        }
    }

    /// Like `new`, but remembers which LEBs are mapped so that erased LEBs
    /// are handed out before written ones
    pub fn from_volume(fs: &FsInfo, vol: &dyn Volume) -> Result<Self> {
        let mut lebs = Self::new(fs);
        for (i, written) in lebs.written.iter_mut().enumerate() {
            *written = vol.is_mapped(fs.main_first + i as u32)?;
        }
        Ok(lebs)
    }

    pub fn mark(&mut self, lnum: u32) {
        if let Some(slot) = lnum
            .checked_sub(self.main_first)
            .and_then(|i| self.used.get_mut(i as usize))
        {
            *slot = true;
        }
    }

    pub fn is_used(&self, lnum: u32) -> bool {
        lnum.checked_sub(self.main_first)
            .and_then(|i| self.used.get(i as usize))
            .copied()
            .unwrap_or(true)
    }

    /// Take a free main area LEB, erased ones first
    ///
    /// A written LEB without live nodes may still hold deletion nodes, so it
    /// is only reclaimed once no erased LEB is left.
    pub fn get_free_leb(&mut self) -> Result<u32> {
        let index = (0..self.used.len())
            .find(|&i| !self.used[i] && !self.written[i])
            .or_else(|| self.used.iter().position(|used| !used))
            .ok_or(FsckError::NoSpace)?;
        self.used[index] = true;
        Ok(self.main_first + index as u32)
    }
}
