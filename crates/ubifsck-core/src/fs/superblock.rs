/// Superblock reading and validation

use crate::error::{Corruption, FsckError, Result};
use crate::fs::FsInfo;
use crate::media::*;
use crate::volume::{scan_leb, NodeRanges, Volume};

fn bad(detail: String) -> FsckError {
    FsckError::corrupted(Corruption::Superblock, SB_LNUM, 0, detail)
}

/// Read the superblock node from LEB 0
pub fn read_superblock(vol: &dyn Volume) -> Result<SbNode> {
    let ranges = NodeRanges::new(vol.leb_size(), MIN_FANOUT);
    let sleb = scan_leb(vol, &ranges, SB_LNUM, 0)?;
    let node = sleb
        .nodes
        .first()
        .filter(|n| n.node_type == NodeType::Sb)
        .ok_or_else(|| {
            let at = sleb.corrupted_at.unwrap_or(0);
            FsckError::corrupted(Corruption::Superblock, SB_LNUM, at, "no valid superblock node")
        })?;
    Ok(SbNode::parse(&node.data)?)
}

/// Check the superblock against the volume and derive the filesystem geometry
pub fn validate_sb(sb: &SbNode, vol: &dyn Volume) -> Result<FsInfo> {
    if sb.key_fmt != 0 {
        return Err(bad(format!("unsupported key format {}", sb.key_fmt)));
    }
    if KeyHash::from_u8(sb.key_hash).is_none() {
        return Err(bad(format!("unsupported key hash {}", sb.key_hash)));
    }
    if sb.flags & FLG_AUTHENTICATION != 0 {
        return Err(bad("authenticated filesystems are not supported".into()));
    }
    if sb.fmt_version < 3 || sb.fmt_version > FORMAT_VERSION {
        return Err(bad(format!("on-flash format version {} is not supported", sb.fmt_version)));
    }
    if sb.min_io_size != vol.min_io_size() {
        return Err(bad(format!(
            "min. I/O unit mismatch: {} in superblock, {} real",
            sb.min_io_size,
            vol.min_io_size()
        )));
    }
    if sb.leb_size != vol.leb_size() {
        return Err(bad(format!(
            "LEB size mismatch: {} in superblock, {} real",
            sb.leb_size,
            vol.leb_size()
        )));
    }
    if sb.leb_size < MIN_LEB_SZ || sb.leb_size > MAX_LEB_SZ {
        return Err(bad(format!("bad LEB size {}", sb.leb_size)));
    }
    if sb.log_lebs < MIN_LOG_LEBS || sb.lpt_lebs < MIN_LPT_LEBS || sb.orph_lebs < MIN_ORPH_LEBS {
        return Err(bad(format!(
            "bad area sizes: log {}, LPT {}, orphans {}",
            sb.log_lebs, sb.lpt_lebs, sb.orph_lebs
        )));
    }
    if sb.jhead_cnt < NONDATA_JHEADS_CNT + 1 || sb.jhead_cnt > NONDATA_JHEADS_CNT + MAX_JHEADS {
        return Err(bad(format!("bad journal head count {}", sb.jhead_cnt)));
    }

    let min_leb_cnt =
        1 + MST_LEBS + sb.log_lebs + sb.lpt_lebs + sb.orph_lebs + sb.jhead_cnt + 6;
    if sb.leb_cnt < min_leb_cnt || sb.leb_cnt > vol.leb_cnt() {
        return Err(bad(format!(
            "bad LEB count: {} in superblock, {} in the volume, min. {}",
            sb.leb_cnt,
            vol.leb_cnt(),
            min_leb_cnt
        )));
    }
    if sb.max_leb_cnt < sb.leb_cnt {
        return Err(bad(format!(
            "max. LEB count {} less than LEB count {}",
            sb.max_leb_cnt, sb.leb_cnt
        )));
    }

    let fs = FsInfo::new(sb.clone()).map_err(|e| bad(e.to_string()))?;
    if fs.main_lebs < MIN_MAIN_LEBS {
        return Err(bad(format!("too few main LEBs: {}", fs.main_lebs)));
    }

    let leb_size = sb.leb_size as u64;
    if sb.max_bud_bytes < leb_size * MIN_BUD_LEBS as u64 || sb.max_bud_bytes > fs.main_bytes() {
        return Err(bad(format!("bad max. bud bytes {}", sb.max_bud_bytes)));
    }
    if sb.fanout < MIN_FANOUT || idx_node_sz(sb.fanout) > sb.leb_size {
        return Err(bad(format!("bad fanout {}", sb.fanout)));
    }
    let lsave_limit = sb.max_leb_cnt - 1 - MST_LEBS - sb.log_lebs - sb.lpt_lebs - sb.orph_lebs;
    if sb.lsave_cnt > DEFAULT_LSAVE_CNT && sb.lsave_cnt > lsave_limit {
        return Err(bad(format!("bad lsave count {}", sb.lsave_cnt)));
    }
    if sb.default_compr >= COMPR_TYPES_CNT {
        return Err(bad(format!("bad default compressor {}", sb.default_compr)));
    }
    if sb.rp_size > fs.main_bytes() {
        return Err(bad(format!("bad reserved pool size {}", sb.rp_size)));
    }
    if sb.time_gran < 1 || sb.time_gran > 1_000_000_000 {
        return Err(bad(format!("bad time granularity {}", sb.time_gran)));
    }
    if !fs.double_hash && sb.fmt_version >= 5 {
        return Err(bad("double hash must be enabled in format version 5".into()));
    }
    if fs.encrypted && sb.fmt_version < 5 {
        return Err(bad("encryption requires format version 5".into()));
    }

    let commit_sz = align(CS_NODE_SZ + REF_NODE_SZ * sb.jhead_cnt, sb.min_io_size);
    if commit_sz > sb.leb_size {
        return Err(bad(format!("LEB size {} cannot fit a commit of {} bytes", sb.leb_size, commit_sz)));
    }
    let bits = &fs.lpt_bits;
    if bits.ltab_sz > sb.leb_size as usize || bits.lsave_sz > sb.leb_size as usize {
        return Err(bad("LPT LEBs too small for the LPT tables".into()));
    }

    tracing::debug!(
        "superblock: {} LEBs of {} bytes, main area {}..{}, fanout {}",
        fs.leb_cnt,
        fs.leb_size,
        fs.main_first,
        fs.leb_cnt,
        fs.fanout
    );
    Ok(fs)
}
