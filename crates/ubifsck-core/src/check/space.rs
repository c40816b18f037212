/// Space accounting verification
///
/// The per-LEB properties are derived again from what the index references
/// and compared with the on-flash LPT, then the master statistics and the
/// index size are compared with the derived totals. An accepted fix means the
/// LPT and master are rewritten by a commit.
///
/// LEBs the journal wrote to after the last commit are not judged: the LPT
/// only catches up with them at the next commit, so their on-flash entries
/// are taken as they are.

use crate::check::problem::{Policy, Problem};
use std::collections::BTreeSet;

use crate::error::{Corruption, FsckError, Result};
use crate::fs::lpt::{calc_lprops, calc_stats, LpStats, Lprops};
use crate::fs::tnc::Tnc;
use crate::fs::FsInfo;
use crate::media::MstNode;
use crate::volume::Volume;

#[derive(Debug, Clone, Default)]
pub struct SpaceCheck {
    pub lprops: Vec<Lprops>,
    pub stats: LpStats,
    /// LEBs whose on-flash properties were wrong
    pub bad_lebs: usize,
    pub needs_commit: bool,
}

/// Compare the on-flash LPT (`None` when it could not be read) with the
/// properties derived from `tnc`, leaving out the LEBs in `buds`
pub fn check_space(
    vol: &dyn Volume,
    fs: &FsInfo,
    tnc: &Tnc,
    mst: &MstNode,
    on_flash: Option<&[Lprops]>,
    buds: &BTreeSet<u32>,
    policy: &mut Policy,
) -> Result<SpaceCheck> {
    let mut lprops = calc_lprops(vol, fs, tnc, Some(mst.gc_lnum))?;
    check_conservation(fs, &lprops)?;
    if let Some(old) = on_flash {
        for &lnum in buds {
            let Some(i) = lnum.checked_sub(fs.main_first) else {
                continue;
            };
            if let (Some(calc), Some(read)) = (lprops.get_mut(i as usize), old.get(i as usize)) {
                *calc = *read;
            }
        }
    }
    let stats = calc_stats(fs, &lprops);
    let mut out = SpaceCheck {
        lprops,
        stats,
        ..SpaceCheck::default()
    };

    match on_flash {
        None => {
            if policy.fix_problem(Problem::LptCorrupted, None)? {
                out.needs_commit = true;
            }
        }
        Some(old) => {
            for (i, (calc, read)) in out.lprops.iter().zip(old).enumerate() {
                if calc.same_as(read, fs.leb_size) {
                    continue;
                }
                out.bad_lebs += 1;
                let detail = format!(
                    "LEB {}: free {} dirty {} index {}, should be free {} dirty {} index {}",
                    fs.main_first + i as u32,
                    read.free,
                    read.dirty,
                    read.index,
                    calc.free,
                    calc.dirty,
                    calc.index
                );
                if policy.fix_problem(Problem::LpIncorrect, Some(&detail))? {
                    out.needs_commit = true;
                }
            }
            let recorded = LpStats::from_master(mst);
            if out.bad_lebs == 0 && recorded != out.stats {
                let detail = format!("recorded {:?}, calculated {:?}", recorded, out.stats);
                if policy.fix_problem(Problem::SpaceStatIncorrect, Some(&detail))? {
                    out.needs_commit = true;
                }
            }
        }
    }

    let index_size = tnc.index_size();
    if index_size != mst.index_size {
        let detail = format!("index size {}, should be {}", mst.index_size, index_size);
        if policy.fix_problem(Problem::IncorrectIdxSz, Some(&detail))? {
            out.needs_commit = true;
        }
    }

    tracing::debug!(
        "Space: {} free, {} dirty, {} used, {} empty LEBs",
        out.stats.total_free,
        out.stats.total_dirty,
        out.stats.total_used,
        out.stats.empty_lebs
    );
    Ok(out)
}

/// Every derived LEB must account for all of its bytes
fn check_conservation(fs: &FsInfo, lprops: &[Lprops]) -> Result<()> {
    for (i, lp) in lprops.iter().enumerate() {
        if lp.free as u64 + lp.dirty as u64 > fs.leb_size as u64 {
            let lnum = fs.main_first + i as u32;
            return Err(FsckError::corrupted(
                Corruption::Lpt,
                lnum,
                0,
                format!("free {} and dirty {} exceed the LEB size", lp.free, lp.dirty),
            ));
        }
    }
    let total: u64 = lprops
        .iter()
        .map(|lp| (lp.free + lp.dirty + lp.used(fs.leb_size)) as u64)
        .sum();
    if lprops.len() != fs.main_lebs as usize || total != fs.main_bytes() {
        return Err(FsckError::corrupted(
            Corruption::Lpt,
            fs.main_first,
            0,
            format!("{} LEBs account for {} bytes, main area has {}", lprops.len(), total, fs.main_bytes()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::problem::Mode;
    use crate::fs::tests::test_sb;
    use crate::volume::MemVolume;

    #[test]
    fn test_empty_volume_matches_empty_lpt() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let tnc = Tnc::new();
        let old = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        let mut mst = MstNode::default();
        calc_stats(&fs, &old).store(&mut mst);

        let mut policy = Policy::new(Mode::Check);
        let out = check_space(&vol, &fs, &tnc, &mst, Some(&old), &BTreeSet::new(), &mut policy).unwrap();
        assert_eq!(out.bad_lebs, 0);
        assert!(!out.needs_commit);
        assert_eq!(policy.problem_count(), 0);
    }

    #[test]
    fn test_wrong_lprops_and_stats() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let tnc = Tnc::new();
        let mut old = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        old[2] = Lprops { free: 0, dirty: 100, index: false };
        let mst = MstNode::default();

        let mut policy = Policy::new(Mode::Danger0);
        let out = check_space(&vol, &fs, &tnc, &mst, Some(&old), &BTreeSet::new(), &mut policy).unwrap();
        assert_eq!(out.bad_lebs, 1);
        assert!(out.needs_commit);
        assert_eq!(policy.detected()[&Problem::LpIncorrect], 1);
        // statistics are only judged once every LEB agrees
        assert!(!policy.detected().contains_key(&Problem::SpaceStatIncorrect));

        let mut policy = Policy::new(Mode::Check);
        let out = check_space(&vol, &fs, &tnc, &mst, None, &BTreeSet::new(), &mut policy).unwrap();
        assert!(!out.needs_commit);
        assert_eq!(policy.detected()[&Problem::LptCorrupted], 1);
    }

    #[test]
    fn test_bud_lebs_are_not_judged() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        let tnc = Tnc::new();
        let mut old = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        old[2] = Lprops { free: 0, dirty: 100, index: false };
        let mut mst = MstNode::default();
        calc_stats(&fs, &old).store(&mut mst);

        let buds = BTreeSet::from([fs.main_first + 2]);
        let mut policy = Policy::new(Mode::Check);
        let out = check_space(&vol, &fs, &tnc, &mst, Some(&old), &buds, &mut policy).unwrap();
        assert_eq!(out.bad_lebs, 0);
        assert_eq!(policy.problem_count(), 0, "{:?}", policy.detected());

        // the same entry outside the journal is wrong
        old[3] = old[2];
        let out = check_space(&vol, &fs, &tnc, &mst, Some(&old), &buds, &mut policy).unwrap();
        assert_eq!(out.bad_lebs, 1);
        assert_eq!(policy.detected()[&Problem::LpIncorrect], 1);
    }

    #[test]
    fn test_unbalanced_lprops_are_corruption() {
        let fs = FsInfo::new(test_sb()).unwrap();
        let mut lprops = vec![Lprops::empty(fs.leb_size); fs.main_lebs as usize];
        assert!(check_conservation(&fs, &lprops).is_ok());

        lprops[3] = Lprops { free: fs.leb_size, dirty: 8, index: false };
        let err = check_conservation(&fs, &lprops).unwrap_err();
        assert_eq!(err.corruption(), Some(Corruption::Lpt));

        lprops[3] = Lprops::empty(fs.leb_size);
        lprops.pop();
        assert!(check_conservation(&fs, &lprops).is_err());
    }
}
