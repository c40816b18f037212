/// Log and orphan area cleanup after a commit

use crate::error::Result;
use crate::fs::FsInfo;
use crate::media::*;
use crate::volume::Volume;

/// Empty the log and start it with a commit start node for `fs.cmt_no`
pub fn clean_log(vol: &mut dyn Volume, fs: &mut FsInfo) -> Result<()> {
    for lnum in LOG_LNUM..=fs.log_last {
        vol.unmap(lnum)?;
    }
    let mut buf = CsNode { cmt_no: fs.cmt_no }.encode(fs.next_sqnum());
    let start = buf.len();
    let len = align(start as u32, fs.min_io_size) as usize;
    buf.resize(len, 0);
    pad_space(&mut buf[start..]);
    vol.change(LOG_LNUM, &buf)?;
    tracing::debug!("Cleaned log, commit number {}", fs.cmt_no);
    Ok(())
}

pub fn clear_orphans(vol: &mut dyn Volume, fs: &FsInfo) -> Result<()> {
    for lnum in fs.orph_first..=fs.orph_last {
        vol.unmap(lnum)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::test_sb;
    use crate::volume::{scan_leb, MemVolume};

    #[test]
    fn test_clean_log() {
        let mut fs = FsInfo::new(test_sb()).unwrap();
        fs.cmt_no = 7;
        let mut vol = MemVolume::new(fs.leb_size, fs.leb_cnt, fs.min_io_size);
        vol.write(fs.log_last, 0, &[0u8; 64]).unwrap();

        clean_log(&mut vol, &mut fs).unwrap();
        assert!(!vol.is_mapped(fs.log_last).unwrap());
        let sleb = scan_leb(&vol, &fs.ranges, LOG_LNUM, 0).unwrap();
        assert_eq!(sleb.nodes.len(), 1);
        assert_eq!(CsNode::parse(&sleb.nodes[0].data).unwrap().cmt_no, 7);
    }
}
