/// Logical eraseblock (LEB) volume access
///
/// The checker works on a volume of equally sized LEBs. A LEB is either
/// unmapped (reads back as erased flash) or mapped and written from the start
/// in minimal I/O units. `change` replaces the whole contents of a LEB
/// atomically; partial contents are padded with erased bytes.

pub mod image;
pub mod mem;
pub mod scan;

pub use image::ImageVolume;
pub use mem::MemVolume;
pub use scan::{scan_leb, NodeRanges, ScannedLeb, ScannedNode};

use crate::error::{FsckError, Result};

pub trait Volume {
    fn leb_size(&self) -> u32;
    fn leb_cnt(&self) -> u32;
    fn min_io_size(&self) -> u32;
    fn is_read_only(&self) -> bool;

    /// Read `buf.len()` bytes at `offs` of LEB `lnum`
    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offs` of LEB `lnum`
    fn write(&mut self, lnum: u32, offs: u32, data: &[u8]) -> Result<()>;

    /// Atomically replace the contents of LEB `lnum` with `data`
    fn change(&mut self, lnum: u32, data: &[u8]) -> Result<()>;

    fn unmap(&mut self, lnum: u32) -> Result<()>;

    fn is_mapped(&self, lnum: u32) -> Result<bool>;

    fn read_leb(&self, lnum: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.leb_size() as usize];
        self.read(lnum, 0, &mut buf)?;
        Ok(buf)
    }

    /// True when no LEB of the volume is mapped
    fn is_empty(&self) -> Result<bool> {
        for lnum in 0..self.leb_cnt() {
            if self.is_mapped(lnum)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Bounds check shared by the volume implementations
pub(crate) fn check_range(vol: &dyn Volume, lnum: u32, offs: u32, len: usize) -> Result<()> {
    if lnum >= vol.leb_cnt() {
        return Err(FsckError::InvalidGeometry(format!(
            "LEB {} beyond the end of the volume ({} LEBs)",
            lnum,
            vol.leb_cnt()
        )));
    }
    if offs as u64 + len as u64 > vol.leb_size() as u64 {
        return Err(FsckError::InvalidGeometry(format!(
            "access {}:{} of {} bytes crosses the LEB boundary",
            lnum, offs, len
        )));
    }
    Ok(())
}
