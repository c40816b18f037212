/// In-memory volume

use super::{check_range, Volume};
use crate::error::{FsckError, Result};
use crate::media::EMPTY_BYTE;

pub struct MemVolume {
    data: Vec<u8>,
    mapped: Vec<bool>,
    leb_size: u32,
    min_io_size: u32,
    read_only: bool,
    writes: u64,
}

impl MemVolume {
    pub fn new(leb_size: u32, leb_cnt: u32, min_io_size: u32) -> Self {
        Self {
            data: vec![EMPTY_BYTE; leb_size as usize * leb_cnt as usize],
            mapped: vec![false; leb_cnt as usize],
            leb_size,
            min_io_size,
            read_only: false,
            writes: 0,
        }
    }

    /// Wrap a raw image; LEBs that are not all erased count as mapped
    pub fn from_image(data: Vec<u8>, leb_size: u32, min_io_size: u32) -> Self {
        let leb_cnt = data.len() / leb_size as usize;
        let mut data = data;
        data.truncate(leb_cnt * leb_size as usize);
        let mapped = data
            .chunks_exact(leb_size as usize)
            .map(|leb| leb.iter().any(|&b| b != EMPTY_BYTE))
            .collect();
        Self {
            data,
            mapped,
            leb_size,
            min_io_size,
            read_only: false,
            writes: 0,
        }
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Number of modifying operations performed so far
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Raw access for fault injection
    pub fn raw_mut(&mut self, lnum: u32) -> &mut [u8] {
        let start = lnum as usize * self.leb_size as usize;
        self.mapped[lnum as usize] = true;
        &mut self.data[start..start + self.leb_size as usize]
    }

    pub fn raw(&self, lnum: u32) -> &[u8] {
        let start = lnum as usize * self.leb_size as usize;
        &self.data[start..start + self.leb_size as usize]
    }

    fn modify(&mut self) -> Result<()> {
        if self.read_only {
            return Err(FsckError::ReadOnly);
        }
        self.writes += 1;
        Ok(())
    }
}

impl Volume for MemVolume {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_cnt(&self) -> u32 {
        self.mapped.len() as u32
    }

    fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        check_range(self, lnum, offs, buf.len())?;
        let start = lnum as usize * self.leb_size as usize + offs as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, lnum: u32, offs: u32, data: &[u8]) -> Result<()> {
        check_range(self, lnum, offs, data.len())?;
        self.modify()?;
        let start = lnum as usize * self.leb_size as usize + offs as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.mapped[lnum as usize] = true;
        Ok(())
    }

    fn change(&mut self, lnum: u32, data: &[u8]) -> Result<()> {
        check_range(self, lnum, 0, data.len())?;
        self.modify()?;
        let leb = self.raw_mut(lnum);
        leb.fill(EMPTY_BYTE);
        leb[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn unmap(&mut self, lnum: u32) -> Result<()> {
        check_range(self, lnum, 0, 0)?;
        self.modify()?;
        self.raw_mut(lnum).fill(EMPTY_BYTE);
        self.mapped[lnum as usize] = false;
        Ok(())
    }

    fn is_mapped(&self, lnum: u32) -> Result<bool> {
        check_range(self, lnum, 0, 0)?;
        Ok(self.mapped[lnum as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_unmap() {
        let mut vol = MemVolume::new(16384, 4, 8);
        assert!(vol.is_empty().unwrap());
        vol.write(2, 8, b"abcdefgh").unwrap();
        assert!(vol.is_mapped(2).unwrap());
        let mut buf = [0u8; 8];
        vol.read(2, 8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        vol.unmap(2).unwrap();
        assert!(vol.is_empty().unwrap());
        assert_eq!(vol.write_count(), 2);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let mut vol = MemVolume::new(16384, 4, 8);
        vol.set_read_only(true);
        assert!(matches!(vol.write(0, 0, &[1]), Err(FsckError::ReadOnly)));
        assert!(matches!(vol.change(0, &[1]), Err(FsckError::ReadOnly)));
        assert_eq!(vol.write_count(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let vol = MemVolume::new(16384, 4, 8);
        let mut buf = [0u8; 16];
        assert!(vol.read(4, 0, &mut buf).is_err());
        assert!(vol.read(0, 16380, &mut buf).is_err());
    }
}
