/// Memory-mapped UBIFS image file
///
/// Images produced by `mkfs.ubifs` stop after the last used LEB; everything
/// beyond the end of the file is erased flash.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use super::{check_range, Volume};
use crate::error::{Corruption, FsckError, Result};
use crate::media::{CommonHeader, NodeType, SbNode, EMPTY_BYTE, NODE_MAGIC};

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

pub struct ImageVolume {
    _file: File,
    map: Mapping,
    leb_size: u32,
    leb_cnt: u32,
    min_io_size: u32,
}

impl ImageVolume {
    /// Open an image, taking the geometry from its superblock
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut head = vec![0u8; SbNode::SIZE];
        let file_len = file.metadata()?.len();
        if file_len < SbNode::SIZE as u64 {
            return Err(FsckError::EmptyVolume);
        }
        (&file).read_exact(&mut head)?;
        let ch = CommonHeader::parse(&head)?;
        if ch.magic != NODE_MAGIC || ch.node_type() != Some(NodeType::Sb) {
            return Err(FsckError::corrupted(
                Corruption::Superblock,
                0,
                0,
                "no superblock at the start of the image",
            ));
        }
        let sb = SbNode::parse(&head)?;
        if sb.leb_size == 0 || !sb.min_io_size.is_power_of_two() {
            return Err(FsckError::InvalidGeometry(format!(
                "LEB size {}, min. I/O unit {}",
                sb.leb_size, sb.min_io_size
            )));
        }
        let file_lebs = (file_len / sb.leb_size as u64) as u32;
        let leb_cnt = file_lebs.max(sb.leb_cnt);
        drop(file);
        Self::open_with_geometry(path, sb.leb_size, leb_cnt, sb.min_io_size, writable)
    }

    /// Open an image with explicit geometry
    pub fn open_with_geometry<P: AsRef<Path>>(
        path: P,
        leb_size: u32,
        leb_cnt: u32,
        min_io_size: u32,
        writable: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        let old_len = file.metadata()?.len();
        let want_len = leb_size as u64 * leb_cnt as u64;

        let map = if writable {
            if old_len < want_len {
                file.set_len(want_len)?;
            }
            let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
            if old_len < want_len {
                mmap[old_len as usize..want_len as usize].fill(EMPTY_BYTE);
            }
            Mapping::Writable(mmap)
        } else {
            if old_len == 0 {
                return Err(FsckError::EmptyVolume);
            }
            Mapping::ReadOnly(unsafe { MmapOptions::new().map(&file)? })
        };

        tracing::debug!(
            "Opened image {}: {} LEBs of {} bytes, min. I/O unit {}",
            path.as_ref().display(),
            leb_cnt,
            leb_size,
            min_io_size
        );
        Ok(Self {
            _file: file,
            map,
            leb_size,
            leb_cnt,
            min_io_size,
        })
    }

    fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::Writable(m) => &m[..],
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Mapping::ReadOnly(_) => Err(FsckError::ReadOnly),
            Mapping::Writable(m) => Ok(&mut m[..]),
        }
    }

    fn leb_start(&self, lnum: u32) -> usize {
        lnum as usize * self.leb_size as usize
    }

    pub fn flush(&self) -> Result<()> {
        if let Mapping::Writable(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}

impl Volume for ImageVolume {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_cnt(&self) -> u32 {
        self.leb_cnt
    }

    fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    fn is_read_only(&self) -> bool {
        matches!(self.map, Mapping::ReadOnly(_))
    }

    fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        check_range(self, lnum, offs, buf.len())?;
        let start = self.leb_start(lnum) + offs as usize;
        let bytes = self.bytes();
        buf.fill(EMPTY_BYTE);
        if start < bytes.len() {
            let avail = (bytes.len() - start).min(buf.len());
            buf[..avail].copy_from_slice(&bytes[start..start + avail]);
        }
        Ok(())
    }

    fn write(&mut self, lnum: u32, offs: u32, data: &[u8]) -> Result<()> {
        check_range(self, lnum, offs, data.len())?;
        let start = self.leb_start(lnum) + offs as usize;
        let bytes = self.bytes_mut()?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn change(&mut self, lnum: u32, data: &[u8]) -> Result<()> {
        check_range(self, lnum, 0, data.len())?;
        let start = self.leb_start(lnum);
        let end = start + self.leb_size as usize;
        let leb = &mut self.bytes_mut()?[start..end];
        leb.fill(EMPTY_BYTE);
        leb[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn unmap(&mut self, lnum: u32) -> Result<()> {
        check_range(self, lnum, 0, 0)?;
        let start = self.leb_start(lnum);
        let end = start + self.leb_size as usize;
        self.bytes_mut()?[start..end].fill(EMPTY_BYTE);
        Ok(())
    }

    fn is_mapped(&self, lnum: u32) -> Result<bool> {
        check_range(self, lnum, 0, 0)?;
        let start = self.leb_start(lnum);
        let bytes = self.bytes();
        if start >= bytes.len() {
            return Ok(false);
        }
        let end = (start + self.leb_size as usize).min(bytes.len());
        Ok(bytes[start..end].iter().any(|&b| b != EMPTY_BYTE))
    }
}
