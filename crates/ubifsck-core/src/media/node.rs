/// Typed node codecs
///
/// Each node type decodes from a complete node buffer (common header
/// included) and encodes back into a sealed buffer. Decoding only checks that
/// the buffer is long enough; range checks belong to the callers.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::key::{Key, KEY_LEN, MAX_KEY_LEN};
use super::*;

// ============================================================================
// Inode node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InoNode {
    pub key: Key,
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub atime_nsec: u32,
    pub ctime_nsec: u32,
    pub mtime_nsec: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub data_len: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub xattr_names: u32,
    pub compr_type: u16,
    pub data: Vec<u8>,
}

impl InoNode {
    pub const SIZE: usize = INO_NODE_SZ as usize;

    /// Field offsets patched in place by the reconciler
    pub const OFFS_SIZE: usize = 48;
    pub const OFFS_NLINK: usize = 92;
    pub const OFFS_XATTR_CNT: usize = 116;
    pub const OFFS_XATTR_SIZE: usize = 120;
    pub const OFFS_XATTR_NAMES: usize = 128;

    /// A fresh inode with all times set to `now` (seconds since the epoch)
    pub fn new(inum: u32, mode: u32, nlink: u32, size: u64, now: u64) -> Self {
        Self {
            key: Key::ino(inum),
            creat_sqnum: 0,
            size,
            atime_sec: now,
            ctime_sec: now,
            mtime_sec: now,
            atime_nsec: 0,
            ctime_nsec: 0,
            mtime_nsec: 0,
            nlink,
            uid: 0,
            gid: 0,
            mode,
            flags: 0,
            data_len: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            compr_type: COMPR_NONE,
            data: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for inode node");
        }
        let key = Key::read(&data[24..])?;
        let mut cursor = Cursor::new(&data[40..]);
        let creat_sqnum = cursor.read_u64::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let atime_sec = cursor.read_u64::<LittleEndian>()?;
        let ctime_sec = cursor.read_u64::<LittleEndian>()?;
        let mtime_sec = cursor.read_u64::<LittleEndian>()?;
        let atime_nsec = cursor.read_u32::<LittleEndian>()?;
        let ctime_nsec = cursor.read_u32::<LittleEndian>()?;
        let mtime_nsec = cursor.read_u32::<LittleEndian>()?;
        let nlink = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let data_len = cursor.read_u32::<LittleEndian>()?;
        let xattr_cnt = cursor.read_u32::<LittleEndian>()?;
        let xattr_size = cursor.read_u32::<LittleEndian>()?;
        let xattr_names = LittleEndian::read_u32(&data[128..132]);
        let compr_type = LittleEndian::read_u16(&data[132..134]);

        let end = (Self::SIZE + data_len as usize).min(data.len());
        Ok(Self {
            key,
            creat_sqnum,
            size,
            atime_sec,
            ctime_sec,
            mtime_sec,
            atime_nsec,
            ctime_nsec,
            mtime_nsec,
            nlink,
            uid,
            gid,
            mode,
            flags,
            data_len,
            xattr_cnt,
            xattr_size,
            xattr_names,
            compr_type,
            data: data[Self::SIZE..end].to_vec(),
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE + self.data.len()];
        self.key.write(&mut buf[24..24 + MAX_KEY_LEN]);
        LittleEndian::write_u64(&mut buf[40..48], self.creat_sqnum);
        LittleEndian::write_u64(&mut buf[48..56], self.size);
        LittleEndian::write_u64(&mut buf[56..64], self.atime_sec);
        LittleEndian::write_u64(&mut buf[64..72], self.ctime_sec);
        LittleEndian::write_u64(&mut buf[72..80], self.mtime_sec);
        LittleEndian::write_u32(&mut buf[80..84], self.atime_nsec);
        LittleEndian::write_u32(&mut buf[84..88], self.ctime_nsec);
        LittleEndian::write_u32(&mut buf[88..92], self.mtime_nsec);
        LittleEndian::write_u32(&mut buf[92..96], self.nlink);
        LittleEndian::write_u32(&mut buf[96..100], self.uid);
        LittleEndian::write_u32(&mut buf[100..104], self.gid);
        LittleEndian::write_u32(&mut buf[104..108], self.mode);
        LittleEndian::write_u32(&mut buf[108..112], self.flags);
        LittleEndian::write_u32(&mut buf[112..116], self.data.len() as u32);
        LittleEndian::write_u32(&mut buf[116..120], self.xattr_cnt);
        LittleEndian::write_u32(&mut buf[120..124], self.xattr_size);
        LittleEndian::write_u32(&mut buf[128..132], self.xattr_names);
        LittleEndian::write_u16(&mut buf[132..134], self.compr_type);
        buf[Self::SIZE..].copy_from_slice(&self.data);
        seal_node(&mut buf, NodeType::Ino, sqnum);
        buf
    }
}

// ============================================================================
// Directory / extended attribute entry node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentNode {
    pub key: Key,
    pub inum: u64,
    pub itype: u8,
    pub nlen: u16,
    pub cookie: u32,
    pub name: Vec<u8>,
    /// Whether the byte after the name is the terminating zero
    pub name_terminated: bool,
}

impl DentNode {
    pub const SIZE: usize = DENT_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for directory entry node");
        }
        let key = Key::read(&data[24..])?;
        let inum = LittleEndian::read_u64(&data[40..48]);
        let itype = data[49];
        let nlen = LittleEndian::read_u16(&data[50..52]);
        let cookie = LittleEndian::read_u32(&data[52..56]);
        let name_end = (Self::SIZE + nlen as usize).min(data.len());
        let name = data[Self::SIZE..name_end].to_vec();
        let name_terminated = data.get(Self::SIZE + nlen as usize) == Some(&0);
        Ok(Self {
            key,
            inum,
            itype,
            nlen,
            cookie,
            name,
            name_terminated,
        })
    }

    pub fn encode(&self, node_type: NodeType, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE + self.name.len() + 1];
        self.key.write(&mut buf[24..24 + MAX_KEY_LEN]);
        LittleEndian::write_u64(&mut buf[40..48], self.inum);
        buf[49] = self.itype;
        LittleEndian::write_u16(&mut buf[50..52], self.name.len() as u16);
        LittleEndian::write_u32(&mut buf[52..56], self.cookie);
        buf[Self::SIZE..Self::SIZE + self.name.len()].copy_from_slice(&self.name);
        seal_node(&mut buf, node_type, sqnum);
        buf
    }
}

// ============================================================================
// Data node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub key: Key,
    /// Uncompressed size of the block
    pub size: u32,
    pub compr_type: u16,
    pub compr_size: u16,
    pub data: Vec<u8>,
}

impl DataNode {
    pub const SIZE: usize = DATA_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for data node");
        }
        Ok(Self {
            key: Key::read(&data[24..])?,
            size: LittleEndian::read_u32(&data[40..44]),
            compr_type: LittleEndian::read_u16(&data[44..46]),
            compr_size: LittleEndian::read_u16(&data[46..48]),
            data: data[Self::SIZE..].to_vec(),
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE + self.data.len()];
        self.key.write(&mut buf[24..24 + MAX_KEY_LEN]);
        LittleEndian::write_u32(&mut buf[40..44], self.size);
        LittleEndian::write_u16(&mut buf[44..46], self.compr_type);
        LittleEndian::write_u16(&mut buf[46..48], self.compr_size);
        buf[Self::SIZE..].copy_from_slice(&self.data);
        seal_node(&mut buf, NodeType::Data, sqnum);
        buf
    }
}

// ============================================================================
// Truncation node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunNode {
    pub inum: u32,
    pub old_size: u64,
    pub new_size: u64,
}

impl TrunNode {
    pub const SIZE: usize = TRUN_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for truncation node");
        }
        Ok(Self {
            inum: LittleEndian::read_u32(&data[24..28]),
            old_size: LittleEndian::read_u64(&data[40..48]),
            new_size: LittleEndian::read_u64(&data[48..56]),
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[24..28], self.inum);
        LittleEndian::write_u64(&mut buf[40..48], self.old_size);
        LittleEndian::write_u64(&mut buf[48..56], self.new_size);
        seal_node(&mut buf, NodeType::Trun, sqnum);
        buf
    }
}

// ============================================================================
// Padding node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadNode {
    pub pad_len: u32,
}

impl PadNode {
    pub const SIZE: usize = PAD_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for padding node");
        }
        Ok(Self {
            pad_len: LittleEndian::read_u32(&data[24..28]),
        })
    }
}

// ============================================================================
// Log nodes: commit start and reference
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsNode {
    pub cmt_no: u64,
}

impl CsNode {
    pub const SIZE: usize = CS_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for commit start node");
        }
        Ok(Self {
            cmt_no: LittleEndian::read_u64(&data[24..32]),
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u64(&mut buf[24..32], self.cmt_no);
        seal_node(&mut buf, NodeType::Cs, sqnum);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefNode {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

impl RefNode {
    pub const SIZE: usize = REF_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for reference node");
        }
        let mut cursor = Cursor::new(&data[24..]);
        Ok(Self {
            lnum: cursor.read_u32::<LittleEndian>()?,
            offs: cursor.read_u32::<LittleEndian>()?,
            jhead: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[24..28], self.lnum);
        LittleEndian::write_u32(&mut buf[28..32], self.offs);
        LittleEndian::write_u32(&mut buf[32..36], self.jhead);
        seal_node(&mut buf, NodeType::Ref, sqnum);
        buf
    }
}

// ============================================================================
// Orphan node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphNode {
    /// Commit number; the top bit marks the last node of a commit
    pub cmt_no: u64,
    pub inos: Vec<u64>,
}

impl OrphNode {
    pub const SIZE: usize = ORPH_NODE_SZ as usize;
    pub const LAST_BIT: u64 = 1 << 63;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for orphan node");
        }
        let cmt_no = LittleEndian::read_u64(&data[24..32]);
        let inos = data[Self::SIZE..]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect();
        Ok(Self { cmt_no, inos })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE + self.inos.len() * 8];
        LittleEndian::write_u64(&mut buf[24..32], self.cmt_no);
        for (i, ino) in self.inos.iter().enumerate() {
            let offs = Self::SIZE + i * 8;
            LittleEndian::write_u64(&mut buf[offs..offs + 8], *ino);
        }
        seal_node(&mut buf, NodeType::Orph, sqnum);
        buf
    }
}

// ============================================================================
// Index node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: Key,
}

impl Branch {
    pub const SIZE: usize = BRANCH_SZ as usize + KEY_LEN;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxNode {
    pub level: u16,
    pub branches: Vec<Branch>,
}

impl IdxNode {
    pub const SIZE: usize = IDX_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for index node");
        }
        let child_cnt = LittleEndian::read_u16(&data[24..26]) as usize;
        let level = LittleEndian::read_u16(&data[26..28]);
        if data.len() < Self::SIZE + child_cnt * Branch::SIZE {
            bail!("Insufficient data for {} index branches", child_cnt);
        }
        let mut branches = Vec::with_capacity(child_cnt);
        for i in 0..child_cnt {
            let br = &data[Self::SIZE + i * Branch::SIZE..];
            let mut cursor = Cursor::new(br);
            branches.push(Branch {
                lnum: cursor.read_u32::<LittleEndian>()?,
                offs: cursor.read_u32::<LittleEndian>()?,
                len: cursor.read_u32::<LittleEndian>()?,
                key: Key::read(&br[BRANCH_SZ as usize..])?,
            });
        }
        Ok(Self { level, branches })
    }

    pub fn encoded_len(&self) -> usize {
        idx_node_sz(self.branches.len() as u32) as usize
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        LittleEndian::write_u16(&mut buf[24..26], self.branches.len() as u16);
        LittleEndian::write_u16(&mut buf[26..28], self.level);
        for (i, br) in self.branches.iter().enumerate() {
            let offs = Self::SIZE + i * Branch::SIZE;
            LittleEndian::write_u32(&mut buf[offs..offs + 4], br.lnum);
            LittleEndian::write_u32(&mut buf[offs + 4..offs + 8], br.offs);
            LittleEndian::write_u32(&mut buf[offs + 8..offs + 12], br.len);
            br.key.write(&mut buf[offs + 12..offs + 12 + KEY_LEN]);
        }
        seal_node(&mut buf, NodeType::Idx, sqnum);
        buf
    }
}

// ============================================================================
// Master node
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MstNode {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
    pub gc_lnum: u32,
    pub ihead_lnum: u32,
    pub ihead_offs: u32,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
    pub lscan_lnum: u32,
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub leb_cnt: u32,
}

impl MstNode {
    pub const SIZE: usize = MST_NODE_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for master node");
        }
        let mut cursor = Cursor::new(&data[24..]);
        Ok(Self {
            highest_inum: cursor.read_u64::<LittleEndian>()?,
            cmt_no: cursor.read_u64::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            log_lnum: cursor.read_u32::<LittleEndian>()?,
            root_lnum: cursor.read_u32::<LittleEndian>()?,
            root_offs: cursor.read_u32::<LittleEndian>()?,
            root_len: cursor.read_u32::<LittleEndian>()?,
            gc_lnum: cursor.read_u32::<LittleEndian>()?,
            ihead_lnum: cursor.read_u32::<LittleEndian>()?,
            ihead_offs: cursor.read_u32::<LittleEndian>()?,
            index_size: cursor.read_u64::<LittleEndian>()?,
            total_free: cursor.read_u64::<LittleEndian>()?,
            total_dirty: cursor.read_u64::<LittleEndian>()?,
            total_used: cursor.read_u64::<LittleEndian>()?,
            total_dead: cursor.read_u64::<LittleEndian>()?,
            total_dark: cursor.read_u64::<LittleEndian>()?,
            lpt_lnum: cursor.read_u32::<LittleEndian>()?,
            lpt_offs: cursor.read_u32::<LittleEndian>()?,
            nhead_lnum: cursor.read_u32::<LittleEndian>()?,
            nhead_offs: cursor.read_u32::<LittleEndian>()?,
            ltab_lnum: cursor.read_u32::<LittleEndian>()?,
            ltab_offs: cursor.read_u32::<LittleEndian>()?,
            lsave_lnum: cursor.read_u32::<LittleEndian>()?,
            lsave_offs: cursor.read_u32::<LittleEndian>()?,
            lscan_lnum: cursor.read_u32::<LittleEndian>()?,
            empty_lebs: cursor.read_u32::<LittleEndian>()?,
            idx_lebs: cursor.read_u32::<LittleEndian>()?,
            leb_cnt: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        let mut offs = 24;
        let put64 = |buf: &mut [u8], offs: &mut usize, v: u64| {
            LittleEndian::write_u64(&mut buf[*offs..*offs + 8], v);
            *offs += 8;
        };
        put64(&mut buf, &mut offs, self.highest_inum);
        put64(&mut buf, &mut offs, self.cmt_no);
        let words = [
            self.flags,
            self.log_lnum,
            self.root_lnum,
            self.root_offs,
            self.root_len,
            self.gc_lnum,
            self.ihead_lnum,
            self.ihead_offs,
        ];
        for w in words {
            LittleEndian::write_u32(&mut buf[offs..offs + 4], w);
            offs += 4;
        }
        for v in [
            self.index_size,
            self.total_free,
            self.total_dirty,
            self.total_used,
            self.total_dead,
            self.total_dark,
        ] {
            put64(&mut buf, &mut offs, v);
        }
        let words = [
            self.lpt_lnum,
            self.lpt_offs,
            self.nhead_lnum,
            self.nhead_offs,
            self.ltab_lnum,
            self.ltab_offs,
            self.lsave_lnum,
            self.lsave_offs,
            self.lscan_lnum,
            self.empty_lebs,
            self.idx_lebs,
            self.leb_cnt,
        ];
        for w in words {
            LittleEndian::write_u32(&mut buf[offs..offs + 4], w);
            offs += 4;
        }
        seal_node(&mut buf, NodeType::Mst, sqnum);
        buf
    }
}

// ============================================================================
// Superblock node
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbNode {
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub lsave_cnt: u32,
    pub fmt_version: u32,
    pub default_compr: u16,
    pub rp_uid: u32,
    pub rp_gid: u32,
    pub rp_size: u64,
    pub time_gran: u32,
    pub uuid: [u8; 16],
    pub ro_compat_version: u32,
}

impl SbNode {
    pub const SIZE: usize = SB_NODE_SZ as usize;
    /// Bytes needed to decode every field this crate uses
    pub const USED_SIZE: usize = 128;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::USED_SIZE {
            bail!("Insufficient data for superblock node");
        }
        let key_hash = data[26];
        let key_fmt = data[27];
        let mut cursor = Cursor::new(&data[28..]);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let min_io_size = cursor.read_u32::<LittleEndian>()?;
        let leb_size = cursor.read_u32::<LittleEndian>()?;
        let leb_cnt = cursor.read_u32::<LittleEndian>()?;
        let max_leb_cnt = cursor.read_u32::<LittleEndian>()?;
        let max_bud_bytes = cursor.read_u64::<LittleEndian>()?;
        let log_lebs = cursor.read_u32::<LittleEndian>()?;
        let lpt_lebs = cursor.read_u32::<LittleEndian>()?;
        let orph_lebs = cursor.read_u32::<LittleEndian>()?;
        let jhead_cnt = cursor.read_u32::<LittleEndian>()?;
        let fanout = cursor.read_u32::<LittleEndian>()?;
        let lsave_cnt = cursor.read_u32::<LittleEndian>()?;
        let fmt_version = cursor.read_u32::<LittleEndian>()?;
        let default_compr = LittleEndian::read_u16(&data[84..86]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[108..124]);
        Ok(Self {
            key_hash,
            key_fmt,
            flags,
            min_io_size,
            leb_size,
            leb_cnt,
            max_leb_cnt,
            max_bud_bytes,
            log_lebs,
            lpt_lebs,
            orph_lebs,
            jhead_cnt,
            fanout,
            lsave_cnt,
            fmt_version,
            default_compr,
            rp_uid: LittleEndian::read_u32(&data[88..92]),
            rp_gid: LittleEndian::read_u32(&data[92..96]),
            rp_size: LittleEndian::read_u64(&data[96..104]),
            time_gran: LittleEndian::read_u32(&data[104..108]),
            uuid,
            ro_compat_version: LittleEndian::read_u32(&data[124..128]),
        })
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[26] = self.key_hash;
        buf[27] = self.key_fmt;
        let words = [
            self.flags,
            self.min_io_size,
            self.leb_size,
            self.leb_cnt,
            self.max_leb_cnt,
        ];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[28 + i * 4..32 + i * 4], *w);
        }
        LittleEndian::write_u64(&mut buf[48..56], self.max_bud_bytes);
        let words = [
            self.log_lebs,
            self.lpt_lebs,
            self.orph_lebs,
            self.jhead_cnt,
            self.fanout,
            self.lsave_cnt,
            self.fmt_version,
        ];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[56 + i * 4..60 + i * 4], *w);
        }
        LittleEndian::write_u16(&mut buf[84..86], self.default_compr);
        LittleEndian::write_u32(&mut buf[88..92], self.rp_uid);
        LittleEndian::write_u32(&mut buf[92..96], self.rp_gid);
        LittleEndian::write_u64(&mut buf[96..104], self.rp_size);
        LittleEndian::write_u32(&mut buf[104..108], self.time_gran);
        buf[108..124].copy_from_slice(&self.uuid);
        LittleEndian::write_u32(&mut buf[124..128], self.ro_compat_version);
        seal_node(&mut buf, NodeType::Sb, sqnum);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ino_node_layout() {
        let ino = InoNode {
            key: Key::ino(65),
            creat_sqnum: 7,
            size: 4100,
            atime_sec: 1,
            ctime_sec: 2,
            mtime_sec: 3,
            atime_nsec: 0,
            ctime_nsec: 0,
            mtime_nsec: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            mode: S_IFREG | 0o644,
            flags: COMPR_FL,
            data_len: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            compr_type: COMPR_NONE,
            data: Vec::new(),
        };
        let buf = ino.encode(9);
        assert_eq!(buf.len(), InoNode::SIZE);
        assert_eq!(LittleEndian::read_u64(&buf[InoNode::OFFS_SIZE..]), 4100);
        assert_eq!(LittleEndian::read_u32(&buf[InoNode::OFFS_NLINK..]), 1);
        assert_eq!(InoNode::parse(&buf).unwrap(), ino);
    }

    #[test]
    fn test_dent_node_name() {
        let dent = DentNode {
            key: Key::dent(1, KeyHash::R5.hash(b"etc")),
            inum: 70,
            itype: ITYPE_DIR,
            nlen: 3,
            cookie: 0,
            name: b"etc".to_vec(),
            name_terminated: true,
        };
        let buf = dent.encode(NodeType::Dent, 11);
        assert_eq!(buf.len(), DentNode::SIZE + 4);
        let parsed = DentNode::parse(&buf).unwrap();
        assert_eq!(parsed, dent);
    }

    #[test]
    fn test_idx_node_branches() {
        let idx = IdxNode {
            level: 1,
            branches: vec![
                Branch { lnum: 12, offs: 0, len: 160, key: Key::ino(1) },
                Branch { lnum: 12, offs: 160, len: 64, key: Key::dent(1, 99) },
            ],
        };
        let buf = idx.encode(3);
        assert_eq!(buf.len() as u32, idx_node_sz(2));
        assert_eq!(IdxNode::parse(&buf).unwrap(), idx);
    }

    #[test]
    fn test_mst_node_offsets() {
        let mst = MstNode {
            highest_inum: 64,
            cmt_no: 2,
            root_lnum: 20,
            total_free: 1 << 20,
            leb_cnt: 32,
            ..Default::default()
        };
        let buf = mst.encode(1);
        assert_eq!(LittleEndian::read_u32(&buf[48..52]), 20);
        assert_eq!(LittleEndian::read_u64(&buf[80..88]), 1 << 20);
        assert_eq!(LittleEndian::read_u32(&buf[164..168]), 32);
        assert_eq!(MstNode::parse(&buf).unwrap(), mst);
    }

    #[test]
    fn test_parse_rejects_short_buffers() {
        assert!(InoNode::parse(&[0u8; 100]).is_err());
        assert!(MstNode::parse(&[0u8; 100]).is_err());
        assert!(IdxNode::parse(&[0u8; 10]).is_err());
    }
}
