/// UBIFS on-flash media format
///
/// Constants, the common node header and node checksums. Every node on flash
/// starts with the same 24-byte common header; the CRC32 stored in the header
/// covers the whole node except its first 8 bytes (magic and CRC itself).
/// All multi-byte fields are little-endian.

pub mod key;
pub mod lpt;
pub mod node;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub use key::{Key, KeyHash, KeyType};
pub use node::{
    Branch, CsNode, DataNode, DentNode, IdxNode, InoNode, MstNode, OrphNode, PadNode, RefNode,
    SbNode, TrunNode,
};

// ============================================================================
// Constants
// ============================================================================

/// Node magic number
pub const NODE_MAGIC: u32 = 0x0610_1831;

/// Byte used to fill gaps too small for a padding node
pub const PADDING_BYTE: u8 = 0xCE;

/// Erased flash contents
pub const EMPTY_BYTE: u8 = 0xFF;

/// Data block size
pub const BLOCK_SIZE: u32 = 4096;
pub const BLOCK_SHIFT: u32 = 12;

pub const MAX_NLEN: usize = 255;
pub const MAX_INO_DATA: u32 = BLOCK_SIZE;
pub const XATTR_LIST_MAX: u32 = 65536;

/// Inode numbers above this are never allocated
pub const INUM_WATERMARK: u64 = 0xFFFF_FF00;

pub const ROOT_INO: u64 = 1;
pub const FIRST_INO: u64 = 64;

/// Name of the extended attribute holding the encryption context
pub const XATTR_NAME_ENCRYPTION_CONTEXT: &[u8] = b"c";

/// Fixed LEB layout at the start of the volume
pub const SB_LNUM: u32 = 0;
pub const MST_LNUM: u32 = 1;
pub const MST_LEBS: u32 = 2;
pub const LOG_LNUM: u32 = 3;

pub const MIN_LEB_SZ: u32 = 15 * 1024;
pub const MAX_LEB_SZ: u32 = 2 * 1024 * 1024;
pub const MIN_LOG_LEBS: u32 = 2;
pub const MIN_BUD_LEBS: u32 = 3;
pub const MIN_LPT_LEBS: u32 = 2;
pub const MIN_ORPH_LEBS: u32 = 1;
pub const MIN_MAIN_LEBS: u32 = MIN_BUD_LEBS + 6;
pub const MIN_FANOUT: u32 = 3;
pub const MAX_LEVELS: u16 = 512;
pub const DEFAULT_LSAVE_CNT: u32 = 256;

/// Journal heads: GC, base, data
pub const NONDATA_JHEADS_CNT: u32 = 2;
pub const MAX_JHEADS: u32 = 1;
pub const GCHD: u32 = 0;
pub const BASEHD: u32 = 1;
pub const DATAHD: u32 = 2;

pub const FORMAT_VERSION: u32 = 5;

/// Node sizes
pub const CH_SZ: u32 = 24;
pub const INO_NODE_SZ: u32 = 160;
pub const DATA_NODE_SZ: u32 = 48;
pub const DENT_NODE_SZ: u32 = 56;
pub const XENT_NODE_SZ: u32 = DENT_NODE_SZ;
pub const TRUN_NODE_SZ: u32 = 56;
pub const PAD_NODE_SZ: u32 = 28;
pub const SB_NODE_SZ: u32 = 4096;
pub const MST_NODE_SZ: u32 = 512;
pub const REF_NODE_SZ: u32 = 64;
pub const CS_NODE_SZ: u32 = 32;
pub const ORPH_NODE_SZ: u32 = 32;
pub const IDX_NODE_SZ: u32 = 28;
pub const BRANCH_SZ: u32 = 12;
pub const AUTH_NODE_SZ: u32 = CH_SZ;
pub const SIG_NODE_SZ: u32 = 64;
pub const MAX_HMAC_LEN: u32 = 64;

pub const MAX_INO_NODE_SZ: u32 = INO_NODE_SZ + MAX_INO_DATA;
pub const MAX_DATA_NODE_SZ: u32 = DATA_NODE_SZ + BLOCK_SIZE;
pub const MAX_DENT_NODE_SZ: u32 = DENT_NODE_SZ + MAX_NLEN as u32 + 1;
pub const MAX_XENT_NODE_SZ: u32 = MAX_DENT_NODE_SZ;
pub const MAX_NODE_SZ: u32 = MAX_INO_NODE_SZ;

/// Smallest node worth writing: a data node plus a little data
pub const MIN_WRITE_SZ: u32 = DATA_NODE_SZ + 8;

/// Inode flags
pub const COMPR_FL: u32 = 0x01;
pub const XATTR_FL: u32 = 0x20;
pub const CRYPT_FL: u32 = 0x40;

/// Superblock flags
pub const FLG_BIGLPT: u32 = 0x02;
pub const FLG_SPACE_FIXUP: u32 = 0x04;
pub const FLG_DOUBLE_HASH: u32 = 0x08;
pub const FLG_ENCRYPTION: u32 = 0x10;
pub const FLG_AUTHENTICATION: u32 = 0x20;

/// Master node flags
pub const MST_DIRTY: u32 = 0x01;
pub const MST_NO_ORPHS: u32 = 0x02;
pub const MST_RCVRY: u32 = 0x04;

/// Compression types
pub const COMPR_NONE: u16 = 0;
pub const COMPR_LZO: u16 = 1;
pub const COMPR_ZLIB: u16 = 2;
pub const COMPR_ZSTD: u16 = 3;
pub const COMPR_TYPES_CNT: u16 = 4;

/// Directory entry inode types
pub const ITYPE_REG: u8 = 0;
pub const ITYPE_DIR: u8 = 1;
pub const ITYPE_LNK: u8 = 2;
pub const ITYPE_BLK: u8 = 3;
pub const ITYPE_CHR: u8 = 4;
pub const ITYPE_FIFO: u8 = 5;
pub const ITYPE_SOCK: u8 = 6;
pub const ITYPES_CNT: u8 = 7;

/// POSIX file type bits of an inode mode
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Device number payload sizes (new and huge encodings)
pub const DEV_DESC_NEW_SZ: u32 = 4;
pub const DEV_DESC_HUGE_SZ: u32 = 8;

// ============================================================================
// Node types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NodeType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
    Trun = 4,
    Pad = 5,
    Sb = 6,
    Mst = 7,
    Ref = 8,
    Idx = 9,
    Cs = 10,
    Orph = 11,
    Auth = 12,
    Sig = 13,
}

pub const NODE_TYPES_CNT: usize = 14;

impl NodeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let node_type = match value {
            0 => NodeType::Ino,
            1 => NodeType::Data,
            2 => NodeType::Dent,
            3 => NodeType::Xent,
            4 => NodeType::Trun,
            5 => NodeType::Pad,
            6 => NodeType::Sb,
            7 => NodeType::Mst,
            8 => NodeType::Ref,
            9 => NodeType::Idx,
            10 => NodeType::Cs,
            11 => NodeType::Orph,
            12 => NodeType::Auth,
            13 => NodeType::Sig,
            _ => return None,
        };
        Some(node_type)
    }

    /// Leaf nodes are the ones the content index points at
    pub fn has_key(self) -> bool {
        matches!(
            self,
            NodeType::Ino | NodeType::Data | NodeType::Dent | NodeType::Xent | NodeType::Trun
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeType::Ino => "inode",
            NodeType::Data => "data",
            NodeType::Dent => "direntry",
            NodeType::Xent => "xentry",
            NodeType::Trun => "truncate",
            NodeType::Pad => "padding",
            NodeType::Sb => "superblock",
            NodeType::Mst => "master",
            NodeType::Ref => "reference",
            NodeType::Idx => "index",
            NodeType::Cs => "commit start",
            NodeType::Orph => "orphan",
            NodeType::Auth => "auth",
            NodeType::Sig => "signature",
        }
    }
}

// ============================================================================
// Common header
// ============================================================================

/// Common header present at the start of every node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub magic: u32,
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: u8,
    pub group_type: u8,
}

impl CommonHeader {
    pub const SIZE: usize = CH_SZ as usize;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Insufficient data for common header");
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            magic: cursor.read_u32::<LittleEndian>()?,
            crc: cursor.read_u32::<LittleEndian>()?,
            sqnum: cursor.read_u64::<LittleEndian>()?,
            len: cursor.read_u32::<LittleEndian>()?,
            node_type: cursor.read_u8()?,
            group_type: cursor.read_u8()?,
        })
    }

    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_u8(self.node_type)
    }
}

/// CRC32 as used by UBIFS: seed 0xFFFFFFFF, no final inversion
pub fn crc32(data: &[u8]) -> u32 {
    !crc32fast::hash(data)
}

/// Compute the CRC of a complete node buffer
pub fn node_crc(node: &[u8]) -> u32 {
    crc32(&node[8..])
}

/// Fill in the common header of `node` and seal it with its CRC.
///
/// The node length is the buffer length.
pub fn seal_node(node: &mut [u8], node_type: NodeType, sqnum: u64) {
    let len = node.len() as u32;
    LittleEndian::write_u32(&mut node[0..4], NODE_MAGIC);
    LittleEndian::write_u64(&mut node[8..16], sqnum);
    LittleEndian::write_u32(&mut node[16..20], len);
    node[20] = node_type as u8;
    node[21] = 0;
    node[22] = 0;
    node[23] = 0;
    update_crc(node);
}

/// Recompute the CRC after a node was patched in place
pub fn update_crc(node: &mut [u8]) {
    let crc = node_crc(node);
    LittleEndian::write_u32(&mut node[4..8], crc);
}

/// Fill `buf` with padding: a padding node when it fits, padding bytes otherwise
pub fn pad_space(buf: &mut [u8]) {
    let pad = buf.len() as u32;
    if pad >= PAD_NODE_SZ {
        buf.fill(0);
        LittleEndian::write_u32(&mut buf[24..28], pad - PAD_NODE_SZ);
        let (node, _) = buf.split_at_mut(PAD_NODE_SZ as usize);
        seal_node(node, NodeType::Pad, 0);
    } else {
        buf.fill(PADDING_BYTE);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Round `value` up to a power-of-two boundary
pub const fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) & !(to - 1)
}

pub const fn align64(value: u64, to: u64) -> u64 {
    (value + to - 1) & !(to - 1)
}

/// Bytes a directory entry with an `nlen`-byte name accounts for in its parent's size
pub const fn calc_dent_size(nlen: u32) -> u64 {
    align(DENT_NODE_SZ + nlen + 1, 8) as u64
}

/// Bytes an extended attribute of `size` value bytes accounts for in its host
pub const fn calc_xattr_bytes(size: u64) -> u64 {
    align64(INO_NODE_SZ as u64 + size + 1, 8)
}

/// Size of an index node holding `child_cnt` branches
pub const fn idx_node_sz(child_cnt: u32) -> u32 {
    IDX_NODE_SZ + (BRANCH_SZ + key::KEY_LEN as u32) * child_cnt
}

/// Index of the highest set bit, counting from 1 (0 for 0)
pub fn fls(value: u32) -> u32 {
    32 - value.leading_zeros()
}

/// Map an inode mode to its directory entry type
pub fn dent_type(mode: u32) -> Option<u8> {
    let itype = match mode & S_IFMT {
        S_IFREG => ITYPE_REG,
        S_IFDIR => ITYPE_DIR,
        S_IFLNK => ITYPE_LNK,
        S_IFBLK => ITYPE_BLK,
        S_IFCHR => ITYPE_CHR,
        S_IFIFO => ITYPE_FIFO,
        S_IFSOCK => ITYPE_SOCK,
        _ => return None,
    };
    Some(itype)
}

pub fn type_name(itype: u8) -> &'static str {
    match itype {
        ITYPE_REG => "file",
        ITYPE_DIR => "dir",
        ITYPE_LNK => "symlink",
        ITYPE_BLK => "blkdev",
        ITYPE_CHR => "char dev",
        ITYPE_FIFO => "fifo",
        ITYPE_SOCK => "socket",
        _ => "unknown/invalid type",
    }
}

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align(0, 8), 0);
        assert_eq!(align(1, 8), 8);
        assert_eq!(align(57, 8), 64);
        assert_eq!(align(2048, 2048), 2048);
    }

    #[test]
    fn test_calc_dent_size() {
        // 56 byte header, 4 byte name and the terminating zero
        assert_eq!(calc_dent_size(4), 64);
        assert_eq!(calc_dent_size(7), 64);
        assert_eq!(calc_dent_size(8), 72);
    }

    #[test]
    fn test_fls() {
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(16384), 15);
        assert_eq!(fls(16383), 14);
    }

    #[test]
    fn test_seal_node_checks_out() {
        let mut node = vec![0u8; CS_NODE_SZ as usize];
        seal_node(&mut node, NodeType::Cs, 42);
        let ch = CommonHeader::parse(&node).unwrap();
        assert_eq!(ch.magic, NODE_MAGIC);
        assert_eq!(ch.sqnum, 42);
        assert_eq!(ch.len, CS_NODE_SZ);
        assert_eq!(ch.node_type(), Some(NodeType::Cs));
        assert_eq!(ch.crc, node_crc(&node));
    }

    #[test]
    fn test_pad_space() {
        let mut buf = vec![0u8; 64];
        pad_space(&mut buf);
        let ch = CommonHeader::parse(&buf).unwrap();
        assert_eq!(ch.node_type(), Some(NodeType::Pad));
        assert_eq!(LittleEndian::read_u32(&buf[24..28]), 64 - PAD_NODE_SZ);

        let mut small = vec![0u8; 16];
        pad_space(&mut small);
        assert!(small.iter().all(|&b| b == PADDING_BYTE));
    }

    #[test]
    fn test_dent_type() {
        assert_eq!(dent_type(S_IFREG | 0o644), Some(ITYPE_REG));
        assert_eq!(dent_type(S_IFDIR | 0o755), Some(ITYPE_DIR));
        assert_eq!(dent_type(0o644), None);
    }
}
