/// Leaf node parser
///
/// Decodes an intact leaf node into the record the file graph works with and
/// checks that its fields make sense. A node that fails is reported as an
/// `InvalidNode`, which callers turn into a problem; it is never a hard error.

use thiserror::Error;

use crate::fs::FsInfo;
use crate::media::key::MAX_INODE_SZ;
use crate::media::*;

/// Where a node lives and how new it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePos {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub sqnum: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InoRecord {
    pub pos: NodePos,
    pub key: Key,
    pub is_xattr: bool,
    pub is_encrypted: bool,
    pub mode: u32,
    pub nlink: u32,
    pub xcnt: u32,
    pub xsz: u32,
    pub xnms: u32,
    pub size: u64,
}

impl InoRecord {
    pub fn inum(&self) -> u64 {
        self.key.inum as u64
    }
}

/// Directory entry or extended attribute entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentRecord {
    pub pos: NodePos,
    pub key: Key,
    pub is_xent: bool,
    pub itype: u8,
    pub name: Vec<u8>,
    /// Target inode, 0 for a deletion entry
    pub inum: u64,
}

impl DentRecord {
    /// Inode the entry lives in: the parent directory or the xattr host
    pub fn parent(&self) -> u64 {
        self.key.inum as u64
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub pos: NodePos,
    pub key: Key,
    /// Uncompressed bytes in the block
    pub size: u32,
}

impl DataRecord {
    /// File offset just past the data of this block
    pub fn end(&self) -> u64 {
        self.key.block() as u64 * BLOCK_SIZE as u64 + self.size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunRecord {
    pub pos: NodePos,
    pub inum: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafRecord {
    Ino(InoRecord),
    Dent(DentRecord),
    Data(DataRecord),
    Trun(TrunRecord),
}

impl LeafRecord {
    pub fn pos(&self) -> NodePos {
        match self {
            LeafRecord::Ino(r) => r.pos,
            LeafRecord::Dent(r) => r.pos,
            LeafRecord::Data(r) => r.pos,
            LeafRecord::Trun(r) => r.pos,
        }
    }
}

/// Why a node was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidNode {
    #[error("bad inode number {0}")]
    BadInum(u64),
    #[error("node type {node} differs from key type {key}")]
    TypeMismatch { node: u8, key: u32 },
    #[error("root inode is not a directory, type {0:#o}")]
    RootNotDir(u32),
    #[error("size {0} is too large")]
    TooLarge(u64),
    #[error("unknown compression type {0}")]
    BadCompression(u16),
    #[error("too big xattr names {names} count {count}")]
    XattrList { names: u32, count: u32 },
    #[error("inline data length {data_len} does not fit node length {len}")]
    DataLen { data_len: u32, len: u32 },
    #[error("bad inline data length {data_len} for type {mode:#o}")]
    TypeDataLen { data_len: u32, mode: u32 },
    #[error("xattr inode {0}")]
    BadXattr(&'static str),
    #[error("unknown file type {0:#o}")]
    UnknownType(u32),
    #[error("encrypted but cannot be encrypted")]
    BadEncryption,
    #[error("bad entry (len {len} nlen {nlen} type {itype} inum {inum})")]
    BadEntry {
        len: u32,
        nlen: u16,
        itype: u8,
        inum: u64,
    },
    #[error("invalid data size {0}")]
    BadDataSize(u32),
    #[error("bad truncation (old size {old} new size {new})")]
    BadTruncation { old: u64, new: u64 },
    #[error("undecodable node: {0}")]
    Undecodable(String),
}

fn undecodable(err: anyhow::Error) -> InvalidNode {
    InvalidNode::Undecodable(err.to_string())
}

fn header(buf: &[u8], lnum: u32, offs: u32) -> Result<(CommonHeader, NodePos), InvalidNode> {
    let ch = CommonHeader::parse(buf).map_err(undecodable)?;
    let pos = NodePos {
        lnum,
        offs,
        len: ch.len,
        sqnum: ch.sqnum,
    };
    Ok((ch, pos))
}

fn check_inum(inum: u64) -> Result<(), InvalidNode> {
    if inum == 0 || inum > INUM_WATERMARK {
        return Err(InvalidNode::BadInum(inum));
    }
    Ok(())
}

fn check_key_type(ch: &CommonHeader, key: &Key) -> Result<(), InvalidNode> {
    if ch.node_type as u32 != key.type_bits() {
        return Err(InvalidNode::TypeMismatch {
            node: ch.node_type,
            key: key.type_bits(),
        });
    }
    Ok(())
}

/// Parse an inode node
pub fn parse_ino(fs: &FsInfo, buf: &[u8], key: &Key, lnum: u32, offs: u32) -> Result<InoRecord, InvalidNode> {
    let inum = key.inum as u64;
    check_inum(inum)?;
    let (ch, pos) = header(buf, lnum, offs)?;
    check_key_type(&ch, key)?;
    let ino = InoNode::parse(buf).map_err(undecodable)?;

    let rec = InoRecord {
        pos,
        key: *key,
        is_xattr: ino.flags & XATTR_FL != 0,
        is_encrypted: ino.flags & CRYPT_FL != 0,
        mode: ino.mode,
        nlink: ino.nlink,
        xcnt: ino.xattr_cnt,
        xsz: ino.xattr_size,
        xnms: ino.xattr_names,
        size: ino.size,
    };
    let data_len = ino.data_len;

    if inum == ROOT_INO && !is_dir(rec.mode) {
        return Err(InvalidNode::RootNotDir(rec.mode & S_IFMT));
    }
    if rec.size > MAX_INODE_SZ {
        return Err(InvalidNode::TooLarge(rec.size));
    }
    if ino.compr_type >= COMPR_TYPES_CNT {
        return Err(InvalidNode::BadCompression(ino.compr_type));
    }
    if rec.xnms as u64 + rec.xcnt as u64 > XATTR_LIST_MAX as u64 {
        return Err(InvalidNode::XattrList {
            names: rec.xnms,
            count: rec.xcnt,
        });
    }
    if data_len > MAX_INO_DATA || INO_NODE_SZ + data_len != ch.len {
        return Err(InvalidNode::DataLen { data_len, len: ch.len });
    }

    if rec.is_xattr {
        if !is_reg(rec.mode) {
            return Err(InvalidNode::BadXattr("is not a regular file"));
        }
        if data_len as u64 != rec.size {
            return Err(InvalidNode::BadXattr("value length differs from its size"));
        }
        if rec.xcnt != 0 || rec.xsz != 0 || rec.xnms != 0 {
            return Err(InvalidNode::BadXattr("carries xattrs of its own"));
        }
    }

    let type_data_len = InvalidNode::TypeDataLen { data_len, mode: rec.mode & S_IFMT };
    match rec.mode & S_IFMT {
        S_IFREG if !rec.is_xattr && data_len != 0 => return Err(type_data_len),
        S_IFREG => {}
        S_IFDIR | S_IFSOCK | S_IFIFO if data_len != 0 => return Err(type_data_len),
        S_IFDIR | S_IFSOCK | S_IFIFO => {}
        // A symlink inode written before its target is useless
        S_IFLNK if data_len == 0 => return Err(type_data_len),
        S_IFLNK => {}
        S_IFBLK | S_IFCHR if data_len != DEV_DESC_NEW_SZ && data_len != DEV_DESC_HUGE_SZ => {
            return Err(type_data_len)
        }
        S_IFBLK | S_IFCHR => {}
        other => return Err(InvalidNode::UnknownType(other)),
    }

    if rec.is_encrypted {
        let kind = rec.mode & S_IFMT;
        let can = fs.encrypted && !rec.is_xattr && matches!(kind, S_IFREG | S_IFDIR | S_IFLNK);
        if !can {
            return Err(InvalidNode::BadEncryption);
        }
    }
    Ok(rec)
}

/// Parse a directory entry or extended attribute entry node
///
/// An entry pointing at inode 0 is a deletion entry and is valid.
pub fn parse_dent(buf: &[u8], lnum: u32, offs: u32) -> Result<DentRecord, InvalidNode> {
    let (ch, pos) = header(buf, lnum, offs)?;
    let dent = DentNode::parse(buf).map_err(undecodable)?;
    let key_type = dent.key.type_bits();
    let is_xent = key_type == KeyType::Xent as u32;
    let nlen = dent.nlen as usize;

    let bad = ch.len != DENT_NODE_SZ + dent.nlen as u32 + 1
        || dent.itype >= ITYPES_CNT
        || nlen > MAX_NLEN
        || !dent.name_terminated
        || (is_xent && dent.name.iter().take(nlen).any(|&b| b == 0))
        || dent.inum > INUM_WATERMARK
        || key_type != ch.node_type as u32;
    if bad {
        return Err(InvalidNode::BadEntry {
            len: ch.len,
            nlen: dent.nlen,
            itype: dent.itype,
            inum: dent.inum,
        });
    }
    Ok(DentRecord {
        pos,
        key: dent.key,
        is_xent,
        itype: dent.itype,
        name: dent.name,
        inum: dent.inum,
    })
}

/// Parse a data node
pub fn parse_data(buf: &[u8], key: &Key, lnum: u32, offs: u32) -> Result<DataRecord, InvalidNode> {
    let (ch, pos) = header(buf, lnum, offs)?;
    check_key_type(&ch, key)?;
    check_inum(key.inum as u64)?;
    let dn = DataNode::parse(buf).map_err(undecodable)?;
    if dn.size == 0 || dn.size > BLOCK_SIZE {
        return Err(InvalidNode::BadDataSize(dn.size));
    }
    if dn.compr_type >= COMPR_TYPES_CNT {
        return Err(InvalidNode::BadCompression(dn.compr_type));
    }
    Ok(DataRecord {
        pos,
        key: *key,
        size: dn.size,
    })
}

/// Parse a truncation node; only found when scanning raw LEBs
pub fn parse_trun(buf: &[u8], lnum: u32, offs: u32) -> Result<TrunRecord, InvalidNode> {
    let (_, pos) = header(buf, lnum, offs)?;
    let trun = TrunNode::parse(buf).map_err(undecodable)?;
    let inum = trun.inum as u64;
    check_inum(inum)?;
    if trun.old_size > MAX_INODE_SZ || trun.new_size > MAX_INODE_SZ || trun.old_size <= trun.new_size {
        return Err(InvalidNode::BadTruncation {
            old: trun.old_size,
            new: trun.new_size,
        });
    }
    Ok(TrunRecord {
        pos,
        inum,
        new_size: trun.new_size,
    })
}

/// Parse any leaf node by the type of `key`
pub fn parse_leaf(fs: &FsInfo, buf: &[u8], key: &Key, lnum: u32, offs: u32) -> Result<LeafRecord, InvalidNode> {
    match key.key_type() {
        Some(KeyType::Ino) => parse_ino(fs, buf, key, lnum, offs).map(LeafRecord::Ino),
        Some(KeyType::Dent) | Some(KeyType::Xent) => parse_dent(buf, lnum, offs).map(LeafRecord::Dent),
        Some(KeyType::Data) => parse_data(buf, key, lnum, offs).map(LeafRecord::Data),
        Some(KeyType::Trun) => parse_trun(buf, lnum, offs).map(LeafRecord::Trun),
        None => Err(InvalidNode::TypeMismatch {
            node: buf.get(20).copied().unwrap_or(u8::MAX),
            key: key.type_bits(),
        }),
    }
}

/// Problem raised for an invalid node with this key
pub fn invalid_problem(key: &Key) -> crate::check::problem::Problem {
    use crate::check::problem::Problem;
    match key.key_type() {
        Some(KeyType::Ino) => Problem::InvalidInoNode,
        Some(KeyType::Dent) | Some(KeyType::Xent) => Problem::InvalidDentNode,
        _ => Problem::InvalidDataNode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::test_sb;
    use byteorder::{ByteOrder, LittleEndian};

    fn ino(inum: u32, mode: u32, nlink: u32, size: u64) -> InoNode {
        InoNode {
            key: Key::ino(inum),
            creat_sqnum: 1,
            size,
            atime_sec: 0,
            ctime_sec: 0,
            mtime_sec: 0,
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

    fn fs() -> FsInfo {
        FsInfo::new(test_sb()).unwrap()
    }

    #[test]
    fn test_parse_regular_inode() {
        let buf = ino(65, S_IFREG | 0o644, 1, 100).encode(5);
        let rec = parse_ino(&fs(), &buf, &Key::ino(65), 9, 0).unwrap();
        assert_eq!(rec.pos.sqnum, 5);
        assert_eq!(rec.size, 100);
        assert!(!rec.is_xattr);
    }

    #[test]
    fn test_inode_rules() {
        let fs = fs();
        let buf = ino(1, S_IFREG | 0o644, 1, 0).encode(1);
        assert_eq!(
            parse_ino(&fs, &buf, &Key::ino(1), 9, 0),
            Err(InvalidNode::RootNotDir(S_IFREG))
        );

        let mut link = ino(66, S_IFLNK | 0o777, 1, 0);
        let buf = link.encode(1);
        assert!(matches!(
            parse_ino(&fs, &buf, &Key::ino(66), 9, 0),
            Err(InvalidNode::TypeDataLen { .. })
        ));
        link.data = b"target".to_vec();
        let buf = link.encode(1);
        assert!(parse_ino(&fs, &buf, &Key::ino(66), 9, 0).is_ok());

        let mut dev = ino(67, S_IFCHR | 0o600, 1, 0);
        dev.data = vec![0; 6];
        let buf = dev.encode(1);
        assert!(parse_ino(&fs, &buf, &Key::ino(67), 9, 0).is_err());

        let mut enc = ino(68, S_IFREG | 0o600, 1, 0);
        enc.flags = CRYPT_FL;
        let buf = enc.encode(1);
        assert_eq!(
            parse_ino(&fs, &buf, &Key::ino(68), 9, 0),
            Err(InvalidNode::BadEncryption)
        );

        let buf = ino(69, 0o644, 1, 0).encode(1);
        assert_eq!(
            parse_ino(&fs, &buf, &Key::ino(69), 9, 0),
            Err(InvalidNode::UnknownType(0))
        );
    }

    #[test]
    fn test_xattr_inode_rules() {
        let fs = fs();
        let mut x = ino(70, S_IFREG | 0o600, 1, 3);
        x.flags = XATTR_FL;
        x.data = b"val".to_vec();
        let buf = x.encode(1);
        assert!(parse_ino(&fs, &buf, &Key::ino(70), 9, 0).unwrap().is_xattr);

        x.xattr_cnt = 1;
        let buf = x.encode(1);
        assert!(matches!(
            parse_ino(&fs, &buf, &Key::ino(70), 9, 0),
            Err(InvalidNode::BadXattr(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let buf = ino(65, S_IFREG | 0o644, 1, 0).encode(1);
        assert!(matches!(
            parse_ino(&fs(), &buf, &Key::data(65, 0), 9, 0),
            Err(InvalidNode::TypeMismatch { .. })
        ));
    }

    fn dent(parent: u32, name: &[u8], inum: u64) -> DentNode {
        DentNode {
            key: Key::dent(parent, KeyHash::R5.hash(name)),
            inum,
            itype: ITYPE_REG,
            nlen: name.len() as u16,
            cookie: 0,
            name: name.to_vec(),
            name_terminated: true,
        }
    }

    #[test]
    fn test_parse_dent() {
        let buf = dent(1, b"file", 65).encode(NodeType::Dent, 3);
        let rec = parse_dent(&buf, 9, 160).unwrap();
        assert_eq!(rec.parent(), 1);
        assert_eq!(rec.inum, 65);
        assert_eq!(rec.name, b"file");
        assert!(!rec.is_xent);

        // deletion entries are valid
        let buf = dent(1, b"file", 0).encode(NodeType::Dent, 4);
        assert_eq!(parse_dent(&buf, 9, 0).unwrap().inum, 0);
    }

    #[test]
    fn test_bad_dents() {
        let mut d = dent(1, b"file", 65);
        d.itype = ITYPES_CNT;
        assert!(parse_dent(&d.encode(NodeType::Dent, 1), 9, 0).is_err());

        // dent key in an xent node
        let d = dent(1, b"file", 65);
        assert!(parse_dent(&d.encode(NodeType::Xent, 1), 9, 0).is_err());

        let mut buf = dent(1, b"file", 65).encode(NodeType::Dent, 1);
        let last = buf.len() - 1;
        buf[last] = b'x';
        update_crc(&mut buf);
        assert!(parse_dent(&buf, 9, 0).is_err());

        let mut x = dent(65, b"a\0b", 70);
        x.key = Key::xent(65, 5);
        assert!(parse_dent(&x.encode(NodeType::Xent, 1), 9, 0).is_err());
    }

    #[test]
    fn test_parse_data() {
        let dn = DataNode {
            key: Key::data(65, 2),
            size: 100,
            compr_type: COMPR_NONE,
            compr_size: 0,
            data: vec![1; 100],
        };
        let buf = dn.encode(8);
        let rec = parse_data(&buf, &Key::data(65, 2), 9, 0).unwrap();
        assert_eq!(rec.end(), 2 * 4096 + 100);

        let mut bad = buf.clone();
        LittleEndian::write_u32(&mut bad[40..44], 0);
        assert_eq!(parse_data(&bad, &Key::data(65, 2), 9, 0), Err(InvalidNode::BadDataSize(0)));

        let mut bad = buf;
        LittleEndian::write_u16(&mut bad[44..46], COMPR_TYPES_CNT);
        assert!(parse_data(&bad, &Key::data(65, 2), 9, 0).is_err());
    }

    #[test]
    fn test_parse_trun() {
        let buf = TrunNode { inum: 65, old_size: 8192, new_size: 100 }.encode(9);
        assert_eq!(parse_trun(&buf, 9, 0).unwrap().new_size, 100);
        let buf = TrunNode { inum: 65, old_size: 100, new_size: 100 }.encode(9);
        assert!(parse_trun(&buf, 9, 0).is_err());
        let buf = TrunNode { inum: 0, old_size: 200, new_size: 100 }.encode(9);
        assert_eq!(parse_trun(&buf, 9, 0), Err(InvalidNode::BadInum(0)));
    }
}
