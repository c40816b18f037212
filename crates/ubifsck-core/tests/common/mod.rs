//! Builds small UBIFS images in memory for the integration tests.

#![allow(dead_code)]

use ubifsck_core::fs::commit::{commit, NodeWriter};
use ubifsck_core::fs::lpt::{create_lpt, read_lpt, Lprops};
use ubifsck_core::fs::master::{read_master, write_master};
use ubifsck_core::fs::tnc::{read_leaf, Tnc, Zbranch};
use ubifsck_core::fs::{FsInfo, UsedLebs};
use ubifsck_core::media::*;
use ubifsck_core::volume::{MemVolume, Volume};

pub const LEB_SIZE: u32 = 16384;
pub const LEB_CNT: u32 = 32;
pub const MIN_IO: u32 = 8;

pub fn superblock() -> SbNode {
    SbNode {
        key_hash: 0,
        key_fmt: 0,
        flags: FLG_DOUBLE_HASH,
        min_io_size: MIN_IO,
        leb_size: LEB_SIZE,
        leb_cnt: LEB_CNT,
        max_leb_cnt: LEB_CNT,
        max_bud_bytes: 3 * LEB_SIZE as u64,
        log_lebs: 2,
        lpt_lebs: 2,
        orph_lebs: 1,
        jhead_cnt: 3,
        fanout: 8,
        lsave_cnt: 256,
        fmt_version: FORMAT_VERSION,
        default_compr: COMPR_NONE,
        rp_uid: 0,
        rp_gid: 0,
        rp_size: 0,
        time_gran: 1_000_000_000,
        uuid: [7; 16],
        ro_compat_version: 0,
    }
}

/// Size of a directory holding entries with the given names
pub fn dir_size(names: &[&str]) -> u64 {
    INO_NODE_SZ as u64 + names.iter().map(|n| calc_dent_size(n.len() as u32)).sum::<u64>()
}

/// An image under construction; nodes are packed into main area LEBs and,
/// unless written as strays, indexed
pub struct Image {
    pub fs: FsInfo,
    pub vol: MemVolume,
    pub tnc: Tnc,
    used: UsedLebs,
    writer: NodeWriter,
}

impl Image {
    pub fn new() -> Self {
        let sb = superblock();
        let mut vol = MemVolume::new(LEB_SIZE, LEB_CNT, MIN_IO);
        let mut node = sb.encode(1);
        let start = node.len();
        node.resize(align(start as u32, MIN_IO) as usize, 0);
        pad_space(&mut node[start..]);
        vol.change(SB_LNUM, &node).unwrap();

        let mut fs = FsInfo::new(sb).unwrap();
        fs.saw_sqnum(1);
        let used = UsedLebs::new(&fs);
        Self {
            fs,
            vol,
            tnc: Tnc::new(),
            used,
            writer: NodeWriter::new(),
        }
    }

    fn put(&mut self, node: &[u8]) -> Zbranch {
        let (lnum, offs) = self.writer.add(&mut self.vol, &self.fs, &mut self.used, node).unwrap();
        Zbranch {
            lnum,
            offs,
            len: node.len() as u32,
        }
    }

    fn ino_node(&mut self, inum: u32, mode: u32, nlink: u32, size: u64) -> Vec<u8> {
        let sqnum = self.fs.next_sqnum();
        self.fs.highest_inum = self.fs.highest_inum.max(inum as u64);
        InoNode::new(inum, mode, nlink, size, 1_700_000_000).encode(sqnum)
    }

    fn dent_node(&mut self, parent: u32, name: &str, inum: u64, itype: u8) -> (Key, Vec<u8>) {
        let key = Key::dent(parent, self.fs.name_hash(name.as_bytes()));
        let sqnum = self.fs.next_sqnum();
        let node = DentNode {
            key,
            inum,
            itype,
            nlen: name.len() as u16,
            cookie: 0,
            name: name.as_bytes().to_vec(),
            name_terminated: true,
        }
        .encode(NodeType::Dent, sqnum);
        (key, node)
    }

    fn data_node(&mut self, inum: u32, block: u32, bytes: &[u8]) -> Vec<u8> {
        let sqnum = self.fs.next_sqnum();
        DataNode {
            key: Key::data(inum, block),
            size: bytes.len() as u32,
            compr_type: COMPR_NONE,
            compr_size: 0,
            data: bytes.to_vec(),
        }
        .encode(sqnum)
    }

    pub fn dir(&mut self, inum: u32, nlink: u32, size: u64) {
        let node = self.ino_node(inum, S_IFDIR | 0o755, nlink, size);
        let zbr = self.put(&node);
        self.tnc.insert(Key::ino(inum), zbr);
    }

    pub fn file(&mut self, inum: u32, nlink: u32, size: u64) {
        let node = self.ino_node(inum, S_IFREG | 0o644, nlink, size);
        let zbr = self.put(&node);
        self.tnc.insert(Key::ino(inum), zbr);
    }

    pub fn dent(&mut self, parent: u32, name: &str, inum: u64, itype: u8) {
        let (key, node) = self.dent_node(parent, name, inum, itype);
        let zbr = self.put(&node);
        self.tnc.insert(key, zbr);
    }

    pub fn data(&mut self, inum: u32, block: u32, bytes: &[u8]) {
        let node = self.data_node(inum, block, bytes);
        let zbr = self.put(&node);
        self.tnc.insert(Key::data(inum, block), zbr);
    }

    /// Data node that is on flash but not indexed
    pub fn stray_data(&mut self, inum: u32, block: u32, bytes: &[u8]) {
        let node = self.data_node(inum, block, bytes);
        self.put(&node);
    }

    /// Inode with no links left, as written when the last name goes away
    pub fn deletion_ino(&mut self, inum: u32) {
        let node = self.ino_node(inum, S_IFREG | 0o644, 0, 0);
        self.put(&node);
        self.tnc.remove_range(Key::lowest(inum), Key::highest(inum));
    }

    /// Entry pointing at inode 0, as written by unlink
    pub fn deletion_dent(&mut self, parent: u32, name: &str) {
        let (key, node) = self.dent_node(parent, name, 0, ITYPE_REG);
        self.put(&node);
        self.tnc.remove_range(key, key);
    }

    /// Close the current LEB; the next node starts a new one
    pub fn start_leb(&mut self) {
        self.writer.flush(&mut self.vol, &self.fs).unwrap();
    }

    /// Leave a journal behind the commit described by `master`: a bud LEB
    /// with a new version of regular file `inum`, named by the log
    ///
    /// Returns the bud.
    pub fn journal_file(&mut self, master: &MstNode, inum: u32, size: u64) -> u32 {
        let bud = (self.fs.main_first..LEB_CNT)
            .find(|&lnum| lnum != master.gc_lnum && !self.vol.is_mapped(lnum).unwrap())
            .unwrap();
        let cs = CsNode { cmt_no: master.cmt_no }.encode(self.fs.next_sqnum());
        let reference = RefNode {
            lnum: bud,
            offs: 0,
            jhead: BASEHD,
        }
        .encode(self.fs.next_sqnum());
        write_nodes(&mut self.vol, LOG_LNUM, &[cs, reference]);
        let ino = self.ino_node(inum, S_IFREG | 0o644, 1, size);
        write_nodes(&mut self.vol, bud, &[ino]);
        bud
    }

    /// Rewrite the LPT with a wrong entry for `lnum`; returns the new master
    pub fn corrupt_lprops(&mut self, master: &MstNode, lnum: u32, wrong: Lprops) -> MstNode {
        let mut lprops = read_lpt(&self.vol, &self.fs, master).unwrap();
        lprops[(lnum - self.fs.main_first) as usize] = wrong;
        let pos = create_lpt(&mut self.vol, &self.fs, &lprops).unwrap();
        let mut mst = master.clone();
        pos.store(&mut mst);
        write_master(&mut self.vol, &mut self.fs, &mst).unwrap();
        mst
    }

    /// Write everything out and commit, leaving a journal-less filesystem
    pub fn commit(&mut self) -> MstNode {
        self.writer.flush(&mut self.vol, &self.fs).unwrap();
        commit(&mut self.vol, &mut self.fs, &mut self.tnc, &MstNode::default())
            .unwrap()
            .master
    }

    /// Root with one regular file `f` (inode 65) holding 12 bytes
    pub fn simple() -> Self {
        let mut img = Image::new();
        img.dir(ROOT_INO as u32, 2, dir_size(&["f"]));
        img.data(65, 0, b"hello, flash");
        img.file(65, 1, 12);
        img.dent(ROOT_INO as u32, "f", 65, ITYPE_REG);
        img.commit();
        img
    }
}

/// Replace LEB `lnum` with `nodes`, packed as the journal would
fn write_nodes(vol: &mut MemVolume, lnum: u32, nodes: &[Vec<u8>]) {
    let mut buf = Vec::new();
    for node in nodes {
        buf.extend_from_slice(node);
        buf.resize(align(buf.len() as u32, 8) as usize, PADDING_BYTE);
    }
    let start = buf.len();
    buf.resize(align(start as u32, MIN_IO) as usize, 0);
    pad_space(&mut buf[start..]);
    vol.change(lnum, &buf).unwrap();
}

/// Break both copies of the master node
pub fn corrupt_master(vol: &mut MemVolume) {
    for lnum in [MST_LNUM, MST_LNUM + 1] {
        let leb = vol.raw_mut(lnum);
        leb[40] ^= 0xFF;
    }
}

/// Load the committed index of `vol`
pub fn load_index(vol: &MemVolume) -> (FsInfo, Tnc) {
    let mut fs = FsInfo::new(superblock()).unwrap();
    let master = read_master(vol, &fs).unwrap();
    fs.highest_inum = master.node.highest_inum;
    let tnc = Tnc::load(vol, &fs, &master.node).unwrap();
    (fs, tnc)
}

/// Read and decode the indexed inode `inum`
pub fn read_ino(vol: &MemVolume, fs: &FsInfo, tnc: &Tnc, inum: u32) -> Option<InoNode> {
    let key = Key::ino(inum);
    let zbr = tnc.lookup(&key).first().copied()?;
    let buf = read_leaf(vol, fs, &key, &zbr).unwrap();
    Some(InoNode::parse(&buf).unwrap())
}

/// Read and decode the indexed data block
pub fn read_data(vol: &MemVolume, fs: &FsInfo, tnc: &Tnc, inum: u32, block: u32) -> Option<DataNode> {
    let key = Key::data(inum, block);
    let zbr = tnc.lookup(&key).first().copied()?;
    let buf = read_leaf(vol, fs, &key, &zbr).unwrap();
    Some(DataNode::parse(&buf).unwrap())
}
