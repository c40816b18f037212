/// LEB properties tree node formats
///
/// LPT nodes are bit-packed, least significant bit first, and start with a
/// CRC16 over the rest of the node followed by a 4-bit node type.

use anyhow::{bail, Result};

use super::fls;

pub const LPT_FANOUT: usize = 4;
pub const LPT_FANOUT_SHIFT: u32 = 2;
pub const LPT_CRC_BITS: u32 = 16;
pub const LPT_CRC_BYTES: usize = 2;
pub const LPT_TYPE_BITS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LptNodeType {
    Pnode = 0,
    Nnode = 1,
    Ltab = 2,
    Lsave = 3,
}

impl LptNodeType {
    fn from_bits(value: u32) -> Option<Self> {
        match value {
            0 => Some(LptNodeType::Pnode),
            1 => Some(LptNodeType::Nnode),
            2 => Some(LptNodeType::Ltab),
            3 => Some(LptNodeType::Lsave),
            _ => None,
        }
    }
}

/// CRC16 with the reflected 0x8005 polynomial, seeded with 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ============================================================================
// Bit packing
// ============================================================================

struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        buf.fill(0);
        Self { buf, pos: 0 }
    }

    fn pack(&mut self, value: u32, nrbits: u32) {
        for i in 0..nrbits as usize {
            if value >> i & 1 != 0 {
                let bit = self.pos + i;
                self.buf[bit / 8] |= 1 << (bit % 8);
            }
        }
        self.pos += nrbits as usize;
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn unpack(&mut self, nrbits: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..nrbits as usize {
            let bit = self.pos + i;
            if self.buf[bit / 8] >> (bit % 8) & 1 != 0 {
                value |= 1 << i;
            }
        }
        self.pos += nrbits as usize;
        value
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Field widths and node sizes of the LPT for one filesystem geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LptBits {
    pub big_lpt: bool,
    pub space_bits: u32,
    pub lpt_lnum_bits: u32,
    pub lpt_offs_bits: u32,
    pub lpt_spc_bits: u32,
    pub pcnt_bits: u32,
    pub lnum_bits: u32,
    pub pnode_sz: usize,
    pub nnode_sz: usize,
    pub ltab_sz: usize,
    pub lsave_sz: usize,
    pub lpt_lebs: u32,
    pub lsave_cnt: u32,
}

impl LptBits {
    pub fn new(leb_size: u32, lpt_lebs: u32, max_leb_cnt: u32, lsave_cnt: u32, big_lpt: bool) -> Self {
        let space_bits = fls(leb_size) - 3;
        let lpt_lnum_bits = fls(lpt_lebs);
        let lpt_offs_bits = fls(leb_size - 1);
        let lpt_spc_bits = fls(leb_size);
        let max_pnodes = (max_leb_cnt as usize).div_ceil(LPT_FANOUT) as u32;
        let pcnt_bits = fls(max_pnodes.saturating_sub(1));
        let lnum_bits = fls(max_leb_cnt.saturating_sub(1));
        let num_bits = if big_lpt { pcnt_bits } else { 0 };
        let hdr = LPT_CRC_BITS + LPT_TYPE_BITS;

        let bytes = |bits: u32| bits.div_ceil(8) as usize;
        Self {
            big_lpt,
            space_bits,
            lpt_lnum_bits,
            lpt_offs_bits,
            lpt_spc_bits,
            pcnt_bits,
            lnum_bits,
            pnode_sz: bytes(hdr + num_bits + (space_bits * 2 + 1) * LPT_FANOUT as u32),
            nnode_sz: bytes(hdr + num_bits + (lpt_lnum_bits + lpt_offs_bits) * LPT_FANOUT as u32),
            ltab_sz: bytes(hdr + lpt_spc_bits * 2 * lpt_lebs),
            lsave_sz: bytes(hdr + lnum_bits * lsave_cnt),
            lpt_lebs,
            lsave_cnt,
        }
    }

    fn write_header(&self, w: &mut BitWriter<'_>, node_type: LptNodeType) {
        w.pack(0, LPT_CRC_BITS);
        w.pack(node_type as u32, LPT_TYPE_BITS);
    }

    fn seal(buf: &mut [u8]) {
        let crc = crc16(&buf[LPT_CRC_BYTES..]);
        buf[0..2].copy_from_slice(&crc.to_le_bytes());
    }

    fn check_header<'a>(&self, buf: &'a [u8], len: usize, expected: LptNodeType) -> Result<BitReader<'a>> {
        if buf.len() < len {
            bail!("Insufficient data for LPT {:?} node", expected);
        }
        let buf = &buf[..len];
        let mut r = BitReader::new(buf);
        let stored = r.unpack(LPT_CRC_BITS) as u16;
        let calc = crc16(&buf[LPT_CRC_BYTES..]);
        if stored != calc {
            bail!("LPT {:?} node CRC mismatch: stored {:#06x}, calculated {:#06x}", expected, stored, calc);
        }
        let node_type = r.unpack(LPT_TYPE_BITS);
        if LptNodeType::from_bits(node_type) != Some(expected) {
            bail!("LPT node type {} where {:?} was expected", node_type, expected);
        }
        Ok(r)
    }

    /// Node type of a packed LPT node, or `None` for anything unrecognized
    pub fn peek_type(buf: &[u8]) -> Option<LptNodeType> {
        if buf.len() < 3 {
            return None;
        }
        let mut r = BitReader::new(buf);
        r.unpack(LPT_CRC_BITS);
        LptNodeType::from_bits(r.unpack(LPT_TYPE_BITS))
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Properties of one LEB as stored in a pnode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PnodeEntry {
    pub free: u32,
    pub dirty: u32,
    pub index: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pnode {
    pub num: u32,
    pub entries: [PnodeEntry; LPT_FANOUT],
}

impl Pnode {
    pub fn pack(&self, bits: &LptBits) -> Vec<u8> {
        let mut buf = vec![0u8; bits.pnode_sz];
        let mut w = BitWriter::new(&mut buf);
        bits.write_header(&mut w, LptNodeType::Pnode);
        if bits.big_lpt {
            w.pack(self.num, bits.pcnt_bits);
        }
        for entry in &self.entries {
            w.pack(entry.free >> 3, bits.space_bits);
            w.pack(entry.dirty >> 3, bits.space_bits);
            w.pack(entry.index as u32, 1);
        }
        LptBits::seal(&mut buf);
        buf
    }

    pub fn unpack(bits: &LptBits, buf: &[u8]) -> Result<Self> {
        let mut r = bits.check_header(buf, bits.pnode_sz, LptNodeType::Pnode)?;
        let num = if bits.big_lpt { r.unpack(bits.pcnt_bits) } else { 0 };
        let mut entries = [PnodeEntry::default(); LPT_FANOUT];
        for entry in entries.iter_mut() {
            entry.free = r.unpack(bits.space_bits) << 3;
            entry.dirty = r.unpack(bits.space_bits) << 3;
            entry.index = r.unpack(1) != 0;
        }
        Ok(Self { num, entries })
    }
}

/// Position of a child LPT node; `lnum == 0` means no child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NnodeBranch {
    pub lnum: u32,
    pub offs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nnode {
    pub num: u32,
    pub branches: [NnodeBranch; LPT_FANOUT],
}

impl Nnode {
    pub fn pack(&self, bits: &LptBits, lpt_first: u32) -> Vec<u8> {
        let mut buf = vec![0u8; bits.nnode_sz];
        let mut w = BitWriter::new(&mut buf);
        bits.write_header(&mut w, LptNodeType::Nnode);
        if bits.big_lpt {
            w.pack(self.num, bits.pcnt_bits);
        }
        for br in &self.branches {
            let rel = if br.lnum == 0 {
                bits.lpt_lebs
            } else {
                br.lnum - lpt_first
            };
            w.pack(rel, bits.lpt_lnum_bits);
            w.pack(br.offs, bits.lpt_offs_bits);
        }
        LptBits::seal(&mut buf);
        buf
    }

    pub fn unpack(bits: &LptBits, buf: &[u8], lpt_first: u32) -> Result<Self> {
        let mut r = bits.check_header(buf, bits.nnode_sz, LptNodeType::Nnode)?;
        let num = if bits.big_lpt { r.unpack(bits.pcnt_bits) } else { 0 };
        let mut branches = [NnodeBranch::default(); LPT_FANOUT];
        for br in branches.iter_mut() {
            let rel = r.unpack(bits.lpt_lnum_bits);
            let offs = r.unpack(bits.lpt_offs_bits);
            if rel == bits.lpt_lebs {
                *br = NnodeBranch { lnum: 0, offs: 0 };
            } else if rel > bits.lpt_lebs {
                bail!("nnode branch LEB {} outside the LPT area", rel);
            } else {
                *br = NnodeBranch { lnum: lpt_first + rel, offs };
            }
        }
        Ok(Self { num, branches })
    }
}

/// Free and dirty space of one LPT LEB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LtabEntry {
    pub free: u32,
    pub dirty: u32,
}

pub fn pack_ltab(bits: &LptBits, ltab: &[LtabEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; bits.ltab_sz];
    let mut w = BitWriter::new(&mut buf);
    bits.write_header(&mut w, LptNodeType::Ltab);
    for entry in ltab {
        w.pack(entry.free, bits.lpt_spc_bits);
        w.pack(entry.dirty, bits.lpt_spc_bits);
    }
    LptBits::seal(&mut buf);
    buf
}

pub fn unpack_ltab(bits: &LptBits, buf: &[u8]) -> Result<Vec<LtabEntry>> {
    let mut r = bits.check_header(buf, bits.ltab_sz, LptNodeType::Ltab)?;
    Ok((0..bits.lpt_lebs)
        .map(|_| LtabEntry {
            free: r.unpack(bits.lpt_spc_bits),
            dirty: r.unpack(bits.lpt_spc_bits),
        })
        .collect())
}

pub fn pack_lsave(bits: &LptBits, lsave: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; bits.lsave_sz];
    let mut w = BitWriter::new(&mut buf);
    bits.write_header(&mut w, LptNodeType::Lsave);
    for lnum in lsave {
        w.pack(*lnum, bits.lnum_bits);
    }
    LptBits::seal(&mut buf);
    buf
}

pub fn unpack_lsave(bits: &LptBits, buf: &[u8]) -> Result<Vec<u32>> {
    let mut r = bits.check_header(buf, bits.lsave_sz, LptNodeType::Lsave)?;
    Ok((0..bits.lsave_cnt).map(|_| r.unpack(bits.lnum_bits)).collect())
}

/// Number of the nnode at `row` (root is row 0) and `col` in the big model
pub fn calc_nnode_num(mut row: u32, mut col: u32) -> u32 {
    let mut num = 1u32;
    while row > 0 {
        let bits = col & (LPT_FANOUT as u32 - 1);
        col >>= LPT_FANOUT_SHIFT;
        num <<= LPT_FANOUT_SHIFT;
        num |= bits;
        row -= 1;
    }
    num
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_bits() -> LptBits {
        LptBits::new(16384, 2, 32, 256, false)
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/MODBUS check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_geometry() {
        let bits = small_bits();
        assert_eq!(bits.space_bits, 12);
        assert_eq!(bits.lpt_lnum_bits, 2);
        assert_eq!(bits.lpt_offs_bits, 14);
        assert_eq!(bits.pnode_sz, 15);
        assert_eq!(bits.nnode_sz, 11);
    }

    #[test]
    fn test_pnode_pack() {
        let bits = small_bits();
        let mut pnode = Pnode::default();
        pnode.entries[0] = PnodeEntry { free: 16384 - 2048, dirty: 64, index: false };
        pnode.entries[3] = PnodeEntry { free: 0, dirty: 8, index: true };
        let buf = pnode.pack(&bits);
        assert_eq!(LptBits::peek_type(&buf), Some(LptNodeType::Pnode));
        assert_eq!(Pnode::unpack(&bits, &buf).unwrap(), pnode);
    }

    #[test]
    fn test_nnode_empty_branch() {
        let bits = small_bits();
        let mut nnode = Nnode::default();
        nnode.branches[0] = NnodeBranch { lnum: 8, offs: 30 };
        let buf = nnode.pack(&bits, 7);
        let parsed = Nnode::unpack(&bits, &buf, 7).unwrap();
        assert_eq!(parsed.branches[0], NnodeBranch { lnum: 8, offs: 30 });
        assert_eq!(parsed.branches[1], NnodeBranch { lnum: 0, offs: 0 });
    }

    #[test]
    fn test_corrupted_node_is_rejected() {
        let bits = small_bits();
        let mut buf = pack_ltab(&bits, &[LtabEntry { free: 100, dirty: 4 }, LtabEntry::default()]);
        assert!(unpack_ltab(&bits, &buf).is_ok());
        buf[3] ^= 0x10;
        assert!(unpack_ltab(&bits, &buf).is_err());
        assert!(Pnode::unpack(&bits, &pack_lsave(&bits, &[0; 256])).is_err());
    }

    #[test]
    fn test_reader_borrows_the_buffer() {
        let buf = pack_lsave(&small_bits(), &[9; 256]);
        // the geometry is gone before the body is read
        let (mut r, lnum_bits) = {
            let bits = small_bits();
            (bits.check_header(&buf, bits.lsave_sz, LptNodeType::Lsave).unwrap(), bits.lnum_bits)
        };
        assert_eq!(r.unpack(lnum_bits), 9);
        assert!(small_bits().check_header(&buf[..2], 3, LptNodeType::Lsave).is_err());
    }

    #[test]
    fn test_calc_nnode_num() {
        assert_eq!(calc_nnode_num(0, 0), 1);
        assert_eq!(calc_nnode_num(1, 2), 6);
        assert_eq!(calc_nnode_num(2, 5), 0b1_01_01);
    }
}
