/// LEB scanner
///
/// Walks the nodes of a LEB at 8-byte alignment. Padding nodes and padding
/// bytes are skipped, erased space ends the scan. Anything else that does not
/// check out stops the scan at the offending offset; the nodes found before
/// it are still returned.

use byteorder::{ByteOrder, LittleEndian};

use super::Volume;
use crate::error::Result;
use crate::media::*;

/// Allowed length range per node type
#[derive(Debug, Clone)]
pub struct NodeRanges {
    min: [u32; NODE_TYPES_CNT],
    max: [u32; NODE_TYPES_CNT],
}

impl NodeRanges {
    pub fn new(leb_size: u32, fanout: u32) -> Self {
        let mut min = [0u32; NODE_TYPES_CNT];
        let mut max = [0u32; NODE_TYPES_CNT];
        let mut set = |t: NodeType, lo: u32, hi: u32| {
            min[t as usize] = lo;
            max[t as usize] = hi;
        };
        set(NodeType::Pad, PAD_NODE_SZ, PAD_NODE_SZ);
        set(NodeType::Sb, SB_NODE_SZ, SB_NODE_SZ);
        set(NodeType::Mst, MST_NODE_SZ, MST_NODE_SZ);
        set(NodeType::Ref, REF_NODE_SZ, REF_NODE_SZ);
        set(NodeType::Trun, TRUN_NODE_SZ, TRUN_NODE_SZ);
        set(NodeType::Cs, CS_NODE_SZ, CS_NODE_SZ);
        set(NodeType::Ino, INO_NODE_SZ, MAX_INO_NODE_SZ);
        set(NodeType::Data, DATA_NODE_SZ, MAX_DATA_NODE_SZ);
        set(NodeType::Dent, DENT_NODE_SZ, MAX_DENT_NODE_SZ);
        set(NodeType::Xent, XENT_NODE_SZ, MAX_XENT_NODE_SZ);
        set(NodeType::Orph, ORPH_NODE_SZ + 8, leb_size);
        set(NodeType::Idx, idx_node_sz(1), idx_node_sz(fanout.max(1)));
        set(NodeType::Auth, AUTH_NODE_SZ, AUTH_NODE_SZ + MAX_HMAC_LEN);
        set(
            NodeType::Sig,
            SIG_NODE_SZ,
            leb_size.saturating_sub(SB_NODE_SZ).max(SIG_NODE_SZ),
        );
        Self { min, max }
    }

    pub fn check(&self, node_type: NodeType, len: u32) -> bool {
        let t = node_type as usize;
        len >= self.min[t] && len <= self.max[t]
    }
}

/// A node found by the scanner, copied out of the LEB
#[derive(Debug, Clone)]
pub struct ScannedNode {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub node_type: NodeType,
    pub sqnum: u64,
    /// Leaf key for keyed node types
    pub key: Option<Key>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ScannedLeb {
    pub lnum: u32,
    pub nodes: Vec<ScannedNode>,
    /// End of the written part, aligned to the minimal I/O unit
    pub endpt: u32,
    /// Offset of the first corruption, if any
    pub corrupted_at: Option<u32>,
}

impl ScannedLeb {
    pub fn is_corrupted(&self) -> bool {
        self.corrupted_at.is_some()
    }

    /// True if the LEB holds index nodes only
    pub fn is_index(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.node_type == NodeType::Idx)
    }

    /// True if the LEB mixes index and non-index nodes
    pub fn is_mixed(&self) -> bool {
        let idx = self.nodes.iter().filter(|n| n.node_type == NodeType::Idx).count();
        idx != 0 && idx != self.nodes.len()
    }
}

enum Step {
    Node(NodeType, u32),
    Skip(u32),
    Empty,
    Garbage(&'static str),
}

/// Check one node at the start of `buf`
fn scan_a_node(buf: &[u8], offs: u32, leb_size: u32, ranges: &NodeRanges) -> Step {
    if buf.len() >= 4 && LittleEndian::read_u32(&buf[0..4]) == 0xFFFF_FFFF {
        return Step::Empty;
    }
    if buf.len() < CH_SZ as usize || LittleEndian::read_u32(&buf[0..4]) != NODE_MAGIC {
        let pad_len = buf.iter().take_while(|&&b| b == PADDING_BYTE).count() as u32;
        if pad_len == 0 || pad_len & 7 != 0 {
            return Step::Garbage("bad node magic");
        }
        return Step::Skip(pad_len);
    }

    let ch = match CommonHeader::parse(buf) {
        Ok(ch) => ch,
        Err(_) => return Step::Garbage("truncated node header"),
    };
    let node_type = match ch.node_type() {
        Some(t) => t,
        None => return Step::Garbage("bad node type"),
    };
    if !ranges.check(node_type, ch.len) {
        return Step::Garbage("bad node length");
    }
    if offs + ch.len > leb_size || ch.len as usize > buf.len() {
        return Step::Garbage("node crosses the LEB boundary");
    }
    if node_crc(&buf[..ch.len as usize]) != ch.crc {
        return Step::Garbage("bad node CRC");
    }

    if node_type == NodeType::Pad {
        let pad_len = LittleEndian::read_u32(&buf[24..28]);
        let total = ch.len as u64 + pad_len as u64;
        if offs as u64 + total > leb_size as u64 || total & 7 != 0 {
            return Step::Garbage("bad padding length");
        }
        return Step::Skip(total as u32);
    }
    Step::Node(node_type, ch.len)
}

/// Scan LEB `lnum` starting at `offs`
pub fn scan_leb(vol: &dyn Volume, ranges: &NodeRanges, lnum: u32, offs: u32) -> Result<ScannedLeb> {
    let leb_size = vol.leb_size();
    let min_io = vol.min_io_size();
    let buf = vol.read_leb(lnum)?;
    let mut nodes = Vec::new();
    let mut pos = offs;
    let mut corrupted_at = None;

    while pos + 8 <= leb_size {
        let rest = &buf[pos as usize..];
        match scan_a_node(rest, pos, leb_size, ranges) {
            Step::Empty => break,
            Step::Skip(len) => pos += len,
            Step::Garbage(why) => {
                tracing::debug!("LEB {}:{}: {}", lnum, pos, why);
                corrupted_at = Some(pos);
                break;
            }
            Step::Node(node_type, len) => {
                let data = rest[..len as usize].to_vec();
                let key = if node_type.has_key() && node_type != NodeType::Trun {
                    Key::read(&data[24..]).ok()
                } else if node_type == NodeType::Trun {
                    Some(Key::trun(LittleEndian::read_u32(&data[24..28])))
                } else {
                    None
                };
                nodes.push(ScannedNode {
                    lnum,
                    offs: pos,
                    len,
                    node_type,
                    sqnum: LittleEndian::read_u64(&data[8..16]),
                    key,
                    data,
                });
                pos += align(len, 8);
            }
        }
    }

    if corrupted_at.is_none() && pos < leb_size {
        if pos % min_io != 0 {
            tracing::debug!("LEB {}: empty space starts at non-aligned offset {}", lnum, pos);
            corrupted_at = Some(pos);
        } else if let Some(dirty) = buf[pos as usize..].iter().position(|&b| b != EMPTY_BYTE) {
            tracing::debug!("LEB {}: garbage in empty space at offset {}", lnum, pos as usize + dirty);
            corrupted_at = Some(pos);
        }
    }

    Ok(ScannedLeb {
        lnum,
        nodes,
        endpt: align(pos.min(leb_size), min_io),
        corrupted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemVolume;

    const LEB: u32 = 16384;

    fn ino_node(inum: u32, sqnum: u64) -> Vec<u8> {
        InoNode {
            key: Key::ino(inum),
            creat_sqnum: sqnum,
            size: 0,
            atime_sec: 0,
            ctime_sec: 0,
            mtime_sec: 0,
            atime_nsec: 0,
            ctime_nsec: 0,
            mtime_nsec: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            mode: S_IFREG | 0o644,
            flags: 0,
            data_len: 0,
            xattr_cnt: 0,
            xattr_size: 0,
            xattr_names: 0,
            compr_type: 0,
            data: Vec::new(),
        }
        .encode(sqnum)
    }

    fn leb_with(nodes: &[Vec<u8>], min_io: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        for node in nodes {
            buf.extend_from_slice(node);
            let aligned = align(buf.len() as u32, 8) as usize;
            buf.resize(aligned, PADDING_BYTE);
        }
        let end = align(buf.len() as u32, min_io) as usize;
        let start = buf.len();
        buf.resize(end, 0);
        pad_space(&mut buf[start..end]);
        buf
    }

    #[test]
    fn test_scan_clean_leb() {
        let mut vol = MemVolume::new(LEB, 4, 64);
        let leb = leb_with(&[ino_node(65, 10), ino_node(66, 11)], 64);
        vol.write(2, 0, &leb).unwrap();
        let ranges = NodeRanges::new(LEB, 8);

        let sleb = scan_leb(&vol, &ranges, 2, 0).unwrap();
        assert!(!sleb.is_corrupted());
        assert_eq!(sleb.nodes.len(), 2);
        assert_eq!(sleb.nodes[1].offs, 160);
        assert_eq!(sleb.nodes[1].key, Some(Key::ino(66)));
        assert_eq!(sleb.endpt, 320);
    }

    #[test]
    fn test_scan_stops_at_corruption() {
        let mut vol = MemVolume::new(LEB, 4, 8);
        let leb = leb_with(&[ino_node(65, 10), ino_node(66, 11)], 8);
        vol.write(1, 0, &leb).unwrap();
        vol.raw_mut(1)[200] ^= 0xFF;
        let ranges = NodeRanges::new(LEB, 8);

        let sleb = scan_leb(&vol, &ranges, 1, 0).unwrap();
        assert_eq!(sleb.nodes.len(), 1);
        assert_eq!(sleb.corrupted_at, Some(160));
    }

    #[test]
    fn test_garbage_after_free_space() {
        let mut vol = MemVolume::new(LEB, 4, 8);
        vol.write(0, 0, &leb_with(&[ino_node(65, 1)], 8)).unwrap();
        vol.write(0, 4096, &[0u8; 8]).unwrap();
        let ranges = NodeRanges::new(LEB, 8);
        let sleb = scan_leb(&vol, &ranges, 0, 0).unwrap();
        assert_eq!(sleb.nodes.len(), 1);
        assert_eq!(sleb.corrupted_at, Some(160));
    }

    #[test]
    fn test_empty_leb() {
        let vol = MemVolume::new(LEB, 4, 8);
        let sleb = scan_leb(&vol, &NodeRanges::new(LEB, 8), 3, 0).unwrap();
        assert!(sleb.nodes.is_empty());
        assert!(!sleb.is_corrupted());
        assert_eq!(sleb.endpt, 0);
    }
}
