/// Node keys
///
/// Simple key format: 32-bit inode number followed by a 32-bit word holding
/// the 3-bit key type in its top bits and a 29-bit value (block number or
/// name hash). Keys order by inode number, then type, then value.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Bytes a key occupies in an index branch
pub const KEY_LEN: usize = 8;
/// Bytes reserved for a key inside leaf nodes
pub const MAX_KEY_LEN: usize = 16;

pub const KEY_TYPE_BITS: u32 = 3;
pub const KEY_VALUE_BITS: u32 = 29;
pub const KEY_VALUE_MASK: u32 = (1 << KEY_VALUE_BITS) - 1;
pub const KEY_BLOCK_MASK: u32 = KEY_VALUE_MASK;

/// Largest file size representable by a data key
pub const MAX_INODE_SZ: u64 = (1u64 << KEY_VALUE_BITS) * super::BLOCK_SIZE as u64;

/// Name hash values 0..=2 are reserved for "." / ".." style entries
const HASH_RESERVED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
    /// Truncation nodes are not indexed; the type only exists while replaying
    Trun = 4,
}

impl KeyType {
    pub fn from_u32(value: u32) -> Option<Self> {
        let key_type = match value {
            0 => KeyType::Ino,
            1 => KeyType::Data,
            2 => KeyType::Dent,
            3 => KeyType::Xent,
            4 => KeyType::Trun,
            _ => return None,
        };
        Some(key_type)
    }
}

/// Directory entry name hash function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHash {
    R5,
    Test,
}

impl KeyHash {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(KeyHash::R5),
            1 => Some(KeyHash::Test),
            _ => None,
        }
    }

    pub fn hash(self, name: &[u8]) -> u32 {
        let raw = match self {
            KeyHash::R5 => r5_hash(name),
            KeyHash::Test => test_hash(name),
        };
        let mut hash = raw & KEY_VALUE_MASK;
        if hash <= HASH_RESERVED {
            hash += 3;
        }
        hash
    }
}

fn r5_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &byte in name {
        let s = byte as i8 as i32;
        a = a.wrapping_add((s << 4) as u32);
        a = a.wrapping_add((s >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    a
}

fn test_hash(name: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let len = name.len().min(4);
    word[..len].copy_from_slice(&name[..len]);
    u32::from_le_bytes(word)
}

/// A node key in simple format
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub inum: u32,
    pub raw: u32,
}

impl Key {
    pub fn ino(inum: u32) -> Self {
        Self { inum, raw: 0 }
    }

    pub fn data(inum: u32, block: u32) -> Self {
        Self {
            inum,
            raw: ((KeyType::Data as u32) << KEY_VALUE_BITS) | (block & KEY_BLOCK_MASK),
        }
    }

    pub fn dent(inum: u32, hash: u32) -> Self {
        Self {
            inum,
            raw: ((KeyType::Dent as u32) << KEY_VALUE_BITS) | (hash & KEY_VALUE_MASK),
        }
    }

    pub fn xent(inum: u32, hash: u32) -> Self {
        Self {
            inum,
            raw: ((KeyType::Xent as u32) << KEY_VALUE_BITS) | (hash & KEY_VALUE_MASK),
        }
    }

    pub fn trun(inum: u32) -> Self {
        Self {
            inum,
            raw: (KeyType::Trun as u32) << KEY_VALUE_BITS,
        }
    }

    /// Lowest key of inode `inum`
    pub fn lowest(inum: u32) -> Self {
        Self::ino(inum)
    }

    /// Highest key of inode `inum`
    pub fn highest(inum: u32) -> Self {
        Self {
            inum,
            raw: u32::MAX,
        }
    }

    /// Raw type bits, which may be out of range on corrupted media
    pub fn type_bits(&self) -> u32 {
        self.raw >> KEY_VALUE_BITS
    }

    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::from_u32(self.type_bits())
    }

    pub fn value(&self) -> u32 {
        self.raw & KEY_VALUE_MASK
    }

    pub fn block(&self) -> u32 {
        self.raw & KEY_BLOCK_MASK
    }

    /// Decode a key from its on-flash representation
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < KEY_LEN {
            bail!("Insufficient data for key");
        }
        Ok(Self {
            inum: LittleEndian::read_u32(&data[0..4]),
            raw: LittleEndian::read_u32(&data[4..8]),
        })
    }

    /// Encode the key into `buf`, zeroing the rest of a leaf key field
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.inum);
        LittleEndian::write_u32(&mut buf[4..8], self.raw);
        let end = buf.len().min(MAX_KEY_LEN);
        if end > KEY_LEN {
            buf[KEY_LEN..end].fill(0);
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_type() {
            Some(KeyType::Ino) => write!(f, "({}, inode)", self.inum),
            Some(KeyType::Data) => write!(f, "({}, data, {})", self.inum, self.block()),
            Some(KeyType::Dent) => write!(f, "({}, direntry, {:#08x})", self.inum, self.value()),
            Some(KeyType::Xent) => write!(f, "({}, xentry, {:#08x})", self.inum, self.value()),
            Some(KeyType::Trun) => write!(f, "({}, truncate)", self.inum),
            None => write!(f, "({}, invalid key type {})", self.inum, self.type_bits()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let ino = Key::ino(70);
        let data0 = Key::data(70, 0);
        let data9 = Key::data(70, 9);
        let dent = Key::dent(70, 5);
        let next = Key::ino(71);
        assert!(ino < data0);
        assert!(data0 < data9);
        assert!(data9 < dent);
        assert!(dent < Key::highest(70));
        assert!(Key::highest(70) < next);
    }

    #[test]
    fn test_key_fields() {
        let key = Key::data(80, 1234);
        assert_eq!(key.key_type(), Some(KeyType::Data));
        assert_eq!(key.block(), 1234);
        assert_eq!(Key::trun(3).key_type(), Some(KeyType::Trun));
        let bogus = Key { inum: 1, raw: 7 << KEY_VALUE_BITS };
        assert_eq!(bogus.key_type(), None);
    }

    #[test]
    fn test_hash_skips_reserved_values() {
        for name in [&b""[..], b"a", b"lost+found", b"\xff\xfe"] {
            assert!(KeyHash::R5.hash(name) > HASH_RESERVED);
            assert!(KeyHash::Test.hash(name) > HASH_RESERVED);
        }
        assert_eq!(KeyHash::Test.hash(b""), 3);
        assert_eq!(KeyHash::Test.hash(b"abcd"), u32::from_le_bytes(*b"abcd") & KEY_VALUE_MASK);
    }

    #[test]
    fn test_key_write_read() {
        let mut buf = [0xAAu8; MAX_KEY_LEN];
        let key = Key::dent(1, KeyHash::R5.hash(b"file"));
        key.write(&mut buf);
        assert_eq!(Key::read(&buf).unwrap(), key);
        assert!(buf[KEY_LEN..].iter().all(|&b| b == 0));
    }
}
