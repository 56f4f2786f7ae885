#![forbid(unsafe_code)]
//! Identifier types and on-disk geometry constants for tidefs.
//!
//! Every multibyte integer on disk is little-endian. The constants here fix
//! the volume layout; changing any of them changes the on-disk format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── On-disk geometry ────────────────────────────────────────────────────────

/// Block size in bytes; the smallest supported page size.
pub const BLOCK_SIZE: u32 = 4096;
/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;

/// First block of the super ping-pong pair (64 KiB into the device).
pub const SUPER_BLKNO: u64 = 16;
/// Number of super pair blocks.
pub const SUPER_NR: u64 = 2;

/// First block of the self-host bitmap ping-pong pair.
pub const BUDDY_BM_BLKNO: u64 = SUPER_BLKNO + SUPER_NR;
/// Number of self-host bitmap pair blocks.
pub const BUDDY_BM_NR: u64 = 2;

/// Number of buddy orders; the largest extent is `2^(BUDDY_ORDERS - 1)` blocks.
pub const BUDDY_ORDERS: usize = 5;
/// Order-0 bits per buddy block; one slot covers this many blocks.
pub const BUDDY_ORDER0_BITS: u32 = 16384;
/// Slots in the buddy indirect block.
pub const BUDDY_SLOTS: usize = 160;

/// Physical block numbers per block-map item.
pub const BLOCK_MAP_COUNT: usize = 16;
/// log2 of [`BLOCK_MAP_COUNT`]; shift from logical block to item offset.
pub const BLOCK_MAP_SHIFT: u32 = 4;
/// Mask from logical block to index within an item.
pub const BLOCK_MAP_MASK: u64 = BLOCK_MAP_COUNT as u64 - 1;

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Physical device block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// The null block number; never a valid allocation.
    pub const NULL: Self = Self(0);

    /// Whether this is the null sentinel.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block on the device, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(u64::from(BLOCK_SIZE))
    }
}

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Commit sequence number. Advances once per committed transaction; blocks
/// dirtied in a transaction carry its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitSeq(pub u64);

impl CommitSeq {
    /// The next sequence.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Reference to a metadata block: location plus the sequence it was dirtied
/// at. A zero `blkno` means the reference is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub blkno: BlockNumber,
    pub seq: CommitSeq,
}

impl BlockRef {
    /// Encoded size on disk.
    pub const SIZE: usize = 16;

    /// The absent reference.
    pub const NULL: Self = Self {
        blkno: BlockNumber::NULL,
        seq: CommitSeq(0),
    };

    #[must_use]
    pub fn new(blkno: BlockNumber, seq: CommitSeq) -> Self {
        Self { blkno, seq }
    }

    /// Whether the reference is absent.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.blkno.is_null()
    }

    /// Decode from 16 little-endian bytes at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            blkno: BlockNumber(read_le_u64(data, offset)?),
            seq: CommitSeq(read_le_u64(data, offset + 8)?),
        })
    }

    /// Encode into 16 little-endian bytes at `offset`.
    pub fn encode(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.blkno.0)?;
        write_le_u64(data, offset + 8, self.seq.0)
    }
}

// ── Item keys ───────────────────────────────────────────────────────────────

/// Item key namespace; one value per kind of metadata item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyKind {
    Inode = 1,
    Xattr = 2,
    Dirent = 3,
    LinkBackref = 4,
    Symlink = 5,
    Extent = 6,
    Bmap = 7,
}

/// Key of a metadata item: `(inode, kind, offset)`, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub ino: InodeNumber,
    pub kind: KeyKind,
    pub offset: u64,
}

impl ItemKey {
    #[must_use]
    pub fn new(ino: InodeNumber, kind: KeyKind, offset: u64) -> Self {
        Self { ino, kind, offset }
    }

    /// Key of the block-map item covering logical block `iblock`.
    #[must_use]
    pub fn bmap(ino: InodeNumber, iblock: u64) -> Self {
        Self::new(ino, KeyKind::Bmap, iblock >> BLOCK_MAP_SHIFT)
    }
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let end = offset.checked_add(4).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    let end = offset.checked_add(8).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 8,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = vec![0u8; 16];
        write_le_u32(&mut buf, 0, 0x1234_5678).unwrap();
        write_le_u64(&mut buf, 4, 0x90AB_CDEF_0102_0304).unwrap();
        assert_eq!(read_le_u32(&buf, 0).unwrap(), 0x1234_5678);
        assert_eq!(read_le_u64(&buf, 4).unwrap(), 0x90AB_CDEF_0102_0304);
    }

    #[test]
    fn read_past_end_fails() {
        let buf = [0u8; 4];
        assert!(read_le_u64(&buf, 0).is_err());
        assert!(read_le_u32(&buf, 2).is_err());
        assert!(write_le_u32(&mut [0u8; 2], 0, 1).is_err());
    }

    #[test]
    fn block_ref_round_trip() {
        let mut buf = vec![0u8; 32];
        let r = BlockRef::new(BlockNumber(42), CommitSeq(7));
        r.encode(&mut buf, 8).unwrap();
        assert_eq!(BlockRef::parse(&buf, 8).unwrap(), r);
        assert!(!r.is_null());
        assert!(BlockRef::NULL.is_null());
    }

    #[test]
    fn bmap_key_groups_sixteen_blocks() {
        let ino = InodeNumber(5);
        assert_eq!(ItemKey::bmap(ino, 0), ItemKey::bmap(ino, 15));
        assert_ne!(ItemKey::bmap(ino, 15), ItemKey::bmap(ino, 16));
        assert_eq!(ItemKey::bmap(ino, 16).offset, 1);
    }

    #[test]
    fn item_keys_order_by_inode_then_kind_then_offset() {
        let a = ItemKey::new(InodeNumber(1), KeyKind::Bmap, 100);
        let b = ItemKey::new(InodeNumber(2), KeyKind::Inode, 0);
        let c = ItemKey::new(InodeNumber(2), KeyKind::Bmap, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn geometry_constants_are_consistent() {
        assert_eq!(1u32 << BLOCK_SHIFT, BLOCK_SIZE);
        assert_eq!(1usize << BLOCK_MAP_SHIFT, BLOCK_MAP_COUNT);
        assert_eq!(BLOCK_MAP_MASK, BLOCK_MAP_COUNT as u64 - 1);
        assert!(BUDDY_ORDER0_BITS.is_power_of_two());
        // The largest order extent must divide a slot's coverage.
        assert_eq!(BUDDY_ORDER0_BITS % (1 << (BUDDY_ORDERS - 1)), 0);
    }

    #[test]
    fn commit_seq_advances() {
        assert_eq!(CommitSeq(3).next(), CommitSeq(4));
    }
}
