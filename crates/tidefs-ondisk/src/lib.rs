#![forbid(unsafe_code)]
//! On-disk block layouts and codecs for tidefs.
//!
//! Every metadata block is one [`BLOCK_SIZE`] buffer starting with a
//! [`BlockHeader`]. Field access is by fixed little-endian offsets; nothing
//! on disk goes through serde.
//!
//! Layouts:
//!
//! - **Super block**: header, blake3 fingerprint, volume geometry, and the
//!   two allocator references (`buddy_bm_ref`, `buddy_ind_ref`).
//! - **Self-host bitmap block**: header + one bit per buddy-metadata block.
//! - **Buddy block**: header + per-order popcount cache + the per-order
//!   sub-bitmaps packed as a geometric series (order 0 first, each higher
//!   order half as many bits).
//! - **Buddy indirect block**: header + per-order free totals + fixed slot
//!   array of `{ref, free_orders}`.
//! - **Block-map item**: `[u64; BLOCK_MAP_COUNT]` physical block numbers.

use tidefs_error::{Result, TideError};
use tidefs_types::{
    BlockNumber, BlockRef, CommitSeq, ParseError, read_le_u32, read_le_u64, write_le_u32,
    write_le_u64, BLOCK_MAP_COUNT, BLOCK_SIZE, BUDDY_BM_BLKNO, BUDDY_BM_NR, BUDDY_ORDER0_BITS,
    BUDDY_ORDERS, BUDDY_SLOTS, SUPER_BLKNO,
};

// ── Block header ────────────────────────────────────────────────────────────

/// Magic of the super block.
pub const SUPER_MAGIC: u32 = 0x5464_5350;
/// Magic of the self-host bitmap block.
pub const BITMAP_MAGIC: u32 = 0x5464_424D;
/// Magic of a buddy block.
pub const BUDDY_MAGIC: u32 = 0x5464_4244;
/// Magic of the buddy indirect block.
pub const INDIRECT_MAGIC: u32 = 0x5464_494E;

/// Size of the header at the front of every metadata block.
pub const HDR_SIZE: usize = 32;

const HDR_MAGIC_OFF: usize = 0;
const HDR_FSID_OFF: usize = 8;
const HDR_BLKNO_OFF: usize = 16;
const HDR_SEQ_OFF: usize = 24;

/// Header at the front of every metadata block.
///
/// `seq` is stamped when the block is dirtied and must match the `seq` of
/// any [`BlockRef`] naming the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub fsid: u64,
    pub blkno: BlockNumber,
    pub seq: CommitSeq,
}

impl BlockHeader {
    /// Decode the header of a block buffer.
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            magic: read_le_u32(data, HDR_MAGIC_OFF)?,
            fsid: read_le_u64(data, HDR_FSID_OFF)?,
            blkno: BlockNumber(read_le_u64(data, HDR_BLKNO_OFF)?),
            seq: CommitSeq(read_le_u64(data, HDR_SEQ_OFF)?),
        })
    }

    /// Stamp this header onto the front of a block buffer.
    pub fn encode(&self, data: &mut [u8]) -> std::result::Result<(), ParseError> {
        write_le_u32(data, HDR_MAGIC_OFF, self.magic)?;
        write_le_u32(data, HDR_MAGIC_OFF + 4, 0)?;
        write_le_u64(data, HDR_FSID_OFF, self.fsid)?;
        write_le_u64(data, HDR_BLKNO_OFF, self.blkno.0)?;
        write_le_u64(data, HDR_SEQ_OFF, self.seq.0)
    }
}

// ── Super block ─────────────────────────────────────────────────────────────

const SUPER_FP_OFF: usize = 32;
const SUPER_FP_LEN: usize = 32;
const SUPER_TOTAL_OFF: usize = 64;
const SUPER_BUDDY_BLOCKS_OFF: usize = 72;
const SUPER_BM_REF_OFF: usize = 80;
const SUPER_IND_REF_OFF: usize = 96;
const SUPER_PAYLOAD_END: usize = 112;

/// Parsed super block.
///
/// The process keeps two copies: the dirty one mutated in flight and the
/// stable one from the last commit. The on-disk copy ping-pongs between the
/// two super pair blocks, side selected by `seq & 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub fsid: u64,
    pub seq: CommitSeq,
    pub total_blocks: u64,
    pub buddy_blocks: u32,
    pub buddy_bm_ref: BlockRef,
    pub buddy_ind_ref: BlockRef,
}

impl Superblock {
    /// Device block the super with sequence `seq` is written to.
    #[must_use]
    pub fn side_blkno(seq: CommitSeq) -> BlockNumber {
        BlockNumber(SUPER_BLKNO + (seq.0 & 1))
    }

    /// First device block covered by the buddy allocator.
    #[must_use]
    pub fn first_blkno(&self) -> u64 {
        BUDDY_BM_BLKNO + BUDDY_BM_NR + u64::from(self.buddy_blocks)
    }

    /// Slot in the indirect block covering `blkno`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn indirect_slot(&self, blkno: BlockNumber) -> usize {
        ((blkno.0 - self.first_blkno()) / u64::from(BUDDY_ORDER0_BITS)) as usize
    }

    /// Number of device blocks managed by slot `sl` (the last slot may be
    /// clipped by `total_blocks`).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_count(&self, sl: usize) -> u32 {
        let first = self.first_blkno() + sl as u64 * u64::from(BUDDY_ORDER0_BITS);
        self.total_blocks
            .saturating_sub(first)
            .min(u64::from(BUDDY_ORDER0_BITS)) as u32
    }

    /// Number of slots with a nonzero block count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_total(&self) -> usize {
        let covered = self.total_blocks.saturating_sub(self.first_blkno());
        covered.div_ceil(u64::from(BUDDY_ORDER0_BITS)) as usize
    }

    /// Order-0 bit offset of `blkno` within its slot.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn buddy_bit(&self, blkno: BlockNumber) -> u32 {
        ((blkno.0 - self.first_blkno()) % u64::from(BUDDY_ORDER0_BITS)) as u32
    }

    /// Whether `blkno` could start an extent of `order`.
    #[must_use]
    pub fn valid_order(&self, blkno: BlockNumber, order: usize) -> bool {
        blkno.0 >= self.first_blkno() && self.buddy_bit(blkno) & ((1 << order) - 1) == 0
    }

    /// Device block of the order-`order` bit `nr` in slot `sl`.
    #[must_use]
    pub fn slot_buddy_blkno(&self, sl: usize, order: usize, nr: u32) -> BlockNumber {
        BlockNumber(
            self.first_blkno()
                + sl as u64 * u64::from(BUDDY_ORDER0_BITS)
                + (u64::from(nr) << order),
        )
    }

    /// Encode a full super block buffer, fingerprint included.
    pub fn encode_block(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        BlockHeader {
            magic: SUPER_MAGIC,
            fsid: self.fsid,
            blkno: Self::side_blkno(self.seq),
            seq: self.seq,
        }
        .encode(&mut buf)?;
        write_le_u64(&mut buf, SUPER_TOTAL_OFF, self.total_blocks)?;
        write_le_u32(&mut buf, SUPER_BUDDY_BLOCKS_OFF, self.buddy_blocks)?;
        self.buddy_bm_ref.encode(&mut buf, SUPER_BM_REF_OFF)?;
        self.buddy_ind_ref.encode(&mut buf, SUPER_IND_REF_OFF)?;
        let fp = fingerprint(&buf);
        buf[SUPER_FP_OFF..SUPER_FP_OFF + SUPER_FP_LEN].copy_from_slice(&fp);
        Ok(buf)
    }

    /// Parse and verify a super block buffer read from `blkno`.
    pub fn parse_block(data: &[u8], blkno: BlockNumber) -> Result<Self> {
        if data.len() < SUPER_PAYLOAD_END {
            return Err(TideError::corrupt(blkno.0, "short super block"));
        }
        let hdr = BlockHeader::parse(data)?;
        if hdr.magic != SUPER_MAGIC {
            return Err(TideError::corrupt(blkno.0, "bad super magic"));
        }
        if hdr.blkno != blkno {
            return Err(TideError::corrupt(blkno.0, "super header blkno mismatch"));
        }
        let fp = fingerprint(data);
        if data[SUPER_FP_OFF..SUPER_FP_OFF + SUPER_FP_LEN] != fp {
            return Err(TideError::corrupt(blkno.0, "super fingerprint mismatch"));
        }
        Ok(Self {
            fsid: hdr.fsid,
            seq: hdr.seq,
            total_blocks: read_le_u64(data, SUPER_TOTAL_OFF)?,
            buddy_blocks: read_le_u32(data, SUPER_BUDDY_BLOCKS_OFF)?,
            buddy_bm_ref: BlockRef::parse(data, SUPER_BM_REF_OFF)?,
            buddy_ind_ref: BlockRef::parse(data, SUPER_IND_REF_OFF)?,
        })
    }
}

/// Fingerprint of a super block buffer: blake3 over the header and payload,
/// excluding the fingerprint field itself.
fn fingerprint(data: &[u8]) -> [u8; SUPER_FP_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&data[..SUPER_FP_OFF]);
    hasher.update(&data[SUPER_FP_OFF + SUPER_FP_LEN..SUPER_PAYLOAD_END]);
    *hasher.finalize().as_bytes()
}

// ── Self-host bitmap block ──────────────────────────────────────────────────

/// Byte offset of the bitmap bits.
pub const BITMAP_BITS_OFF: usize = HDR_SIZE;
/// Bits a bitmap block can hold.
pub const BITMAP_CAPACITY: u32 = (BLOCK_SIZE as usize - BITMAP_BITS_OFF) as u32 * 8;

// ── Buddy block ─────────────────────────────────────────────────────────────

const BUDDY_COUNTS_OFF: usize = HDR_SIZE;
/// Byte offset of the order sub-bitmaps in a buddy block.
pub const BUDDY_BITS_OFF: usize = BUDDY_COUNTS_OFF + BUDDY_ORDERS * 4 + 4;
/// Total bits across all order sub-bitmaps.
pub const BUDDY_TOTAL_BITS: u32 = 2 * BUDDY_ORDER0_BITS - (BUDDY_ORDER0_BITS >> (BUDDY_ORDERS - 1));

/// Starting bit offset of an order's sub-bitmap within the bits area.
///
/// Order 0 occupies the first `BUDDY_ORDER0_BITS` bits; each higher order
/// half as many, packed immediately after. Accepts `order == BUDDY_ORDERS`
/// to name the end of the last sub-bitmap.
#[must_use]
pub fn buddy_order_off(order: usize) -> u32 {
    if order == 0 {
        0
    } else {
        2 * BUDDY_ORDER0_BITS - (BUDDY_ORDER0_BITS >> (order - 1))
    }
}

/// Absolute bit offset of order bit `nr`.
#[must_use]
pub fn buddy_order_nr(order: usize, nr: u32) -> u32 {
    buddy_order_off(order) + nr
}

/// Cached popcount of an order's sub-bitmap.
#[must_use]
pub fn buddy_order_count(buf: &[u8], order: usize) -> u32 {
    le32(buf, BUDDY_COUNTS_OFF + order * 4)
}

/// Store an order's popcount.
pub fn buddy_set_order_count(buf: &mut [u8], order: usize, count: u32) {
    put32(buf, BUDDY_COUNTS_OFF + order * 4, count);
}

// ── Buddy indirect block ────────────────────────────────────────────────────

const IND_TOTALS_OFF: usize = HDR_SIZE;
const IND_SLOTS_OFF: usize = IND_TOTALS_OFF + BUDDY_ORDERS * 8;
const IND_SLOT_SIZE: usize = 24;
const IND_SLOT_FREE_ORDERS_OFF: usize = 16;

/// Aggregate free-region count for an order across all slots.
#[must_use]
pub fn ind_order_total(buf: &[u8], order: usize) -> u64 {
    le64(buf, IND_TOTALS_OFF + order * 8)
}

/// Adjust an order's aggregate free-region count.
pub fn ind_add_order_total(buf: &mut [u8], order: usize, delta: i64) {
    let off = IND_TOTALS_OFF + order * 8;
    let total = le64(buf, off).wrapping_add_signed(delta);
    put64(buf, off, total);
}

/// Reference of slot `sl`.
#[must_use]
pub fn ind_slot_ref(buf: &[u8], sl: usize) -> BlockRef {
    let off = IND_SLOTS_OFF + sl * IND_SLOT_SIZE;
    BlockRef {
        blkno: BlockNumber(le64(buf, off)),
        seq: CommitSeq(le64(buf, off + 8)),
    }
}

/// Store the reference of slot `sl`.
pub fn ind_set_slot_ref(buf: &mut [u8], sl: usize, r: BlockRef) {
    let off = IND_SLOTS_OFF + sl * IND_SLOT_SIZE;
    put64(buf, off, r.blkno.0);
    put64(buf, off + 8, r.seq.0);
}

/// Free-order bitmap of slot `sl`; bit *k* set when the slot's buddy block
/// has at least one free region of order *k*.
#[must_use]
pub fn ind_slot_free_orders(buf: &[u8], sl: usize) -> u8 {
    buf[IND_SLOTS_OFF + sl * IND_SLOT_SIZE + IND_SLOT_FREE_ORDERS_OFF]
}

/// Store the free-order bitmap of slot `sl`.
pub fn ind_set_slot_free_orders(buf: &mut [u8], sl: usize, free: u8) {
    buf[IND_SLOTS_OFF + sl * IND_SLOT_SIZE + IND_SLOT_FREE_ORDERS_OFF] = free;
}

// ── Block-map item ──────────────────────────────────────────────────────────

/// Encoded size of a block-map item.
pub const BMAP_ITEM_LEN: usize = BLOCK_MAP_COUNT * 8;

/// Physical block number at index `i` of a block-map item; zero = unmapped.
#[must_use]
pub fn bmap_get(item: &[u8], i: usize) -> u64 {
    le64(item, i * 8)
}

/// Store the physical block number at index `i` of a block-map item.
pub fn bmap_set(item: &mut [u8], i: usize, blkno: u64) {
    put64(item, i * 8, blkno);
}

// ── Fixed-offset accessors ──────────────────────────────────────────────────
//
// These operate on full-size block buffers; a short buffer is a caller bug.

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

// Layout must fit in one block.
const _: () = {
    assert!(BUDDY_BITS_OFF + (BUDDY_TOTAL_BITS as usize).div_ceil(8) <= BLOCK_SIZE as usize);
    assert!(IND_SLOTS_OFF + BUDDY_SLOTS * IND_SLOT_SIZE <= BLOCK_SIZE as usize);
    assert!(SUPER_PAYLOAD_END <= BLOCK_SIZE as usize);
};

// ── Tests ───────────────────────────────────────────────────────────────────
