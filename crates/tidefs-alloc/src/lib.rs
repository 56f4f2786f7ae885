#![forbid(unsafe_code)]
//! Block allocation for tidefs.
//!
//! Three device regions, each with its own allocation discipline:
//!
//! 1. **Pair** — the super and self-host bitmap ping-pong pairs at fixed
//!    block numbers. Allocation is `existing ^ 1`; free is a no-op because
//!    one side of each pair is always live.
//! 2. **Bitmap** — the blocks holding buddy metadata (the indirect block and
//!    the buddy blocks), allocated out of one flat bitmap block referenced by
//!    the super.
//! 3. **Buddy** — everything from `first_blkno` up: file data and any future
//!    index blocks, allocated by hierarchical per-order bitmaps.
//!
//! The buddy index is one indirect block of slots, each slot referencing a
//! buddy block that manages [`BUDDY_ORDER0_BITS`] device blocks. A set bit at
//! order *k* means a free extent of `2^k` blocks; when a high-order bit is
//! set, every bit it covers below is clear.
//!
//! The copy-on-write twist: a region freed in this transaction may still be
//! referenced by the last committed (stable) tree, so satisfying an
//! allocation with it would overwrite live data. Every allocator here only
//! returns blocks free in **both** the dirty and the stable view. This can
//! skip otherwise-available extents, but only up to a transaction's worth of
//! churn, which is one reason transactions are capacity-bounded.
//!
//! A single allocator mutex serializes all mutations per volume. Freeing
//! needs no dual-view check: freeing in the dirty view cannot overwrite
//! anything.

use parking_lot::Mutex;
use std::sync::Arc;
use tidefs_block::{BlockCache, BlockDevice, BlockHandle, CowAllocator, SuperCell};
use tidefs_error::{Result, TideError};
use tidefs_ondisk::{
    buddy_order_count, buddy_order_nr, buddy_order_off, buddy_set_order_count,
    ind_add_order_total, ind_order_total, ind_set_slot_free_orders, ind_set_slot_ref,
    ind_slot_free_orders, ind_slot_ref, BlockHeader, Superblock, BITMAP_BITS_OFF, BITMAP_CAPACITY,
    BITMAP_MAGIC, BUDDY_BITS_OFF, BUDDY_MAGIC, INDIRECT_MAGIC,
};
use tidefs_types::{
    BlockNumber, BlockRef, CommitSeq, BLOCK_SIZE, BUDDY_BM_BLKNO, BUDDY_BM_NR, BUDDY_ORDER0_BITS,
    BUDDY_ORDERS, BUDDY_SLOTS,
};
use tracing::{debug, info, trace};

// ── Bitmap bit helpers ──────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first set bit in `[start, size)`, returning `size` if none.
#[must_use]
pub fn find_next_set(bitmap: &[u8], size: u32, start: u32) -> u32 {
    let mut idx = start;
    while idx < size {
        if bitmap_get(bitmap, idx) {
            return idx;
        }
        idx += 1;
    }
    size
}

// ── Region classifier ───────────────────────────────────────────────────────

/// Top-level partitioning of the device address space by allocator
/// discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Pair,
    Bitmap,
    Buddy,
}

/// Which region `blkno` belongs to under the given super block geometry.
#[must_use]
pub fn region_of(sb: &Superblock, blkno: BlockNumber) -> Region {
    let mut end = BUDDY_BM_BLKNO + BUDDY_BM_NR;
    if blkno.0 < end {
        return Region::Pair;
    }

    end += u64::from(sb.buddy_blocks);
    if blkno.0 < end {
        return Region::Bitmap;
    }

    Region::Buddy
}

// ── Buddy bit helpers ───────────────────────────────────────────────────────
//
// The order bitmaps of one buddy block, with the cached popcounts in the
// buddy block and the aggregate totals in the indirect block kept in step.

fn test_buddy_bit(bud: &[u8], order: usize, nr: u32) -> bool {
    bitmap_get(&bud[BUDDY_BITS_OFF..], buddy_order_nr(order, nr))
}

/// Whether a free region of order >= `order` covers position `nr`.
fn test_buddy_bit_or_higher(bud: &[u8], order: usize, mut nr: u32) -> bool {
    for i in order..BUDDY_ORDERS {
        if test_buddy_bit(bud, i, nr) {
            return true;
        }
        nr >>= 1;
    }
    false
}

fn set_buddy_bit(ind: &mut [u8], bud: &mut [u8], order: usize, nr: u32) {
    if !test_buddy_bit(bud, order, nr) {
        bitmap_set(&mut bud[BUDDY_BITS_OFF..], buddy_order_nr(order, nr));
        buddy_set_order_count(bud, order, buddy_order_count(bud, order) + 1);
        ind_add_order_total(ind, order, 1);
    }
}

fn clear_buddy_bit(ind: &mut [u8], bud: &mut [u8], order: usize, nr: u32) {
    if test_buddy_bit(bud, order, nr) {
        bitmap_clear(&mut bud[BUDDY_BITS_OFF..], buddy_order_nr(order, nr));
        buddy_set_order_count(bud, order, buddy_order_count(bud, order) - 1);
        ind_add_order_total(ind, order, -1);
    }
}

/// Next set bit of an order's sub-bitmap at or after `nr`.
fn find_next_buddy_bit(bud: &[u8], order: usize, nr: u32) -> Option<u32> {
    let size = buddy_order_off(order + 1);
    let abs = find_next_set(&bud[BUDDY_BITS_OFF..], size, buddy_order_nr(order, nr));
    if abs >= size {
        None
    } else {
        Some(abs - buddy_order_off(order))
    }
}

/// Refresh a slot's free-order summary from its buddy block's counts.
fn update_free_orders(ind: &mut [u8], sl: usize, bud: &[u8]) {
    let mut free = 0u8;
    for i in 0..BUDDY_ORDERS {
        if buddy_order_count(bud, i) > 0 {
            free |= 1 << i;
        }
    }
    ind_set_slot_free_orders(ind, sl, free);
}

/// Free-order summary of a slot that has never been populated, derived from
/// the bit pattern lazy initialization would seed for `count` blocks.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn initial_free_orders(count: u32) -> u8 {
    if count == 0 {
        return 0;
    }
    let top = 1u32 << (BUDDY_ORDERS - 1);
    let rem = ((count - 1) % top) + 1;
    let mut free = rem as u8;
    if count > top {
        free |= 1 << (BUDDY_ORDERS - 1);
    }
    free
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Per-volume block allocator over the cached super pair.
pub struct Allocator {
    cache: Arc<BlockCache>,
    supers: Arc<SuperCell>,
    mutex: Mutex<()>,
}

impl Allocator {
    #[must_use]
    pub fn new(cache: Arc<BlockCache>, supers: Arc<SuperCell>) -> Self {
        Self {
            cache,
            supers,
            mutex: Mutex::new(()),
        }
    }

    /// Allocate an extent of `2^order` blocks from the buddy region.
    ///
    /// Keeps trying smaller orders until something fits, so the granted order
    /// may be smaller than requested; it is never larger. Fails `NoSpace`
    /// only when no extent of any order <= `order` is free in both views.
    pub fn alloc(&self, order: usize) -> Result<(BlockNumber, usize)> {
        let ret = self.buddy_alloc(order);
        match &ret {
            Ok((blkno, granted)) => {
                trace!(blkno = blkno.0, order, granted, "buddy_alloc");
            }
            Err(err) => trace!(order, %err, "buddy_alloc"),
        }
        ret
    }

    /// Allocate one block from the same region as `existing`; used when the
    /// block layer copies a metadata block for write.
    pub fn alloc_same(&self, order: usize, existing: BlockNumber) -> Result<BlockNumber> {
        let sb = self.supers.lock().dirty;
        let region = region_of(&sb, existing);
        let ret = match region {
            Region::Pair => Ok(BlockNumber(existing.0 ^ 1)),
            Region::Bitmap => self.bitmap_alloc(),
            Region::Buddy => self.buddy_alloc(order).map(|(blkno, _)| blkno),
        };
        match &ret {
            Ok(blkno) => trace!(blkno = blkno.0, order, ?region, "buddy_alloc_same"),
            Err(err) => trace!(order, ?region, %err, "buddy_alloc_same"),
        }
        ret
    }

    /// Free the aligned extent of `2^order` blocks at `blkno`, dispatched by
    /// region. Pair blocks are never freed; bitmap blocks return to the
    /// self-host bitmap; buddy extents merge with free neighbors.
    pub fn free(&self, blkno: BlockNumber, order: usize) -> Result<()> {
        let sb = self.supers.lock().dirty;
        let region = region_of(&sb, blkno);
        let ret = match region {
            Region::Pair => Ok(()),
            Region::Bitmap => self.bitmap_free(blkno),
            Region::Buddy => self.buddy_free(blkno, order),
        };
        match &ret {
            Ok(()) => trace!(blkno = blkno.0, order, ?region, "buddy_free"),
            Err(err) => trace!(blkno = blkno.0, order, ?region, %err, "buddy_free"),
        }
        ret
    }

    /// Free an unaligned run of `count` blocks by decomposing it into the
    /// aligned power-of-two extents that produced it.
    pub fn free_extent(&self, blkno: BlockNumber, count: u64) -> Result<()> {
        let sb = self.supers.lock().stable;
        let mut blkno = blkno;
        let mut count = count;

        while count > 0 {
            let off = sb.buddy_bit(blkno);
            let by_align = if off == 0 {
                BUDDY_ORDERS - 1
            } else {
                off.trailing_zeros() as usize
            };
            let by_count = (63 - count.leading_zeros()) as usize;
            let order = by_align.min(by_count).min(BUDDY_ORDERS - 1);

            self.free(blkno, order)?;

            blkno = BlockNumber(blkno.0 + (1 << order));
            count -= 1 << order;
        }
        Ok(())
    }

    /// Whether the extent of `2^order` blocks at `blkno` was free in the last
    /// committed transaction. An extent in a slot the stable tree never
    /// populated is free.
    pub fn was_free(&self, blkno: BlockNumber, order: usize) -> Result<bool> {
        if order >= BUDDY_ORDERS {
            return Err(TideError::Invalid("order out of range"));
        }

        let _guard = self.mutex.lock();

        let sb = self.supers.lock().stable;
        if sb.buddy_ind_ref.is_null() {
            return Err(TideError::corrupt(blkno.0, "missing stable indirect ref"));
        }
        if blkno.0 < sb.first_blkno() {
            return Err(TideError::Invalid("was_free outside the buddy region"));
        }
        let sl = sb.indirect_slot(blkno);
        if sl >= BUDDY_SLOTS {
            return Err(TideError::Invalid("block beyond indirect coverage"));
        }

        let ind = self.cache.read_ref(&sb.buddy_ind_ref)?;
        let slot_ref = ind_slot_ref(&ind.data(), sl);
        if slot_ref.is_null() {
            return Ok(true);
        }

        let bud = self.cache.read_ref(&slot_ref)?;
        let nr = sb.buddy_bit(blkno) >> order;
        let free = test_buddy_bit_or_higher(&bud.data(), order, nr);
        trace!(blkno = blkno.0, order, free, "buddy_was_free");
        Ok(free)
    }

    /// Approximate count of free blocks, sampled from the dirty indirect
    /// block without taking the allocator mutex.
    pub fn bfree(&self) -> Result<u64> {
        let ind_ref = self.supers.lock().dirty.buddy_ind_ref;
        if ind_ref.is_null() {
            return Err(TideError::corrupt(0, "missing indirect ref"));
        }

        let ind = self.cache.read_ref(&ind_ref)?;
        let buf = ind.data();
        let mut free = 0u64;
        for order in 0..BUDDY_ORDERS {
            free += ind_order_total(&buf, order) << order;
        }
        Ok(free)
    }

    // ── Self-host bitmap region ─────────────────────────────────────────

    /// Allocate a buddy-metadata block from the super's bitmap block.
    ///
    /// Stable buddy blocks are freed as they are copied for write, so only
    /// bits set in **both** the dirty and the stable bitmap may be handed
    /// out.
    fn bitmap_alloc(&self) -> Result<BlockNumber> {
        let (mut bm_ref, stable_ref, size) = {
            let supers = self.supers.lock();
            (
                supers.dirty.buddy_bm_ref,
                supers.stable.buddy_bm_ref,
                supers.dirty.buddy_blocks,
            )
        };
        if bm_ref.is_null() || stable_ref.is_null() {
            return Err(TideError::corrupt(BUDDY_BM_BLKNO, "missing bitmap ref"));
        }

        let bm = self.cache.dirty_ref(&mut bm_ref, BITMAP_MAGIC, self)?;
        self.supers.lock().dirty.buddy_bm_ref = bm_ref;
        let stable = self.cache.read_ref(&stable_ref)?;

        // Lowest bit set in both bitmaps.
        let found = {
            let dirty_buf = bm.data();
            let stable_buf = stable.data();
            let dirty_bits = &dirty_buf[BITMAP_BITS_OFF..];
            let stable_bits = &stable_buf[BITMAP_BITS_OFF..];
            let mut s = 0;
            let mut d;
            loop {
                d = find_next_set(dirty_bits, size, s);
                s = find_next_set(stable_bits, size, d);
                if d == s {
                    break;
                }
            }
            d
        };
        if found >= size {
            return Err(TideError::NoSpace);
        }

        bitmap_clear(&mut bm.data_mut()[BITMAP_BITS_OFF..], found);
        Ok(BlockNumber(BUDDY_BM_BLKNO + BUDDY_BM_NR + u64::from(found)))
    }

    /// Return a buddy-metadata block to the super's bitmap block.
    fn bitmap_free(&self, blkno: BlockNumber) -> Result<()> {
        let mut bm_ref = self.supers.lock().dirty.buddy_bm_ref;
        if bm_ref.is_null() {
            return Err(TideError::corrupt(BUDDY_BM_BLKNO, "missing bitmap ref"));
        }

        let bm = self.cache.dirty_ref(&mut bm_ref, BITMAP_MAGIC, self)?;
        self.supers.lock().dirty.buddy_bm_ref = bm_ref;

        #[allow(clippy::cast_possible_truncation)]
        let nr = (blkno.0 - (BUDDY_BM_BLKNO + BUDDY_BM_NR)) as u32;
        bitmap_set(&mut bm.data_mut()[BITMAP_BITS_OFF..], nr);
        Ok(())
    }

    // ── Buddy region ────────────────────────────────────────────────────

    fn buddy_alloc(&self, order: usize) -> Result<(BlockNumber, usize)> {
        if order >= BUDDY_ORDERS {
            return Err(TideError::Invalid("order out of range"));
        }

        let _guard = self.mutex.lock();

        let mut order = order;
        loop {
            match self.alloc_order(order) {
                Ok(blkno) => return Ok((blkno, order)),
                Err(TideError::NoSpace) if order > 0 => order -= 1,
                Err(err) => return Err(err),
            }
        }
    }

    /// Try each slot that has the order free in both the dirty and stable
    /// views. Caller holds the allocator mutex.
    fn alloc_order(&self, order: usize) -> Result<BlockNumber> {
        let (mut ind_ref, stable_ref, sb) = {
            let supers = self.supers.lock();
            (
                supers.dirty.buddy_ind_ref,
                supers.stable.buddy_ind_ref,
                supers.dirty,
            )
        };
        if ind_ref.is_null() || stable_ref.is_null() {
            return Err(TideError::corrupt(0, "missing indirect ref"));
        }

        let ind = self.cache.dirty_ref(&mut ind_ref, INDIRECT_MAGIC, self)?;
        self.supers.lock().dirty.buddy_ind_ref = ind_ref;
        let stable = self.cache.read_ref(&stable_ref)?;

        let mask = !0u8 << order;
        for sl in 0..BUDDY_SLOTS {
            let (dirty_free, stable_free, stable_slot_ref) = {
                let ind_buf = ind.data();
                let stable_buf = stable.data();
                (
                    ind_slot_free_orders(&ind_buf, sl),
                    ind_slot_free_orders(&stable_buf, sl),
                    ind_slot_ref(&stable_buf, sl),
                )
            };
            if mask & dirty_free == 0 || mask & stable_free == 0 {
                continue;
            }

            match self.alloc_slot(&sb, &ind, sl, stable_slot_ref, order) {
                Err(TideError::NoSpace) => {}
                other => return other,
            }
        }

        Err(TideError::NoSpace)
    }

    /// Find the first free region of at least `order` in slot `sl` that is
    /// also free in the stable buddy bitmaps. May break up a larger order;
    /// the remainder is recorded as free right-buddies.
    fn alloc_slot(
        &self,
        sb: &Superblock,
        ind: &BlockHandle,
        sl: usize,
        stable_slot_ref: BlockRef,
        order: usize,
    ) -> Result<BlockNumber> {
        let bud = self.dirty_buddy_block(sb, ind, sl)?;

        let stable_bud = if stable_slot_ref.is_null() {
            None
        } else {
            Some(self.cache.read_ref(&stable_slot_ref)?)
        };

        let found = {
            let bud_buf = bud.data();
            let stable_guard = stable_bud.as_ref().map(BlockHandle::data);
            let stable_buf = stable_guard.as_deref().map(Vec::as_slice);
            find_first_fit(sb, sl, &bud_buf, stable_buf, order)
        };
        let Some((found_order, nr)) = found else {
            return Err(TideError::NoSpace);
        };

        let blkno = sb.slot_buddy_blkno(sl, found_order, nr);

        let mut ind_buf = ind.data_mut();
        let mut bud_buf = bud.data_mut();
        clear_buddy_bit(&mut ind_buf, &mut bud_buf, found_order, nr);

        // Breaking up a larger order leaves the right halves free.
        let mut nr = nr;
        let mut i = found_order;
        while i > order {
            nr <<= 1;
            i -= 1;
            set_buddy_bit(&mut ind_buf, &mut bud_buf, i, nr | 1);
        }

        update_free_orders(&mut ind_buf, sl, &bud_buf);
        Ok(blkno)
    }

    /// Writable buddy block for slot `sl`, creating and seeding a fresh one
    /// if the slot has never been used.
    fn dirty_buddy_block(
        &self,
        sb: &Superblock,
        ind: &BlockHandle,
        sl: usize,
    ) -> Result<BlockHandle> {
        let slot_ref = ind_slot_ref(&ind.data(), sl);

        if !slot_ref.is_null() {
            let mut r = slot_ref;
            let bud = self.cache.dirty_ref(&mut r, BUDDY_MAGIC, self)?;
            if r != slot_ref {
                ind_set_slot_ref(&mut ind.data_mut(), sl, r);
            }
            return Ok(bud);
        }

        let blkno = self.bitmap_alloc()?;
        let bud = match self.cache.dirty(blkno, BUDDY_MAGIC) {
            Ok(bud) => bud,
            Err(err) => {
                let _ = self.bitmap_free(blkno);
                return Err(err);
            }
        };
        debug!(slot = sl, blkno = blkno.0, "buddy_slot_seeded");

        let mut ind_buf = ind.data_mut();
        let mut bud_buf = bud.data_mut();

        // Mark the initial run of highest-order extents free, then one bit
        // per remaining power of two.
        let mut count = sb.slot_count(sl);
        let order = BUDDY_ORDERS - 1;
        let size = 1u32 << order;
        let mut nr = 0u32;
        while count > size {
            set_buddy_bit(&mut ind_buf, &mut bud_buf, order, nr);
            nr += 1;
            count -= size;
        }
        let mut order = order;
        loop {
            if count & (1 << order) != 0 {
                set_buddy_bit(&mut ind_buf, &mut bud_buf, order, nr);
                nr = (nr + 1) << 1;
            } else {
                nr <<= 1;
            }
            if order == 0 {
                break;
            }
            order -= 1;
        }

        ind_set_slot_ref(&mut ind_buf, sl, bud.block_ref());
        update_free_orders(&mut ind_buf, sl, &bud_buf);
        drop(ind_buf);
        drop(bud_buf);
        Ok(bud)
    }

    /// Merge the freed extent with its free buddy, then that larger extent
    /// with its buddy, and so on; the highest order has no buddy. Caller
    /// must not hold the allocator mutex.
    fn buddy_free(&self, blkno: BlockNumber, order: usize) -> Result<()> {
        if order >= BUDDY_ORDERS {
            return Err(TideError::Invalid("order out of range"));
        }

        let _guard = self.mutex.lock();

        let sb = self.supers.lock().dirty;
        if !sb.valid_order(blkno, order) {
            return Err(TideError::Invalid("misaligned free"));
        }
        let sl = sb.indirect_slot(blkno);
        if sl >= BUDDY_SLOTS {
            return Err(TideError::Invalid("block beyond indirect coverage"));
        }

        let mut ind_ref = sb.buddy_ind_ref;
        if ind_ref.is_null() {
            return Err(TideError::corrupt(blkno.0, "missing indirect ref"));
        }
        let ind = self.cache.dirty_ref(&mut ind_ref, INDIRECT_MAGIC, self)?;
        self.supers.lock().dirty.buddy_ind_ref = ind_ref;

        let slot_ref = ind_slot_ref(&ind.data(), sl);
        if slot_ref.is_null() {
            return Err(TideError::corrupt(blkno.0, "free into unpopulated slot"));
        }
        let mut r = slot_ref;
        let bud = self.cache.dirty_ref(&mut r, BUDDY_MAGIC, self)?;
        if r != slot_ref {
            ind_set_slot_ref(&mut ind.data_mut(), sl, r);
        }

        let mut ind_buf = ind.data_mut();
        let mut bud_buf = bud.data_mut();

        let mut nr = sb.buddy_bit(blkno) >> order;
        let mut i = order;
        while i < BUDDY_ORDERS - 1 {
            if !test_buddy_bit(&bud_buf, i, nr ^ 1) {
                break;
            }
            clear_buddy_bit(&mut ind_buf, &mut bud_buf, i, nr ^ 1);
            nr >>= 1;
            i += 1;
        }
        set_buddy_bit(&mut ind_buf, &mut bud_buf, i, nr);

        update_free_orders(&mut ind_buf, sl, &bud_buf);
        Ok(())
    }
}

impl CowAllocator for Allocator {
    fn alloc_same(&self, existing: BlockNumber) -> Result<BlockNumber> {
        Allocator::alloc_same(self, 0, existing)
    }

    fn free_same(&self, blkno: BlockNumber) -> Result<()> {
        self.free(blkno, 0)
    }
}

/// Order bitmap position and order of the first allocation satisfying
/// `order`, preferring the lowest block number.
///
/// Walks every order from `order` up, keeping one cursor per order, and
/// rejects candidates that are not free in the stable view. A slot with no
/// stable buddy block was never referenced by the stable tree, so every
/// candidate is acceptable.
fn find_first_fit(
    sb: &Superblock,
    sl: usize,
    bud: &[u8],
    stable_bud: Option<&[u8]>,
    order: usize,
) -> Option<(usize, u32)> {
    let mut cursors = [0u32; BUDDY_ORDERS];
    let mut best_blkno = u64::MAX;
    let mut best = None;

    loop {
        let mut made_progress = false;

        for i in order..BUDDY_ORDERS {
            let Some(nr) = find_next_buddy_bit(bud, i, cursors[i]) else {
                continue;
            };
            cursors[i] = nr;
            made_progress = true;

            // Advance past bits that are not free in stable.
            let stable_free =
                stable_bud.is_none_or(|stable| test_buddy_bit_or_higher(stable, i, nr));
            if !stable_free {
                cursors[i] = nr + 1;
                continue;
            }

            // Use the first lowest-order blkno.
            let blkno = sb.slot_buddy_blkno(sl, i, nr).0;
            if blkno < best_blkno {
                best_blkno = blkno;
                best = Some((i, nr));
            }
        }

        if best.is_some() || !made_progress {
            return best;
        }
    }
}

// ── mkfs ────────────────────────────────────────────────────────────────────

/// Format a device: the self-host bitmap block, the (empty) buddy indirect
/// block, and the first super block, all at sequence 1.
///
/// `buddy_blocks` is sized at two bitmap slots per buddy block plus two for
/// the indirect block, so every metadata block can alternate between a live
/// and a just-freed home across transactions. Slots are left unpopulated
/// with their achievable `free_orders` seeded; the buddy blocks themselves
/// are created lazily at first allocation.
pub fn mkfs(dev: &dyn BlockDevice, fsid: u64) -> Result<Superblock> {
    if dev.block_size() != BLOCK_SIZE {
        return Err(TideError::Invalid("unsupported device block size"));
    }
    let total_blocks = dev.block_count();

    // buddy_blocks feeds first_blkno which feeds the slot count; iterate to
    // the fixed point.
    let mut buddy_blocks: u64 = 0;
    let slots = loop {
        let first = BUDDY_BM_BLKNO + BUDDY_BM_NR + buddy_blocks;
        if first >= total_blocks {
            return Err(TideError::Invalid("volume too small"));
        }
        let slots = (total_blocks - first).div_ceil(u64::from(BUDDY_ORDER0_BITS));
        let need = 2 * (slots + 1);
        if need == buddy_blocks {
            break slots;
        }
        buddy_blocks = need;
    };
    if slots > BUDDY_SLOTS as u64 {
        return Err(TideError::Invalid("volume beyond indirect coverage"));
    }
    if buddy_blocks > u64::from(BITMAP_CAPACITY) {
        return Err(TideError::Invalid("bitmap capacity exceeded"));
    }

    let seq = CommitSeq(1);
    let bm_blkno = BlockNumber(BUDDY_BM_BLKNO + (seq.0 & 1));

    // Bitmap block: every self-host slot free, then the indirect block takes
    // the first one.
    let mut bm_buf = vec![0u8; BLOCK_SIZE as usize];
    BlockHeader {
        magic: BITMAP_MAGIC,
        fsid,
        blkno: bm_blkno,
        seq,
    }
    .encode(&mut bm_buf)?;
    #[allow(clippy::cast_possible_truncation)]
    for bit in 0..buddy_blocks as u32 {
        bitmap_set(&mut bm_buf[BITMAP_BITS_OFF..], bit);
    }
    bitmap_clear(&mut bm_buf[BITMAP_BITS_OFF..], 0);
    let ind_blkno = BlockNumber(BUDDY_BM_BLKNO + BUDDY_BM_NR);

    #[allow(clippy::cast_possible_truncation)]
    let buddy_blocks_u32 = buddy_blocks as u32;
    let sb = Superblock {
        fsid,
        seq,
        total_blocks,
        buddy_blocks: buddy_blocks_u32,
        buddy_bm_ref: BlockRef::new(bm_blkno, seq),
        buddy_ind_ref: BlockRef::new(ind_blkno, seq),
    };

    // Indirect block: no slot populated yet, free orders pre-computed from
    // each slot's coverage so the allocation gates pass.
    let mut ind_buf = vec![0u8; BLOCK_SIZE as usize];
    BlockHeader {
        magic: INDIRECT_MAGIC,
        fsid,
        blkno: ind_blkno,
        seq,
    }
    .encode(&mut ind_buf)?;
    for sl in 0..sb.slot_total() {
        ind_set_slot_free_orders(&mut ind_buf, sl, initial_free_orders(sb.slot_count(sl)));
    }

    dev.write_block(bm_blkno, &bm_buf)?;
    dev.write_block(ind_blkno, &ind_buf)?;
    dev.write_block(Superblock::side_blkno(seq), &sb.encode_block()?)?;
    // A leftover super from an earlier format must not win at mount.
    dev.write_block(
        Superblock::side_blkno(seq.next()),
        &vec![0u8; BLOCK_SIZE as usize],
    )?;
    dev.sync()?;

    info!(
        fsid,
        total_blocks,
        buddy_blocks,
        slots,
        "mkfs"
    );
    Ok(sb)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tidefs_block::MemBlockDevice;
    use tidefs_ondisk::HDR_SIZE;

    const FSID: u64 = 0xF51D;

    struct TestVol {
        cache: Arc<BlockCache>,
        supers: Arc<SuperCell>,
        alloc: Allocator,
    }

    fn vol(total_blocks: u64) -> TestVol {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(total_blocks));
        let sb = mkfs(dev.as_ref(), FSID).unwrap();
        let cache = Arc::new(BlockCache::new(dev, FSID, sb.seq.next()));
        let supers = Arc::new(SuperCell::new(sb));
        let alloc = Allocator::new(Arc::clone(&cache), Arc::clone(&supers));
        TestVol {
            cache,
            supers,
            alloc,
        }
    }

    /// Minimal commit: flush, publish dirty as stable, advance the dirty seq.
    fn commit(v: &TestVol) {
        v.cache.flush().unwrap();
        {
            let mut supers = v.supers.lock();
            supers.dirty.seq = v.cache.dirty_seq();
            supers.stable = supers.dirty;
        }
        v.cache.finish_commit();
    }

    fn read_block(v: &TestVol, r: &BlockRef) -> Vec<u8> {
        v.cache.read_ref(r).unwrap().data().clone()
    }

    fn check_descendants_clear(bud: &[u8], order: usize, nr: u32) {
        for child_order in 0..order {
            let shift = order - child_order;
            for pos in (nr << shift)..((nr + 1) << shift) {
                assert!(
                    !test_buddy_bit(bud, child_order, pos),
                    "order {child_order} bit {pos} set under free order {order} bit {nr}"
                );
            }
        }
    }

    /// Recompute every cached count from the raw bitmaps and compare, and
    /// check the hierarchy invariant for every set bit.
    fn check_invariants(v: &TestVol) {
        let sb = v.supers.lock().dirty;
        let ind = read_block(v, &sb.buddy_ind_ref);
        let mut totals = [0u64; BUDDY_ORDERS];

        for sl in 0..BUDDY_SLOTS {
            let slot_ref = ind_slot_ref(&ind, sl);
            if slot_ref.is_null() {
                continue;
            }
            let bud = read_block(v, &slot_ref);

            let mut free_orders = 0u8;
            for order in 0..BUDDY_ORDERS {
                let width = BUDDY_ORDER0_BITS >> order;
                let mut pop = 0u32;
                for nr in 0..width {
                    if test_buddy_bit(&bud, order, nr) {
                        pop += 1;
                        check_descendants_clear(&bud, order, nr);
                    }
                }
                assert_eq!(
                    pop,
                    buddy_order_count(&bud, order),
                    "slot {sl} order {order} count"
                );
                totals[order] += u64::from(pop);
                if pop > 0 {
                    free_orders |= 1 << order;
                }
            }
            assert_eq!(
                free_orders,
                ind_slot_free_orders(&ind, sl),
                "slot {sl} free_orders"
            );
        }

        for (order, total) in totals.iter().enumerate() {
            assert_eq!(*total, ind_order_total(&ind, order), "order {order} total");
        }
    }

    /// Slot 0's buddy block contents past the header (bits and counts).
    fn slot_bits(v: &TestVol) -> Vec<u8> {
        let sb = v.supers.lock().dirty;
        let ind = read_block(v, &sb.buddy_ind_ref);
        let slot_ref = ind_slot_ref(&ind, 0);
        read_block(v, &slot_ref)[HDR_SIZE..].to_vec()
    }

    // ── Region classifier ───────────────────────────────────────────────

    #[test]
    fn regions_partition_the_device() {
        let v = vol(1024);
        let sb = v.supers.lock().dirty;
        assert_eq!(region_of(&sb, BlockNumber(0)), Region::Pair);
        assert_eq!(region_of(&sb, BlockNumber(17)), Region::Pair);
        assert_eq!(region_of(&sb, BlockNumber(19)), Region::Pair);
        assert_eq!(region_of(&sb, BlockNumber(20)), Region::Bitmap);
        assert_eq!(region_of(&sb, BlockNumber(23)), Region::Bitmap);
        assert_eq!(region_of(&sb, BlockNumber(24)), Region::Buddy);
        assert_eq!(sb.first_blkno(), 24);
    }

    // ── Basic allocation ────────────────────────────────────────────────

    #[test]
    fn first_alloc_returns_first_covered_block() {
        let v = vol(1024);
        let (blkno, granted) = v.alloc.alloc(0).unwrap();
        assert_eq!(blkno, BlockNumber(24));
        assert_eq!(granted, 0);
        check_invariants(&v);
    }

    #[test]
    fn sequential_single_block_allocs_are_contiguous() {
        let v = vol(1024);
        let blknos: Vec<u64> = (0..4).map(|_| v.alloc.alloc(0).unwrap().0 .0).collect();
        assert_eq!(blknos, vec![24, 25, 26, 27]);
        check_invariants(&v);
    }

    #[test]
    fn alloc_breaks_up_larger_orders() {
        let v = vol(1024);
        let (blkno, granted) = v.alloc.alloc(2).unwrap();
        assert_eq!(blkno, BlockNumber(24));
        assert_eq!(granted, 2);
        // The remainder of the order-4 extent is free again.
        let (next, _) = v.alloc.alloc(2).unwrap();
        assert_eq!(next, BlockNumber(28));
        check_invariants(&v);
    }

    #[test]
    fn metadata_lands_in_its_regions() {
        let v = vol(1024);
        v.alloc.alloc(0).unwrap();
        let sb = v.supers.lock().dirty;
        assert_eq!(region_of(&sb, sb.buddy_bm_ref.blkno), Region::Pair);
        assert_eq!(region_of(&sb, sb.buddy_ind_ref.blkno), Region::Bitmap);
    }

    #[test]
    fn alloc_rejects_out_of_range_order() {
        let v = vol(1024);
        assert!(matches!(
            v.alloc.alloc(BUDDY_ORDERS),
            Err(TideError::Invalid(_))
        ));
    }

    // ── Partial grants and exhaustion ───────────────────────────────────

    #[test]
    fn alloc_grants_smaller_order_as_volume_fills() {
        let v = vol(1024);
        // 62 full order-4 extents cover 992 of the 1000 managed blocks.
        for i in 0..62 {
            let (blkno, granted) = v.alloc.alloc(4).unwrap();
            assert_eq!(blkno.0, 24 + 16 * i);
            assert_eq!(granted, 4);
        }
        // Only the order-3 tail remains.
        let (blkno, granted) = v.alloc.alloc(4).unwrap();
        assert_eq!(blkno.0, 24 + 992);
        assert_eq!(granted, 3);

        assert!(matches!(v.alloc.alloc(0), Err(TideError::NoSpace)));
        check_invariants(&v);
    }

    // ── Dual-view constraint ────────────────────────────────────────────

    #[test]
    fn freed_in_transaction_is_not_reallocated_until_commit() {
        let v = vol(1024);
        let (b0, _) = v.alloc.alloc(0).unwrap();
        assert_eq!(b0, BlockNumber(24));
        commit(&v);

        v.alloc.free(b0, 0).unwrap();
        let (b1, _) = v.alloc.alloc(0).unwrap();
        assert_ne!(b1, b0, "stable-referenced block handed out");
        check_invariants(&v);

        // After the free commits the block is allocatable again.
        commit(&v);
        let (b2, _) = v.alloc.alloc(0).unwrap();
        assert_eq!(b2, b0);
    }

    #[test]
    fn was_free_tracks_the_stable_view() {
        let v = vol(1024);
        // Nothing committed: every buddy-region block reads as free.
        assert!(v.alloc.was_free(BlockNumber(500), 0).unwrap());

        let (b0, _) = v.alloc.alloc(0).unwrap();
        // Still free in stable until the transaction commits.
        assert!(v.alloc.was_free(b0, 0).unwrap());

        commit(&v);
        assert!(!v.alloc.was_free(b0, 0).unwrap());
        assert!(v.alloc.was_free(BlockNumber(b0.0 + 1), 0).unwrap());
    }

    // ── Free and merge ──────────────────────────────────────────────────

    #[test]
    fn freeing_both_buddies_merges_upward() {
        let v = vol(1024);
        let (a, _) = v.alloc.alloc(0).unwrap();
        let (b, _) = v.alloc.alloc(0).unwrap();
        assert_eq!(b.0, a.0 + 1);

        v.alloc.free(b, 0).unwrap();
        v.alloc.free(a, 0).unwrap();

        // Fully merged back to one order-4 extent at the slot start.
        let sb = v.supers.lock().dirty;
        let ind = read_block(&v, &sb.buddy_ind_ref);
        let bud = read_block(&v, &ind_slot_ref(&ind, 0));
        assert!(test_buddy_bit(&bud, BUDDY_ORDERS - 1, 0));
        for order in 0..BUDDY_ORDERS - 1 {
            assert_eq!(buddy_order_count(&bud, order), 0, "order {order} not merged");
        }
        check_invariants(&v);
    }

    #[test]
    fn misaligned_free_is_invalid() {
        let v = vol(1024);
        v.alloc.alloc(1).unwrap();
        assert!(matches!(
            v.alloc.free(BlockNumber(25), 1),
            Err(TideError::Invalid(_))
        ));
        assert!(matches!(
            v.alloc.free(BlockNumber(24), BUDDY_ORDERS),
            Err(TideError::Invalid(_))
        ));
    }

    #[test]
    fn free_extent_decomposes_unaligned_runs() {
        let v = vol(1024);
        let (b, granted) = v.alloc.alloc(4).unwrap();
        assert_eq!(granted, 4);
        assert_eq!(v.alloc.bfree().unwrap(), 1000 - 16);

        // An unaligned 9-block run inside the extent.
        v.alloc.free_extent(BlockNumber(b.0 + 3), 9).unwrap();
        assert_eq!(v.alloc.bfree().unwrap(), 1000 - 16 + 9);
        check_invariants(&v);
    }

    // ── bfree ───────────────────────────────────────────────────────────

    #[test]
    fn bfree_counts_populated_slots() {
        let v = vol(1024);
        // Slots are lazy: nothing populated, nothing counted.
        assert_eq!(v.alloc.bfree().unwrap(), 0);

        let (b, _) = v.alloc.alloc(0).unwrap();
        assert_eq!(v.alloc.bfree().unwrap(), 999);

        v.alloc.free(b, 0).unwrap();
        assert_eq!(v.alloc.bfree().unwrap(), 1000);
    }

    // ── Self-host bitmap across transactions ────────────────────────────

    #[test]
    fn metadata_ping_pongs_across_commits() {
        let v = vol(1024);
        for _ in 0..6 {
            let (b, o) = v.alloc.alloc(0).unwrap();
            check_invariants(&v);
            v.alloc.free(b, o).unwrap();
            commit(&v);

            let supers = v.supers.lock();
            let sb = supers.dirty;
            assert!(matches!(region_of(&sb, sb.buddy_bm_ref.blkno), Region::Pair));
            assert!(matches!(
                region_of(&sb, sb.buddy_ind_ref.blkno),
                Region::Bitmap
            ));
        }
    }

    // ── Seeding ─────────────────────────────────────────────────────────

    #[test]
    fn initial_free_orders_matches_seed_pattern() {
        assert_eq!(initial_free_orders(0), 0);
        assert_eq!(initial_free_orders(1), 0x01);
        assert_eq!(initial_free_orders(5), 0x05);
        assert_eq!(initial_free_orders(16), 0x10);
        assert_eq!(initial_free_orders(17), 0x11);
        assert_eq!(initial_free_orders(1000), 0x18);
        assert_eq!(initial_free_orders(BUDDY_ORDER0_BITS), 0x10);
    }

    #[test]
    fn mkfs_rejects_tiny_volume() {
        let dev = MemBlockDevice::new(20);
        assert!(matches!(mkfs(&dev, FSID), Err(TideError::Invalid(_))));
    }

    #[test]
    fn mkfs_sizes_bitmap_for_cow_shadows() {
        let v = vol(1024);
        let sb = v.supers.lock().dirty;
        // One slot plus the indirect block, each with a CoW shadow.
        assert_eq!(sb.buddy_blocks, 4);
        assert_eq!(sb.total_blocks, 1024);
    }

    // ── Properties ──────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Any alloc sequence followed by freeing every grant restores the
        /// buddy bitmaps exactly, with the accounting and hierarchy
        /// invariants holding at every step.
        #[test]
        fn alloc_free_round_trip(orders in proptest::collection::vec(0usize..BUDDY_ORDERS, 1..20)) {
            let v = vol(4096);

            // Populate the slot, then return to the seeded state.
            let (first, granted) = v.alloc.alloc(0).unwrap();
            v.alloc.free(first, granted).unwrap();
            let snapshot = slot_bits(&v);

            let mut owned = Vec::new();
            for &order in &orders {
                match v.alloc.alloc(order) {
                    Ok(grant) => owned.push(grant),
                    Err(TideError::NoSpace) => {}
                    Err(err) => panic!("alloc failed: {err}"),
                }
                check_invariants(&v);
            }

            for (blkno, order) in owned.into_iter().rev() {
                v.alloc.free(blkno, order).unwrap();
                check_invariants(&v);
            }

            prop_assert_eq!(slot_bits(&v), snapshot);
        }

        /// Grants within one transaction never overlap each other.
        #[test]
        fn grants_are_disjoint(orders in proptest::collection::vec(0usize..BUDDY_ORDERS, 1..16)) {
            let v = vol(4096);
            let mut taken: Vec<(u64, u64)> = Vec::new();
            for &order in &orders {
                match v.alloc.alloc(order) {
                    Ok((blkno, granted)) => {
                        let len = 1u64 << granted;
                        for &(start, count) in &taken {
                            prop_assert!(
                                blkno.0 + len <= start || start + count <= blkno.0,
                                "grant {} +{} overlaps {} +{}", blkno.0, len, start, count
                            );
                        }
                        taken.push((blkno.0, len));
                    }
                    Err(TideError::NoSpace) => {}
                    Err(err) => panic!("alloc failed: {err}"),
                }
            }
        }
    }
}
