#![forbid(unsafe_code)]
//! File data block mapping under copy-on-write.
//!
//! Fixed-size block-map items map aligned groups of [`BLOCK_MAP_COUNT`]
//! logical file blocks to physical blocks. Dirty file blocks are only ever
//! written to free space: the first time a logical block is mapped for write
//! in a transaction it gets a freshly allocated block and the previous one is
//! freed. A mapping whose block is still free in the stable view was
//! allocated earlier in this same transaction, so it is reused; that is what
//! lets the page cache redirty a block repeatedly without burning a new
//! allocation every time.
//!
//! Single-block allocations come from a per-volume reservoir that carves one
//! high-order buddy extent, which is how consecutive file blocks end up
//! physically contiguous. The remainder goes back to the buddy allocator
//! when the transaction commits.

pub mod pager;

use parking_lot::Mutex;
use tidefs_alloc::Allocator;
use tidefs_error::{Result, TideError};
use tidefs_items::{ItemStore, WriteCursor};
use tidefs_ondisk::{bmap_get, bmap_set, BMAP_ITEM_LEN};
use tidefs_types::{BlockNumber, InodeNumber, ItemKey, BLOCK_MAP_COUNT, BLOCK_MAP_MASK,
    BUDDY_ORDERS};
use tracing::{debug, trace};

// ── Read-side mapping ───────────────────────────────────────────────────────

/// Number of contiguously mapped logical blocks starting at `iblock`, and
/// the physical block of the first one. Only walks one block-map item;
/// callers iterate if it matters.
#[must_use]
pub fn contig_mapped_blocks(
    items: &ItemStore,
    ino: InodeNumber,
    iblock: u64,
) -> (usize, BlockNumber) {
    let key = ItemKey::bmap(ino, iblock);
    let Some(item) = items.lookup(&key) else {
        return (0, BlockNumber::NULL);
    };

    #[allow(clippy::cast_possible_truncation)]
    let start = (iblock & BLOCK_MAP_MASK) as usize;
    let blkno = bmap_get(&item, start);

    let mut count = 0;
    let mut i = start;
    while i < BLOCK_MAP_COUNT && bmap_get(&item, i) != 0 {
        count += 1;
        i += 1;
    }

    trace!(
        ino = ino.0,
        iblock,
        blkno,
        count,
        "contig_mapped_blocks"
    );
    (count, BlockNumber(blkno))
}

// ── Write-side mapping ──────────────────────────────────────────────────────

/// Make the mapping at `(ino, iblock)` writable in this transaction and
/// return its physical block.
///
/// Reuses the existing mapping when it was allocated in the live
/// transaction; otherwise allocates from the reservoir and frees the
/// predecessor. On error every speculative step is reversed: a popped block
/// goes back to the reservoir and an item created here is deleted.
pub fn map_writable_block(
    items: &ItemStore,
    alloc: &Allocator,
    reservoir: &FileAlloc,
    ino: InodeNumber,
    iblock: u64,
) -> Result<BlockNumber> {
    let key = ItemKey::bmap(ino, iblock);
    let mut curs = items.write(key, BMAP_ITEM_LEN)?;

    #[allow(clippy::cast_possible_truncation)]
    let i = (iblock & BLOCK_MAP_MASK) as usize;
    let old = bmap_get(curs.value(), i);

    // Free in stable means the block became mapped earlier in this
    // transaction; nothing durable references it yet, so write in place.
    if old != 0 {
        match alloc.was_free(BlockNumber(old), 0) {
            Ok(true) => {
                trace!(ino = ino.0, iblock, blkno = old, "map_reuse");
                return Ok(BlockNumber(old));
            }
            Ok(false) => {}
            Err(err) => {
                rollback(curs, None, reservoir);
                return Err(err);
            }
        }
    }

    let new = match reservoir.alloc_block(alloc) {
        Ok(blkno) => blkno,
        Err(err) => {
            rollback(curs, None, reservoir);
            return Err(err);
        }
    };

    if old != 0 {
        if let Err(err) = alloc.free(BlockNumber(old), 0) {
            rollback(curs, Some(new), reservoir);
            return Err(err);
        }
    }

    bmap_set(curs.value_mut(), i, new.0);
    trace!(
        ino = ino.0,
        iblock,
        old,
        new = new.0,
        "map_writable_block"
    );
    Ok(new)
}

/// Reverse the speculative steps of a failed mapping. Infallible: returning
/// a popped reservoir block and removing an in-memory item cannot fail.
fn rollback(curs: WriteCursor<'_>, new: Option<BlockNumber>, reservoir: &FileAlloc) {
    if let Some(blkno) = new {
        reservoir.return_block(blkno);
    }
    if curs.inserted() {
        curs.cancel_insert();
    }
}

// ── Reservoir ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Reservoir {
    blkno: u64,
    count: u64,
}

/// Per-volume pool of preallocated file blocks, refilled one high-order
/// buddy extent at a time and carved into single-block grants.
#[derive(Debug, Default)]
pub struct FileAlloc {
    inner: Mutex<Reservoir>,
}

impl FileAlloc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop one block, bulk-refilling from the buddy allocator when empty.
    ///
    /// The refill drops the reservoir lock around the buddy call and
    /// re-checks afterwards; if another thread got there first the surplus
    /// extent goes straight back.
    pub fn alloc_block(&self, alloc: &Allocator) -> Result<BlockNumber> {
        let mut surplus = None;

        let mut inner = self.inner.lock();
        if inner.count == 0 {
            drop(inner);
            let (blkno, granted) = alloc.alloc(BUDDY_ORDERS - 1)?;
            inner = self.inner.lock();
            if inner.count == 0 {
                inner.blkno = blkno.0;
                inner.count = 1 << granted;
            } else {
                surplus = Some((blkno, granted));
            }
        }

        let ret = if inner.count > 0 {
            let blkno = BlockNumber(inner.blkno);
            inner.blkno += 1;
            inner.count -= 1;
            Ok(blkno)
        } else {
            Err(TideError::NoSpace)
        };
        drop(inner);

        if let Some((blkno, granted)) = surplus {
            if let Err(err) = alloc.free(blkno, granted) {
                debug!(blkno = blkno.0, granted, %err, "surplus refill free failed");
            }
        }

        if let Ok(blkno) = &ret {
            trace!(blkno = blkno.0, "alloc_file_block");
        }
        ret
    }

    /// Return the most recently popped block. Called from error paths after
    /// steps that would be annoying to reverse, so it cannot fail; handing
    /// back any block but the last popped one is a caller bug.
    pub fn return_block(&self, blkno: BlockNumber) {
        let mut inner = self.inner.lock();
        assert!(
            inner.count == 0 || inner.blkno == blkno.0 + 1,
            "reservoir return out of order"
        );
        if inner.count == 0 {
            inner.blkno = blkno.0 + 1;
        }
        inner.blkno -= 1;
        inner.count += 1;
    }

    /// Return the remaining blocks to the buddy allocator wholesale. Called
    /// at commit, serialized against all other callers.
    pub fn release(&self, alloc: &Allocator) -> Result<()> {
        let (blkno, count) = {
            let mut inner = self.inner.lock();
            let pair = (inner.blkno, inner.count);
            inner.blkno = 0;
            inner.count = 0;
            pair
        };

        trace!(blkno, count, "reservoir_release");
        if count > 0 {
            alloc.free_extent(BlockNumber(blkno), count)?;
        }
        Ok(())
    }

    /// Forget the reservoir without freeing; its blocks were only ever
    /// dirty-view allocations, so an aborted transaction drops them with the
    /// rest of the dirty state.
    pub fn forget(&self) {
        let mut inner = self.inner.lock();
        inner.blkno = 0;
        inner.count = 0;
    }

    /// Blocks currently pooled.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.inner.lock().count
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
