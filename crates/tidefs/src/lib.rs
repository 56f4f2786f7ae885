#![forbid(unsafe_code)]
//! tidefs — the block-allocation and file-data-mapping core of a
//! copy-on-write block filesystem.
//!
//! A mounted volume keeps two super blocks in memory: the stable one from
//! the last commit and the dirty one being built by the current transaction.
//! Metadata mutations copy-on-write blocks into the transaction through the
//! block cache; file writes land in freshly allocated blocks; commit writes
//! everything out, publishes the dirty super to the other side of the super
//! pair, and the dirty view becomes stable.
//!
//! [`Fs`] wires the pieces together: the block cache, the super pair, the
//! region-dispatched allocator, the item store, the file-block reservoir,
//! and the pager.

pub use tidefs_alloc::{mkfs, Allocator, Region};
pub use tidefs_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use tidefs_error::{Result, TideError};
pub use tidefs_ondisk::Superblock;
pub use tidefs_types::{BlockNumber, InodeNumber, BLOCK_SIZE};

use std::sync::Arc;
use tidefs_block::{BlockCache, SuperCell, TransLock};
use tidefs_file::pager::Pager;
use tidefs_file::{contig_mapped_blocks, FileAlloc};
use tidefs_items::ItemStore;
use tidefs_types::{SUPER_BLKNO, SUPER_NR};
use tracing::{debug, info};

/// Volume usage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub total_blocks: u64,
    pub free_blocks: u64,
}

/// A mounted tidefs volume.
pub struct Fs {
    dev: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    supers: Arc<SuperCell>,
    alloc: Arc<Allocator>,
    items: Arc<ItemStore>,
    reservoir: Arc<FileAlloc>,
    pager: Pager,
    trans: Arc<TransLock>,
}

impl Fs {
    /// Mount a formatted device: pick the newer valid super side and build
    /// the volume state around it.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(TideError::Invalid("unsupported device block size"));
        }

        let sb = read_super(dev.as_ref())?;
        if sb.total_blocks > dev.block_count() {
            return Err(TideError::corrupt(
                SUPER_BLKNO,
                "super names more blocks than the device has",
            ));
        }

        let cache = Arc::new(BlockCache::new(Arc::clone(&dev), sb.fsid, sb.seq.next()));
        let supers = Arc::new(SuperCell::new(sb));
        let alloc = Arc::new(Allocator::new(Arc::clone(&cache), Arc::clone(&supers)));
        let items = Arc::new(ItemStore::new());
        let reservoir = Arc::new(FileAlloc::new());
        let trans = Arc::new(TransLock::new());
        let pager = Pager::new(
            Arc::clone(&dev),
            Arc::clone(&items),
            Arc::clone(&alloc),
            Arc::clone(&reservoir),
            Arc::clone(&trans),
        );

        info!(
            fsid = sb.fsid,
            seq = sb.seq.0,
            total_blocks = sb.total_blocks,
            "mount"
        );
        Ok(Self {
            dev,
            cache,
            supers,
            alloc,
            items,
            reservoir,
            pager,
            trans,
        })
    }

    /// Buffered write at byte position `pos`.
    pub fn write(&self, ino: InodeNumber, pos: u64, data: &[u8]) -> Result<usize> {
        self.pager.write(ino, pos, data)
    }

    /// Buffered read from byte position `pos`. Holes read zeros.
    pub fn read(&self, ino: InodeNumber, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.pager.read(ino, pos, buf)
    }

    /// Physical mapping of `iblock`: contiguously mapped count and the
    /// first physical block.
    #[must_use]
    pub fn bmap(&self, ino: InodeNumber, iblock: u64) -> (usize, BlockNumber) {
        contig_mapped_blocks(&self.items, ino, iblock)
    }

    /// Commit the current transaction.
    ///
    /// Order matters: data pages go to their freshly allocated blocks first,
    /// the reservoir remainder returns to the buddy allocator, metadata
    /// flushes, and only then does the super publish the new tree. The dirty
    /// view becomes stable once the super is durable.
    pub fn commit(&self) -> Result<()> {
        let _barrier = self.trans.begin_commit();

        self.pager.writeback()?;
        self.reservoir.release(&self.alloc)?;
        self.items.commit();
        self.cache.flush()?;
        self.dev.sync()?;

        let seq = self.cache.dirty_seq();
        let sb = {
            let mut supers = self.supers.lock();
            supers.dirty.seq = seq;
            supers.dirty
        };
        self.dev
            .write_block(Superblock::side_blkno(seq), &sb.encode_block()?)?;
        self.dev.sync()?;

        {
            let mut supers = self.supers.lock();
            supers.stable = supers.dirty;
        }
        self.cache.finish_commit();
        debug!(seq = seq.0, "commit");
        Ok(())
    }

    /// Abort the current transaction by discarding every piece of dirty
    /// state; the stable view is untouched. Reservoir blocks were dirty-view
    /// allocations, so forgetting them frees them.
    pub fn abort(&self) {
        let _barrier = self.trans.begin_commit();

        self.pager.discard();
        self.reservoir.forget();
        self.items.discard();
        self.cache.discard_dirty();

        let mut supers = self.supers.lock();
        supers.dirty = supers.stable;
        debug!("abort");
    }

    /// Volume usage. The free count is the allocator's approximate sample.
    pub fn statfs(&self) -> Result<StatFs> {
        let total_blocks = self.supers.lock().dirty.total_blocks;
        Ok(StatFs {
            total_blocks,
            free_blocks: self.alloc.bfree()?,
        })
    }

    /// The block allocator, for callers that manage extents directly.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    /// The stable super block of the last commit.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.supers.lock().stable
    }

    /// Drop clean pages, as memory pressure would.
    pub fn drop_page_cache(&self) {
        self.pager.invalidate_clean();
    }
}

/// Read both super pair sides and keep the newer valid one.
fn read_super(dev: &dyn BlockDevice) -> Result<Superblock> {
    let mut best: Option<Superblock> = None;
    for side in 0..SUPER_NR {
        let blkno = BlockNumber(SUPER_BLKNO + side);
        let buf = match dev.read_block(blkno) {
            Ok(buf) => buf,
            Err(err) => {
                debug!(blkno = blkno.0, %err, "super side unreadable");
                continue;
            }
        };
        match Superblock::parse_block(buf.as_slice(), blkno) {
            Ok(sb) => {
                if best.is_none_or(|b| sb.seq > b.seq) {
                    best = Some(sb);
                }
            }
            Err(err) => debug!(blkno = blkno.0, %err, "super side invalid"),
        }
    }
    best.ok_or_else(|| TideError::corrupt(SUPER_BLKNO, "no valid super block"))
}
