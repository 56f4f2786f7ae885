//! Write-path adapter between a block-sized page cache and the mapper.
//!
//! Generic write paths assume an existing mapping is writable; under
//! copy-on-write it is not, because a cached mapping may point at a stable,
//! read-only physical block. The adapter therefore clears the page's cached
//! mapping on every write and drives [`map_writable_block`] fresh, trading
//! redundant mapping calls for correctness.
//!
//! A write that does not cover a whole block reads the page first through
//! the read-only mapper, outside the transaction; the mapping itself happens
//! with the transaction reader side held. Dirty pages are written out to
//! their freshly allocated blocks at commit; nothing durable references them
//! until the metadata commits.

use crate::{contig_mapped_blocks, map_writable_block, FileAlloc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidefs_alloc::Allocator;
use tidefs_block::{BlockDevice, TransLock};
use tidefs_error::{Result, TideError};
use tidefs_items::ItemStore;
use tidefs_types::{BlockNumber, InodeNumber, BLOCK_SHIFT, BLOCK_SIZE};
use tracing::trace;

struct Page {
    data: Vec<u8>,
    uptodate: bool,
    dirty: bool,
    mapped: Option<BlockNumber>,
}

impl Page {
    fn new() -> Self {
        Self {
            data: vec![0u8; BLOCK_SIZE as usize],
            uptodate: false,
            dirty: false,
            mapped: None,
        }
    }
}

/// Per-volume page cache and write-path adapter.
pub struct Pager {
    dev: Arc<dyn BlockDevice>,
    items: Arc<ItemStore>,
    alloc: Arc<Allocator>,
    reservoir: Arc<FileAlloc>,
    trans: Arc<TransLock>,
    pages: Mutex<HashMap<(u64, u64), Arc<Mutex<Page>>>>,
}

impl Pager {
    #[must_use]
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        items: Arc<ItemStore>,
        alloc: Arc<Allocator>,
        reservoir: Arc<FileAlloc>,
        trans: Arc<TransLock>,
    ) -> Self {
        Self {
            dev,
            items,
            alloc,
            reservoir,
            trans,
            pages: Mutex::new(HashMap::new()),
        }
    }

    fn page(&self, ino: InodeNumber, index: u64) -> Arc<Mutex<Page>> {
        Arc::clone(
            self.pages
                .lock()
                .entry((ino.0, index))
                .or_insert_with(|| Arc::new(Mutex::new(Page::new()))),
        )
    }

    /// Buffered write of `data` at byte position `pos`.
    pub fn write(&self, ino: InodeNumber, pos: u64, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let abs = pos + written as u64;
            let index = abs >> BLOCK_SHIFT;
            #[allow(clippy::cast_possible_truncation)]
            let off = (abs & u64::from(BLOCK_SIZE - 1)) as usize;
            let len = (data.len() - written).min(BLOCK_SIZE as usize - off);
            self.write_page(ino, index, off, &data[written..written + len])?;
            written += len;
        }
        Ok(written)
    }

    fn write_page(&self, ino: InodeNumber, index: u64, off: usize, chunk: &[u8]) -> Result<()> {
        let covers = off == 0 && chunk.len() == BLOCK_SIZE as usize;

        // A partial overwrite must see the current contents first; do the
        // read before entering the transaction.
        if !covers {
            let page = self.page(ino, index);
            let mut page = page.lock();
            if !page.uptodate {
                self.read_into(ino, index, &mut page)?;
            }
        }

        let _hold = self.trans.hold();
        let page = self.page(ino, index);
        let mut page = page.lock();
        if !covers && !page.uptodate {
            // The page went away between the passes; read it again.
            self.read_into(ino, index, &mut page)?;
        }

        // A cached mapping may name a stable block; always remap so the
        // write lands in free space.
        page.mapped = None;
        let blkno = map_writable_block(&self.items, &self.alloc, &self.reservoir, ino, index)?;
        page.mapped = Some(blkno);

        page.data[off..off + chunk.len()].copy_from_slice(chunk);
        page.uptodate = true;
        page.dirty = true;
        trace!(ino = ino.0, index, blkno = blkno.0, "write_page");
        Ok(())
    }

    /// Buffered read into `buf` from byte position `pos`. Holes read zeros.
    pub fn read(&self, ino: InodeNumber, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let abs = pos + done as u64;
            let index = abs >> BLOCK_SHIFT;
            #[allow(clippy::cast_possible_truncation)]
            let off = (abs & u64::from(BLOCK_SIZE - 1)) as usize;
            let len = (buf.len() - done).min(BLOCK_SIZE as usize - off);

            let page = self.page(ino, index);
            let mut page = page.lock();
            if !page.uptodate {
                self.read_into(ino, index, &mut page)?;
            }
            buf[done..done + len].copy_from_slice(&page.data[off..off + len]);
            done += len;
        }
        Ok(done)
    }

    /// Fill a page from its mapped block, or zeros for a hole. The mapping
    /// is deliberately not cached on the page: mappings used for reads must
    /// never satisfy a later write.
    fn read_into(&self, ino: InodeNumber, index: u64, page: &mut Page) -> Result<()> {
        let (count, blkno) = contig_mapped_blocks(&self.items, ino, index);
        if count > 0 && !blkno.is_null() {
            let buf = self.dev.read_block(blkno)?;
            page.data.copy_from_slice(buf.as_slice());
        } else {
            page.data.fill(0);
        }
        page.uptodate = true;
        Ok(())
    }

    /// Write every dirty page to its mapped block.
    ///
    /// A dirty page with no mapping never went through the mapper; that
    /// write path (mmap) does not exist yet, so it is an error here.
    pub fn writeback(&self) -> Result<()> {
        let pages: Vec<((u64, u64), Arc<Mutex<Page>>)> = {
            let map = self.pages.lock();
            let mut v: Vec<_> = map
                .iter()
                .map(|(key, page)| (*key, Arc::clone(page)))
                .collect();
            v.sort_by_key(|(key, _)| *key);
            v
        };

        for ((ino, index), page) in pages {
            let mut page = page.lock();
            if !page.dirty {
                continue;
            }
            let Some(blkno) = page.mapped else {
                return Err(TideError::Invalid("writeback of unmapped dirty page"));
            };
            self.dev.write_block(blkno, &page.data)?;
            page.dirty = false;
            trace!(ino, index, blkno = blkno.0, "writeback_page");
        }
        Ok(())
    }

    /// Drop clean pages, keeping dirty ones; the memory-pressure analog.
    pub fn invalidate_clean(&self) {
        self.pages.lock().retain(|_, page| page.lock().dirty);
    }

    /// Drop every page, dirty included (transaction abort).
    pub fn discard(&self) {
        self.pages.lock().clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tidefs_alloc::mkfs;
    use tidefs_block::{BlockCache, MemBlockDevice, SuperCell};

    const FSID: u64 = 0x9A6E;
    const INO: InodeNumber = InodeNumber(5);

    fn pager(total_blocks: u64) -> (Arc<MemBlockDevice>, Pager) {
        let mem = Arc::new(MemBlockDevice::new(total_blocks));
        let dev: Arc<dyn BlockDevice> = Arc::clone(&mem) as Arc<dyn BlockDevice>;
        let sb = mkfs(dev.as_ref(), FSID).unwrap();
        let cache = Arc::new(BlockCache::new(Arc::clone(&dev), FSID, sb.seq.next()));
        let supers = Arc::new(SuperCell::new(sb));
        let alloc = Arc::new(Allocator::new(cache, supers));
        let pager = Pager::new(
            dev,
            Arc::new(ItemStore::new()),
            alloc,
            Arc::new(FileAlloc::new()),
            Arc::new(TransLock::new()),
        );
        (mem, pager)
    }

    #[test]
    fn write_then_read_back() {
        let (_mem, pager) = pager(1024);
        let data = vec![0xABu8; BLOCK_SIZE as usize];
        assert_eq!(pager.write(INO, 0, &data).unwrap(), data.len());

        let mut out = vec![0u8; data.len()];
        pager.read(INO, 0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn writeback_lands_on_mapped_block() {
        let (mem, pager) = pager(1024);
        let data = vec![0x5Au8; BLOCK_SIZE as usize];
        pager.write(INO, 0, &data).unwrap();
        pager.writeback().unwrap();

        let (count, blkno) = contig_mapped_blocks(&pager.items, INO, 0);
        assert_eq!(count, 1);
        assert_eq!(mem.read_block(blkno).unwrap().as_slice(), &data[..]);
    }

    #[test]
    fn hole_reads_zeros() {
        let (_mem, pager) = pager(1024);
        let mut out = vec![0xFFu8; 100];
        pager.read(INO, 10_000, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn partial_write_preserves_surroundings() {
        let (_mem, pager) = pager(1024);
        let base = vec![0x11u8; BLOCK_SIZE as usize];
        pager.write(INO, 0, &base).unwrap();
        pager.writeback().unwrap();
        pager.invalidate_clean();

        // Ten bytes in the middle; the rest of the page must survive.
        pager.write(INO, 2000, &[0x22u8; 10]).unwrap();

        let mut out = vec![0u8; BLOCK_SIZE as usize];
        pager.read(INO, 0, &mut out).unwrap();
        assert_eq!(&out[..2000], &base[..2000]);
        assert_eq!(&out[2000..2010], &[0x22u8; 10]);
        assert_eq!(&out[2010..], &base[2010..]);
    }

    #[test]
    fn redirty_within_transaction_keeps_one_mapping() {
        let (_mem, pager) = pager(1024);
        pager.write(INO, 0, &[1u8; 16]).unwrap();
        let (_, first) = contig_mapped_blocks(&pager.items, INO, 0);
        pager.write(INO, 100, &[2u8; 16]).unwrap();
        let (_, second) = contig_mapped_blocks(&pager.items, INO, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn multi_block_write_spans_pages() {
        let (mem, pager) = pager(1024);
        let len = 4 * BLOCK_SIZE as usize;
        let data: Vec<u8> = (0..len).map(|i| (i / BLOCK_SIZE as usize) as u8).collect();
        pager.write(INO, 0, &data).unwrap();
        pager.writeback().unwrap();

        let (count, blkno) = contig_mapped_blocks(&pager.items, INO, 0);
        assert_eq!(count, 4);
        // Carved from one extent, physically consecutive.
        for i in 0..4u64 {
            let block = mem.read_block(BlockNumber(blkno.0 + i)).unwrap();
            assert!(block.as_slice().iter().all(|b| u64::from(*b) == i));
        }

        let mut out = vec![0u8; len];
        pager.read(INO, 0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn discard_drops_dirty_pages() {
        let (_mem, pager) = pager(1024);
        pager.write(INO, 0, &[9u8; 8]).unwrap();
        pager.discard();
        pager.writeback().unwrap();
    }
}
