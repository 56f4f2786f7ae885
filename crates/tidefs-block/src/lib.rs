#![forbid(unsafe_code)]
//! Block devices and the metadata block cache for tidefs.
//!
//! The cache is where the copy-on-write discipline lives: a metadata block is
//! either *stable* (referenced by the last committed super) or *dirty*
//! (created in the current transaction). Dirtying a stable block allocates a
//! new block in the same device region, copies the contents, frees the old
//! block in the dirty view, and restamps the caller's [`BlockRef`]. Dirtying
//! a block that is already dirty in the current transaction is in place.
//!
//! Handles release on drop; the last writer's state is flushed to the device
//! by the commit path.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidefs_error::{Result, TideError};
use tidefs_ondisk::{BlockHeader, Superblock};
use tidefs_types::{BlockNumber, BlockRef, CommitSeq, BLOCK_SIZE};
use tracing::{debug, trace};

// ── Block devices ───────────────────────────────────────────────────────────

/// Owned, immutable block buffer returned by device reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        Arc::try_unwrap(self.bytes).unwrap_or_else(|arc| (*arc).clone())
    }
}

/// Fixed-block-size storage backend.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blkno: BlockNumber) -> Result<BlockBuf>;
    fn write_block(&self, blkno: BlockNumber, data: &[u8]) -> Result<()>;
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u64;
    fn sync(&self) -> Result<()>;
}

/// In-memory block device. Unwritten blocks read as zeros.
pub struct MemBlockDevice {
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, blkno: BlockNumber) -> Result<BlockBuf> {
        if blkno.0 >= self.block_count {
            return Err(TideError::Invalid("read past end of device"));
        }
        let blocks = self.blocks.lock();
        Ok(blocks.get(&blkno.0).map_or_else(
            || BlockBuf::zeroed(BLOCK_SIZE as usize),
            |data| BlockBuf::new(data.clone()),
        ))
    }

    fn write_block(&self, blkno: BlockNumber, data: &[u8]) -> Result<()> {
        if blkno.0 >= self.block_count {
            return Err(TideError::Invalid("write past end of device"));
        }
        if data.len() != BLOCK_SIZE as usize {
            return Err(TideError::Invalid("write of non-block-sized buffer"));
        }
        self.blocks.lock().insert(blkno.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device using positioned reads and writes.
pub struct FileBlockDevice {
    file: File,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            block_count: len / u64::from(BLOCK_SIZE),
        })
    }

    /// Create (or truncate) an image of `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * u64::from(BLOCK_SIZE))?;
        Ok(Self { file, block_count })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, blkno: BlockNumber) -> Result<BlockBuf> {
        if blkno.0 >= self.block_count {
            return Err(TideError::Invalid("read past end of device"));
        }
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let offset = blkno
            .to_byte_offset()
            .ok_or(TideError::Invalid("block offset overflow"))?;
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, blkno: BlockNumber, data: &[u8]) -> Result<()> {
        if blkno.0 >= self.block_count {
            return Err(TideError::Invalid("write past end of device"));
        }
        if data.len() != BLOCK_SIZE as usize {
            return Err(TideError::Invalid("write of non-block-sized buffer"));
        }
        let offset = blkno
            .to_byte_offset()
            .ok_or(TideError::Invalid("block offset overflow"))?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── Allocator seam ──────────────────────────────────────────────────────────

/// Allocation callbacks the cache uses when copy-on-writing a block.
///
/// The new block must come from the same device region as the existing one
/// so each region keeps its own allocation discipline. Both calls run with
/// whatever locks the caller of [`BlockCache::dirty_ref`] already holds; the
/// implementation must not retake them for the pair and bitmap regions.
pub trait CowAllocator: Send + Sync {
    /// Allocate one block in the same region as `existing`.
    fn alloc_same(&self, existing: BlockNumber) -> Result<BlockNumber>;

    /// Free one block of the region it belongs to.
    fn free_same(&self, blkno: BlockNumber) -> Result<()>;
}

// ── Block cache ─────────────────────────────────────────────────────────────

/// Handle to a cached metadata block.
///
/// Dropping the handle releases it; dirty state stays in the cache until the
/// transaction commits or aborts.
#[derive(Debug, Clone)]
pub struct BlockHandle {
    blkno: BlockNumber,
    seq: CommitSeq,
    data: Arc<RwLock<Vec<u8>>>,
}

impl BlockHandle {
    #[must_use]
    pub fn blkno(&self) -> BlockNumber {
        self.blkno
    }

    #[must_use]
    pub fn seq(&self) -> CommitSeq {
        self.seq
    }

    /// Reference naming this block at the sequence it was produced.
    #[must_use]
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.blkno, self.seq)
    }

    #[must_use]
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    #[must_use]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

#[derive(Clone)]
struct CachedBlock {
    data: Arc<RwLock<Vec<u8>>>,
    seq: CommitSeq,
    dirty: bool,
}

/// Per-volume metadata block cache with dirty tracking.
pub struct BlockCache {
    dev: Arc<dyn BlockDevice>,
    fsid: u64,
    dirty_seq: AtomicU64,
    inner: Mutex<HashMap<u64, CachedBlock>>,
}

impl BlockCache {
    /// `dirty_seq` is the sequence the next commit will carry; blocks dirtied
    /// now are stamped with it.
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, fsid: u64, dirty_seq: CommitSeq) -> Self {
        Self {
            dev,
            fsid,
            dirty_seq: AtomicU64::new(dirty_seq.0),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Sequence stamped on blocks dirtied in the current transaction.
    #[must_use]
    pub fn dirty_seq(&self) -> CommitSeq {
        CommitSeq(self.dirty_seq.load(Ordering::Acquire))
    }

    /// Produce a writable, zeroed block at `blkno`, stamped with `magic` and
    /// the current dirty sequence. Used for blocks that have just been
    /// allocated and have no prior contents.
    pub fn dirty(&self, blkno: BlockNumber, magic: u32) -> Result<BlockHandle> {
        let seq = self.dirty_seq();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        BlockHeader {
            magic,
            fsid: self.fsid,
            blkno,
            seq,
        }
        .encode(&mut buf)?;

        let data = Arc::new(RwLock::new(buf));
        self.inner.lock().insert(
            blkno.0,
            CachedBlock {
                data: Arc::clone(&data),
                seq,
                dirty: true,
            },
        );
        trace!(blkno = blkno.0, seq = seq.0, "block_dirty");
        Ok(BlockHandle { blkno, seq, data })
    }

    /// Read-only access to the block named by `r`.
    pub fn read_ref(&self, r: &BlockRef) -> Result<BlockHandle> {
        if r.is_null() {
            return Err(TideError::corrupt(0, "read through null block ref"));
        }

        if let Some(cached) = self.inner.lock().get(&r.blkno.0) {
            if cached.seq != r.seq {
                return Err(TideError::Stale { block: r.blkno.0 });
            }
            return Ok(BlockHandle {
                blkno: r.blkno,
                seq: cached.seq,
                data: Arc::clone(&cached.data),
            });
        }

        let data = self.fetch(r)?;
        let arc = Arc::new(RwLock::new(data));
        self.inner.lock().insert(
            r.blkno.0,
            CachedBlock {
                data: Arc::clone(&arc),
                seq: r.seq,
                dirty: false,
            },
        );
        Ok(BlockHandle {
            blkno: r.blkno,
            seq: r.seq,
            data: arc,
        })
    }

    /// Writable access to the block named by `r`, copy-on-writing it into the
    /// current transaction if it is stable. On CoW the new block comes from
    /// `alloc.alloc_same`, the old one goes to `alloc.free_same`, and `r` is
    /// updated in place.
    pub fn dirty_ref(
        &self,
        r: &mut BlockRef,
        magic: u32,
        alloc: &dyn CowAllocator,
    ) -> Result<BlockHandle> {
        if r.is_null() {
            return Err(TideError::corrupt(0, "dirty through null block ref"));
        }

        let cur = self.dirty_seq();
        {
            let inner = self.inner.lock();
            if let Some(cached) = inner.get(&r.blkno.0) {
                if cached.dirty && cached.seq == cur {
                    if r.seq != cached.seq {
                        return Err(TideError::Stale { block: r.blkno.0 });
                    }
                    return Ok(BlockHandle {
                        blkno: r.blkno,
                        seq: cached.seq,
                        data: Arc::clone(&cached.data),
                    });
                }
            }
        }

        // Stable block: copy into a freshly allocated home.
        let old = *r;
        let mut buf = match self.inner.lock().get(&old.blkno.0) {
            Some(cached) if cached.seq == old.seq => cached.data.read().clone(),
            Some(_) => return Err(TideError::Stale { block: old.blkno.0 }),
            None => self.fetch(&old)?,
        };

        let new_blkno = alloc.alloc_same(old.blkno)?;
        BlockHeader {
            magic,
            fsid: self.fsid,
            blkno: new_blkno,
            seq: cur,
        }
        .encode(&mut buf)?;

        let data = Arc::new(RwLock::new(buf));
        self.inner.lock().insert(
            new_blkno.0,
            CachedBlock {
                data: Arc::clone(&data),
                seq: cur,
                dirty: true,
            },
        );
        alloc.free_same(old.blkno)?;

        *r = BlockRef::new(new_blkno, cur);
        trace!(
            old_blkno = old.blkno.0,
            new_blkno = new_blkno.0,
            seq = cur.0,
            "block_cow"
        );
        Ok(BlockHandle {
            blkno: new_blkno,
            seq: cur,
            data,
        })
    }

    /// Write every dirty block to the device. Dirty state is kept until
    /// [`finish_commit`](Self::finish_commit).
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<(u64, Arc<RwLock<Vec<u8>>>)> = {
            let inner = self.inner.lock();
            let mut v: Vec<_> = inner
                .iter()
                .filter(|(_, c)| c.dirty)
                .map(|(blkno, c)| (*blkno, Arc::clone(&c.data)))
                .collect();
            v.sort_by_key(|(blkno, _)| *blkno);
            v
        };

        debug!(blocks = dirty.len(), "cache_flush");
        for (blkno, data) in dirty {
            self.dev.write_block(BlockNumber(blkno), &data.read())?;
        }
        Ok(())
    }

    /// Mark the flushed transaction committed: clear dirty flags and advance
    /// the dirty sequence so the next mutation copy-on-writes again.
    pub fn finish_commit(&self) {
        let mut inner = self.inner.lock();
        for cached in inner.values_mut() {
            cached.dirty = false;
        }
        self.dirty_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Throw away every dirty block (transaction abort).
    pub fn discard_dirty(&self) {
        self.inner.lock().retain(|_, c| !c.dirty);
    }

    /// Number of dirty blocks staged in the current transaction.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().values().filter(|c| c.dirty).count()
    }

    /// Read a block from the device and verify its header against `r`.
    fn fetch(&self, r: &BlockRef) -> Result<Vec<u8>> {
        let buf = self.dev.read_block(r.blkno)?;
        let hdr = BlockHeader::parse(buf.as_slice())?;
        if hdr.fsid != self.fsid || hdr.blkno != r.blkno {
            return Err(TideError::corrupt(r.blkno.0, "block header mismatch"));
        }
        if hdr.seq != r.seq {
            return Err(TideError::Stale { block: r.blkno.0 });
        }
        Ok(buf.into_vec())
    }
}

// ── Super pair ──────────────────────────────────────────────────────────────

/// The dirty and stable super blocks of a mounted volume.
#[derive(Debug, Clone, Copy)]
pub struct SuperPair {
    pub dirty: Superblock,
    pub stable: Superblock,
}

/// Shared, locked super pair.
pub struct SuperCell {
    inner: Mutex<SuperPair>,
}

impl SuperCell {
    /// Start with dirty == stable, as after mount or commit.
    #[must_use]
    pub fn new(stable: Superblock) -> Self {
        Self {
            inner: Mutex::new(SuperPair {
                dirty: stable,
                stable,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SuperPair> {
        self.inner.lock()
    }
}

// ── Transaction barrier ─────────────────────────────────────────────────────

/// Reader/writer barrier between mutating operations and commit.
///
/// Mutators hold the reader side for the duration of one operation; commit
/// takes the writer side, so it observes no in-flight mutations.
#[derive(Default)]
pub struct TransLock {
    rw: RwLock<()>,
}

/// Reader-side guard; release by dropping.
pub struct TransGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Writer-side guard held across commit.
pub struct CommitGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl TransLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the transaction (reader side). Blocks while a commit runs.
    pub fn hold(&self) -> TransGuard<'_> {
        TransGuard {
            _guard: self.rw.read(),
        }
    }

    /// Begin a commit (writer side). Blocks until all holders release.
    pub fn begin_commit(&self) -> CommitGuard<'_> {
        CommitGuard {
            _guard: self.rw.write(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
