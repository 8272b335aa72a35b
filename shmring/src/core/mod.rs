use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::errors::RingError;
use crate::sem::Semaphore;

/// Directory and block headers are padded to this boundary; the layout is
/// the cross-process wire format and must match bit-for-bit between all
/// participants.
pub const BLOCK_ALIGN: usize = 64;

/// Chain-link sentinel: sole/terminal block of a message, or unlinked.
pub const NIL: i64 = -1;

/// Published last by the segment creator; attachers refuse a directory
/// that does not carry it.
const MAGIC: u64 = 0x5348_4d52_494e_4731; // "SHMRING1"

/// Block flag bits, kept out-of-band from the payload.
pub const FLAG_MSG_LAST: u64 = 0x01;
pub const FLAG_MSG_FIRST: u64 = 0x02;

const LOCK_REGION: usize = 64;

/// Backing store for one in-segment raw_sync mutex.
#[repr(C, align(8))]
struct LockRegion(UnsafeCell<[u8; LOCK_REGION]>);

/// The shared header at offset 0 of the segment.
///
/// The four cursors are free-running counters, never reduced; a cursor
/// occupies the slot `counter % block_count`. Keeping them monotonic is
/// what lets an empty region be told apart from one spanning the whole
/// ring: region sizes are exact differences, and two cursors compare
/// equal only when the region between them is empty.
///
/// Regions, in ring order: `[read_start, read_end)` reader-owned,
/// `[read_end, write_start)` committed unread, `[write_start, write_end)`
/// writer-owned mid-write; the remaining
/// `block_count - (write_end - read_start)` slots are the free pool.
#[repr(C, align(64))]
pub struct RingDirectory {
    magic: AtomicU64,
    block_count: AtomicU64,
    block_size: AtomicU64,
    pub(crate) read_start: AtomicU64,
    pub(crate) read_end: AtomicU64,
    pub(crate) write_start: AtomicU64,
    pub(crate) write_end: AtomicU64,
    pub(crate) sem_signal: Semaphore,
    pub(crate) sem_avail: Semaphore,
    writer_lock_mem: LockRegion,
    reader_lock_mem: LockRegion,
}

/// Fixed-width header of one block; `block_size` payload bytes follow it
/// immediately, so the stride between blocks is `64 + block_size`.
#[repr(C, align(64))]
pub struct BlockHeader {
    pub(crate) next: AtomicI64,
    pub(crate) prev: AtomicI64,
    pub(crate) done_read: AtomicU64,
    pub(crate) done_write: AtomicU64,
    pub(crate) size: AtomicU64,
    pub(crate) flags: AtomicU64,
}

const _: () = assert!(mem::size_of::<BlockHeader>() == BLOCK_ALIGN);
const _: () = assert!(mem::size_of::<RingDirectory>() % BLOCK_ALIGN == 0);

impl BlockHeader {
    /// Returns the block to its freshly-initialized state. Called by the
    /// reader sweep before the block re-enters the free pool.
    pub(crate) fn reset(&self) {
        self.next.store(NIL, Ordering::Relaxed);
        self.prev.store(NIL, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.done_write.store(0, Ordering::Relaxed);
        self.done_read.store(0, Ordering::Release);
    }
}

/// A message mapped onto `len` contiguous blocks; `head` is the cursor
/// value of the first one, not a reduced slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    pub head: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    pub data_dir: String,
    pub link_name: String,
    pub block_count: u64,
    pub block_size: u64,
    /// Upper bound on blocks per message; `0` resolves to
    /// `block_count - 1` at build time.
    pub max_message_blocks: u64,
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            data_dir: "/dev/shm".to_string(),
            link_name: "shmring-queue".to_string(),
            block_count: 1024,
            block_size: 8192,
            max_message_blocks: 0,
        }
    }
}

impl RingConfig {
    pub fn builder() -> RingConfigBuilder {
        RingConfigBuilder {
            cfg: RingConfig::default(),
        }
    }

    fn link_path(&self) -> String {
        format!("{}/{}", self.data_dir, self.link_name)
    }

    pub(crate) fn max_chain(&self) -> u64 {
        if self.max_message_blocks == 0 {
            self.block_count - 1
        } else {
            self.max_message_blocks
        }
    }
}

pub struct RingConfigBuilder {
    cfg: RingConfig,
}

impl RingConfigBuilder {
    pub fn data_dir(mut self, data_dir: String) -> Self {
        self.cfg.data_dir = data_dir;
        self
    }

    pub fn link_name(mut self, link_name: String) -> Self {
        self.cfg.link_name = link_name;
        self
    }

    pub fn block_count(mut self, block_count: u64) -> Self {
        self.cfg.block_count = block_count;
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.cfg.block_size = block_size;
        self
    }

    pub fn max_message_blocks(mut self, max_message_blocks: u64) -> Self {
        self.cfg.max_message_blocks = max_message_blocks;
        self
    }

    pub fn build(self) -> Result<RingConfig, RingError> {
        validate_geometry(self.cfg.block_count, self.cfg.block_size)?;
        if self.cfg.max_message_blocks > self.cfg.block_count - 1 {
            return Err(RingError::Config(format!(
                "max_message_blocks {} exceeds block_count - 1 ({})",
                self.cfg.max_message_blocks,
                self.cfg.block_count - 1
            )));
        }
        Ok(self.cfg)
    }
}

fn validate_geometry(block_count: u64, block_size: u64) -> Result<(), RingError> {
    if block_count < 2 {
        return Err(RingError::Config(format!(
            "block_count must be at least 2, got {}",
            block_count
        )));
    }
    if block_size == 0 || block_size % BLOCK_ALIGN as u64 != 0 {
        return Err(RingError::Config(format!(
            "block_size must be a non-zero multiple of {}, got {}",
            BLOCK_ALIGN, block_size
        )));
    }
    Ok(())
}

fn segment_size(cfg: &RingConfig) -> usize {
    mem::size_of::<RingDirectory>()
        + (mem::size_of::<BlockHeader>() + cfg.block_size as usize) * cfg.block_count as usize
}

/// Creates the segment named by `cfg`, or opens it when another writer
/// got there first.
pub fn writer_context(cfg: &RingConfig) -> Result<Shmem, RingError> {
    match ShmemConf::new()
        .size(segment_size(cfg))
        .flink(cfg.link_path())
        .create()
    {
        Ok(m) => Ok(m),
        Err(ShmemError::LinkExists) => open_linked(cfg),
        Err(e) => Err(e.into()),
    }
}

/// Attach-only: the segment must already exist and be initialized.
pub fn reader_context(cfg: &RingConfig) -> Result<Shmem, RingError> {
    open_linked(cfg)
}

fn open_linked(cfg: &RingConfig) -> Result<Shmem, RingError> {
    Ok(ShmemConf::new().flink(cfg.link_path()).open()?)
}

/// Set once per process when a termination signal arrives; every ring
/// operation checks it before touching the segment so a dying process
/// stops mid-protocol mutations at a clean boundary.
static CLOSING: Lazy<Arc<AtomicBool>> = Lazy::new(|| {
    let flag = Arc::new(AtomicBool::new(false));
    match Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM]) {
        Ok(mut signals) => {
            let closing = Arc::clone(&flag);
            thread::spawn(move || {
                for _ in signals.forever() {
                    closing.store(true, Ordering::SeqCst);
                }
            });
        }
        Err(e) => eprintln!("shmring: signal registration failed: {}", e),
    }
    flag
});

/// The explicit handle to one mapped ring: the directory, the block
/// array, both semaphores and both cursor mutexes. Every operation takes
/// this handle; there is no process-wide singleton for the segment.
pub struct RingService {
    // Owns the mapping; `dir` and `blocks` point into it.
    #[allow(dead_code)]
    shmem: Shmem,
    dir: *const RingDirectory,
    blocks: *mut u8,
    stride: usize,
    block_count: u64,
    block_size: u64,
    max_chain: u64,
    writer_lock: Box<dyn LockImpl>,
    reader_lock: Box<dyn LockImpl>,
    closing: Arc<AtomicBool>,
}

impl RingService {
    /// Wraps a mapping obtained from `writer_context`/`reader_context`.
    /// The segment owner initializes the directory; everyone else
    /// validates it.
    pub fn new(shmem: Shmem, cfg: &RingConfig) -> Result<Box<RingService>, RingError> {
        let base = shmem.as_ptr();
        let dir = base as *const RingDirectory;

        let (writer_lock, reader_lock) = if shmem.is_owner() {
            unsafe { init_directory(dir, cfg)? }
        } else {
            unsafe { attach_directory(dir)? }
        };

        let directory = unsafe { &*dir };
        let block_count = directory.block_count.load(Ordering::Acquire);
        let block_size = directory.block_size.load(Ordering::Acquire);
        validate_geometry(block_count, block_size).map_err(|_| {
            RingError::ProtocolViolation(format!(
                "directory carries impossible geometry: {} blocks of {} bytes",
                block_count, block_size
            ))
        })?;

        let stride = mem::size_of::<BlockHeader>() + block_size as usize;
        Ok(Box::new(RingService {
            blocks: unsafe { base.add(mem::size_of::<RingDirectory>()) },
            shmem,
            dir,
            stride,
            block_count,
            block_size,
            max_chain: cfg.max_chain().min(block_count - 1),
            writer_lock,
            reader_lock,
            closing: Arc::clone(&CLOSING),
        }))
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub(crate) fn max_chain(&self) -> u64 {
        self.max_chain
    }

    pub(crate) fn directory(&self) -> &RingDirectory {
        unsafe { &*self.dir }
    }

    /// Slot a free-running cursor occupies. Stored `next`/`prev` links
    /// carry slots, so this is a no-op on them.
    #[inline]
    pub(crate) fn slot_of(&self, at: u64) -> u64 {
        at % self.block_count
    }

    pub(crate) fn block(&self, at: u64) -> &BlockHeader {
        let slot = self.slot_of(at) as usize;
        unsafe { &*(self.blocks.add(slot * self.stride) as *const BlockHeader) }
    }

    pub(crate) fn data_ptr(&self, at: u64) -> *mut u8 {
        let slot = self.slot_of(at) as usize;
        unsafe {
            self.blocks
                .add(slot * self.stride + mem::size_of::<BlockHeader>())
        }
    }

    pub(crate) fn writer_lock(&self) -> Result<LockGuard<'_>, RingError> {
        self.writer_lock.lock().map_err(RingError::Lock)
    }

    pub(crate) fn reader_lock(&self) -> Result<LockGuard<'_>, RingError> {
        self.reader_lock.lock().map_err(RingError::Lock)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), RingError> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(RingError::Closing);
        }
        Ok(())
    }

    /// Free-pool permit count. Exact only on a quiesced ring.
    pub fn free_blocks(&self) -> Result<i64, RingError> {
        Ok(self.directory().sem_avail.value()?)
    }

    /// Committed-unread permit count. Exact only on a quiesced ring.
    pub fn signaled_blocks(&self) -> Result<i64, RingError> {
        Ok(self.directory().sem_signal.value()?)
    }
}

unsafe fn init_directory(
    dir: *const RingDirectory,
    cfg: &RingConfig,
) -> Result<(Box<dyn LockImpl>, Box<dyn LockImpl>), RingError> {
    validate_geometry(cfg.block_count, cfg.block_size)?;
    let d = &*dir;

    // The mapping arrives zeroed, so the cursors and every block's
    // done_read/done_write/size already hold their initial values.
    d.block_count.store(cfg.block_count, Ordering::Relaxed);
    d.block_size.store(cfg.block_size, Ordering::Relaxed);

    let stride = mem::size_of::<BlockHeader>() + cfg.block_size as usize;
    let blocks = (dir as *const u8).add(mem::size_of::<RingDirectory>());
    for i in 0..cfg.block_count {
        let block = &*(blocks.add(i as usize * stride) as *const BlockHeader);
        block.next.store(NIL, Ordering::Relaxed);
        block.prev.store(NIL, Ordering::Relaxed);
    }

    d.sem_signal.init(0)?;
    d.sem_avail.init(cfg.block_count as u32)?;

    let (writer_lock, used) = Mutex::new(d.writer_lock_mem.0.get() as *mut u8, dir as *mut u8)
        .map_err(RingError::Lock)?;
    if used > LOCK_REGION {
        // caught before the magic word publishes, so no one attaches to a
        // directory with an overrun lock region
        return Err(RingError::Config(format!(
            "cursor mutex needs {} bytes, lock region holds {}",
            used, LOCK_REGION
        )));
    }
    let (reader_lock, _) = Mutex::new(d.reader_lock_mem.0.get() as *mut u8, dir as *mut u8)
        .map_err(RingError::Lock)?;

    // Publish last: attachers key off the magic word.
    d.magic.store(MAGIC, Ordering::Release);
    Ok((writer_lock, reader_lock))
}

unsafe fn attach_directory(
    dir: *const RingDirectory,
) -> Result<(Box<dyn LockImpl>, Box<dyn LockImpl>), RingError> {
    let d = &*dir;
    if d.magic.load(Ordering::Acquire) != MAGIC {
        return Err(RingError::ProtocolViolation(
            "segment is not an initialized ring directory".to_string(),
        ));
    }
    let (writer_lock, _) =
        Mutex::from_existing(d.writer_lock_mem.0.get() as *mut u8, dir as *mut u8)
            .map_err(RingError::Lock)?;
    let (reader_lock, _) =
        Mutex::from_existing(d.reader_lock_mem.0.get() as *mut u8, dir as *mut u8)
            .map_err(RingError::Lock)?;
    Ok((writer_lock, reader_lock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_bad_geometry() {
        assert!(matches!(
            RingConfig::builder().block_count(1).build(),
            Err(RingError::Config(_))
        ));
        assert!(matches!(
            RingConfig::builder().block_size(0).build(),
            Err(RingError::Config(_))
        ));
        assert!(matches!(
            RingConfig::builder().block_size(100).build(),
            Err(RingError::Config(_))
        ));
        assert!(matches!(
            RingConfig::builder()
                .block_count(4)
                .max_message_blocks(4)
                .build(),
            Err(RingError::Config(_))
        ));
    }

    #[test]
    fn max_chain_defaults_to_count_minus_one() {
        let cfg = RingConfig::builder()
            .block_count(8)
            .block_size(64)
            .build()
            .unwrap();
        assert_eq!(cfg.max_chain(), 7);

        let cfg = RingConfig::builder()
            .block_count(8)
            .block_size(64)
            .max_message_blocks(3)
            .build()
            .unwrap();
        assert_eq!(cfg.max_chain(), 3);
    }

    #[test]
    fn segment_size_covers_directory_and_blocks() {
        let cfg = RingConfig::builder()
            .block_count(4)
            .block_size(64)
            .build()
            .unwrap();
        let expected = mem::size_of::<RingDirectory>() + 4 * (BLOCK_ALIGN + 64);
        assert_eq!(segment_size(&cfg), expected);
    }
}
