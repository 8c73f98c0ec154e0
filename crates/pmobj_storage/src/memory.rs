//! In-memory pool with durability tracking.

use crate::backend::{cacheline_span, check_range, MemFlags, PersistentMemory};
use crate::error::StorageResult;
use parking_lot::RwLock;

/// Counters describing the persistence traffic a pool has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of `write`/`fill` calls.
    pub writes: u64,
    /// Number of flushed ranges.
    pub flushes: u64,
    /// Number of drain barriers.
    pub drains: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    /// What the CPU sees: every store lands here immediately.
    volatile: Vec<u8>,
    /// What survives a power loss: only drained flushes land here.
    durable: Vec<u8>,
    /// Flushed but not yet drained cachelines, captured at flush time.
    pending: Vec<(u64, Vec<u8>)>,
    stats: PoolStats,
}

/// An in-memory pool that models persistent memory.
///
/// Stores go to a volatile image. A flush snapshots the covering
/// cachelines; a drain makes every snapshot durable. The durable image is
/// what a process would find after a power failure, which makes this pool
/// suitable for:
/// - Unit tests
/// - Crash simulation
/// - Ephemeral pools that don't need persistence
///
/// # Thread Safety
///
/// This pool is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use pmobj_storage::{InMemoryPool, MemFlags, PersistentMemory};
///
/// let mut pool = InMemoryPool::new(4096);
/// pool.write(128, b"hello", MemFlags::NO_FLUSH).unwrap();
/// assert_eq!(&pool.durable_image()[128..133], &[0u8; 5]);
///
/// pool.persist(128, 5).unwrap();
/// assert_eq!(&pool.durable_image()[128..133], b"hello");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPool {
    state: RwLock<PoolState>,
}

impl InMemoryPool {
    /// Creates a zeroed pool of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::from_image(vec![0u8; size])
    }

    /// Creates a pool whose volatile and durable contents are `image`.
    ///
    /// Used to "reopen" a pool from the durable image of a crashed one.
    #[must_use]
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            state: RwLock::new(PoolState {
                durable: image.clone(),
                volatile: image,
                pending: Vec::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Returns a copy of the bytes that are guaranteed durable.
    #[must_use]
    pub fn durable_image(&self) -> Vec<u8> {
        self.state.read().durable.clone()
    }

    /// Returns the durable bytes with every flushed-but-undrained range
    /// applied as well.
    ///
    /// Hardware may or may not have written those lines back before a
    /// failure; tests use both images to cover both outcomes.
    #[must_use]
    pub fn durable_image_with_pending(&self) -> Vec<u8> {
        let state = self.state.read();
        let mut image = state.durable.clone();
        for (offset, bytes) in &state.pending {
            let start = *offset as usize;
            image[start..start + bytes.len()].copy_from_slice(bytes);
        }
        image
    }

    /// Returns a copy of the volatile image.
    #[must_use]
    pub fn volatile_image(&self) -> Vec<u8> {
        self.state.read().volatile.clone()
    }

    /// Returns the number of flushed ranges awaiting a drain.
    #[must_use]
    pub fn pending_flushes(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Returns the persistence counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state.read().stats
    }

    fn store(&self, offset: u64, len: usize, flags: MemFlags, apply: impl FnOnce(&mut [u8])) -> StorageResult<()> {
        {
            let mut state = self.state.write();
            let size = state.volatile.len() as u64;
            let range = check_range(offset, len, size)?;
            apply(&mut state.volatile[range]);
            state.stats.writes += 1;
        }

        if flags.contains(MemFlags::NO_FLUSH) || len == 0 {
            return Ok(());
        }
        self.flush_range(offset, len)?;
        if !flags.contains(MemFlags::NO_DRAIN) {
            self.drain_pending();
        }
        Ok(())
    }

    fn flush_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        let mut state = self.state.write();
        let size = state.volatile.len() as u64;
        check_range(offset, len, size)?;
        if len == 0 {
            return Ok(());
        }
        let (start, span) = cacheline_span(offset, len, size);
        let snapshot = state.volatile[start as usize..start as usize + span].to_vec();
        state.pending.push((start, snapshot));
        state.stats.flushes += 1;
        Ok(())
    }

    fn drain_pending(&self) {
        let mut state = self.state.write();
        let pending = std::mem::take(&mut state.pending);
        for (offset, bytes) in pending {
            let start = offset as usize;
            state.durable[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        state.stats.drains += 1;
    }
}

impl PersistentMemory for InMemoryPool {
    fn size(&self) -> u64 {
        self.state.read().volatile.len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let state = self.state.read();
        let range = check_range(offset, buf.len(), state.volatile.len() as u64)?;
        buf.copy_from_slice(&state.volatile[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8], flags: MemFlags) -> StorageResult<()> {
        self.store(offset, data.len(), flags, |dst| dst.copy_from_slice(data))
    }

    fn fill(&mut self, offset: u64, value: u8, len: usize, flags: MemFlags) -> StorageResult<()> {
        self.store(offset, len, flags, |dst| dst.fill(value))
    }

    fn flush(&mut self, offset: u64, len: usize) -> StorageResult<()> {
        self.flush_range(offset, len)
    }

    fn drain(&mut self) -> StorageResult<()> {
        self.drain_pending();
        Ok(())
    }
}
