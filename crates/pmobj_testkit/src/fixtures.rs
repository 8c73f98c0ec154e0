//! Test fixtures and pool helpers.
//!
//! Provides a laid-out test pool with a log, a segment allocator and a
//! destination validator, plus common log scenarios.

use pmobj_core::ulog::construct;
use pmobj_core::{
    CoreError, CoreResult, Generation, LogConfig, OffsetValidator, SegmentAllocator, SegmentChain,
    UnifiedLog,
};
use pmobj_storage::{FilePool, InMemoryPool, PersistentMemory};
use tempfile::TempDir;

/// Where things live in a test pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    /// Total pool size.
    pub pool_size: usize,
    /// Offset of the log's base segment.
    pub log_head: u64,
    /// First byte of the continuation segment arena.
    pub arena_start: u64,
    /// End of the continuation segment arena.
    pub arena_end: u64,
    /// Data area capacity of each continuation segment.
    pub segment_capacity: usize,
    /// First byte logs are allowed to modify.
    pub data_start: u64,
    /// End of the area logs are allowed to modify.
    pub data_end: u64,
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self {
            pool_size: 64 * 1024,
            log_head: 64,
            arena_start: 4096,
            arena_end: 32 * 1024,
            segment_capacity: 256,
            data_start: 32 * 1024,
            data_end: 64 * 1024,
        }
    }
}

impl PoolLayout {
    /// Returns a validator accepting only the data area.
    pub fn validator(&self) -> RangeValidator {
        RangeValidator::new(self.data_start, self.data_end)
    }

    /// Returns an allocator over the segment arena.
    pub fn allocator(&self) -> BumpSegmentAllocator {
        BumpSegmentAllocator::new(self.arena_start, self.arena_end, self.segment_capacity)
    }

    /// Returns the pool offset of the `index`th 64-bit word of the data area.
    pub fn data_word(&self, index: u64) -> u64 {
        self.data_start + index * 8
    }
}

/// Hands out fixed-size segments from an arena, reusing freed ones.
///
/// State is volatile: after a restart call [`resume_after`] so segments
/// still linked into a log are not handed out twice.
///
/// [`resume_after`]: BumpSegmentAllocator::resume_after
#[derive(Debug, Clone)]
pub struct BumpSegmentAllocator {
    cursor: u64,
    end: u64,
    segment_capacity: usize,
    free_list: Vec<u64>,
    /// Segments currently handed out.
    pub live: usize,
    /// Total `extend` calls that succeeded.
    pub extended: usize,
    /// Total `free` calls.
    pub freed: usize,
}

impl BumpSegmentAllocator {
    /// Creates an allocator over `[start, end)`.
    pub fn new(start: u64, end: u64, segment_capacity: usize) -> Self {
        Self {
            cursor: start,
            end,
            segment_capacity,
            free_list: Vec::new(),
            live: 0,
            extended: 0,
            freed: 0,
        }
    }

    /// Footprint of one segment, rounded to a cacheline.
    pub fn stride(&self) -> u64 {
        let footprint = (pmobj_core::ulog::SEGMENT_HEADER_SIZE + self.segment_capacity) as u64;
        footprint.div_ceil(64) * 64
    }

    /// Moves the cursor past every continuation of `chain`.
    pub fn resume_after(&mut self, chain: &SegmentChain) {
        if let Some(&last) = chain.continuations().iter().max() {
            self.cursor = self.cursor.max(last + self.stride());
        }
        self.live = chain.continuations().len();
    }
}

impl<P: PersistentMemory + ?Sized> SegmentAllocator<P> for BumpSegmentAllocator {
    fn extend(&mut self, pool: &mut P, generation: Generation) -> CoreResult<u64> {
        let offset = match self.free_list.pop() {
            Some(offset) => offset,
            None => {
                if self.cursor + self.stride() > self.end {
                    return Err(CoreError::extend_failed(format!(
                        "segment arena exhausted at {:#x}",
                        self.cursor
                    )));
                }
                let offset = self.cursor;
                self.cursor += self.stride();
                offset
            }
        };
        construct(pool, offset, self.segment_capacity, generation, true)?;
        self.live += 1;
        self.extended += 1;
        Ok(offset)
    }

    fn free(&mut self, _pool: &mut P, offset: u64) -> CoreResult<()> {
        self.free_list.push(offset);
        self.live = self.live.saturating_sub(1);
        self.freed += 1;
        Ok(())
    }
}

/// Accepts destinations that lie entirely inside `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValidator {
    /// Inclusive start.
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
}

impl RangeValidator {
    /// Creates a validator for `[start, end)`.
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

impl<P: PersistentMemory + ?Sized> OffsetValidator<P> for RangeValidator {
    fn is_valid(&self, _pool: &P, offset: u64, len: usize) -> bool {
        offset >= self.start
            && offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end)
    }
}

/// Installs a tracing subscriber that writes to the test output.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A pool with a constructed log, an allocator and a validator.
pub struct TestPool {
    /// The pool.
    pub pool: InMemoryPool,
    /// The log at [`PoolLayout::log_head`].
    pub log: UnifiedLog,
    /// Allocator over the segment arena.
    pub alloc: BumpSegmentAllocator,
    /// Destination validator over the data area.
    pub validator: RangeValidator,
    /// Layout in use.
    pub layout: PoolLayout,
}

impl TestPool {
    /// Creates a pool with a redo log using the default configuration.
    pub fn new() -> Self {
        Self::with_config(LogConfig::default())
    }

    /// Creates a pool with a log using `config`.
    pub fn with_config(config: LogConfig) -> Self {
        let layout = PoolLayout::default();
        let mut pool = InMemoryPool::new(layout.pool_size);
        let log = UnifiedLog::construct(&mut pool, layout.log_head, config)
            .expect("Failed to construct log");
        Self {
            pool,
            log,
            alloc: layout.allocator(),
            validator: layout.validator(),
            layout,
        }
    }

    /// Simulates a clean restart: keeps only durable bytes and reopens the
    /// log from them.
    pub fn restart(&self) -> Self {
        Self::reopen(InMemoryPool::from_image(self.pool.durable_image()), self.log.config().clone())
    }

    /// Opens the log in an existing image laid out with the default layout.
    pub fn reopen(pool: InMemoryPool, config: LogConfig) -> Self {
        let layout = PoolLayout::default();
        let log = UnifiedLog::open(&pool, layout.log_head, config).expect("Failed to open log");
        let mut alloc = layout.allocator();
        alloc.resume_after(log.chain());
        Self {
            pool,
            log,
            alloc,
            validator: layout.validator(),
            layout,
        }
    }

    /// Runs recovery with the fixture's validator and allocator.
    pub fn recover(&mut self) -> CoreResult<pmobj_core::RecoveryReport> {
        let validator: &dyn OffsetValidator<InMemoryPool> = &self.validator;
        let alloc: &mut dyn SegmentAllocator<InMemoryPool> = &mut self.alloc;
        self.log.recover(&mut self.pool, Some(validator), Some(alloc))
    }

    /// Reads the `index`th word of the data area.
    pub fn data_word(&self, index: u64) -> u64 {
        self.pool
            .read_u64(self.layout.data_word(index))
            .expect("data word out of range")
    }
}

impl Default for TestPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test with a fresh redo test pool.
///
/// # Example
///
/// ```rust,ignore
/// use pmobj_testkit::with_test_pool;
///
/// #[test]
/// fn my_test() {
///     with_test_pool(|t| {
///         let redo = t.log.transient(&t.pool).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_test_pool<F, R>(f: F) -> R
where
    F: FnOnce(&mut TestPool) -> R,
{
    let mut pool = TestPool::new();
    f(&mut pool)
}

/// Runs a test with a file-backed pool in a temporary directory.
pub fn with_temp_file_pool<F, R>(size: u64, f: F) -> R
where
    F: FnOnce(&mut FilePool) -> R,
{
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut pool =
        FilePool::create(&temp_dir.path().join("pool.pmobj"), size).expect("Failed to create pool");
    f(&mut pool)
}

/// Common log scenarios.
pub mod scenarios {
    use super::*;
    use pmobj_core::{Operation, TransientLog};

    /// Builds a redo log setting consecutive data words to `values`.
    pub fn redo_setting_words(test: &TestPool, values: &[u64]) -> TransientLog {
        let mut redo = test
            .log
            .transient(&test.pool)
            .expect("Failed to create transient log");
        for (index, &value) in values.iter().enumerate() {
            redo.append_value(test.layout.data_word(index as u64), value, Operation::Set)
                .expect("redo log full");
        }
        redo
    }

    /// Grows the log and stores a redo log of `count` word updates without
    /// processing it, leaving it pending.
    pub fn pending_redo(test: &mut TestPool, count: usize) {
        let values: Vec<u64> = (1..=count as u64).map(|v| v * 0x0101).collect();
        test.log
            .reserve(&mut test.pool, 16 * count + 16, &mut test.alloc)
            .expect("Failed to reserve");
        let redo = redo_setting_words(test, &values);
        test.log.store(&mut test.pool, &redo).expect("Failed to store");
    }

    /// Snapshots `len` bytes of the data area into an undo log, then
    /// overwrites them with `fill`.
    pub fn undo_snapshot_then_overwrite(test: &mut TestPool, len: usize, fill: u8) {
        let mut before = vec![0u8; len];
        test.pool
            .read(test.layout.data_start, &mut before)
            .expect("Failed to read data area");
        test.log
            .append_buffer(&mut test.pool, test.layout.data_start, &before, Operation::BufCpy)
            .expect("Failed to append snapshot");
        test.pool
            .fill(
                test.layout.data_start,
                fill,
                len,
                pmobj_storage::MemFlags::NONE,
            )
            .expect("Failed to overwrite");
    }
}
