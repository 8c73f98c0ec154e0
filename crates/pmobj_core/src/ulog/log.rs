//! The unified log handle.

use tracing::debug;

use crate::allocator::{OffsetValidator, SegmentAllocator};
use crate::config::LogConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{Generation, LogKind};
use crate::ulog::chain::{self, SegmentChain};
use crate::ulog::entry::{self, Entry, Operation};
use crate::ulog::iterator::{self, EntryIterator};
use crate::ulog::process;
use crate::ulog::reclaim::{self, ReclaimFlags, ReclaimReport};
use crate::ulog::recovery::{self, LogState, RecoveryReport};
use crate::ulog::region::{ChainReader, ChainWriter};
use crate::ulog::store;
use crate::ulog::transient::TransientLog;
use pmobj_storage::PersistentMemory;

/// A unified undo/redo log rooted at a base segment in a pool.
///
/// The handle caches the segment chain; the pool is passed to every call.
/// Only one handle may operate on a given chain at a time.
///
/// # Redo lifecycle
///
/// 1. [`reserve`](Self::reserve) enough capacity
/// 2. build a [`TransientLog`] with [`transient`](Self::transient)
/// 3. [`store`](Self::store) it, which publishes it atomically
/// 4. [`process`](Self::process) the entries
/// 5. [`clobber`](Self::clobber) and [`clobber_data`](Self::clobber_data)
///
/// [`commit`](Self::commit) runs steps 3 to 5.
///
/// # Undo lifecycle
///
/// Entries are appended straight into the pool with
/// [`append_buffer`](Self::append_buffer); on abort they are processed, on
/// commit the log is reclaimed with a generation bump.
#[derive(Debug, Clone)]
pub struct UnifiedLog {
    chain: SegmentChain,
    config: LogConfig,
    tail: usize,
}

impl UnifiedLog {
    /// Initializes a new, persisted base segment at `head` with generation
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the segment does
    /// not fit in the pool.
    pub fn construct<P: PersistentMemory + ?Sized>(
        pool: &mut P,
        head: u64,
        config: LogConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        chain::construct(pool, head, config.base_capacity, Generation::default(), true)?;
        debug!(head, capacity = config.base_capacity, kind = %config.kind, "log constructed");
        Ok(Self {
            chain: SegmentChain::rebuild(pool, head)?,
            config,
            tail: 0,
        })
    }

    /// Attaches to an existing chain at `head`.
    ///
    /// For undo logs, appends continue after the last valid entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the chain is malformed, or
    /// [`CoreError::InvalidConfig`] if the base capacity differs from the
    /// configuration.
    pub fn open<P: PersistentMemory + ?Sized>(
        pool: &P,
        head: u64,
        config: LogConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        let chain = SegmentChain::rebuild(pool, head)?;
        if chain.base_capacity() != config.base_capacity {
            return Err(CoreError::invalid_config(format!(
                "log at {head:#x} has base capacity {}, configured {}",
                chain.base_capacity(),
                config.base_capacity
            )));
        }
        let mut log = Self {
            chain,
            config,
            tail: 0,
        };
        if log.config.kind == LogKind::Undo {
            log.tail = log.for_each_entry(pool, |_, _| Ok(true))?;
        }
        Ok(log)
    }

    /// Pool offset of the base segment.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.chain.head()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Cached segment chain.
    #[must_use]
    pub const fn chain(&self) -> &SegmentChain {
        &self.chain
    }

    /// Total data capacity across every segment.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.chain.capacity()
    }

    /// Offset at which the next undo entry is appended.
    #[must_use]
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Current base generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    pub fn generation<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<Generation> {
        self.chain.generation(pool)
    }

    /// Ensures at least `desired` bytes of capacity. Returns the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ExtendFailed`] if the allocator fails.
    pub fn reserve<P, A>(&mut self, pool: &mut P, desired: usize, alloc: &mut A) -> CoreResult<usize>
    where
        P: PersistentMemory + ?Sized,
        A: SegmentAllocator<P> + ?Sized,
    {
        self.chain.reserve(pool, desired, alloc)
    }

    /// Creates an empty transient log matching this chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    pub fn transient<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<TransientLog> {
        TransientLog::for_chain(pool, &self.chain)
    }

    /// Publishes a transient redo log.
    ///
    /// # Errors
    ///
    /// See [`store::store`].
    pub fn store<P: PersistentMemory + ?Sized>(&self, pool: &mut P, log: &TransientLog) -> CoreResult<()> {
        store::store(pool, &self.chain, log)
    }

    /// Appends a snapshot entry directly into the pool (undo path).
    ///
    /// Undo logs hold buffer entries only: retiring them relies on the
    /// generation bump, which value entries do not observe.
    ///
    /// The entry becomes valid atomically: a crash leaves either the whole
    /// entry or an entry that fails validation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogFull`] if the entry does not fit.
    pub fn append_buffer<P: PersistentMemory + ?Sized>(
        &mut self,
        pool: &mut P,
        dest: u64,
        payload: &[u8],
        op: Operation,
    ) -> CoreResult<()> {
        let generation = self.generation(pool)?;
        let mut writer = ChainWriter::new(pool, self.chain.map(), generation);
        let size = entry::write_buffer(&mut writer, self.tail, dest, payload, op)?;
        self.tail += size;
        Ok(())
    }

    /// Calls `callback` for each valid entry until it returns `Ok(false)`.
    /// Returns the offset just past the last entry visited.
    ///
    /// # Errors
    ///
    /// Propagates corruption and callback errors.
    pub fn for_each_entry<P, F>(&self, pool: &P, callback: F) -> CoreResult<usize>
    where
        P: PersistentMemory + ?Sized,
        F: FnMut(usize, &Entry) -> CoreResult<bool>,
    {
        let reader = ChainReader::new(pool, self.chain.map(), self.generation(pool)?);
        iterator::for_each_entry(&reader, callback)
    }

    /// Collects every valid entry with its offset.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] on an unknown tag.
    pub fn entries<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<Vec<(usize, Entry)>> {
        let reader = ChainReader::new(pool, self.chain.map(), self.generation(pool)?);
        EntryIterator::new(&reader).collect()
    }

    /// Bytes of valid entries starting in the base segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] on an unknown tag.
    pub fn base_byte_count<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<usize> {
        let reader = ChainReader::new(pool, self.chain.map(), self.generation(pool)?);
        iterator::base_byte_count(&reader, self.chain.base_capacity())
    }

    /// Verifies every entry's destination.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] naming the first rejected entry.
    pub fn check<P, V>(&self, pool: &P, validator: &V) -> CoreResult<()>
    where
        P: PersistentMemory + ?Sized,
        V: OffsetValidator<P> + ?Sized,
    {
        process::check(pool, &self.chain, validator)
    }

    /// Applies every valid entry. The validator runs first when the
    /// consistency check is enabled.
    ///
    /// # Errors
    ///
    /// See [`process::process`].
    pub fn process<P: PersistentMemory + ?Sized>(
        &self,
        pool: &mut P,
        validator: Option<&dyn OffsetValidator<P>>,
    ) -> CoreResult<usize> {
        let validator = validator.filter(|_| self.config.consistency_check);
        let applied = process::process(pool, &self.chain, validator)?;
        debug!(head = self.head(), applied, "log processed");
        Ok(applied)
    }

    /// Classifies the log.
    ///
    /// # Errors
    ///
    /// See [`recovery::state`].
    pub fn state<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<LogState> {
        recovery::state(pool, &self.chain, self.config.kind)
    }

    /// Returns true if the log must be replayed.
    ///
    /// # Errors
    ///
    /// See [`recovery::state`].
    pub fn recovery_needed<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<bool> {
        recovery::recovery_needed(pool, &self.chain, self.config.kind)
    }

    /// Replays a pending log and clobbers it.
    ///
    /// With `normalize_on_clean` configured and an allocator given, every
    /// continuation segment is freed afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the log cannot be interpreted.
    pub fn recover<P: PersistentMemory + ?Sized>(
        &mut self,
        pool: &mut P,
        validator: Option<&dyn OffsetValidator<P>>,
        alloc: Option<&mut dyn SegmentAllocator<P>>,
    ) -> CoreResult<RecoveryReport> {
        let validator = validator.filter(|_| self.config.consistency_check);
        let mut report = recovery::recover(pool, &self.chain, self.config.kind, validator)?;
        self.tail = 0;
        if report.state == LogState::Clean && self.config.kind == LogKind::Undo {
            self.tail = self.for_each_entry(&*pool, |_, _| Ok(true))?;
        }

        if let Some(alloc) = alloc.filter(|_| self.config.normalize_on_clean) {
            if report.state == LogState::Clean && self.tail == 0 {
                let reclaimed = reclaim::clobber_data(
                    pool,
                    &mut self.chain,
                    alloc,
                    ReclaimFlags::FREE_AFTER_FIRST,
                )?;
                report.generation = reclaimed.generation;
            }
        }
        Ok(report)
    }

    /// Invalidates the log's content. Returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the header cannot be written.
    pub fn clobber<P: PersistentMemory + ?Sized>(&mut self, pool: &mut P) -> CoreResult<Generation> {
        let generation = reclaim::clobber(pool, &self.chain, None)?;
        self.tail = 0;
        Ok(generation)
    }

    /// Frees continuation segments; see [`reclaim::clobber_data`].
    ///
    /// Unless `FREE_AFTER_FIRST` is given, the first continuation is kept
    /// only when `keep_warm_continuation` is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if a write or a free fails.
    pub fn clobber_data<P, A>(
        &mut self,
        pool: &mut P,
        alloc: &mut A,
        mut flags: ReclaimFlags,
    ) -> CoreResult<ReclaimReport>
    where
        P: PersistentMemory + ?Sized,
        A: SegmentAllocator<P> + ?Sized,
    {
        if !self.config.keep_warm_continuation {
            flags |= ReclaimFlags::FREE_AFTER_FIRST;
        }
        let report = reclaim::clobber_data(pool, &mut self.chain, alloc, flags)?;
        if flags.contains(ReclaimFlags::INC_FIRST_GEN) {
            self.tail = 0;
        }
        Ok(report)
    }

    /// Publishes, applies and retires a redo log.
    ///
    /// Once `store` returns, the changes survive any crash: recovery replays
    /// them if processing does not finish.
    ///
    /// # Errors
    ///
    /// Returns an error from any step; a failure after the store leaves the
    /// log pending for recovery.
    pub fn commit<P, A>(
        &mut self,
        pool: &mut P,
        log: &TransientLog,
        validator: Option<&dyn OffsetValidator<P>>,
        alloc: &mut A,
    ) -> CoreResult<usize>
    where
        P: PersistentMemory + ?Sized,
        A: SegmentAllocator<P> + ?Sized,
    {
        self.store(pool, log)?;
        let applied = self.process(pool, validator)?;
        self.clobber(pool)?;
        self.clobber_data(pool, alloc, ReclaimFlags::NONE)?;
        Ok(applied)
    }

    /// Rolls back an undo log: applies its snapshots, then retires it.
    ///
    /// # Errors
    ///
    /// Returns an error from any step.
    pub fn abort<P, A>(
        &mut self,
        pool: &mut P,
        validator: Option<&dyn OffsetValidator<P>>,
        alloc: &mut A,
    ) -> CoreResult<usize>
    where
        P: PersistentMemory + ?Sized,
        A: SegmentAllocator<P> + ?Sized,
    {
        let applied = self.process(pool, validator)?;
        self.clobber_data(pool, alloc, ReclaimFlags::INC_FIRST_GEN)?;
        Ok(applied)
    }
}
