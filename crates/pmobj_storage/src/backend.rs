//! Persistent memory trait definition.

use crate::error::{StorageError, StorageResult};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Size of a CPU cacheline, the unit of atomic persistence.
pub const CACHELINE_SIZE: usize = 64;

/// Flags selecting the variant of a memory copy or fill.
///
/// Without [`MemFlags::NO_FLUSH`] or [`MemFlags::NO_DRAIN`] a write is
/// persisted (flushed and drained) before it returns.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemFlags(u32);

impl MemFlags {
    /// Persist the write before returning.
    pub const NONE: Self = Self(0);
    /// Bypass the cache (streaming store).
    pub const NON_TEMPORAL: Self = Self(1 << 0);
    /// Flush but do not drain; durability waits for the next `drain`.
    pub const NO_DRAIN: Self = Self(1 << 1);
    /// Neither flush nor drain; the caller persists explicitly later.
    pub const NO_FLUSH: Self = Self(1 << 2);
    /// Ordering relative to other relaxed writes is not required.
    pub const RELAXED: Self = Self(1 << 3);
    /// Write-combining store.
    pub const WRITE_COMBINE: Self = Self(1 << 4);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for MemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MemFlags, &str); 5] = [
            (MemFlags::NON_TEMPORAL, "NON_TEMPORAL"),
            (MemFlags::NO_DRAIN, "NO_DRAIN"),
            (MemFlags::NO_FLUSH, "NO_FLUSH"),
            (MemFlags::RELAXED, "RELAXED"),
            (MemFlags::WRITE_COMBINE, "WRITE_COMBINE"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("MemFlags(NONE)")
        } else {
            write!(f, "MemFlags({})", set.join(" | "))
        }
    }
}

/// A byte-addressed region of persistent memory.
///
/// Pools are **opaque byte arenas**. Offsets are relative to the pool base;
/// every access is bounds-checked. The pool knows nothing about logs,
/// segments or entries.
///
/// # Durability model
///
/// - `write`/`fill` store bytes into the pool (visible to later reads)
/// - `flush` starts write-back of a range; it is not yet guaranteed durable
/// - `drain` waits until every flushed range is durable
/// - `persist` is `flush` followed by `drain`
///
/// # Implementors
///
/// - [`super::InMemoryPool`] - For testing and crash simulation
/// - [`super::FilePool`] - For pools backed by a file
pub trait PersistentMemory: Send + Sync {
    /// Returns the size of the pool in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if the range exceeds the pool.
    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Copies `data` into the pool at `offset` (memcpy).
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the pool or the write fails.
    fn write(&mut self, offset: u64, data: &[u8], flags: MemFlags) -> StorageResult<()>;

    /// Fills `len` bytes at `offset` with `value` (memset).
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the pool or the write fails.
    fn fill(&mut self, offset: u64, value: u8, len: usize, flags: MemFlags) -> StorageResult<()>;

    /// Starts write-back of a range without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the pool or the flush fails.
    fn flush(&mut self, offset: u64, len: usize) -> StorageResult<()>;

    /// Waits until every previously flushed range is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the barrier fails.
    fn drain(&mut self) -> StorageResult<()>;

    /// Flushes a range and drains.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    fn persist(&mut self, offset: u64, len: usize) -> StorageResult<()> {
        self.flush(offset, len)?;
        self.drain()
    }

    /// Reads a native-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the word is outside the pool.
    fn read_u64(&self, offset: u64) -> StorageResult<u64> {
        let mut word = [0u8; 8];
        self.read(offset, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }

    /// Writes a native-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the word is outside the pool.
    fn write_u64(&mut self, offset: u64, value: u64, flags: MemFlags) -> StorageResult<()> {
        self.write(offset, &value.to_ne_bytes(), flags)
    }
}

/// Validates that `[offset, offset + len)` lies inside a pool of `size` bytes.
///
/// # Errors
///
/// Returns [`StorageError::OutOfBounds`] otherwise.
pub fn check_range(offset: u64, len: usize, size: u64) -> StorageResult<std::ops::Range<usize>> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(StorageError::OutOfBounds { offset, len, size }),
    }
}

/// Rounds a `[offset, offset + len)` range outward to cacheline boundaries.
#[must_use]
pub fn cacheline_span(offset: u64, len: usize, size: u64) -> (u64, usize) {
    let line = CACHELINE_SIZE as u64;
    let start = offset - offset % line;
    let end = (offset + len as u64).div_ceil(line) * line;
    let end = end.min(size);
    (start, (end - start) as usize)
}
