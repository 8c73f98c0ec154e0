//! Logical addressing of log data across a segment chain.
//!
//! Entries are addressed by their offset in one logical byte stream made
//! of the data areas of every segment, in link order. An entry may straddle
//! a segment boundary; reads and writes are split transparently.

use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use crate::ulog::layout::data_offset;
use pmobj_storage::{MemFlags, PersistentMemory};

/// Read access to a log data stream.
pub trait LogSource {
    /// Total data bytes addressable in the stream.
    fn capacity(&self) -> usize;

    /// Generation that entry checksums are validated against.
    fn generation(&self) -> Generation;

    /// Reads `buf.len()` bytes at logical offset `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the capacity or the pool read
    /// fails.
    fn read_at(&self, at: usize, buf: &mut [u8]) -> CoreResult<()>;

    /// Reads a native-endian word at `at`.
    ///
    /// # Errors
    ///
    /// See [`LogSource::read_at`].
    fn read_word_at(&self, at: usize) -> CoreResult<u64> {
        let mut word = [0u8; 8];
        self.read_at(at, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }
}

/// Write access to a log data stream.
pub trait LogSink: LogSource {
    /// Writes `data` at logical offset `at` with the given flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the capacity or the pool write
    /// fails.
    fn write_at(&mut self, at: usize, data: &[u8], flags: MemFlags) -> CoreResult<()>;

    /// Waits until every deferred write is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool barrier fails.
    fn drain(&mut self) -> CoreResult<()>;
}

/// Maps logical offsets onto the data areas of a chain's segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentMap {
    /// (segment offset, data capacity) in link order.
    segments: Vec<(u64, usize)>,
    total: usize,
}

impl SegmentMap {
    /// Builds a map from (segment offset, capacity) pairs.
    #[must_use]
    pub fn new(segments: Vec<(u64, usize)>) -> Self {
        let total = segments.iter().map(|(_, cap)| cap).sum();
        Self { segments, total }
    }

    /// Total data capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.total
    }

    /// Segments in link order.
    #[must_use]
    pub fn segments(&self) -> &[(u64, usize)] {
        &self.segments
    }

    /// Splits `[at, at + len)` into (pool offset, range-in-buffer) pieces.
    fn pieces(&self, at: usize, len: usize) -> CoreResult<Vec<(u64, std::ops::Range<usize>)>> {
        let end = at
            .checked_add(len)
            .filter(|&end| end <= self.total)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "log range {at}+{len} exceeds capacity {}",
                    self.total
                ))
            })?;

        let mut pieces = Vec::new();
        let mut start = 0usize;
        let mut cursor = at;
        for &(segment, cap) in &self.segments {
            if cursor >= end {
                break;
            }
            let seg_end = start + cap;
            if cursor < seg_end {
                let n = (seg_end.min(end)) - cursor;
                let done = cursor - at;
                pieces.push((data_offset(segment) + (cursor - start) as u64, done..done + n));
                cursor += n;
            }
            start = seg_end;
        }
        Ok(pieces)
    }
}

/// Read-only view of a chain in a pool.
#[derive(Debug)]
pub struct ChainReader<'a, P: PersistentMemory + ?Sized> {
    pool: &'a P,
    map: &'a SegmentMap,
    generation: Generation,
}

impl<'a, P: PersistentMemory + ?Sized> ChainReader<'a, P> {
    /// Creates a view validating entries against `generation`.
    pub fn new(pool: &'a P, map: &'a SegmentMap, generation: Generation) -> Self {
        Self {
            pool,
            map,
            generation,
        }
    }
}

impl<P: PersistentMemory + ?Sized> LogSource for ChainReader<'_, P> {
    fn capacity(&self) -> usize {
        self.map.capacity()
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn read_at(&self, at: usize, buf: &mut [u8]) -> CoreResult<()> {
        for (offset, range) in self.map.pieces(at, buf.len())? {
            self.pool.read(offset, &mut buf[range])?;
        }
        Ok(())
    }
}

/// Writable view of a chain in a pool.
#[derive(Debug)]
pub struct ChainWriter<'a, P: PersistentMemory + ?Sized> {
    pool: &'a mut P,
    map: &'a SegmentMap,
    generation: Generation,
}

impl<'a, P: PersistentMemory + ?Sized> ChainWriter<'a, P> {
    /// Creates a writable view whose entries carry `generation`.
    pub fn new(pool: &'a mut P, map: &'a SegmentMap, generation: Generation) -> Self {
        Self {
            pool,
            map,
            generation,
        }
    }
}

impl<P: PersistentMemory + ?Sized> LogSource for ChainWriter<'_, P> {
    fn capacity(&self) -> usize {
        self.map.capacity()
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn read_at(&self, at: usize, buf: &mut [u8]) -> CoreResult<()> {
        for (offset, range) in self.map.pieces(at, buf.len())? {
            self.pool.read(offset, &mut buf[range])?;
        }
        Ok(())
    }
}

impl<P: PersistentMemory + ?Sized> LogSink for ChainWriter<'_, P> {
    fn write_at(&mut self, at: usize, data: &[u8], flags: MemFlags) -> CoreResult<()> {
        let pieces = self.map.pieces(at, data.len())?;
        let persist = !flags.contains(MemFlags::NO_DRAIN) && !flags.contains(MemFlags::NO_FLUSH);
        if persist && pieces.len() > 1 {
            // Persist all pieces behind a single barrier.
            for (offset, range) in &pieces {
                self.pool.write(*offset, &data[range.clone()], flags | MemFlags::NO_DRAIN)?;
            }
            self.pool.drain()?;
            return Ok(());
        }
        for (offset, range) in pieces {
            self.pool.write(offset, &data[range], flags)?;
        }
        Ok(())
    }

    fn drain(&mut self) -> CoreResult<()> {
        self.pool.drain()?;
        Ok(())
    }
}
