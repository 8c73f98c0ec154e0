//! Transient (DRAM) logs.
//!
//! A redo log is assembled in ordinary memory and published into the pool
//! in one step by [`crate::ulog::store()`]. The transient buffer mirrors the
//! logical data stream of the destination chain, so it is sized to the
//! chain's total capacity and carries the chain's generation.

use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use crate::ulog::chain::SegmentChain;
use crate::ulog::entry::{self, Entry, Operation};
use crate::ulog::iterator::EntryIterator;
use crate::ulog::region::{LogSink, LogSource};
use pmobj_storage::{MemFlags, PersistentMemory};

/// A log under construction in DRAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientLog {
    data: Vec<u8>,
    generation: Generation,
    len: usize,
}

impl TransientLog {
    /// Creates an empty log of `capacity` data bytes.
    #[must_use]
    pub fn new(capacity: usize, generation: Generation) -> Self {
        Self {
            data: vec![0u8; capacity],
            generation,
            len: 0,
        }
    }

    /// Creates an empty log sized to `chain` and stamped with its current
    /// base generation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the base header cannot be read.
    pub fn for_chain<P: PersistentMemory + ?Sized>(pool: &P, chain: &SegmentChain) -> CoreResult<Self> {
        Ok(Self::new(chain.capacity(), chain.generation(pool)?))
    }

    /// Wraps existing log bytes. The append position is left at zero.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>, generation: Generation) -> Self {
        Self {
            data,
            generation,
            len: 0,
        }
    }

    /// Appends a value entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::LogFull`] if the entry does not fit.
    pub fn append_value(&mut self, dest: u64, value: u64, op: Operation) -> CoreResult<()> {
        let at = self.len;
        let size = entry::write_value(self, at, dest, value, op, MemFlags::NONE)?;
        self.len += size;
        Ok(())
    }

    /// Appends a buffer entry.
    ///
    /// Buffer entries start on a cacheline boundary: append them before any
    /// value entries, or after a multiple of four.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::LogFull`] if the entry does not fit, or
    /// [`crate::CoreError::InvalidArgument`] if the log does not end on a
    /// cacheline boundary.
    pub fn append_buffer(&mut self, dest: u64, payload: &[u8], op: Operation) -> CoreResult<()> {
        let at = self.len;
        let size = entry::write_buffer(self, at, dest, payload, op)?;
        self.len += size;
        Ok(())
    }

    /// Bytes of entries appended so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been appended.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still free.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len.min(self.data.len())
    }

    /// Raw data stream.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Discards every entry, keeping capacity and generation.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    /// Decodes the valid entries in order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::Corruption`] on an unknown tag.
    pub fn entries(&self) -> CoreResult<Vec<Entry>> {
        EntryIterator::new(self)
            .map(|item| item.map(|(_, entry)| entry))
            .collect()
    }
}

impl LogSource for TransientLog {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn read_at(&self, at: usize, buf: &mut [u8]) -> CoreResult<()> {
        let src = at
            .checked_add(buf.len())
            .and_then(|end| self.data.get(at..end))
            .ok_or_else(|| out_of_range(at, buf.len(), self.data.len()))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl LogSink for TransientLog {
    fn write_at(&mut self, at: usize, data: &[u8], _flags: MemFlags) -> CoreResult<()> {
        let capacity = self.data.len();
        let dst = at
            .checked_add(data.len())
            .and_then(|end| self.data.get_mut(at..end))
            .ok_or_else(|| out_of_range(at, data.len(), capacity))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn drain(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

fn out_of_range(at: usize, len: usize, capacity: usize) -> CoreError {
    CoreError::invalid_argument(format!(
        "transient log range {at}+{len} exceeds capacity {capacity}"
    ))
}
