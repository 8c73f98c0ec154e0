//! Segment chains: the base segment and its continuations.

use std::collections::HashSet;

use crate::allocator::SegmentAllocator;
use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use crate::ulog::layout::{data_offset, SegmentHeader, NEXT_FIELD, SEGMENT_HEADER_SIZE};
use crate::ulog::region::SegmentMap;
use pmobj_storage::{MemFlags, PersistentMemory};

/// Initializes a segment at `offset`.
///
/// Writes the header (capacity, zero checksum, zero link, `generation`) and
/// zeroes the data area. With `flush` the segment is persisted; without it
/// the stores stay in the cache and the caller is responsible for
/// persisting them.
///
/// # Errors
///
/// Returns an error if the segment does not fit in the pool.
pub fn construct<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    offset: u64,
    capacity: usize,
    generation: Generation,
    flush: bool,
) -> CoreResult<()> {
    let header = SegmentHeader::new(capacity as u64, generation);
    if flush {
        pool.write(offset, &header.encode(), MemFlags::NO_DRAIN | MemFlags::RELAXED)?;
        pool.fill(
            data_offset(offset),
            0,
            capacity,
            MemFlags::NON_TEMPORAL | MemFlags::NO_DRAIN | MemFlags::RELAXED,
        )?;
        pool.drain()?;
    } else {
        pool.write(offset, &header.encode(), MemFlags::NO_FLUSH)?;
        pool.fill(data_offset(offset), 0, capacity, MemFlags::NO_FLUSH)?;
    }
    Ok(())
}

/// In-memory description of a chain: the head and every continuation in
/// link order, with a cached logical-offset map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentChain {
    head: u64,
    next: Vec<u64>,
    map: SegmentMap,
}

impl SegmentChain {
    /// Walks the links from `head` and records every segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if a link points outside the pool
    /// or back into the chain, or if a segment's data overruns the pool.
    pub fn rebuild<P: PersistentMemory + ?Sized>(pool: &P, head: u64) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        let mut segments = Vec::new();
        let mut next = Vec::new();
        let mut offset = head;

        loop {
            let header = Self::checked_header(pool, offset)?;
            if !seen.insert(offset) {
                return Err(CoreError::corruption(format!(
                    "segment chain from {head:#x} loops back to {offset:#x}"
                )));
            }
            segments.push((offset, header.capacity as usize));
            if header.next == 0 {
                break;
            }
            next.push(header.next);
            offset = header.next;
        }

        Ok(Self {
            head,
            next,
            map: SegmentMap::new(segments),
        })
    }

    fn checked_header<P: PersistentMemory + ?Sized>(
        pool: &P,
        offset: u64,
    ) -> CoreResult<SegmentHeader> {
        let size = pool.size();
        let header_end = offset.checked_add(SEGMENT_HEADER_SIZE as u64);
        if offset == 0 || header_end.map_or(true, |end| end > size) {
            return Err(CoreError::corruption(format!(
                "segment offset {offset:#x} outside pool of {size} bytes"
            )));
        }
        let header = SegmentHeader::read(pool, offset)?;
        let data_end = data_offset(offset).checked_add(header.capacity);
        if data_end.map_or(true, |end| end > size) {
            return Err(CoreError::corruption(format!(
                "segment at {offset:#x} claims capacity {} past pool end",
                header.capacity
            )));
        }
        Ok(header)
    }

    /// Pool offset of the base segment.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Continuation offsets in link order.
    #[must_use]
    pub fn continuations(&self) -> &[u64] {
        &self.next
    }

    /// Offset of the first continuation, or zero.
    #[must_use]
    pub fn first_next(&self) -> u64 {
        self.next.first().copied().unwrap_or(0)
    }

    /// Logical-offset map of the chain.
    #[must_use]
    pub const fn map(&self) -> &SegmentMap {
        &self.map
    }

    /// Data capacity of the base segment.
    #[must_use]
    pub fn base_capacity(&self) -> usize {
        self.map.segments().first().map_or(0, |&(_, cap)| cap)
    }

    /// Total data capacity of every segment.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Reads the base segment's generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read.
    pub fn generation<P: PersistentMemory + ?Sized>(&self, pool: &P) -> CoreResult<Generation> {
        Ok(SegmentHeader::read(pool, self.head)?.generation)
    }

    /// Grows the chain until its capacity is at least `desired`.
    ///
    /// Each new segment is stamped with the base generation and linked from
    /// the current tail with a persisted write. Returns the new capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ExtendFailed`] if the allocator fails. Segments
    /// linked before the failure stay part of the chain.
    pub fn reserve<P, A>(&mut self, pool: &mut P, desired: usize, alloc: &mut A) -> CoreResult<usize>
    where
        P: PersistentMemory + ?Sized,
        A: SegmentAllocator<P> + ?Sized,
    {
        if self.capacity() >= desired {
            return Ok(self.capacity());
        }
        let generation = self.generation(pool)?;

        while self.capacity() < desired {
            let tail = self.next.last().copied().unwrap_or(self.head);
            let segment = alloc.extend(pool, generation)?;
            let header = Self::checked_header(pool, segment)?;
            if header.capacity == 0 {
                return Err(CoreError::extend_failed(format!(
                    "allocator returned empty segment at {segment:#x}"
                )));
            }
            pool.write_u64(tail + NEXT_FIELD as u64, segment, MemFlags::NONE)?;

            self.next.push(segment);
            let mut segments = self.map.segments().to_vec();
            segments.push((segment, header.capacity as usize));
            self.map = SegmentMap::new(segments);

            tracing::debug!(
                head = self.head,
                segment,
                capacity = self.capacity(),
                desired,
                "log extended"
            );
        }
        Ok(self.capacity())
    }

    /// Drops every continuation after the first `keep` from the in-memory
    /// description.
    pub(crate) fn truncate(&mut self, keep: usize) {
        self.next.truncate(keep);
        let segments = self.map.segments()[..=keep.min(self.map.segments().len() - 1)].to_vec();
        self.map = SegmentMap::new(segments);
    }
}
