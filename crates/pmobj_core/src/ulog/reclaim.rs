//! Discarding committed log content.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use tracing::debug;

use crate::allocator::SegmentAllocator;
use crate::error::CoreResult;
use crate::types::Generation;
use crate::ulog::chain::SegmentChain;
use crate::ulog::layout::{SegmentHeader, GENERATION_FIELD, NEXT_FIELD, SEGMENT_HEADER_SIZE};
use pmobj_storage::{MemFlags, PersistentMemory};

/// Invalidates the log's content in one persisting write.
///
/// The base header keeps its capacity, gets a zero checksum, the given link
/// (or its current one) and the next generation; the first entry word is
/// zeroed. Stale buffer entries anywhere in the chain stop validating
/// because their checksums were computed under the old generation.
///
/// Returns the new generation.
///
/// # Errors
///
/// Returns a storage error if the header cannot be read or written.
pub fn clobber<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    chain: &SegmentChain,
    next: Option<u64>,
) -> CoreResult<Generation> {
    let old = SegmentHeader::read(pool, chain.head())?;
    let header = SegmentHeader {
        capacity: old.capacity,
        checksum: 0,
        next: next.unwrap_or(old.next),
        generation: old.generation.next(),
    };

    let mut buf = [0u8; SEGMENT_HEADER_SIZE + 8];
    buf[..SEGMENT_HEADER_SIZE].copy_from_slice(&header.encode());
    let len = if old.capacity >= 8 {
        buf.len()
    } else {
        SEGMENT_HEADER_SIZE
    };
    pool.write(chain.head(), &buf[..len], MemFlags::WRITE_COMBINE)?;

    debug!(
        head = chain.head(),
        generation = header.generation.as_u64(),
        "log clobbered"
    );
    Ok(header.generation)
}

/// Options for [`clobber_data`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReclaimFlags(u32);

impl ReclaimFlags {
    /// Keep the base generation and the first continuation.
    pub const NONE: Self = Self(0);
    /// Persistently advance the base generation (used on abort).
    pub const INC_FIRST_GEN: Self = Self(1 << 0);
    /// Free every continuation, including the first.
    pub const FREE_AFTER_FIRST: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReclaimFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReclaimFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ReclaimFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimFlags")
            .field("inc_first_gen", &self.contains(Self::INC_FIRST_GEN))
            .field("free_after_first", &self.contains(Self::FREE_AFTER_FIRST))
            .finish()
    }
}

/// Outcome of [`clobber_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Continuation segments returned to the allocator.
    pub freed: usize,
    /// Base generation afterwards.
    pub generation: Generation,
}

/// Drops continuation segments after a log has been consumed.
///
/// By default the first continuation is kept for the next transaction (its
/// generation is advanced without persisting it) and the rest are freed.
/// Segments are unlinked and freed tail first, so no persisted link ever
/// points at a freed segment.
///
/// # Errors
///
/// Returns an error if a write fails or the allocator cannot free a
/// segment. Segments unlinked before the failure stay unlinked.
pub fn clobber_data<P, A>(
    pool: &mut P,
    chain: &mut SegmentChain,
    alloc: &mut A,
    flags: ReclaimFlags,
) -> CoreResult<ReclaimReport>
where
    P: PersistentMemory + ?Sized,
    A: SegmentAllocator<P> + ?Sized,
{
    let head = chain.head();
    let mut generation = chain.generation(pool)?;

    if flags.contains(ReclaimFlags::INC_FIRST_GEN) {
        generation = generation.next();
        pool.write_u64(head + GENERATION_FIELD as u64, generation.as_u64(), MemFlags::NONE)?;
    }

    let free_all = flags.contains(ReclaimFlags::FREE_AFTER_FIRST);
    let second = chain.first_next();
    if second != 0 && !free_all {
        let second_gen = SegmentHeader::read(pool, second)?.generation.next();
        pool.write_u64(
            second + GENERATION_FIELD as u64,
            second_gen.as_u64(),
            MemFlags::NO_FLUSH,
        )?;
    }

    let keep = usize::from(!free_all).min(chain.continuations().len());
    let mut links: Vec<(u64, u64)> = Vec::new();
    let mut previous = if keep == 0 {
        head
    } else {
        chain.continuations()[keep - 1]
    };
    for &segment in &chain.continuations()[keep..] {
        links.push((previous, segment));
        previous = segment;
    }

    let mut freed = 0;
    for &(owner, segment) in links.iter().rev() {
        pool.write_u64(owner + NEXT_FIELD as u64, 0, MemFlags::NONE)?;
        chain.truncate(chain.continuations().len() - 1);
        alloc.free(pool, segment)?;
        freed += 1;
    }

    debug!(head, freed, kept = chain.continuations().len(), "log data reclaimed");
    Ok(ReclaimReport { freed, generation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::ulog::chain::construct;
    use crate::ulog::layout::data_offset;
    use pmobj_storage::InMemoryPool;

    #[derive(Default)]
    struct Recording {
        cursor: u64,
        freed: Vec<u64>,
    }

    impl<P: PersistentMemory + ?Sized> SegmentAllocator<P> for Recording {
        fn extend(&mut self, pool: &mut P, generation: Generation) -> CoreResult<u64> {
            let offset = 1024 + self.cursor;
            construct(pool, offset, 64, generation, true)?;
            self.cursor += 128;
            Ok(offset)
        }

        fn free(&mut self, pool: &mut P, offset: u64) -> CoreResult<()> {
            // The segment must already be unreachable from the base.
            let mut at = 64;
            loop {
                let next = pool.read_u64(at + NEXT_FIELD as u64)?;
                if next == 0 {
                    break;
                }
                if next == offset {
                    return Err(CoreError::corruption("freed a linked segment"));
                }
                at = next;
            }
            self.freed.push(offset);
            Ok(())
        }
    }

    fn chain_with(continuations: usize) -> (InMemoryPool, SegmentChain, Recording) {
        let mut pool = InMemoryPool::new(8192);
        construct(&mut pool, 64, 128, Generation(5), true).unwrap();
        let mut chain = SegmentChain::rebuild(&pool, 64).unwrap();
        let mut alloc = Recording::default();
        chain
            .reserve(&mut pool, 128 + 64 * continuations, &mut alloc)
            .unwrap();
        (pool, chain, alloc)
    }

    #[test]
    fn clobber_bumps_generation_and_zeroes_first_word() {
        let mut pool = InMemoryPool::new(4096);
        construct(&mut pool, 64, 128, Generation(5), true).unwrap();
        pool.write_u64(64 + 8, 0xDEAD, MemFlags::NONE).unwrap();
        pool.write_u64(data_offset(64), 0xBEEF, MemFlags::NONE).unwrap();
        let chain = SegmentChain::rebuild(&pool, 64).unwrap();

        let generation = clobber(&mut pool, &chain, Some(0)).unwrap();
        assert_eq!(generation, Generation(6));

        let durable = InMemoryPool::from_image(pool.durable_image());
        let header = SegmentHeader::read(&durable, 64).unwrap();
        assert_eq!(header, SegmentHeader::new(128, Generation(6)));
        assert_eq!(durable.read_u64(data_offset(64)).unwrap(), 0);
    }

    #[test]
    fn clobber_keeps_link_by_default() {
        let (mut pool, chain, _) = chain_with(1);
        clobber(&mut pool, &chain, None).unwrap();
        assert_eq!(SegmentHeader::read(&pool, 64).unwrap().next, 1024);
    }

    #[test]
    fn clobber_data_keeps_first_continuation() {
        let (mut pool, mut chain, mut alloc) = chain_with(3);
        assert_eq!(chain.continuations(), &[1024, 1152, 1280]);

        let report = clobber_data(&mut pool, &mut chain, &mut alloc, ReclaimFlags::NONE).unwrap();
        assert_eq!(report.freed, 2);
        assert_eq!(report.generation, Generation(5));
        assert_eq!(alloc.freed, vec![1280, 1152]);
        assert_eq!(chain.continuations(), &[1024]);
        assert_eq!(SegmentHeader::read(&pool, 1024).unwrap().next, 0);
        assert_eq!(SegmentHeader::read(&pool, 1024).unwrap().generation, Generation(6));
        // The kept segment's generation bump is not persisted.
        let durable = InMemoryPool::from_image(pool.durable_image());
        assert_eq!(SegmentHeader::read(&durable, 1024).unwrap().generation, Generation(5));
    }

    #[test]
    fn clobber_data_free_after_first() {
        let (mut pool, mut chain, mut alloc) = chain_with(2);
        let flags = ReclaimFlags::FREE_AFTER_FIRST | ReclaimFlags::INC_FIRST_GEN;
        let report = clobber_data(&mut pool, &mut chain, &mut alloc, flags).unwrap();
        assert_eq!(report.freed, 2);
        assert_eq!(report.generation, Generation(6));
        assert!(chain.continuations().is_empty());
        assert_eq!(chain.capacity(), 128);

        let durable = InMemoryPool::from_image(pool.durable_image());
        let header = SegmentHeader::read(&durable, 64).unwrap();
        assert_eq!(header.next, 0);
        assert_eq!(header.generation, Generation(6));
    }

    #[test]
    fn clobber_data_without_continuations() {
        let (mut pool, mut chain, mut alloc) = chain_with(0);
        let report = clobber_data(&mut pool, &mut chain, &mut alloc, ReclaimFlags::NONE).unwrap();
        assert_eq!(report.freed, 0);
        assert!(alloc.freed.is_empty());
    }

    #[test]
    fn reclaim_flags_debug() {
        let flags = ReclaimFlags::INC_FIRST_GEN;
        assert_eq!(
            format!("{flags:?}"),
            "ReclaimFlags { inc_first_gen: true, free_after_first: false }"
        );
    }
}
