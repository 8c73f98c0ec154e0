//! Collaborators supplied by the object store.
//!
//! The log does not own an allocator. Continuation segments come from a
//! [`SegmentAllocator`] and destination offsets can be checked with an
//! [`OffsetValidator`] before a log is applied.

use crate::error::CoreResult;
use crate::types::Generation;
use pmobj_storage::PersistentMemory;

/// Source of continuation segments.
///
/// # Contract
///
/// `extend` must return the offset of a segment already constructed with
/// [`crate::ulog::construct`] (capacity set, checksum and link zero, the
/// given generation). `free` releases a segment previously returned by
/// `extend`; the log unlinks it first.
pub trait SegmentAllocator<P: PersistentMemory + ?Sized> {
    /// Allocates and constructs a new segment stamped with `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::ExtendFailed`] if no space is available.
    fn extend(&mut self, pool: &mut P, generation: Generation) -> CoreResult<u64>;

    /// Releases the segment at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be released.
    fn free(&mut self, pool: &mut P, offset: u64) -> CoreResult<()>;
}

/// Predicate deciding whether a destination range is legal to modify.
pub trait OffsetValidator<P: PersistentMemory + ?Sized> {
    /// Returns true if `len` bytes at `offset` may be written by a log.
    fn is_valid(&self, pool: &P, offset: u64, len: usize) -> bool;
}

impl<P, F> OffsetValidator<P> for F
where
    P: PersistentMemory + ?Sized,
    F: Fn(&P, u64, usize) -> bool,
{
    fn is_valid(&self, pool: &P, offset: u64, len: usize) -> bool {
        self(pool, offset, len)
    }
}
