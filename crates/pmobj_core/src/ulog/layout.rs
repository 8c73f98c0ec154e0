//! On-media layout of log segments.
//!
//! Every segment starts with a one-cacheline header:
//!
//! ```text
//! +----------+----------+------+------------+---------------+
//! | capacity | checksum | next | generation | reserved (32) |
//! |    8     |    8     |  8   |     8      |   zeroed      |
//! +----------+----------+------+------------+---------------+
//! ```
//!
//! followed by `capacity` bytes of entry data. All integers are
//! native-endian; a `next` of zero ends the chain.

use crate::checksum;
use crate::error::CoreResult;
use crate::types::Generation;
use pmobj_storage::PersistentMemory;

pub use pmobj_storage::CACHELINE_SIZE;

/// Size of a segment header.
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Byte offset of `capacity` within the header.
pub const CAPACITY_FIELD: usize = 0;

/// Byte offset of `checksum` within the header.
pub const CHECKSUM_FIELD: usize = 8;

/// Byte offset of `next` within the header.
pub const NEXT_FIELD: usize = 16;

/// Byte offset of `generation` within the header.
pub const GENERATION_FIELD: usize = 24;

/// Alignment of value entries within the log data stream. Buffer entries
/// start on a cacheline boundary.
pub const ENTRY_ALIGN: usize = 16;

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Usable data bytes after the header.
    pub capacity: u64,
    /// Checksum over header and committed data (base segment only).
    pub checksum: u64,
    /// Pool offset of the next segment, or zero.
    pub next: u64,
    /// Generation of the segment's content.
    pub generation: Generation,
}

impl SegmentHeader {
    /// Creates an empty header.
    #[must_use]
    pub const fn new(capacity: u64, generation: Generation) -> Self {
        Self {
            capacity,
            checksum: 0,
            next: 0,
            generation,
        }
    }

    /// Encodes the header, reserved bytes zeroed.
    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[CAPACITY_FIELD..CAPACITY_FIELD + 8].copy_from_slice(&self.capacity.to_ne_bytes());
        buf[CHECKSUM_FIELD..CHECKSUM_FIELD + 8].copy_from_slice(&self.checksum.to_ne_bytes());
        buf[NEXT_FIELD..NEXT_FIELD + 8].copy_from_slice(&self.next.to_ne_bytes());
        buf[GENERATION_FIELD..GENERATION_FIELD + 8].copy_from_slice(&self.generation.to_bytes());
        buf
    }

    /// Decodes a header.
    #[must_use]
    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        Self {
            capacity: read_word(buf, CAPACITY_FIELD),
            checksum: read_word(buf, CHECKSUM_FIELD),
            next: read_word(buf, NEXT_FIELD),
            generation: Generation(read_word(buf, GENERATION_FIELD)),
        }
    }

    /// Reads the header of the segment at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header lies outside the pool.
    pub fn read<P: PersistentMemory + ?Sized>(pool: &P, offset: u64) -> CoreResult<Self> {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        pool.read(offset, &mut buf)?;
        Ok(Self::decode(&buf))
    }

    /// Computes the checksum over this header (checksum field as zero)
    /// followed by `data`.
    #[must_use]
    pub fn compute_checksum(&self, data: &[u8]) -> u64 {
        let mut sum = checksum::Fletcher64::new();
        let mut header = *self;
        header.checksum = 0;
        sum.update(&header.encode());
        sum.update(data);
        sum.finish()
    }
}

/// Reads a native-endian word at `at`.
pub(crate) fn read_word(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(word)
}

/// Returns the pool offset of the data area of the segment at `offset`.
#[must_use]
pub const fn data_offset(segment: u64) -> u64 {
    segment + SEGMENT_HEADER_SIZE as u64
}
