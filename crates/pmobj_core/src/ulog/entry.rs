//! Log entry encoding.
//!
//! Every entry begins with a 64-bit word: the top three bits carry the
//! operation tag, the low 61 bits the destination offset in the pool.
//!
//! ```text
//! value entry (16 bytes):   | offset|tag | value |
//! buffer entry (n * 64):    | offset|tag | size | checksum | payload ... pad |
//! ```
//!
//! A zero word terminates the log. A value entry is valid when its word is
//! non-zero. A buffer entry is valid when its checksum over the whole entry
//! (checksum field as zero) continued over the generation matches.

use crate::checksum::{self, Fletcher64};
use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use crate::ulog::layout::{align_down, align_up, read_word, CACHELINE_SIZE, ENTRY_ALIGN};
use crate::ulog::region::{LogSink, LogSource};
use pmobj_storage::MemFlags;

/// Bit position of the operation tag.
pub const OPERATION_SHIFT: u32 = 61;

/// Mask selecting the destination offset.
pub const OFFSET_MASK: u64 = (1 << OPERATION_SHIFT) - 1;

/// Size of a value entry.
pub const VALUE_ENTRY_SIZE: usize = 16;

/// Size of a buffer entry header (offset, size, checksum).
pub const BUFFER_HEADER_SIZE: usize = 24;

/// Byte offset of the checksum within a buffer entry.
const BUFFER_CHECKSUM_FIELD: usize = 16;

/// Payload bytes that fit in a buffer entry's first cacheline.
const FIRST_LINE_PAYLOAD: usize = CACHELINE_SIZE - BUFFER_HEADER_SIZE;

/// Operation applied by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `*dest = value`
    Set,
    /// `*dest &= value`
    And,
    /// `*dest |= value`
    Or,
    /// `memset(dest, payload[0], size)`
    BufSet,
    /// `memcpy(dest, payload, size)`
    BufCpy,
}

impl Operation {
    /// Returns the 3-bit tag.
    #[must_use]
    pub const fn tag(self) -> u64 {
        match self {
            Self::Set => 0b000,
            Self::And => 0b001,
            Self::Or => 0b010,
            Self::BufSet => 0b101,
            Self::BufCpy => 0b110,
        }
    }

    /// Parses a 3-bit tag.
    #[must_use]
    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0b000 => Some(Self::Set),
            0b001 => Some(Self::And),
            0b010 => Some(Self::Or),
            0b101 => Some(Self::BufSet),
            0b110 => Some(Self::BufCpy),
            _ => None,
        }
    }

    /// Returns true for operations carrying a payload.
    #[must_use]
    pub const fn is_buffer(self) -> bool {
        matches!(self, Self::BufSet | Self::BufCpy)
    }

    /// Applies a value operation to `current`.
    #[must_use]
    pub const fn combine(self, current: u64, value: u64) -> u64 {
        match self {
            Self::And => current & value,
            Self::Or => current | value,
            _ => value,
        }
    }
}

/// Packs a destination and operation into an entry's first word.
///
/// # Errors
///
/// Returns [`CoreError::InvalidArgument`] if the destination is zero or
/// does not fit in 61 bits.
pub fn encode_word(dest: u64, op: Operation) -> CoreResult<u64> {
    if dest == 0 || dest > OFFSET_MASK {
        return Err(CoreError::invalid_argument(format!(
            "destination offset {dest:#x} cannot be encoded"
        )));
    }
    Ok(dest | (op.tag() << OPERATION_SHIFT))
}

/// Unpacks an entry's first word.
///
/// Returns `Ok(None)` for the zero terminator.
///
/// # Errors
///
/// Returns [`CoreError::Corruption`] if the tag is not a known operation.
pub fn decode_word(word: u64) -> CoreResult<Option<(u64, Operation)>> {
    if word == 0 {
        return Ok(None);
    }
    let tag = word >> OPERATION_SHIFT;
    let op = Operation::from_tag(tag)
        .ok_or_else(|| CoreError::corruption(format!("unknown operation tag {tag:#05b}")))?;
    Ok(Some((word & OFFSET_MASK, op)))
}

/// Returns the log footprint of a buffer entry with a `size`-byte payload.
#[must_use]
pub const fn buffer_entry_size(size: usize) -> usize {
    align_up(BUFFER_HEADER_SIZE + size, CACHELINE_SIZE)
}

/// A decoded, valid log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A 64-bit set, and, or or.
    Value {
        /// Destination pool offset.
        dest: u64,
        /// Set, And or Or.
        op: Operation,
        /// Operand.
        value: u64,
    },
    /// A fill or copy of `payload.len()` bytes.
    Buffer {
        /// Destination pool offset.
        dest: u64,
        /// BufSet or BufCpy.
        op: Operation,
        /// Payload carried in the log.
        payload: Vec<u8>,
    },
}

impl Entry {
    /// Destination pool offset.
    #[must_use]
    pub const fn dest(&self) -> u64 {
        match self {
            Self::Value { dest, .. } | Self::Buffer { dest, .. } => *dest,
        }
    }

    /// Operation.
    #[must_use]
    pub const fn op(&self) -> Operation {
        match self {
            Self::Value { op, .. } | Self::Buffer { op, .. } => *op,
        }
    }

    /// Bytes of pool memory the entry modifies.
    #[must_use]
    pub fn dest_len(&self) -> usize {
        match self {
            Self::Value { .. } => 8,
            Self::Buffer { payload, .. } => payload.len(),
        }
    }

    /// Bytes the entry occupies in the log.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Value { .. } => VALUE_ENTRY_SIZE,
            Self::Buffer { payload, .. } => buffer_entry_size(payload.len()),
        }
    }
}

/// Reads the entry at `at`.
///
/// Returns `Ok(None)` at the terminator, at the end of the capacity, or at
/// an entry that fails validation (torn or stale).
///
/// # Errors
///
/// Returns [`CoreError::Corruption`] on an unknown operation tag, or a
/// storage error if the pool cannot be read.
pub fn read_entry<S: LogSource + ?Sized>(source: &S, at: usize) -> CoreResult<Option<Entry>> {
    let capacity = source.capacity();
    if at.checked_add(8).map_or(true, |end| end > capacity) {
        return Ok(None);
    }
    let Some((dest, op)) = decode_word(source.read_word_at(at)?)? else {
        return Ok(None);
    };

    if !op.is_buffer() {
        if at + VALUE_ENTRY_SIZE > capacity {
            return Ok(None);
        }
        let value = source.read_word_at(at + 8)?;
        return Ok(Some(Entry::Value { dest, op, value }));
    }

    if at + BUFFER_HEADER_SIZE > capacity {
        return Ok(None);
    }
    let size = source.read_word_at(at + 8)?;
    let Some(entry_size) = usize::try_from(size)
        .ok()
        .filter(|&size| size <= capacity)
        .map(buffer_entry_size)
        .filter(|&entry_size| at + entry_size <= capacity)
    else {
        return Ok(None);
    };

    let mut raw = vec![0u8; entry_size];
    source.read_at(at, &mut raw)?;
    let stored = read_word(&raw, BUFFER_CHECKSUM_FIELD);
    let computed = checksum::compute_seq(
        checksum::compute(&raw, Some(BUFFER_CHECKSUM_FIELD)),
        &source.generation().to_bytes(),
    );
    if stored != computed {
        return Ok(None);
    }

    let size = size as usize;
    raw.truncate(BUFFER_HEADER_SIZE + size);
    raw.drain(..BUFFER_HEADER_SIZE);
    Ok(Some(Entry::Buffer {
        dest,
        op,
        payload: raw,
    }))
}

fn ensure_aligned(at: usize, align: usize, op: Operation) -> CoreResult<()> {
    if at % align != 0 {
        return Err(CoreError::invalid_argument(format!(
            "{op:?} entry at log offset {at} is not {align}-byte aligned"
        )));
    }
    Ok(())
}

fn ensure_room<S: LogSource + ?Sized>(sink: &S, at: usize, needed: usize) -> CoreResult<()> {
    let available = sink.capacity().saturating_sub(at);
    if needed > available {
        return Err(CoreError::LogFull { needed, available });
    }
    Ok(())
}

/// Writes a value entry at `at`, followed by a zero terminator when it
/// fits. Returns the entry size.
///
/// # Errors
///
/// Returns [`CoreError::LogFull`] if the entry does not fit, or
/// [`CoreError::InvalidArgument`] for an unencodable destination, a
/// buffer operation or an `at` that is not 16-byte aligned.
pub fn write_value<S: LogSink + ?Sized>(
    sink: &mut S,
    at: usize,
    dest: u64,
    value: u64,
    op: Operation,
    flags: MemFlags,
) -> CoreResult<usize> {
    if op.is_buffer() {
        return Err(CoreError::invalid_argument(format!(
            "{op:?} is not a value operation"
        )));
    }
    let word = encode_word(dest, op)?;
    ensure_aligned(at, ENTRY_ALIGN, op)?;
    ensure_room(sink, at, VALUE_ENTRY_SIZE)?;

    let mut buf = [0u8; VALUE_ENTRY_SIZE + 8];
    buf[..8].copy_from_slice(&word.to_ne_bytes());
    buf[8..16].copy_from_slice(&value.to_ne_bytes());
    let len = if at + buf.len() <= sink.capacity() {
        buf.len()
    } else {
        VALUE_ENTRY_SIZE
    };
    sink.write_at(at, &buf[..len], flags)?;
    Ok(VALUE_ENTRY_SIZE)
}

/// Writes a buffer entry at `at` so that it becomes valid atomically.
///
/// The first cacheline (header plus the start of the payload) is assembled
/// in scratch space and written last; every other byte is written and
/// flushed before it. The checksum folds in the sink's generation. Returns
/// the entry size.
///
/// The entry must start on a cacheline boundary of the data stream, so a
/// buffer entry may follow another buffer entry or a multiple of four
/// value entries.
///
/// # Errors
///
/// Returns [`CoreError::LogFull`] if the entry does not fit, or
/// [`CoreError::InvalidArgument`] for an unencodable destination, a value
/// operation or a misaligned `at`.
pub fn write_buffer<S: LogSink + ?Sized>(
    sink: &mut S,
    at: usize,
    dest: u64,
    payload: &[u8],
    op: Operation,
) -> CoreResult<usize> {
    if !op.is_buffer() {
        return Err(CoreError::invalid_argument(format!(
            "{op:?} is not a buffer operation"
        )));
    }
    let word = encode_word(dest, op)?;
    ensure_aligned(at, CACHELINE_SIZE, op)?;
    let entry_size = buffer_entry_size(payload.len());
    ensure_room(sink, at, entry_size)?;

    let deferred = MemFlags::NON_TEMPORAL | MemFlags::NO_DRAIN | MemFlags::RELAXED;

    let head_len = payload.len().min(FIRST_LINE_PAYLOAD);
    let mut first = [0u8; CACHELINE_SIZE];
    first[..8].copy_from_slice(&word.to_ne_bytes());
    first[8..16].copy_from_slice(&(payload.len() as u64).to_ne_bytes());
    first[BUFFER_HEADER_SIZE..BUFFER_HEADER_SIZE + head_len].copy_from_slice(&payload[..head_len]);

    let rest = &payload[head_len..];
    let middle = &rest[..align_down(rest.len(), CACHELINE_SIZE)];
    let tail = &rest[middle.len()..];

    let mut sum = Fletcher64::new();
    sum.update(&first);

    if !middle.is_empty() {
        sink.write_at(at + CACHELINE_SIZE, middle, deferred)?;
        sum.update(middle);
    }

    if !tail.is_empty() {
        let mut last = [0u8; CACHELINE_SIZE];
        last[..tail.len()].copy_from_slice(tail);
        sum.update(&last);
        sink.write_at(at + CACHELINE_SIZE + middle.len(), &last, deferred)?;
    }

    if at + entry_size + 8 <= sink.capacity() {
        sink.write_at(at + entry_size, &[0u8; 8], deferred)?;
    }

    let checksum = checksum::compute_seq(sum.finish(), &sink.generation().to_bytes());
    first[BUFFER_CHECKSUM_FIELD..BUFFER_CHECKSUM_FIELD + 8].copy_from_slice(&checksum.to_ne_bytes());
    sink.write_at(at, &first, MemFlags::NON_TEMPORAL)?;
    Ok(entry_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::transient::TransientLog;

    #[test]
    fn operation_tags() {
        assert_eq!(Operation::Set.tag(), 0b000);
        assert_eq!(Operation::And.tag(), 0b001);
        assert_eq!(Operation::Or.tag(), 0b010);
        assert_eq!(Operation::BufSet.tag(), 0b101);
        assert_eq!(Operation::BufCpy.tag(), 0b110);
        for tag in [0b011, 0b100, 0b111] {
            assert_eq!(Operation::from_tag(tag), None);
        }
    }

    #[test]
    fn word_roundtrip_keeps_offset_and_tag() {
        let word = encode_word(0x1000, Operation::Or).unwrap();
        assert_eq!(word >> OPERATION_SHIFT, 0b010);
        assert_eq!(decode_word(word).unwrap(), Some((0x1000, Operation::Or)));
    }

    #[test]
    fn word_rejects_bad_destination() {
        assert!(encode_word(0, Operation::Set).is_err());
        assert!(encode_word(1 << 61, Operation::Set).is_err());
    }

    #[test]
    fn decode_zero_is_terminator() {
        assert_eq!(decode_word(0).unwrap(), None);
    }

    #[test]
    fn decode_unknown_tag_is_corruption() {
        let word = (0b111 << OPERATION_SHIFT) | 64;
        assert!(decode_word(word).unwrap_err().is_fatal());
    }

    #[test]
    fn buffer_entry_sizes() {
        assert_eq!(buffer_entry_size(0), 64);
        assert_eq!(buffer_entry_size(40), 64);
        assert_eq!(buffer_entry_size(41), 128);
        assert_eq!(buffer_entry_size(104), 128);
        assert_eq!(buffer_entry_size(105), 192);
    }

    #[test]
    fn value_entry_written_and_read() {
        let mut log = TransientLog::new(256, Generation(0));
        let size = write_value(&mut log, 0, 512, 0xFF, Operation::And, MemFlags::NONE).unwrap();
        assert_eq!(size, VALUE_ENTRY_SIZE);
        assert_eq!(
            read_entry(&log, 0).unwrap(),
            Some(Entry::Value {
                dest: 512,
                op: Operation::And,
                value: 0xFF
            })
        );
        assert_eq!(read_entry(&log, 16).unwrap(), None);
    }

    #[test]
    fn buffer_entry_written_and_read() {
        for len in [0usize, 1, 40, 41, 100, 104, 105, 300] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut log = TransientLog::new(1024, Generation(3));
            let size = write_buffer(&mut log, 0, 2048, &payload, Operation::BufCpy).unwrap();
            assert_eq!(size, buffer_entry_size(len));
            let entry = read_entry(&log, 0).unwrap().unwrap();
            assert_eq!(entry.dest(), 2048);
            assert_eq!(entry.op(), Operation::BufCpy);
            assert_eq!(entry.size(), size);
            assert_eq!(
                entry,
                Entry::Buffer {
                    dest: 2048,
                    op: Operation::BufCpy,
                    payload
                }
            );
        }
    }

    #[test]
    fn buffer_entry_invalid_under_other_generation() {
        let mut log = TransientLog::new(512, Generation(3));
        write_buffer(&mut log, 0, 2048, &[7u8; 64], Operation::BufCpy).unwrap();
        let mut stale = TransientLog::from_bytes(log.as_bytes().to_vec(), Generation(4));
        assert_eq!(read_entry(&stale, 0).unwrap(), None);
        stale = TransientLog::from_bytes(log.as_bytes().to_vec(), Generation(3));
        assert!(read_entry(&stale, 0).unwrap().is_some());
    }

    #[test]
    fn buffer_entry_torn_payload_is_invalid() {
        let mut log = TransientLog::new(512, Generation(0));
        write_buffer(&mut log, 0, 2048, &[7u8; 200], Operation::BufCpy).unwrap();
        let mut bytes = log.as_bytes().to_vec();
        bytes[150] ^= 0x01;
        let torn = TransientLog::from_bytes(bytes, Generation(0));
        assert_eq!(read_entry(&torn, 0).unwrap(), None);
    }

    #[test]
    fn buffer_entry_flipped_checksum_is_invalid() {
        let mut log = TransientLog::new(256, Generation(5));
        write_buffer(&mut log, 0, 2048, &[3u8; 90], Operation::BufCpy).unwrap();
        for bit in [0, 13, 63] {
            let mut bytes = log.as_bytes().to_vec();
            bytes[BUFFER_CHECKSUM_FIELD + bit / 8] ^= 1 << (bit % 8);
            let flipped = TransientLog::from_bytes(bytes, Generation(5));
            assert_eq!(read_entry(&flipped, 0).unwrap(), None, "bit {bit}");
        }
    }

    #[test]
    fn misaligned_entries_rejected() {
        let mut log = TransientLog::new(512, Generation(0));
        let err = write_buffer(&mut log, 16, 2048, &[1u8; 8], Operation::BufCpy).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        let err = write_value(&mut log, 8, 2048, 1, Operation::Set, MemFlags::NONE).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert!(log.as_bytes().iter().all(|&b| b == 0));

        assert_eq!(write_buffer(&mut log, 64, 2048, &[1u8; 8], Operation::BufCpy).unwrap(), 64);
        assert_eq!(write_value(&mut log, 128, 2048, 1, Operation::Set, MemFlags::NONE).unwrap(), 16);
    }

    #[test]
    fn oversized_size_field_is_invalid() {
        let mut log = TransientLog::new(256, Generation(0));
        write_buffer(&mut log, 0, 2048, &[1u8; 8], Operation::BufSet).unwrap();
        let mut bytes = log.as_bytes().to_vec();
        bytes[8..16].copy_from_slice(&u64::MAX.to_ne_bytes());
        let torn = TransientLog::from_bytes(bytes, Generation(0));
        assert_eq!(read_entry(&torn, 0).unwrap(), None);
    }

    #[test]
    fn full_log_rejects_entry() {
        let mut log = TransientLog::new(64, Generation(0));
        let err = write_buffer(&mut log, 0, 2048, &[0u8; 41], Operation::BufCpy).unwrap_err();
        assert!(matches!(
            err,
            CoreError::LogFull {
                needed: 128,
                available: 64
            }
        ));
        let err = write_value(&mut log, 64, 2048, 1, Operation::Set, MemFlags::NONE).unwrap_err();
        assert!(matches!(err, CoreError::LogFull { .. }));
    }

    #[test]
    fn mismatched_operation_kind_rejected() {
        let mut log = TransientLog::new(256, Generation(0));
        assert!(write_value(&mut log, 0, 64, 1, Operation::BufCpy, MemFlags::NONE).is_err());
        assert!(write_buffer(&mut log, 0, 64, &[1], Operation::Set).is_err());
    }

    #[test]
    fn combine_applies_operation() {
        assert_eq!(Operation::Set.combine(0xF0, 0x0F), 0x0F);
        assert_eq!(Operation::And.combine(0xF0, 0x3C), 0x30);
        assert_eq!(Operation::Or.combine(0xF0, 0x0F), 0xFF);
    }
}
