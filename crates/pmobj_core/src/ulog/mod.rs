//! Unified undo/redo log.
//!
//! A log is a chain of segments in the pool: a fixed base segment, linked
//! to zero or more continuation segments obtained from an allocator. The
//! data areas of the chain form one logical stream of entries.
//!
//! ## Entry types
//!
//! - **Value** entries apply a 64-bit set, and, or or to a destination
//! - **Buffer** entries fill or copy a byte range; they carry a checksum
//!   tied to the segment generation so that torn or stale ones are skipped
//!
//! ## Crash consistency
//!
//! - A redo log is published by [`store()`]: one persisting write of the base
//!   header and data makes it visible, guarded by the base checksum
//! - An undo log is written entry by entry; each buffer entry becomes valid
//!   with the final write of its first cacheline
//! - [`clobber()`] retires a log by advancing its generation
//! - [`recover()`] replays a pending log and clobbers it; it is idempotent

mod chain;
mod entry;
mod iterator;
pub(crate) mod layout;
mod log;
mod process;
mod reclaim;
mod recovery;
mod region;
mod store;
mod transient;

pub use chain::{construct, SegmentChain};
pub use entry::{
    buffer_entry_size, decode_word, encode_word, read_entry, write_buffer, write_value, Entry,
    Operation, BUFFER_HEADER_SIZE, OFFSET_MASK, OPERATION_SHIFT, VALUE_ENTRY_SIZE,
};
pub use iterator::{base_byte_count, for_each_entry, valid_len, EntryIterator};
pub use layout::{
    align_up, data_offset, SegmentHeader, CACHELINE_SIZE, CAPACITY_FIELD, CHECKSUM_FIELD,
    ENTRY_ALIGN, GENERATION_FIELD, NEXT_FIELD, SEGMENT_HEADER_SIZE,
};
pub use log::UnifiedLog;
pub use process::{apply_entry, check, process, ApplyMode};
pub use reclaim::{clobber, clobber_data, ReclaimFlags, ReclaimReport};
pub use recovery::{recover, recovery_needed, state, LogState, RecoveryReport};
pub use region::{ChainReader, ChainWriter, LogSink, LogSource, SegmentMap};
pub use store::store;
pub use transient::TransientLog;
