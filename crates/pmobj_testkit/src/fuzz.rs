//! Fuzz testing harnesses for PMObj logs.
//!
//! This module provides fuzz targets that can be used with cargo-fuzz
//! or other fuzzing frameworks. Every target treats its input as a
//! damaged pool or log image and must return without panicking.

use crate::fixtures::RangeValidator;
use pmobj_core::ulog::{EntryIterator, SegmentHeader, SEGMENT_HEADER_SIZE};
use pmobj_core::{
    Generation, LogConfig, LogKind, OffsetValidator, SegmentChain, TransientLog, UnifiedLog,
};
use pmobj_storage::{InMemoryPool, PersistentMemory};

const FUZZ_HEAD: u64 = 64;

fn generation_from(data: &[u8]) -> Generation {
    let mut bytes = [0u8; 8];
    let n = data.len().min(8);
    bytes[..n].copy_from_slice(&data[..n]);
    Generation(u64::from_ne_bytes(bytes))
}

fn pool_from(data: &[u8]) -> InMemoryPool {
    let mut image = vec![0u8; FUZZ_HEAD as usize];
    image.extend_from_slice(data);
    InMemoryPool::from_image(image)
}

/// Fuzz target for entry decoding.
///
/// The first eight bytes pick the generation, the rest is the log data.
/// Tests that iteration either yields entries that fit the log or stops
/// with a proper error.
pub fn fuzz_entry_decode(data: &[u8]) {
    let generation = generation_from(data);
    let log = TransientLog::from_bytes(data.get(8..).unwrap_or_default().to_vec(), generation);
    let capacity = log.as_bytes().len();

    for item in EntryIterator::new(&log) {
        match item {
            Ok((at, entry)) => assert!(at + entry.size() <= capacity, "entry overruns log"),
            Err(_) => break,
        }
    }
}

/// Fuzz target for chain discovery.
///
/// Tests that arbitrary headers and links are either rebuilt into a chain
/// that fits the pool or rejected.
pub fn fuzz_segment_chain(data: &[u8]) {
    let pool = pool_from(data);
    if let Ok(chain) = SegmentChain::rebuild(&pool, FUZZ_HEAD) {
        let size = pool.size();
        let mut segments = vec![chain.head()];
        segments.extend_from_slice(chain.continuations());
        for segment in segments {
            assert!(segment + SEGMENT_HEADER_SIZE as u64 <= size, "segment outside pool");
        }
    }
}

/// Fuzz target for recovery.
///
/// Opens whatever log the image holds at the fuzz head and recovers it
/// twice. Tests that recovery never panics and that a second pass finds
/// nothing left to replay.
pub fn fuzz_recovery(data: &[u8]) {
    if data.len() < SEGMENT_HEADER_SIZE {
        return;
    }
    let mut pool = pool_from(data);
    let Some(capacity) = base_capacity(&pool) else {
        return;
    };

    for kind in [LogKind::Redo, LogKind::Undo] {
        let config = LogConfig::new()
            .base_capacity(capacity)
            .kind(kind)
            .consistency_check(true);
        let Ok(mut log) = UnifiedLog::open(&pool, FUZZ_HEAD, config) else {
            return;
        };

        let size = pool.size();
        let validator = RangeValidator::new(FUZZ_HEAD, size);
        let validator: &dyn OffsetValidator<InMemoryPool> = &validator;
        if log.recover(&mut pool, Some(validator), None).is_ok() {
            let again = log.recover(&mut pool, Some(validator), None);
            if let Ok(report) = again {
                assert_eq!(report.applied, 0, "recovery replayed twice");
            }
        }
    }
}

fn base_capacity(pool: &InMemoryPool) -> Option<usize> {
    let header = SegmentHeader::read(pool, FUZZ_HEAD).ok()?;
    usize::try_from(header.capacity).ok()
}
