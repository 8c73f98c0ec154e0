//! Publishing a transient redo log into its persistent chain.
//!
//! The protocol makes the whole log visible with one persisting write:
//!
//! 1. Everything that lands in continuation segments is written with
//!    deferred flushes, then a single drain makes it durable.
//! 2. The base header (with its link and the checksum over header plus the
//!    base part of the data) and the base data are written together and
//!    persisted last.
//!
//! A crash before step 2 completes leaves the base checksum mismatched, so
//! recovery sees a clean log and nothing is replayed.

use crate::error::{CoreError, CoreResult};
use crate::ulog::chain::SegmentChain;
use crate::ulog::layout::{align_up, SegmentHeader, CACHELINE_SIZE, SEGMENT_HEADER_SIZE};
use crate::ulog::region::LogSource;
use crate::ulog::transient::TransientLog;
use pmobj_storage::{MemFlags, PersistentMemory};

/// Copies `src` into the chain and publishes it atomically.
///
/// `src` must have been built for this chain: its capacity may not exceed
/// the chain's and its generation must equal the base generation.
///
/// # Errors
///
/// Returns [`CoreError::InvalidArgument`] if `src` does not match the
/// chain, or a storage error if a write fails.
pub fn store<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    chain: &SegmentChain,
    src: &TransientLog,
) -> CoreResult<()> {
    let base = SegmentHeader::read(pool, chain.head())?;
    if src.generation() != base.generation {
        return Err(CoreError::invalid_argument(format!(
            "transient log built for {} but chain is at {}",
            src.generation(),
            base.generation
        )));
    }
    let nbytes = src.len();
    if nbytes > chain.capacity() {
        return Err(CoreError::LogFull {
            needed: nbytes,
            available: chain.capacity(),
        });
    }

    let base_capacity = chain.base_capacity();
    // Copy through a zeroed terminator so stale bytes never extend the log,
    // however short the source buffer is.
    let copy_nbytes = align_up(nbytes + 8, CACHELINE_SIZE).min(chain.capacity());
    let mut data = src.as_bytes()[..nbytes].to_vec();
    data.resize(copy_nbytes, 0);
    let base_nbytes = copy_nbytes.min(base_capacity);
    let checksum_nbytes = nbytes.min(base_capacity);

    let mut copied = base_nbytes;
    let mut overflowed = false;
    for &(segment, capacity) in &chain.map().segments()[1..] {
        if copied >= copy_nbytes {
            break;
        }
        let n = (copy_nbytes - copied).min(capacity);
        pool.write(
            segment + SEGMENT_HEADER_SIZE as u64,
            &data[copied..copied + n],
            MemFlags::WRITE_COMBINE | MemFlags::NO_DRAIN | MemFlags::RELAXED,
        )?;
        copied += n;
        overflowed = true;
    }
    if overflowed {
        pool.drain()?;
    }

    let mut header = SegmentHeader {
        capacity: base.capacity,
        checksum: 0,
        next: chain.first_next(),
        generation: base.generation,
    };
    header.checksum = header.compute_checksum(&data[..checksum_nbytes]);

    let mut publish = Vec::with_capacity(SEGMENT_HEADER_SIZE + base_nbytes);
    publish.extend_from_slice(&header.encode());
    publish.extend_from_slice(&data[..base_nbytes]);
    pool.write(chain.head(), &publish, MemFlags::WRITE_COMBINE)?;

    tracing::debug!(
        head = chain.head(),
        nbytes,
        copied = copy_nbytes,
        segments = chain.continuations().len() + 1,
        generation = base.generation.as_u64(),
        "redo log stored"
    );
    Ok(())
}
