//! Crash recovery for a single log chain.

use tracing::{error, info, warn};

use crate::allocator::OffsetValidator;
use crate::error::CoreResult;
use crate::types::{Generation, LogKind};
use crate::ulog::chain::SegmentChain;
use crate::ulog::iterator::base_byte_count;
use crate::ulog::layout::{data_offset, SegmentHeader};
use crate::ulog::process::process;
use crate::ulog::reclaim::clobber;
use crate::ulog::region::ChainReader;
use pmobj_storage::PersistentMemory;

/// Whether a log holds committed, unapplied content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Nothing to replay.
    Clean,
    /// A complete log awaits processing.
    Pending,
}

/// Outcome of [`recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// State found before recovery.
    pub state: LogState,
    /// Entries replayed.
    pub applied: usize,
    /// Base generation after recovery.
    pub generation: Generation,
}

/// Classifies the log.
///
/// The log is clean when the base segment holds no valid entry, or, for
/// redo logs, when the base checksum does not cover the valid entries
/// (a store that did not complete).
///
/// # Errors
///
/// Returns [`crate::CoreError::Corruption`] on an unknown tag, or a storage
/// error.
pub fn state<P: PersistentMemory + ?Sized>(
    pool: &P,
    chain: &SegmentChain,
    kind: LogKind,
) -> CoreResult<LogState> {
    let header = SegmentHeader::read(pool, chain.head())?;
    let reader = ChainReader::new(pool, chain.map(), header.generation);
    let nbytes = base_byte_count(&reader, chain.base_capacity())?;
    if nbytes == 0 {
        return Ok(LogState::Clean);
    }

    if kind.verifies_checksum() {
        let mut data = vec![0u8; nbytes];
        pool.read(data_offset(chain.head()), &mut data)?;
        if header.compute_checksum(&data) != header.checksum {
            warn!(
                head = chain.head(),
                nbytes,
                "redo log checksum mismatch, treating unfinished store as clean"
            );
            return Ok(LogState::Clean);
        }
    }
    Ok(LogState::Pending)
}

/// Returns true if the log must be replayed.
///
/// # Errors
///
/// See [`state`].
pub fn recovery_needed<P: PersistentMemory + ?Sized>(
    pool: &P,
    chain: &SegmentChain,
    kind: LogKind,
) -> CoreResult<bool> {
    Ok(state(pool, chain, kind)? == LogState::Pending)
}

/// Replays a pending log and clobbers it.
///
/// Running it again, or crashing part way and running it again, gives the
/// same pool contents: replaying is idempotent and the clobber is a single
/// persisting write.
///
/// # Errors
///
/// Returns [`crate::CoreError::Corruption`] if the log cannot be
/// interpreted; the pool must not be used afterwards.
pub fn recover<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    chain: &SegmentChain,
    kind: LogKind,
    validator: Option<&dyn OffsetValidator<P>>,
) -> CoreResult<RecoveryReport> {
    let found = state(&*pool, chain, kind).inspect_err(|e| {
        error!(head = chain.head(), error = %e, "log cannot be classified");
    })?;

    if found == LogState::Clean {
        return Ok(RecoveryReport {
            state: found,
            applied: 0,
            generation: chain.generation(&*pool)?,
        });
    }

    info!(head = chain.head(), %kind, "replaying pending log");
    let applied = process(pool, chain, validator).inspect_err(|e| {
        error!(head = chain.head(), error = %e, "log replay failed");
    })?;
    let generation = clobber(pool, chain, None)?;
    info!(head = chain.head(), applied, %generation, "log recovered");

    Ok(RecoveryReport {
        state: found,
        applied,
        generation,
    })
}
