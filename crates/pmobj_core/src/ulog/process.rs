//! Applying log entries to the pool.

use crate::allocator::OffsetValidator;
use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use crate::ulog::chain::SegmentChain;
use crate::ulog::entry::{read_entry, Entry, Operation};
use crate::ulog::iterator::for_each_entry;
use crate::ulog::region::ChainReader;
use pmobj_storage::{MemFlags, PersistentMemory};

/// How an applied entry is made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Flush each destination; one drain follows the last entry.
    Flush,
    /// Persist each destination before the next entry is applied.
    Persist,
}

impl ApplyMode {
    const fn flags(self) -> MemFlags {
        match self {
            Self::Flush => MemFlags::NO_DRAIN,
            Self::Persist => MemFlags::NONE,
        }
    }
}

/// Applies a single entry to its destination.
///
/// # Errors
///
/// Returns a storage error if the destination is outside the pool.
pub fn apply_entry<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    entry: &Entry,
    mode: ApplyMode,
) -> CoreResult<()> {
    let flags = mode.flags();
    match entry {
        Entry::Value { dest, op, value } => {
            let current = match op {
                Operation::Set => 0,
                _ => pool.read_u64(*dest)?,
            };
            pool.write_u64(*dest, op.combine(current, *value), flags)?;
        }
        Entry::Buffer { dest, op, payload } => match op {
            Operation::BufSet => {
                let byte = payload.first().copied().unwrap_or(0);
                pool.fill(*dest, byte, payload.len(), flags)?;
            }
            _ => pool.write(*dest, payload, flags)?,
        },
    }
    Ok(())
}

/// Verifies every entry's destination with `validator`.
///
/// # Errors
///
/// Returns [`CoreError::Corruption`] naming the first rejected entry.
pub fn check<P, V>(pool: &P, chain: &SegmentChain, validator: &V) -> CoreResult<()>
where
    P: PersistentMemory + ?Sized,
    V: OffsetValidator<P> + ?Sized,
{
    let generation = chain.generation(pool)?;
    let reader = ChainReader::new(pool, chain.map(), generation);
    for_each_entry(&reader, |at, entry| {
        if entry.dest() != 0 && validator.is_valid(pool, entry.dest(), entry.dest_len()) {
            Ok(true)
        } else {
            Err(CoreError::corruption(format!(
                "entry at log offset {at} targets invalid range {:#x}+{}",
                entry.dest(),
                entry.dest_len()
            )))
        }
    })?;
    Ok(())
}

/// Applies every valid entry of the chain in order and drains once.
///
/// When a validator is given every destination is checked before any entry
/// is applied. Returns the number of entries applied.
///
/// # Errors
///
/// Returns [`CoreError::Corruption`] on an unknown tag or a rejected
/// destination, or a storage error if applying fails.
pub fn process<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    chain: &SegmentChain,
    validator: Option<&dyn OffsetValidator<P>>,
) -> CoreResult<usize> {
    if let Some(validator) = validator {
        check(&*pool, chain, validator)?;
    }
    let generation = chain.generation(&*pool)?;
    let applied = apply_all(pool, chain, generation, ApplyMode::Flush)?;
    pool.drain()?;
    Ok(applied)
}

fn apply_all<P: PersistentMemory + ?Sized>(
    pool: &mut P,
    chain: &SegmentChain,
    generation: Generation,
    mode: ApplyMode,
) -> CoreResult<usize> {
    let mut at = 0;
    let mut applied = 0;
    loop {
        let entry = {
            let reader = ChainReader::new(&*pool, chain.map(), generation);
            read_entry(&reader, at)?
        };
        let Some(entry) = entry else {
            break;
        };
        apply_entry(pool, &entry, mode)?;
        at += entry.size();
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::chain::construct;
    use crate::ulog::store::store;
    use crate::ulog::transient::TransientLog;
    use pmobj_storage::InMemoryPool;

    fn stored(entries: impl FnOnce(&mut TransientLog)) -> (InMemoryPool, SegmentChain) {
        let mut pool = InMemoryPool::new(8192);
        construct(&mut pool, 64, 512, Generation(0), true).unwrap();
        let chain = SegmentChain::rebuild(&pool, 64).unwrap();
        let mut log = TransientLog::new(chain.capacity(), Generation(0));
        entries(&mut log);
        store(&mut pool, &chain, &log).unwrap();
        (pool, chain)
    }

    fn in_data_area(_pool: &InMemoryPool, offset: u64, len: usize) -> bool {
        offset >= 4096 && offset + len as u64 <= 8192
    }

    #[test]
    fn apply_value_operations() {
        let mut pool = InMemoryPool::new(8192);
        pool.write_u64(4096, 0xF0F0, MemFlags::NONE).unwrap();
        let and = Entry::Value {
            dest: 4096,
            op: Operation::And,
            value: 0x00FF,
        };
        apply_entry(&mut pool, &and, ApplyMode::Persist).unwrap();
        assert_eq!(pool.read_u64(4096).unwrap(), 0x00F0);

        let or = Entry::Value {
            dest: 4096,
            op: Operation::Or,
            value: 0x0F00,
        };
        apply_entry(&mut pool, &or, ApplyMode::Persist).unwrap();
        assert_eq!(pool.read_u64(4096).unwrap(), 0x0FF0);
    }

    #[test]
    fn apply_buffer_operations() {
        let mut pool = InMemoryPool::new(8192);
        let set = Entry::Buffer {
            dest: 4096,
            op: Operation::BufSet,
            payload: vec![0x7E; 100],
        };
        apply_entry(&mut pool, &set, ApplyMode::Persist).unwrap();
        assert!(pool.durable_image()[4096..4196].iter().all(|&b| b == 0x7E));

        let copy = Entry::Buffer {
            dest: 4200,
            op: Operation::BufCpy,
            payload: b"payload".to_vec(),
        };
        apply_entry(&mut pool, &copy, ApplyMode::Flush).unwrap();
        assert_eq!(pool.pending_flushes(), 1);
        pool.drain().unwrap();
        assert_eq!(&pool.durable_image()[4200..4207], b"payload");
    }

    #[test]
    fn process_applies_in_order() {
        let (mut pool, chain) = stored(|log| {
            log.append_buffer(4104, b"abc", Operation::BufCpy).unwrap();
            log.append_value(4096, 5, Operation::Set).unwrap();
            log.append_value(4096, 0b110, Operation::And).unwrap();
            log.append_value(4096, 0b1000, Operation::Or).unwrap();
        });
        let applied = process(&mut pool, &chain, None).unwrap();
        assert_eq!(applied, 4);
        let durable = InMemoryPool::from_image(pool.durable_image());
        assert_eq!(durable.read_u64(4096).unwrap(), 0b1100);
        let mut abc = [0u8; 3];
        durable.read(4104, &mut abc).unwrap();
        assert_eq!(&abc, b"abc");
    }

    #[test]
    fn check_accepts_valid_destinations() {
        let (pool, chain) = stored(|log| {
            log.append_buffer(5000, &[0u8; 64], Operation::BufSet).unwrap();
            log.append_value(4096, 1, Operation::Set).unwrap();
        });
        check(&pool, &chain, &in_data_area).unwrap();
    }

    #[test]
    fn check_rejects_before_applying() {
        let (mut pool, chain) = stored(|log| {
            log.append_value(4096, 1, Operation::Set).unwrap();
            log.append_value(128, 1, Operation::Set).unwrap();
        });
        let before = pool.volatile_image();
        let validator: &dyn OffsetValidator<InMemoryPool> = &in_data_area;
        let err = process(&mut pool, &chain, Some(validator)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pool.volatile_image(), before);
    }
}
