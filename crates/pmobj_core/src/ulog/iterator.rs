//! Entry iteration over a log data stream.

use crate::error::CoreResult;
use crate::ulog::entry::{read_entry, Entry};
use crate::ulog::region::LogSource;

/// Iterator over the valid entries of a log, in order.
///
/// Yields `(offset, entry)` pairs and stops at the first terminator, the
/// first invalid entry, or the end of the capacity. An unknown operation
/// tag yields one error and ends iteration.
pub struct EntryIterator<'a, S: LogSource + ?Sized> {
    source: &'a S,
    at: usize,
    finished: bool,
}

impl<'a, S: LogSource + ?Sized> EntryIterator<'a, S> {
    /// Creates an iterator from the start of the log.
    pub fn new(source: &'a S) -> Self {
        Self::starting_at(source, 0)
    }

    /// Creates an iterator starting at logical offset `at`.
    pub fn starting_at(source: &'a S, at: usize) -> Self {
        Self {
            source,
            at,
            finished: false,
        }
    }

    /// Offset just past the last entry yielded so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.at
    }
}

impl<S: LogSource + ?Sized> Iterator for EntryIterator<'_, S> {
    type Item = CoreResult<(usize, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match read_entry(self.source, self.at) {
            Ok(Some(entry)) => {
                let at = self.at;
                self.at += entry.size();
                Some(Ok((at, entry)))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Calls `callback` for every valid entry until it returns `Ok(false)`.
///
/// Returns the offset just past the last entry visited.
///
/// # Errors
///
/// Propagates corruption and any error from the callback.
pub fn for_each_entry<S, F>(source: &S, mut callback: F) -> CoreResult<usize>
where
    S: LogSource + ?Sized,
    F: FnMut(usize, &Entry) -> CoreResult<bool>,
{
    let mut iter = EntryIterator::new(source);
    for item in iter.by_ref() {
        let (at, entry) = item?;
        if !callback(at, &entry)? {
            break;
        }
    }
    Ok(iter.position())
}

/// Returns the offset just past the last valid entry.
///
/// # Errors
///
/// Returns [`crate::CoreError::Corruption`] on an unknown tag.
pub fn valid_len<S: LogSource + ?Sized>(source: &S) -> CoreResult<usize> {
    for_each_entry(source, |_, _| Ok(true))
}

/// Returns how many bytes of valid entries start in the base segment.
///
/// Walks entries from the start until the first invalid one or until the
/// walk leaves the first `base_capacity` bytes, and caps the result at
/// `base_capacity`. This is the length the base checksum covers.
///
/// # Errors
///
/// Returns [`crate::CoreError::Corruption`] on an unknown tag.
pub fn base_byte_count<S: LogSource + ?Sized>(source: &S, base_capacity: usize) -> CoreResult<usize> {
    let end = for_each_entry(source, |at, entry| Ok(at + entry.size() < base_capacity))?;
    Ok(end.min(base_capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Generation;
    use crate::ulog::entry::{Operation, OPERATION_SHIFT};
    use crate::ulog::region::LogSink;
    use crate::ulog::transient::TransientLog;
    use pmobj_storage::MemFlags;

    fn sample_log() -> TransientLog {
        let mut log = TransientLog::new(512, Generation(1));
        log.append_buffer(128, &[5u8; 60], Operation::BufCpy).unwrap();
        log.append_value(64, 1, Operation::Set).unwrap();
        log.append_value(72, 2, Operation::Or).unwrap();
        log
    }

    #[test]
    fn iterator_yields_offsets() {
        let log = sample_log();
        let offsets: Vec<usize> = EntryIterator::new(&log)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(offsets, vec![0, 128, 144]);
    }

    #[test]
    fn iterator_empty_log() {
        let log = TransientLog::new(128, Generation(0));
        assert_eq!(EntryIterator::new(&log).count(), 0);
        assert_eq!(valid_len(&log).unwrap(), 0);
    }

    #[test]
    fn iterator_stops_on_unknown_tag() {
        let mut log = sample_log();
        let bad = (0b011u64 << OPERATION_SHIFT) | 256;
        log.write_at(160, &bad.to_ne_bytes(), MemFlags::NONE).unwrap();

        let mut iter = EntryIterator::new(&log);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().unwrap_err().is_fatal());
        assert!(iter.next().is_none());
    }

    #[test]
    fn for_each_stops_when_callback_declines() {
        let log = sample_log();
        let mut seen = 0;
        let end = for_each_entry(&log, |_, _| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(end, 144);
    }

    #[test]
    fn valid_len_counts_all_entries() {
        assert_eq!(valid_len(&sample_log()).unwrap(), 160);
    }

    #[test]
    fn base_byte_count_caps_at_base() {
        let log = sample_log();
        assert_eq!(base_byte_count(&log, 512).unwrap(), 160);
        assert_eq!(base_byte_count(&log, 64).unwrap(), 64);
        assert_eq!(base_byte_count(&log, 16).unwrap(), 16);
    }

    #[test]
    fn base_byte_count_stops_at_invalid_entry() {
        let mut log = sample_log();
        // Corrupt the buffer entry's payload.
        log.write_at(40, &[0xEE], MemFlags::NONE).unwrap();
        assert_eq!(base_byte_count(&log, 512).unwrap(), 0);
    }
}
