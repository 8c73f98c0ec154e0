//! Property-based test generators using proptest.
//!
//! Provides strategies for log operations that stay inside a pool's data
//! area, and a reference model that applies them to a plain byte image.

use crate::fixtures::PoolLayout;
use pmobj_core::{CoreResult, Operation, TransientLog};
use proptest::prelude::*;

/// A single change a log can carry, addressed relative to the data area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOperation {
    /// A 64-bit value entry.
    Value {
        /// Word index in the data area.
        word: u64,
        /// Set, And or Or.
        op: Operation,
        /// Operand.
        value: u64,
    },
    /// Fill `len` bytes with `byte`.
    Fill {
        /// Byte offset in the data area.
        offset: u64,
        /// Fill length.
        len: usize,
        /// Fill byte.
        byte: u8,
    },
    /// Copy `payload` into the data area.
    Copy {
        /// Byte offset in the data area.
        offset: u64,
        /// Bytes to copy.
        payload: Vec<u8>,
    },
}

impl LogOperation {
    /// Log bytes the operation occupies.
    pub fn log_size(&self) -> usize {
        match self {
            Self::Value { .. } => pmobj_core::ulog::VALUE_ENTRY_SIZE,
            Self::Fill { len, .. } => pmobj_core::ulog::buffer_entry_size(*len),
            Self::Copy { payload, .. } => pmobj_core::ulog::buffer_entry_size(payload.len()),
        }
    }

    /// Appends the operation to a transient log.
    ///
    /// # Errors
    ///
    /// Returns [`pmobj_core::CoreError::LogFull`] if it does not fit.
    pub fn append_to(&self, layout: &PoolLayout, log: &mut TransientLog) -> CoreResult<()> {
        match self {
            Self::Value { word, op, value } => log.append_value(layout.data_word(*word), *value, *op),
            Self::Fill { offset, len, byte } => {
                log.append_buffer(layout.data_start + offset, &vec![*byte; *len], Operation::BufSet)
            }
            Self::Copy { offset, payload } => {
                log.append_buffer(layout.data_start + offset, payload, Operation::BufCpy)
            }
        }
    }

    /// Applies the operation to a model of the data area.
    pub fn apply_to_model(&self, model: &mut [u8]) {
        match self {
            Self::Value { word, op, value } => {
                let at = *word as usize * 8;
                let mut current = [0u8; 8];
                current.copy_from_slice(&model[at..at + 8]);
                let next = op.combine(u64::from_ne_bytes(current), *value);
                model[at..at + 8].copy_from_slice(&next.to_ne_bytes());
            }
            Self::Fill { offset, len, byte } => {
                let at = *offset as usize;
                model[at..at + len].fill(*byte);
            }
            Self::Copy { offset, payload } => {
                let at = *offset as usize;
                model[at..at + payload.len()].copy_from_slice(payload);
            }
        }
    }
}

/// Strategy for value operations.
pub fn value_operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        2 => Just(Operation::Set),
        1 => Just(Operation::And),
        1 => Just(Operation::Or),
    ]
}

/// Strategy for buffer payloads of up to `max_len` bytes.
pub fn payload_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=max_len)
}

/// Strategy for log operations inside the first `area` bytes of the data
/// area.
pub fn log_operation_strategy(area: usize) -> impl Strategy<Value = LogOperation> {
    let words = (area / 8) as u64;
    prop_oneof![
        4 => (0..words, value_operation_strategy(), any::<u64>())
            .prop_map(|(word, op, value)| LogOperation::Value { word, op, value }),
        1 => (0..area - 256, 1..256usize, any::<u8>()).prop_map(|(offset, len, byte)| {
            LogOperation::Fill { offset: offset as u64, len, byte }
        }),
        2 => (0..area - 256, payload_strategy(255)).prop_map(|(offset, payload)| {
            LogOperation::Copy { offset: offset as u64, payload }
        }),
    ]
}

/// Strategy for a sequence of operations.
///
/// Buffer operations come first so every buffer entry starts on a
/// cacheline boundary of the log.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<LogOperation>> {
    prop::collection::vec(log_operation_strategy(1024), min_ops..max_ops).prop_map(|mut ops| {
        ops.sort_by_key(|op| matches!(op, LogOperation::Value { .. }));
        ops
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
