//! Log configuration.

use crate::error::{CoreError, CoreResult};
use crate::types::LogKind;
use crate::ulog::layout::{CACHELINE_SIZE, SEGMENT_HEADER_SIZE};

/// Configuration for constructing or opening a unified log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Capacity of the base segment's data area, in bytes.
    pub base_capacity: usize,

    /// Whether the log is published as a redo log or written as an undo log.
    pub kind: LogKind,

    /// Whether processing runs the offset consistency pass before applying.
    pub consistency_check: bool,

    /// Whether reclaiming data keeps the first continuation segment.
    pub keep_warm_continuation: bool,

    /// Whether recovery also frees continuation segments of a clean log.
    pub normalize_on_clean: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_capacity: 640, // 10 cachelines
            kind: LogKind::Redo,
            consistency_check: cfg!(debug_assertions),
            keep_warm_continuation: true,
            normalize_on_clean: false,
        }
    }
}

impl LogConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base segment capacity.
    #[must_use]
    pub const fn base_capacity(mut self, bytes: usize) -> Self {
        self.base_capacity = bytes;
        self
    }

    /// Sets the log kind.
    #[must_use]
    pub const fn kind(mut self, kind: LogKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets whether processing validates destination offsets first.
    #[must_use]
    pub const fn consistency_check(mut self, value: bool) -> Self {
        self.consistency_check = value;
        self
    }

    /// Sets whether reclaim keeps the first continuation segment.
    #[must_use]
    pub const fn keep_warm_continuation(mut self, value: bool) -> Self {
        self.keep_warm_continuation = value;
        self
    }

    /// Sets whether recovery frees continuations of a clean log.
    #[must_use]
    pub const fn normalize_on_clean(mut self, value: bool) -> Self {
        self.normalize_on_clean = value;
        self
    }

    /// Checks that the configuration describes a usable log.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the base capacity is zero or
    /// not a whole number of cachelines.
    pub fn validate(&self) -> CoreResult<()> {
        if self.base_capacity == 0 {
            return Err(CoreError::invalid_config("base capacity must be non-zero"));
        }
        if self.base_capacity % CACHELINE_SIZE != 0 {
            return Err(CoreError::invalid_config(format!(
                "base capacity {} is not a multiple of {CACHELINE_SIZE}",
                self.base_capacity
            )));
        }
        Ok(())
    }

    /// Returns the pool footprint of the base segment (header plus data).
    #[must_use]
    pub const fn base_footprint(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.base_capacity
    }
}
