//! Core type definitions for PMObj.

use std::fmt;

/// Generation counter of a log segment.
///
/// Incremented whenever the committed content of a segment is discarded.
/// Buffer entry checksums fold in the generation, so entries written under
/// an older generation never validate again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl Generation {
    /// Creates a generation from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Returns the native-endian encoding folded into checksums.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

/// Kind of log held by a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// Built transiently and published with the store protocol; recovery
    /// verifies the base checksum.
    Redo,
    /// Written entry by entry straight into the pool; only per-entry
    /// checksums guard validity.
    Undo,
}

impl LogKind {
    /// Returns true if recovery must verify the base segment checksum.
    #[must_use]
    pub const fn verifies_checksum(self) -> bool {
        matches!(self, Self::Redo)
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redo => f.write_str("redo"),
            Self::Undo => f.write_str("undo"),
        }
    }
}
