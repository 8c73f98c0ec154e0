//! # PMObj Core
//!
//! Crash-consistent unified undo/redo log for persistent memory pools.
//!
//! This crate provides:
//! - Segment chains that grow on demand through a caller-supplied allocator
//! - Value and buffer log entries with generation-tied checksums
//! - Atomic publication of transient redo logs
//! - In-place undo logging with per-entry atomicity
//! - Processing, recovery and reclamation of logs
//!
//! ## Example
//!
//! ```rust
//! use pmobj_core::{LogConfig, Operation, UnifiedLog};
//! use pmobj_storage::{InMemoryPool, PersistentMemory};
//!
//! let mut pool = InMemoryPool::new(8192);
//! let log = UnifiedLog::construct(&mut pool, 64, LogConfig::default()).unwrap();
//!
//! let mut redo = log.transient(&pool).unwrap();
//! redo.append_value(4096, 0xC0FFEE, Operation::Set).unwrap();
//! log.store(&mut pool, &redo).unwrap();
//!
//! assert!(log.recovery_needed(&pool).unwrap());
//! log.process(&mut pool, None).unwrap();
//! assert_eq!(pool.read_u64(4096).unwrap(), 0xC0FFEE);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod allocator;
pub mod checksum;
mod config;
mod error;
mod types;
pub mod ulog;

pub use allocator::{OffsetValidator, SegmentAllocator};
pub use config::LogConfig;
pub use error::{CoreError, CoreResult};
pub use types::{Generation, LogKind};
pub use ulog::{
    Entry, LogState, Operation, RecoveryReport, ReclaimFlags, ReclaimReport, SegmentChain,
    TransientLog, UnifiedLog,
};
