//! # PMObj Storage
//!
//! Persistent memory backends for PMObj.
//!
//! This crate provides the lowest-level memory abstraction used by the
//! unified log. Pools are **opaque byte arenas** addressed by offsets from
//! the pool base; they do not interpret the data they hold.
//!
//! ## Design Principles
//!
//! - Pools expose the persistence primitives: write, fill, flush, drain
//! - Flags select non-temporal or flush-deferred variants of a store
//! - No knowledge of logs, segments or entries
//! - Every access is bounds-checked
//! - Must be `Send + Sync`
//!
//! ## Available Pools
//!
//! - [`InMemoryPool`] - For testing and crash simulation
//! - [`FilePool`] - For pools that survive process restarts
//!
//! ## Example
//!
//! ```rust
//! use pmobj_storage::{InMemoryPool, MemFlags, PersistentMemory};
//!
//! let mut pool = InMemoryPool::new(4096);
//! pool.write(64, b"hello world", MemFlags::NONE).unwrap();
//! let mut buf = [0u8; 11];
//! pool.read(64, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{cacheline_span, check_range, MemFlags, PersistentMemory, CACHELINE_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FilePool;
pub use memory::{InMemoryPool, PoolStats};
