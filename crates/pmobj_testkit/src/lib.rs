//! # PMObj Testkit
//!
//! Test utilities for PMObj.
//!
//! This crate provides:
//! - Crash simulation with power loss at every persistence operation
//! - Test pools with a log, a segment allocator and a destination validator
//! - Property-based test generators using proptest
//! - Fuzz testing harnesses
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmobj_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_pool() {
//!     with_test_pool(|t| {
//!         let redo = scenarios::redo_setting_words(t, &[1, 2, 3]);
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
