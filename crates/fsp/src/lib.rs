#![forbid(unsafe_code)]
//! fsprobe public API facade.
//!
//! Re-exports the observer, layout registry, classifiers and fault engine
//! from `fsp-core`.

pub use fsp_core::*;
