//! Public facade crate for `ragpipe`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `ragpipe-core`.

pub use ragpipe_core::*;
