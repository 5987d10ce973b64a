//! imgrelay core - shared foundational types.
//!
//! This crate holds the error taxonomy and result alias used across the
//! imgrelay workspace.

pub mod error;

// Re-export commonly used types
pub use error::{RelayError, Result};

/// imgrelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
