//! Shared error type, identifier aliases, and time helpers used by every
//! cosync crate.

pub mod error;
pub mod time;
pub mod types;

pub use error::CosyncError;

/// Convenience result alias for fallible cosync operations.
pub type Result<T> = std::result::Result<T, CosyncError>;
