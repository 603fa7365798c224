//! Configuration loading and schema.
//!
//! Config file: `cosync.toml` in the working directory (or the path in
//! `COSYNC_CONFIG`). Environment variables override file values.

pub mod loader;
pub mod schema;

pub use loader::discover_and_load;
pub use schema::CosyncConfig;
