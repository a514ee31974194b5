//! Error types for the store crate
//!
//! This module collects the error types and their context structures used
//! for detailed error messages throughout the crate.

// Re-export error types from submodules
pub use crate::fs::name::{NameContext, NameError};
pub use crate::store::config::ConfigError;
pub use crate::store::metadata::MetadataError;
pub use crate::store::operations::{StoreError, StoreOpContext, StoreResult};
pub use crate::store::path::PathError;
#[cfg(feature = "watch")]
pub use crate::store::watcher::WatchError;
