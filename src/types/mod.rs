//! Core types for the server engine.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (BackendId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the server, backends and logs

mod config;
mod errors;
mod ids;

pub use config::{BackendConfig, Config, LogConfig, Overflow, ServerConfig, MAX_BACKENDS};
pub use errors::{Error, Result};
pub use ids::BackendId;
