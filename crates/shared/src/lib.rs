//! Shared library for the anime/manga id mapper.
//!
//! This crate provides common functionality used by the mapper crates:
//! - Configuration management
//! - Service and media vocabulary
//! - File path utilities
//! - Logging infrastructure

pub mod config;
pub mod logging;
pub mod models;
pub mod paths;

// Re-export commonly used types
pub use config::Config;
pub use logging::LogConfig;
pub use models::*;
pub use paths::DataPaths;
