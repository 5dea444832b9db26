//! Error types for garden-core
//!
//! This module defines all error types used by the plugin resolver and the
//! VCS handler. Uses `thiserror` for ergonomic error handling with automatic
//! `Display` and `Error` trait implementations.

use thiserror::Error;

/// The primary error type for garden-core operations.
#[derive(Error, Debug)]
pub enum GardenError {
    /// Configuration errors (duplicate or unknown plugins, malformed URLs, missing bases, etc.)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Plugin structure errors (circular bases or dependencies, module type conflicts, etc.)
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Runtime errors (not in a git repository, failed git commands, authentication failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Module outputs that do not satisfy their module type's outputs schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid include/exclude glob patterns
    #[error("Glob error: {0}")]
    Glob(#[from] globset::Error),
}

impl GardenError {
    /// Returns `true` for errors caused by user or plugin configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, GardenError::Configuration(_))
    }

    /// Returns `true` for structural plugin errors.
    pub fn is_plugin(&self) -> bool {
        matches!(self, GardenError::Plugin(_))
    }
}

/// A specialized `Result` type for garden-core operations.
pub type Result<T> = std::result::Result<T, GardenError>;
