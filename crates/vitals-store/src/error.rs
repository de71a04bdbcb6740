//! Error types for vitals-store.

use std::path::PathBuf;

/// Result type for vitals-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vitals-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored date or timestamp that cannot be interpreted.
    #[error("Invalid stored date: {0}")]
    InvalidDate(String),

    /// Serialization error for a state blob.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
