//! Error types for vitals-cold.

/// Result type for cold storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cold storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Backend I/O failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parquet encode/decode failure.
    #[error("parquet error: {message}")]
    Parquet { message: String },

    /// A path that escapes the storage root or is otherwise unusable.
    #[error("invalid object path: {0}")]
    InvalidPath(String),
}
