//! Error types for the API client.

/// Result type for API client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur talking to the remote API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Non-success HTTP status from the remote API.
    #[error("API HTTP error ({status}): {body}")]
    Http { status: u16, body: String },

    /// Transport-level request failure.
    #[error("API request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Response body that does not match the expected shape.
    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    /// A base URL the client cannot be built from.
    #[error("invalid API base URL: {0}")]
    InvalidUrl(String),

    /// An API token that cannot be carried in a header.
    #[error("invalid API token: {0}")]
    InvalidToken(String),
}

impl Error {
    /// Whether a retry can plausibly succeed.
    ///
    /// Server-side trouble (5xx) and throttling (429) are transient, as are
    /// connect/timeout failures. Client errors (4xx) and malformed bodies
    /// are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http { status, .. } => *status >= 500 || *status == 429,
            Error::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::InvalidResponse(_) => false,
            Error::InvalidUrl(_) => false,
            Error::InvalidToken(_) => false,
        }
    }
}
