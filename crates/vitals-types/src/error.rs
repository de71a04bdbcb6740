//! Error types for state transitions.

/// Result type for state operations.
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Errors produced by the typed state machines in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A backfill transition that the state machine does not allow.
    #[error("invalid backfill transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// A backfill range whose end precedes its start.
    #[error("invalid backfill range: {start} > {end}")]
    InvalidRange { start: String, end: String },

    /// A timestamp that cannot be represented or parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
