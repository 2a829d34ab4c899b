//! Change feed and store adapter error types

use thiserror::Error;

/// Adapter errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The backend answered but refused the request. `message` is the raw
    /// backend body so it can be shown to the user verbatim.
    #[error("{message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Entity not found: {entity_type} with key {key}")]
    NotFound { entity_type: String, key: String },

    #[error("Feed closed")]
    Closed,

    #[error("Invalid adapter configuration: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether resubscribing later can fix this
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. } | Self::Closed)
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "rest")]
impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
