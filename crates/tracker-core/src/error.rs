//! Tracker core error types

use std::fmt;

use thiserror::Error;
use tracker_feed::FeedError;

/// Errors surfaced to facade callers
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Backend unreachable: {0}")]
    Transport(String),

    #[error("Backend did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Entity not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    /// Raw backend message, shown to the user as-is
    #[error("{message}")]
    Rejected { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn not_found(entity_type: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.into(),
        }
    }
}

impl From<FeedError> for TrackerError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Transport(msg) | FeedError::Serialization(msg) => Self::Transport(msg),
            FeedError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            FeedError::Rejected { message, .. } => Self::Rejected { message },
            FeedError::NotFound { entity_type, key } => Self::NotFound {
                entity_type,
                id: key,
            },
            FeedError::Closed => Self::Transport("feed closed".to_string()),
            FeedError::Config(msg) => Self::Config(msg),
        }
    }
}

impl From<ValidationErrors> for TrackerError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

/// One rejected input field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Every problem found in a write request, reported together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    /// `Ok(value)` when nothing was recorded
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one field was rejected.
    pub fn into_result<T>(self, value: T) -> std::result::Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_feed_errors_keep_backend_message() {
        let err: TrackerError = FeedError::Rejected {
            status: Some(409),
            message: "IMEI already registered".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "IMEI already registered");
    }

    #[test]
    fn validation_errors_join_fields() {
        let mut errors = ValidationErrors::default();
        errors.push("imei", "is required");
        errors.push("name", "is required");
        assert_eq!(errors.to_string(), "imei: is required; name: is required");
        assert!(errors.into_result(()).is_err());
    }

    #[test]
    fn empty_validation_passes_value_through() {
        let checked = ValidationErrors::default().into_result("356938035643809");
        assert_eq!(checked.unwrap(), "356938035643809");
    }
}
