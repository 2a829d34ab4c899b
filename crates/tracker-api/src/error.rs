//! # API Error Types
//!
//! Unified error handling for the GraphQL and REST surfaces. Backend
//! rejections keep their original message so the user sees it verbatim.

use async_graphql::{Error as GraphQLError, ErrorExtensions, Value as GraphQLValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracker_core::{TrackerError, ValidationErrors};

/// API-level errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Entity not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid UUID format: {0}")]
    InvalidUuid(#[from] uuid::Error),

    /// Backend refused or could not be reached; message passed through
    #[error("{0}")]
    Upstream(String),

    #[error("Backend did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get HTTP status code for this error
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidInput(_) | Self::InvalidUuid(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for GraphQL extensions
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidUuid(_) => "INVALID_UUID",
            Self::Upstream(_) => "BACKEND_ERROR",
            Self::Timeout { .. } => "BACKEND_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn field_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation(errors) => Some(
                errors
                    .fields()
                    .iter()
                    .map(|e| json!({ "field": e.field, "message": e.message }))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound { entity_type, id } => Self::NotFound { entity_type, id },
            TrackerError::Validation(errors) => Self::Validation(errors),
            TrackerError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            TrackerError::Rejected { message } => Self::Upstream(message),
            e @ TrackerError::Transport(_) => Self::Upstream(e.to_string()),
            TrackerError::Config(msg) => Self::Internal(msg),
        }
    }
}

impl ErrorExtensions for ApiError {
    fn extend(&self) -> GraphQLError {
        GraphQLError::new(self.to_string()).extend_with(|_, e| {
            e.set("code", self.error_code());
            e.set("status", self.status_code().as_u16());

            match self {
                Self::NotFound { entity_type, id } => {
                    e.set("entity_type", entity_type.as_str());
                    e.set("entity_id", id.as_str());
                }
                Self::Timeout { timeout_ms } => {
                    e.set("timeout_ms", *timeout_ms);
                }
                _ => {}
            }

            if let Some(fields) = self
                .field_details()
                .and_then(|v| GraphQLValue::from_json(v).ok())
            {
                e.set("fields", fields);
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = json!({
            "message": self.to_string(),
            "code": self.error_code(),
        });
        if let Some(fields) = self.field_details() {
            error["fields"] = fields;
        }

        (status, axum::Json(json!({ "error": error }))).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_rejection_keeps_raw_message() {
        let err = ApiError::from(TrackerError::Rejected {
            message: "duplicate key value violates unique constraint \"devices_imei_key\"".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint \"devices_imei_key\""
        );
    }

    #[test]
    fn maps_core_errors_to_status() {
        let mut errors = ValidationErrors::default();
        errors.push("imei", "IMEI is required");
        assert_eq!(
            ApiError::from(TrackerError::Validation(errors)).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(TrackerError::not_found("alert", "x")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(TrackerError::Timeout { timeout_ms: 10 }).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(TrackerError::Transport("reset".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn graphql_extensions_carry_code_and_fields() {
        let mut errors = ValidationErrors::default();
        errors.push("name", "Device name is required");
        let gql = ApiError::Validation(errors).extend();
        let ext = gql.extensions.expect("extensions set");
        assert_eq!(ext.get("code"), Some(&GraphQLValue::from("VALIDATION_FAILED")));
        assert!(ext.get("fields").is_some());
    }
}
