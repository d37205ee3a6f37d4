//! HTTP error mapping for the VCA API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vca_core::ValidationError;
use vca_reconcile::ReconcileError;
use vca_sheets::{SchemaMismatch, SheetError};

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or empty required field (400)
    #[error("{0}")]
    Validation(ValidationError),

    /// Body or query that could not be parsed (400)
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Lookup by id or name failed (404)
    #[error("{0}")]
    NotFound(String),

    /// Master sheet without an expected column (422)
    #[error("{0}")]
    SchemaMismatch(SchemaMismatch),

    /// Store or upstream failure (500); the detail is only logged
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Validation(v) => ApiError::Validation(v),
            ReconcileError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            ReconcileError::SchemaMismatch(m) => ApiError::SchemaMismatch(m),
            ReconcileError::Storage(e) => ApiError::Internal(e.to_string()),
            ReconcileError::Sheet(e) => match e {
                SheetError::Payload(msg) => ApiError::BadRequest(msg),
                SheetError::Json(e) => ApiError::BadRequest(e.to_string()),
                other => ApiError::Internal(other.to_string()),
            },
        }
    }
}

impl From<SheetError> for ApiError {
    fn from(err: SheetError) -> Self {
        ReconcileError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "code": "VALIDATION_ERROR",
                    "message": err.to_string(),
                    "field": err.field,
                }),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "code": "BAD_REQUEST", "message": msg }),
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({ "code": "NOT_FOUND", "message": msg }),
            ),
            ApiError::SchemaMismatch(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "code": "SCHEMA_MISMATCH",
                    "message": err.to_string(),
                    "sheet": err.sheet,
                    "missing": err.missing,
                    "hints": err.hints,
                }),
            ),
            ApiError::Internal(detail) => {
                error!(error = %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "code": "INTERNAL_ERROR", "message": "internal server error" }),
                )
            }
        };

        (status, Json(json!({ "success": false, "error": detail }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
