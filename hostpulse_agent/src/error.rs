//! Error types for the agent.
//!
//! Tick-level failures (`AcquisitionError`, `StoreError::Write`) are recovered by the
//! session loop; query-level failures (`QueryError`) are rejected before storage.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::MetricColumn;

/// The host metrics capability did not respond.
#[derive(Error, Debug, Clone)]
#[error("metrics acquisition failed: {0}")]
pub struct AcquisitionError(pub String);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open metrics database at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("metrics write failed: {0}")]
    Write(String),

    #[error("metrics query failed: {0}")]
    Read(String),

    #[error("metrics store is closed")]
    Closed,

    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid column parameter: {column}")]
    InvalidColumn { column: String },

    #[error("Invalid time range: since {since_ms} is after until {until_ms}")]
    InvalidRange { since_ms: i64, until_ms: i64 },
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let allowed: Vec<&'static str> = MetricColumn::ALL.iter().map(|c| c.as_str()).collect();
        let body = match &self {
            QueryError::InvalidColumn { .. } => json!({
                "error": "Invalid column parameter",
                "allowedColumns": allowed,
            }),
            QueryError::InvalidRange { since_ms, until_ms } => json!({
                "error": self.to_string(),
                "since": since_ms,
                "until": until_ms,
            }),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Request-path wrapper so handlers can `?` both validation and storage failures.
#[derive(Debug)]
pub enum ApiError {
    Query(QueryError),
    Store { context: &'static str, source: StoreError },
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        ApiError::Query(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Query(e) => e.into_response(),
            ApiError::Store { context, source } => {
                tracing::error!("{context}: {source}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": context })),
                )
                    .into_response()
            }
        }
    }
}
