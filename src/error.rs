//! Error types shared by the store, the transport seam and the HTTP layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::model::ChunkResult;

/// Failures of the embedded store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    #[error("corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record {id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("record {0} not found")]
    Missing(String),
}

// redb splits its errors per operation; fold them into the umbrella error.
macro_rules! from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Database(err.into())
                }
            }
        )*
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Failure of a single recipient delivery
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider rejected message: {0}")]
    Rejected(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the HTTP handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Missing required fields")]
    MissingFields,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Store(StoreError),

    /// The chunk was sent but its result could not be merged into the campaign.
    /// The computed result travels with the error so an operator can reconcile.
    #[error("failed to persist chunk result: {source}")]
    Persistence {
        source: StoreError,
        chunk: Box<ChunkResult>,
    },
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => AppError::Conflict(err.to_string()),
            StoreError::Missing(id) => AppError::NotFound(format!("Newsletter {id} not found")),
            other => AppError::Store(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::MissingFields => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Missing required fields" })),
            )
                .into_response(),
            AppError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": message })),
            )
                .into_response(),
            AppError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "error": message, "code": "not_found" })),
            )
                .into_response(),
            AppError::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(json!({ "success": false, "error": message, "code": "conflict" })),
            )
                .into_response(),
            AppError::MalformedBody(_) | AppError::Store(_) => {
                error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "error": self.to_string() })),
                )
                    .into_response()
            }
            AppError::Persistence { ref source, ref chunk } => {
                error!(
                    error = %source,
                    sent = chunk.sent_count,
                    failed = chunk.failed_count,
                    "chunk sent but result not persisted"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "success": false,
                        "error": self.to_string(),
                        "chunk": chunk,
                    })),
                )
                    .into_response()
            }
        }
    }
}
