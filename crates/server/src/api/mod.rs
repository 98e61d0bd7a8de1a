//! Domain-focused API endpoint modules.
//!
//! Shared error envelope and the request-deadline guard live here in mod.rs.

pub mod anomalies;
pub mod feeds;
pub mod health;
pub mod stations;

use std::future::Future;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

// ── Uniform error envelope ────────────────────────────────────

/// `{error: {kind, message, retryable, retry_after?}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                kind: "bad_request",
                message: message.into(),
                retryable: false,
                retry_after: None,
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                kind: "not_found",
                message: message.into(),
                retryable: false,
                retry_after: None,
            },
        }
    }

    /// Store failures are transient from the caller's perspective.
    pub fn store(err: headway_store::StoreError) -> Self {
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorBody {
                kind: "store_error",
                message: err.to_string(),
                retryable: true,
                retry_after: Some(5),
            },
        }
    }

    /// The request outlived its deadline; no partial result is returned.
    pub fn deadline_exceeded() -> Self {
        ApiError {
            status: StatusCode::REQUEST_TIMEOUT,
            body: ErrorBody {
                kind: "deadline_exceeded",
                message: "request deadline exceeded".into(),
                retryable: false,
                retry_after: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Envelope {
            error: ErrorBody,
        }
        (self.status, Json(Envelope { error: self.body })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ── Request deadline ──────────────────────────────────────────

/// Run a handler body under the configured request deadline.
pub async fn with_deadline<T, F>(state: &Arc<AppState>, fut: F) -> ApiResult<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(state.config.server.request_deadline(), fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::deadline_exceeded()),
    }
}
