use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Admission and request failures, each mapping to one response category.
/// Infrastructure failure details are logged, never echoed to clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("caller identity missing")]
    AuthMissing,
    #[error("caller identity not verifiable")]
    AuthInvalid,
    #[error("caller is not the session owner")]
    Forbidden,
    #[error("validation failed: {0}")]
    Validation(&'static str),
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("session not found")]
    SessionNotFound,
    #[error("orchestrator failure: {0}")]
    Orchestrator(String),
    #[error("pod discovery timed out for session {session_id}")]
    DiscoveryTimeout { session_id: String },
    #[error("store failure: {0}")]
    Store(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4();
        let (status, reason, session_id) = match &self {
            ApiError::AuthMissing => (StatusCode::UNAUTHORIZED, "auth_missing", None),
            ApiError::AuthInvalid => (StatusCode::UNAUTHORIZED, "auth_invalid", None),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "not_owner", None),
            ApiError::Validation(reason) => (StatusCode::BAD_REQUEST, *reason, None),
            ApiError::RateLimited { retry_after_secs } => {
                let body = Json(ErrorBody {
                    reason: "rate_limited",
                    session_id: None,
                });
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response();
            }
            ApiError::SessionNotFound => (StatusCode::NOT_FOUND, "session_not_found", None),
            ApiError::Orchestrator(detail) => {
                error!(%correlation_id, %detail, "orchestrator failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "orchestrator_failure",
                    None,
                )
            }
            ApiError::DiscoveryTimeout { session_id } => {
                error!(%correlation_id, %session_id, "pod discovery timed out");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "pod_discovery_timeout",
                    Some(session_id.clone()),
                )
            }
            ApiError::Store(detail) => {
                error!(%correlation_id, %detail, "store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "store_failure", None)
            }
            ApiError::Internal(detail) => {
                error!(%correlation_id, %detail, "unexpected failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        };

        (status, Json(ErrorBody { reason, session_id })).into_response()
    }
}

impl From<wscli_store::StoreError> for ApiError {
    fn from(err: wscli_store::StoreError) -> Self {
        match err {
            // Fresh UUIDs make duplicates unreachable in practice; a hit
            // means something is badly wrong, not a caller mistake.
            wscli_store::StoreError::Duplicate(key) => {
                ApiError::Internal(format!("duplicate store key {key}"))
            }
            other => ApiError::Store(other.to_string()),
        }
    }
}
