use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wscli_capability::{KeySet, ATTACH_AUDIENCE};
use wscli_store::SessionRecord;

use crate::auth::AuthError;
use crate::error::ApiError;
use crate::orchestrator::{await_pod_ip, JobSpec, OrchestratorError};
use crate::state::AppState;
use crate::validate;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/.well-known/jwks.json", get(key_set))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub code_url: String,
    #[serde(default)]
    pub code_checksum: Option<String>,
    /// Launch command for the workload. Required; an absent field reads as
    /// empty and fails admission.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub ws_url: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionView {
    fn from(row: SessionRecord) -> Self {
        Self {
            session_id: row.session_id,
            pod_name: row.pod_name,
            pod_ip: row.pod_ip,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// POST /api/sessions - admit a workload, submit its job, wait for the pod,
/// mint the attach capability.
///
/// Ordering is load-bearing: the session row exists before the job is
/// submitted, the pod is recorded before the token is minted, and the
/// token-id row exists before the response leaves. A crash between steps
/// leaves only rows the expiry sweep reclaims.
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let owner_id = authenticate(&state, &headers).await?;

    if let Err(retry_after) = state.limiter.check_and_record(&owner_id, "/api/sessions") {
        counter!("wscli_sessions_created_total", 1, "outcome" => "rate_limited");
        return Err(ApiError::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        });
    }

    if let Err(reason) = validate::validate(&payload, state.allowed_code_domains()) {
        counter!("wscli_sessions_created_total", 1, "outcome" => "rejected");
        debug!(%owner_id, reason, "admission rejected");
        return Err(ApiError::Validation(reason));
    }

    let session_id = Uuid::new_v4().to_string();
    let job_name = format!("wscli-{}", &session_id[..13]);
    let now = Utc::now();
    let expires_at = now + state.session_expiry;

    state
        .store
        .insert_session(SessionRecord {
            session_id: session_id.clone(),
            owner_id: owner_id.clone(),
            job_name: job_name.clone(),
            pod_name: None,
            pod_ip: None,
            created_at: now,
            expires_at,
        })
        .await?;

    let spec = JobSpec {
        job_name: job_name.clone(),
        session_id: session_id.clone(),
        code_url: payload.code_url,
        code_checksum: payload.code_checksum,
        command: payload.command,
        prompt: payload.prompt,
    };
    state.orchestrator.create_job(&spec).await.map_err(|err| {
        counter!("wscli_sessions_created_total", 1, "outcome" => "orchestrator_error");
        ApiError::Orchestrator(err.to_string())
    })?;

    let (pod_name, pod_ip) =
        await_pod_ip(&*state.orchestrator, &job_name, state.pod_discovery_timeout)
            .await
            .map_err(|err| match err {
                OrchestratorError::DiscoveryTimeout => {
                    counter!("wscli_sessions_created_total", 1, "outcome" => "discovery_timeout");
                    warn!(%session_id, %job_name, "pod discovery timed out");
                    ApiError::DiscoveryTimeout {
                        session_id: session_id.clone(),
                    }
                }
                other => {
                    counter!("wscli_sessions_created_total", 1, "outcome" => "orchestrator_error");
                    ApiError::Orchestrator(other.to_string())
                }
            })?;

    state
        .store
        .update_session_pod(&session_id, &pod_ip, &pod_name)
        .await?;

    let minted = state
        .minter
        .mint(&owner_id, &session_id, ATTACH_AUDIENCE, state.session_expiry)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    state
        .store
        .insert_token_id(&minted.token_id, &session_id, minted.expires_at)
        .await?;

    counter!("wscli_sessions_created_total", 1, "outcome" => "created");
    counter!("wscli_tokens_minted_total", 1);
    info!(%session_id, %job_name, %pod_name, %pod_ip, %owner_id, "session ready");

    Ok(Json(CreateSessionResponse {
        ws_url: format!("/ws/{session_id}"),
        session_id,
        token: minted.token,
    }))
}

/// GET /api/sessions/{id} - the caller's own session row.
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionView>, ApiError> {
    if !session_id_shape_ok(&session_id) {
        return Err(ApiError::Validation("session_id_shape"));
    }
    let owner_id = authenticate(&state, &headers).await?;

    let row = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or(ApiError::SessionNotFound)?;
    if row.owner_id != owner_id {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(row.into()))
}

/// GET /.well-known/jwks.json - verification keys for attach tokens,
/// active key first, retiring keys behind it.
async fn key_set(State(state): State<AppState>) -> Json<KeySet> {
    Json(state.minter.key_set())
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    database: &'static str,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.ping().await {
        (
            StatusCode::OK,
            Json(HealthBody {
                status: "ok",
                database: "connected",
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody {
                status: "degraded",
                database: "unreachable",
            }),
        )
    }
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.ping().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    state.auth.authenticate(headers).await.map_err(|err| match err {
        AuthError::Missing => ApiError::AuthMissing,
        AuthError::Invalid(detail) => {
            debug!(%detail, "caller rejected");
            ApiError::AuthInvalid
        }
    })
}

pub fn session_id_shape_ok(id: &str) -> bool {
    id.len() == 36
        && id
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        assert!(session_id_shape_ok("11111111-1111-4111-8111-111111111111"));
        assert!(!session_id_shape_ok("11111111-1111-4111-8111-11111111111")); // 35
        assert!(!session_id_shape_ok("11111111-1111-4111-8111-1111111111112")); // 37
        assert!(!session_id_shape_ok("11111111-1111-4111-8111-11111111111G"));
        assert!(!session_id_shape_ok("../etc/passwd/...................."));
    }
}
