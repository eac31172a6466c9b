use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, warn};

use wscli_capability::Verifier;
use wscli_store::SessionStore;

use crate::proxy;
use crate::terminal::TERMINAL_PAGE;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub verifier: Verifier,
    pub upstream_connect_timeout: Duration,
    pub terminal_port: u16,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:session_id", get(attach))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// One uniform rejection for every failed upgrade step. The handshake dies
/// with a bare status and no body; the reason lives only in our logs.
fn reject(session_id: &str, reason: &'static str) -> Response {
    counter!("wscli_attach_total", 1, "outcome" => reason);
    warn!(session_id, reason, "attach rejected");
    StatusCode::UNAUTHORIZED.into_response()
}

/// GET /ws/{sessionId}: the terminal page without an upgrade, the attach
/// state machine with one.
///
/// Step order is the contract: verify and session binding come before the
/// token-id consume, so a bad token never burns a live id; the consume comes
/// before the pod lookup, so a raced second attach loses at the consume even
/// when the lookup would have failed anyway.
async fn attach(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !session_id_shape_ok(&session_id) {
        return match ws {
            Some(_) => reject(&session_id, "bad_path"),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    let Some(ws) = ws else {
        return terminal_page();
    };

    // Token extract: subprotocol `bearer,<token>` wins over `?token=`.
    let offered = offered_protocols(&headers);
    let token = match bearer_subprotocol(&offered).or(query.token) {
        Some(token) => token,
        None => return reject(&session_id, "token_missing"),
    };

    let claims = match state.verifier.verify(&token).await {
        Ok(claims) => claims,
        Err(err) => {
            debug!(%session_id, error = %err, "token verification failed");
            return reject(&session_id, "token_invalid");
        }
    };

    if claims.sid != session_id {
        return reject(&session_id, "session_binding_mismatch");
    }

    // Single-use enforcement point.
    match state.store.consume_token_id(&claims.jti).await {
        Ok(true) => {}
        Ok(false) => return reject(&session_id, "token_consumed"),
        Err(err) => {
            warn!(%session_id, error = %err, "token consume failed");
            return reject(&session_id, "store_error");
        }
    }

    let pod_ip = match state.store.get_session(&session_id).await {
        Ok(Some(row)) => match row.pod_ip {
            Some(pod_ip) => pod_ip,
            None => return reject(&session_id, "pod_not_ready"),
        },
        Ok(None) => return reject(&session_id, "session_absent"),
        Err(err) => {
            warn!(%session_id, error = %err, "session lookup failed");
            return reject(&session_id, "store_error");
        }
    };

    // Forward the client's subprotocols upstream, minus the bearer pair.
    let forwarded = forwarded_protocols(&offered, &token);
    let connect_timeout = state.upstream_connect_timeout;
    let terminal_port = state.terminal_port;

    counter!("wscli_attach_total", 1, "outcome" => "accepted");
    ws.protocols(["bearer"]).on_upgrade(move |socket| {
        proxy::run(
            socket,
            session_id,
            pod_ip,
            terminal_port,
            connect_timeout,
            forwarded,
        )
    })
}

fn terminal_page() -> Response {
    ([(header::CACHE_CONTROL, "no-store")], Html(TERMINAL_PAGE)).into_response()
}

pub fn session_id_shape_ok(id: &str) -> bool {
    id.len() == 36
        && id
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f' | b'-'))
}

/// All subprotocols the client offered, in offer order.
fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    let mut offered = Vec::new();
    for value in headers.get_all(header::SEC_WEBSOCKET_PROTOCOL) {
        if let Ok(value) = value.to_str() {
            offered.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(String::from),
            );
        }
    }
    offered
}

/// The token is the protocol entry immediately after a literal `bearer`.
fn bearer_subprotocol(offered: &[String]) -> Option<String> {
    offered
        .iter()
        .position(|protocol| protocol == "bearer")
        .and_then(|index| offered.get(index + 1))
        .cloned()
}

fn forwarded_protocols(offered: &[String], token: &str) -> Vec<String> {
    offered
        .iter()
        .filter(|protocol| protocol.as_str() != "bearer" && protocol.as_str() != token)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn header_map(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_token_extracted_from_subprotocol() {
        let offered = offered_protocols(&header_map("bearer, eyJ0.abc.def"));
        assert_eq!(bearer_subprotocol(&offered).as_deref(), Some("eyJ0.abc.def"));
    }

    #[test]
    fn bearer_without_token_yields_none() {
        let offered = offered_protocols(&header_map("bearer"));
        assert_eq!(bearer_subprotocol(&offered), None);
    }

    #[test]
    fn unrelated_protocols_are_ignored_and_forwarded() {
        let offered = offered_protocols(&header_map("tty, bearer, tok-123"));
        assert_eq!(bearer_subprotocol(&offered).as_deref(), Some("tok-123"));
        assert_eq!(forwarded_protocols(&offered, "tok-123"), vec!["tty"]);
    }

    #[test]
    fn session_id_shape() {
        assert!(session_id_shape_ok("11111111-1111-4111-8111-111111111111"));
        assert!(!session_id_shape_ok("11111111-1111-4111-8111-11111111111"));
        assert!(!session_id_shape_ok("XXXXXXXX-1111-4111-8111-111111111111"));
    }
}
