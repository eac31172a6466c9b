//! Gateway attach tests: live listeners for the WebSocket paths (a real
//! upstream echo server stands in for the pod terminal), `oneshot` for the
//! plain HTTP paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::Message;
use tower::util::ServiceExt;
use uuid::Uuid;

use wscli_capability::{KeyMaterial, KeySet, Minter, Verifier, ATTACH_AUDIENCE};
use wscli_gateway::attach::{self, AppState};
use wscli_store::{MemStore, SessionRecord, SessionStore};

struct Harness {
    router: Router,
    addr: SocketAddr,
    store: Arc<MemStore>,
    minter: Minter,
}

async fn serve_key_set(minter: &Minter) -> String {
    let set = minter.key_set();
    let app = Router::new().route(
        "/.well-known/jwks.json",
        get(move || {
            let set = set.clone();
            async move { Json::<KeySet>(set) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/.well-known/jwks.json")
}

/// Echo server standing in for a pod terminal on its fixed port.
async fn spawn_echo_upstream() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut tx, mut rx) = ws.split();
                while let Some(Ok(message)) = rx.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

async fn harness(terminal_port: u16) -> Harness {
    let store = Arc::new(MemStore::new());
    let minter = Minter::new(KeyMaterial::generate().unwrap());
    let jwks_url = serve_key_set(&minter).await;
    let state = AppState {
        store: store.clone(),
        verifier: Verifier::new(jwks_url, ATTACH_AUDIENCE.into(), Duration::from_secs(300)),
        upstream_connect_timeout: Duration::from_secs(5),
        terminal_port,
    };
    let router = attach::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        router,
        addr,
        store,
        minter,
    }
}

/// Session row with a discovered pod, plus a minted, recorded token.
/// Returns (token, token_id).
async fn provision(h: &Harness, session_id: &str, pod_ip: Option<&str>) -> (String, String) {
    let now = chrono::Utc::now();
    h.store
        .insert_session(SessionRecord {
            session_id: session_id.to_string(),
            owner_id: "owner-a".into(),
            job_name: format!("wscli-{}", &session_id[..13]),
            pod_name: pod_ip.map(|_| "pod-a".to_string()),
            pod_ip: pod_ip.map(String::from),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(600),
        })
        .await
        .unwrap();

    let minted = h
        .minter
        .mint(
            "owner-a",
            session_id,
            ATTACH_AUDIENCE,
            chrono::Duration::seconds(600),
        )
        .unwrap();
    h.store
        .insert_token_id(&minted.token_id, session_id, minted.expires_at)
        .await
        .unwrap();
    (minted.token, minted.token_id)
}

fn upgrade_request(
    addr: SocketAddr,
    session_id: &str,
    subprotocol_token: Option<&str>,
    query_token: Option<&str>,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let url = match query_token {
        Some(token) => format!("ws://{addr}/ws/{session_id}?token={token}"),
        None => format!("ws://{addr}/ws/{session_id}"),
    };
    let mut request = url.into_client_request().unwrap();
    if let Some(token) = subprotocol_token {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            format!("bearer, {token}").parse().unwrap(),
        );
    }
    request
}

#[tokio::test]
async fn attach_proxies_bytes_both_ways() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    let (token, _) = provision(&h, &session_id, Some("127.0.0.1")).await;

    let request = upgrade_request(h.addr, &session_id, Some(&token), None);
    let (mut ws, _response) = connect_async(request).await.expect("upgrade accepted");

    ws.send(Message::Text("echo me".into())).await.unwrap();
    let reply = loop {
        match ws.next().await.expect("stream open").unwrap() {
            Message::Text(text) => break text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    };
    assert_eq!(reply, "echo me");
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn query_parameter_token_also_attaches() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    let (token, _) = provision(&h, &session_id, Some("127.0.0.1")).await;

    let request = upgrade_request(h.addr, &session_id, None, Some(&token));
    let (mut ws, _response) = connect_async(request).await.expect("upgrade accepted");
    ws.send(Message::Text("ping".into())).await.unwrap();
    let Some(Ok(Message::Text(reply))) = ws.next().await else {
        panic!("expected echo");
    };
    assert_eq!(reply, "ping");
}

#[tokio::test]
async fn replayed_token_is_rejected_after_first_attach() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    let (token, token_id) = provision(&h, &session_id, Some("127.0.0.1")).await;

    let request = upgrade_request(h.addr, &session_id, Some(&token), None);
    let (_ws, _response) = connect_async(request).await.expect("first attach");

    // Same token, same path, immediately after.
    let request = upgrade_request(h.addr, &session_id, Some(&token), None);
    assert!(connect_async(request).await.is_err());

    // The id was consumed by the first attach, not merely blocked.
    assert!(!h.store.consume_token_id(&token_id).await.unwrap());
}

#[tokio::test]
async fn session_binding_mismatch_leaves_the_token_id_intact() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_a = Uuid::new_v4().to_string();
    let session_b = Uuid::new_v4().to_string();
    let (token_a, token_id_a) = provision(&h, &session_a, Some("127.0.0.1")).await;
    let _ = provision(&h, &session_b, Some("127.0.0.1")).await;

    let request = upgrade_request(h.addr, &session_b, Some(&token_a), None);
    assert!(connect_async(request).await.is_err());

    // Rejected before the consume step: session A's token still attaches.
    assert!(h.store.consume_token_id(&token_id_a).await.unwrap());
}

#[tokio::test]
async fn foreign_signature_never_attaches() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    let _ = provision(&h, &session_id, Some("127.0.0.1")).await;

    // Signed by a key the controller never published.
    let foreign = Minter::new(KeyMaterial::generate().unwrap());
    let minted = foreign
        .mint(
            "owner-a",
            &session_id,
            ATTACH_AUDIENCE,
            chrono::Duration::seconds(600),
        )
        .unwrap();
    h.store
        .insert_token_id(&minted.token_id, &session_id, minted.expires_at)
        .await
        .unwrap();

    let request = upgrade_request(h.addr, &session_id, Some(&minted.token), None);
    assert!(connect_async(request).await.is_err());

    // Verification failed before the consume step.
    assert!(h.store.consume_token_id(&minted.token_id).await.unwrap());
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    let _ = provision(&h, &session_id, Some("127.0.0.1")).await;

    let request = upgrade_request(h.addr, &session_id, None, None);
    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn consume_precedes_pod_lookup() {
    let terminal_port = spawn_echo_upstream().await;
    let h = harness(terminal_port).await;
    let session_id = Uuid::new_v4().to_string();
    // Session exists but discovery never completed.
    let (token, token_id) = provision(&h, &session_id, None).await;

    let request = upgrade_request(h.addr, &session_id, Some(&token), None);
    assert!(connect_async(request).await.is_err());

    // One-shot semantics: the failed lookup still consumed the id.
    assert!(!h.store.consume_token_id(&token_id).await.unwrap());
}

#[tokio::test]
async fn plain_get_serves_the_terminal_page() {
    let h = harness(7681).await;
    let session_id = Uuid::new_v4().to_string();

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/ws/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store"
    );
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/html"));

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(page.contains("WebSocket"));
}

#[tokio::test]
async fn malformed_session_id_is_not_found() {
    let h = harness(7681).await;
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ws/not-a-session-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_is_ok() {
    let h = harness(7681).await;
    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}
