use std::time::Duration;

use axum::extract::ws::{self, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as Upstream;
use tracing::{debug, warn};

/// Splice the accepted client socket with the pod's terminal server until
/// either side closes. No store connection is held for the duration.
pub async fn run(
    client: WebSocket,
    session_id: String,
    pod_ip: String,
    terminal_port: u16,
    connect_timeout: Duration,
    subprotocols: Vec<String>,
) {
    let upstream_url = upstream_url(&pod_ip, terminal_port);
    let mut request = match upstream_url.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            warn!(%session_id, %upstream_url, error = %err, "bad upstream request");
            return;
        }
    };
    if !subprotocols.is_empty() {
        if let Ok(value) = subprotocols.join(", ").parse() {
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let upstream = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            warn!(%session_id, %upstream_url, error = %err, "upstream connect failed");
            return;
        }
        Err(_) => {
            warn!(%session_id, %upstream_url, "upstream connect timed out");
            return;
        }
    };
    debug!(%session_id, %upstream_url, "proxying");

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let Ok(message) = message else { break };
            let Some(frame) = to_upstream(message) else {
                continue;
            };
            let closing = matches!(frame, Upstream::Close(_));
            if upstream_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let Ok(message) = message else { break };
            let Some(frame) = to_client(message) else {
                continue;
            };
            let closing = matches!(frame, ws::Message::Close(_));
            if client_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
    };

    // Either side closing or failing tears the whole splice down; the halves
    // drop here and both TCP streams go with them.
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    debug!(%session_id, "proxy finished");
}

fn upstream_url(pod_ip: &str, terminal_port: u16) -> String {
    if pod_ip.contains(':') {
        format!("ws://[{pod_ip}]:{terminal_port}/")
    } else {
        format!("ws://{pod_ip}:{terminal_port}/")
    }
}

fn to_upstream(message: ws::Message) -> Option<Upstream> {
    match message {
        ws::Message::Text(text) => Some(Upstream::Text(text)),
        ws::Message::Binary(data) => Some(Upstream::Binary(data)),
        ws::Message::Ping(data) => Some(Upstream::Ping(data)),
        ws::Message::Pong(data) => Some(Upstream::Pong(data)),
        ws::Message::Close(frame) => Some(Upstream::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        }))),
    }
}

fn to_client(message: Upstream) -> Option<ws::Message> {
    match message {
        Upstream::Text(text) => Some(ws::Message::Text(text)),
        Upstream::Binary(data) => Some(ws::Message::Binary(data)),
        Upstream::Ping(data) => Some(ws::Message::Ping(data)),
        Upstream::Pong(data) => Some(ws::Message::Pong(data)),
        Upstream::Close(frame) => Some(ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        // Raw frames never surface from a configured client stream.
        Upstream::Frame(_) => None,
    }
}
