use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use wscli_capability::{Verifier, ATTACH_AUDIENCE};
use wscli_gateway::attach::{self, AppState};
use wscli_gateway::config::Config;
use wscli_store::{PgStore, PgStoreConfig, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!(
        addr = %config.bind_addr,
        jwks_url = %config.jwks_url,
        terminal_port = config.terminal_port,
        upstream_connect_timeout_secs = config.upstream_connect_timeout.as_secs(),
        "starting wscli gateway"
    );

    let prometheus = install_metrics_recorder();

    let store = PgStore::connect(&PgStoreConfig {
        url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        idle_timeout: config.db_idle_timeout,
    })
    .await
    .context("failed to connect to the session store")?;
    let store: Arc<dyn SessionStore> = Arc::new(store);

    let verifier = Verifier::new(
        config.jwks_url.clone(),
        ATTACH_AUDIENCE.to_string(),
        config.jwks_cache_ttl,
    );

    let state = AppState {
        store,
        verifier,
        upstream_connect_timeout: config.upstream_connect_timeout,
        terminal_port: config.terminal_port,
    };

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus);

    let app = attach::router(state)
        .merge(metrics_routes)
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("wscli gateway listening on {}", config.bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("gateway shut down");
    Ok(())
}

fn init_tracing() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

async fn metrics_handler(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> impl axum::response::IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
