use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use wscli_capability::{KeyMaterial, Minter};
use wscli_controller::auth::{CallerAuth, OidcVerifier};
use wscli_controller::config::{AuthMode, Config};
use wscli_controller::orchestrator::{KubeConfig, KubeOrchestrator};
use wscli_controller::rate_limit::{RateLimitConfig, RateLimiter};
use wscli_controller::routes;
use wscli_controller::state::AppState;
use wscli_store::{PgStore, PgStoreConfig, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!(
        addr = %config.bind_addr,
        namespace = %config.namespace,
        runner_image = %config.runner_image,
        session_expiry_seconds = config.session_expiry_seconds,
        pod_discovery_timeout_secs = config.pod_discovery_timeout.as_secs(),
        auth_mode = ?config.auth_mode,
        "starting wscli controller"
    );

    let prometheus = install_metrics_recorder();

    let key = load_key_material(&config)?;
    info!(kid = key.kid(), "attach token signing key loaded");
    let mut minter = Minter::new(key);
    for path in &config.retired_key_paths {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read retired key {path}"))?;
        let retired = KeyMaterial::from_pem(&pem)
            .with_context(|| format!("unusable retired key {path}"))?;
        info!(kid = retired.kid(), "retiring key kept in the published set");
        minter = minter.with_retired(retired);
    }

    let store = PgStore::connect(&PgStoreConfig {
        url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        idle_timeout: config.db_idle_timeout,
    })
    .await
    .context("failed to connect to the session store")?;
    store
        .migrate()
        .await
        .context("failed to apply store migrations")?;
    let store: Arc<dyn SessionStore> = Arc::new(store);

    let orchestrator = Arc::new(
        KubeOrchestrator::new(kube_config(&config))
            .context("failed to build the orchestrator client")?,
    );

    let auth = match config.auth_mode {
        AuthMode::ApiKey => {
            if config.api_keys.is_empty() {
                bail!("WSCLI_AUTH_MODE=api-key requires WSCLI_API_KEYS");
            }
            CallerAuth::api_keys(config.api_keys.clone())
        }
        AuthMode::Oidc => {
            let Some(jwks_url) = config.oidc_jwks_url.clone() else {
                bail!("WSCLI_AUTH_MODE=oidc requires WSCLI_OIDC_JWKS_URL");
            };
            CallerAuth::Oidc(OidcVerifier::new(
                jwks_url,
                config.oidc_issuer.clone(),
                config.oidc_audience.clone(),
                Duration::from_secs(300),
            ))
        }
    };

    let limiter = RateLimiter::new(RateLimitConfig {
        window: config.rate_window,
        max: config.rate_max,
        skip_paths: config.rate_skip_paths.clone(),
    });

    let state = AppState::new(
        store,
        orchestrator,
        minter,
        auth,
        limiter,
        config.session_expiry_seconds,
        config.pod_discovery_timeout,
        config.allowed_code_domains.clone(),
    );

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus);

    let app = routes::router(state)
        .merge(metrics_routes)
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("wscli controller listening on {}", config.bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("controller shut down");
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

fn load_key_material(config: &Config) -> Result<KeyMaterial> {
    if let Some(path) = &config.signing_key_path {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read signing key {path}"))?;
        return KeyMaterial::from_pem(&pem).context("unusable signing key");
    }
    if let Some(pem) = &config.signing_key_pem {
        return KeyMaterial::from_pem(pem).context("unusable signing key");
    }
    warn!("no signing key configured; generating an ephemeral keypair");
    KeyMaterial::generate().context("keypair generation failed")
}

fn kube_config(config: &Config) -> KubeConfig {
    let api_url = config.kube_api_url.clone().unwrap_or_else(|| {
        match (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            (Ok(host), Ok(port)) => format!("https://{host}:{port}"),
            _ => "https://kubernetes.default.svc".to_string(),
        }
    });
    KubeConfig {
        api_url,
        token: std::fs::read_to_string(&config.kube_token_path)
            .ok()
            .map(|token| token.trim().to_string()),
        ca_pem: std::fs::read(&config.kube_ca_path).ok(),
        namespace: config.namespace.clone(),
        runner_image: config.runner_image.clone(),
        job_ttl_seconds: config.job_ttl_seconds,
        job_active_deadline_seconds: config.job_active_deadline_seconds,
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
