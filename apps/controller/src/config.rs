use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Caller admission strategy. The gateway never sees caller identities
/// either way; this only selects how the controller maps a bearer value to
/// an owner id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Oidc,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub namespace: String,
    pub runner_image: String,
    pub job_ttl_seconds: u64,
    pub job_active_deadline_seconds: u64,
    pub session_expiry_seconds: u64,
    pub pod_discovery_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub allowed_code_domains: Vec<String>,
    pub rate_window: Duration,
    pub rate_max: u32,
    pub rate_skip_paths: Vec<String>,
    pub db_max_connections: u32,
    pub db_idle_timeout: Duration,
    pub auth_mode: AuthMode,
    pub api_keys: HashMap<String, String>,
    pub oidc_jwks_url: Option<String>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
    pub signing_key_path: Option<String>,
    pub signing_key_pem: Option<String>,
    /// Retiring keys still published for verification after a rotation.
    pub retired_key_paths: Vec<String>,
    pub kube_api_url: Option<String>,
    pub kube_token_path: String,
    pub kube_ca_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        let session_expiry_seconds = parse_u64("WSCLI_SESSION_EXPIRY_SECONDS", 600).min(900);
        let pod_discovery_secs = parse_u64("WSCLI_POD_DISCOVERY_TIMEOUT_SECONDS", 30).max(5);

        Self {
            bind_addr: env::var("WSCLI_CONTROLLER_ADDR")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("static addr")),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/wscli".to_string()),
            namespace: env::var("WSCLI_NAMESPACE").unwrap_or_else(|_| "ws-cli".to_string()),
            runner_image: env::var("WSCLI_RUNNER_IMAGE")
                .unwrap_or_else(|_| "wscli-runner:latest".to_string()),
            job_ttl_seconds: parse_u64("WSCLI_JOB_TTL_SECONDS", 300),
            job_active_deadline_seconds: parse_u64("WSCLI_JOB_ACTIVE_DEADLINE_SECONDS", 3600),
            session_expiry_seconds,
            pod_discovery_timeout: Duration::from_secs(pod_discovery_secs),
            allowed_origins: parse_list("WSCLI_ALLOWED_ORIGINS"),
            allowed_code_domains: parse_list("WSCLI_ALLOWED_CODE_DOMAINS"),
            rate_window: Duration::from_millis(parse_u64("WSCLI_RATE_WINDOW_MS", 60_000)),
            rate_max: parse_u64("WSCLI_RATE_MAX", 10) as u32,
            rate_skip_paths: parse_list("WSCLI_RATE_SKIP_PATHS"),
            db_max_connections: parse_u64("WSCLI_DB_MAX_CONNECTIONS", 20) as u32,
            db_idle_timeout: Duration::from_millis(parse_u64("WSCLI_DB_IDLE_TIMEOUT_MS", 30_000)),
            auth_mode: match env::var("WSCLI_AUTH_MODE").as_deref() {
                Ok("oidc") => AuthMode::Oidc,
                _ => AuthMode::ApiKey,
            },
            api_keys: parse_api_keys(&env::var("WSCLI_API_KEYS").unwrap_or_default()),
            oidc_jwks_url: non_empty(env::var("WSCLI_OIDC_JWKS_URL").ok()),
            oidc_issuer: non_empty(env::var("WSCLI_OIDC_ISSUER").ok()),
            oidc_audience: non_empty(env::var("WSCLI_OIDC_AUDIENCE").ok()),
            signing_key_path: non_empty(env::var("WSCLI_SIGNING_KEY_PATH").ok()),
            signing_key_pem: non_empty(env::var("WSCLI_SIGNING_KEY_PEM").ok()),
            retired_key_paths: parse_list("WSCLI_RETIRED_KEY_PATHS"),
            kube_api_url: non_empty(env::var("WSCLI_KUBE_API_URL").ok()),
            kube_token_path: env::var("WSCLI_KUBE_TOKEN_PATH").unwrap_or_else(|_| {
                "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
            }),
            kube_ca_path: env::var("WSCLI_KUBE_CA_PATH").unwrap_or_else(|_| {
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
            }),
        }
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `key:owner` pairs, comma separated.
fn parse_api_keys(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, owner) = pair.trim().split_once(':')?;
            if key.is_empty() || owner.is_empty() {
                return None;
            }
            Some((key.to_string(), owner.to_string()))
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
