use std::env;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    /// Controller well-known key set location.
    pub jwks_url: String,
    pub jwks_cache_ttl: Duration,
    pub upstream_connect_timeout: Duration,
    pub terminal_port: u16,
    pub db_max_connections: u32,
    pub db_idle_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let connect_secs = parse_u64("WSCLI_UPSTREAM_CONNECT_TIMEOUT_SECONDS", 10).clamp(5, 30);
        Self {
            bind_addr: env::var("WSCLI_GATEWAY_ADDR")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| "0.0.0.0:8081".parse().expect("static addr")),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/wscli".to_string()),
            jwks_url: env::var("WSCLI_JWKS_URL").unwrap_or_else(|_| {
                "http://wscli-controller/.well-known/jwks.json".to_string()
            }),
            jwks_cache_ttl: Duration::from_secs(parse_u64("WSCLI_JWKS_CACHE_TTL_SECONDS", 300)),
            upstream_connect_timeout: Duration::from_secs(connect_secs),
            terminal_port: parse_u64("WSCLI_TERMINAL_PORT", 7681) as u16,
            db_max_connections: parse_u64("WSCLI_DB_MAX_CONNECTIONS", 20) as u32,
            db_idle_timeout: Duration::from_millis(parse_u64("WSCLI_DB_IDLE_TIMEOUT_MS", 30_000)),
            allowed_origins: env::var("WSCLI_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
