use std::sync::Arc;

use wscli_capability::Minter;
use wscli_store::SessionStore;

use crate::auth::CallerAuth;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub minter: Minter,
    pub auth: CallerAuth,
    pub limiter: Arc<RateLimiter>,
    /// Session and token lifetime; capped at 15 minutes by config.
    pub session_expiry: chrono::Duration,
    pub pod_discovery_timeout: std::time::Duration,
    allowed_code_domains: Arc<Vec<String>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        orchestrator: Arc<dyn Orchestrator>,
        minter: Minter,
        auth: CallerAuth,
        limiter: RateLimiter,
        session_expiry_seconds: u64,
        pod_discovery_timeout: std::time::Duration,
        allowed_code_domains: Vec<String>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            minter,
            auth,
            limiter: Arc::new(limiter),
            session_expiry: chrono::Duration::seconds(session_expiry_seconds as i64),
            pod_discovery_timeout,
            allowed_code_domains: Arc::new(allowed_code_domains),
        }
    }

    pub fn allowed_code_domains(&self) -> &[String] {
        &self.allowed_code_domains
    }
}
