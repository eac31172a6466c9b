//! Shared durable state for the controller and gateway.
//!
//! Two row kinds live here: sessions and token ids. The controller is the
//! sole writer; the gateway reads sessions and consumes token ids. Rows past
//! their expiry are semantically absent — backends filter them on read and
//! purge them opportunistically, so correctness never depends on timely
//! cleanup.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemStore;
pub use postgres::{PgStore, PgStoreConfig};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_id: String,
    pub job_name: String,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate row for key {0}")]
    Duplicate(String),
    #[error("no session row for {0}")]
    MissingSession(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.constraint().unwrap_or("unknown").to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Store operations shared by both services.
///
/// `consume_token_id` is the single correctness-critical concurrency point:
/// it must be linearizable with respect to itself, so that concurrent calls
/// for one token id observe at most one `true`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, row: SessionRecord) -> Result<(), StoreError>;

    /// Record the discovered pod for `session_id`. The pod ip transition is
    /// monotonic: once set it is never cleared or changed by the core.
    async fn update_session_pod(
        &self,
        session_id: &str,
        pod_ip: &str,
        pod_name: &str,
    ) -> Result<(), StoreError>;

    /// Expired rows read as absent.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn insert_token_id(
        &self,
        token_id: &str,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically delete the token id row; `true` iff a live row was removed.
    async fn consume_token_id(&self, token_id: &str) -> Result<bool, StoreError>;

    /// Backend liveness, for health endpoints.
    async fn ping(&self) -> bool;
}
