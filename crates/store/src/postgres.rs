use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{SessionRecord, SessionStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub idle_timeout: Duration,
}

/// Postgres backend. Tables are unlogged and carry expiry-purge triggers,
/// see `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, row: SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, owner_id, job_name, pod_name, pod_ip, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&row.session_id)
        .bind(&row.owner_id)
        .bind(&row.job_name)
        .bind(&row.pod_name)
        .bind(&row.pod_ip)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session_pod(
        &self,
        session_id: &str,
        pod_ip: &str,
        pod_name: &str,
    ) -> Result<(), StoreError> {
        // The IS NULL guard keeps the null -> set transition monotonic.
        let updated = sqlx::query(
            r#"
            UPDATE sessions SET pod_ip = $2, pod_name = $3
            WHERE session_id = $1 AND pod_ip IS NULL
            "#,
        )
        .bind(session_id)
        .bind(pod_ip)
        .bind(pod_name)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<(i32,)> =
                sqlx::query_as(r#"SELECT 1 FROM sessions WHERE session_id = $1"#)
                    .bind(session_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(StoreError::MissingSession(session_id.to_string()));
            }
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row: Option<SessionRecord> = sqlx::query_as(
            r#"
            SELECT session_id, owner_id, job_name, pod_name, pod_ip, created_at, expires_at
            FROM sessions
            WHERE session_id = $1 AND expires_at > now()
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_token_id(
        &self,
        token_id: &str,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO token_ids (token_id, session_id, expires_at) VALUES ($1, $2, $3)"#,
        )
        .bind(token_id)
        .bind(session_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_token_id(&self, token_id: &str) -> Result<bool, StoreError> {
        // Single-use enforcement: a row-level delete is linearizable per key,
        // so concurrent consumers observe at most one removal.
        let deleted =
            sqlx::query(r#"DELETE FROM token_ids WHERE token_id = $1 AND expires_at > now()"#)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
