use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{SessionRecord, SessionStore, StoreError};

#[derive(Debug, Clone)]
struct TokenIdRow {
    #[allow(dead_code)]
    session_id: String,
    expires_at: DateTime<Utc>,
}

/// In-memory backend for tests and single-process dev runs.
///
/// One mutex guards each map, so `consume_token_id` keeps the same
/// at-most-one-`true` guarantee the Postgres delete provides.
#[derive(Default)]
pub struct MemStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    token_ids: Mutex<HashMap<String, TokenIdRow>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemStore {
    async fn insert_session(&self, row: SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&row.session_id) {
            return Err(StoreError::Duplicate(row.session_id));
        }
        if sessions.values().any(|s| s.job_name == row.job_name) {
            return Err(StoreError::Duplicate(row.job_name));
        }
        sessions.insert(row.session_id.clone(), row);
        Ok(())
    }

    async fn update_session_pod(
        &self,
        session_id: &str,
        pod_ip: &str,
        pod_name: &str,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let row = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::MissingSession(session_id.to_string()))?;
        if row.pod_ip.is_none() {
            row.pod_ip = Some(pod_ip.to_string());
            row.pod_name = Some(pod_name.to_string());
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(session_id)
            .filter(|row| !row.expired(Utc::now()))
            .cloned())
    }

    async fn insert_token_id(
        &self,
        token_id: &str,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut token_ids = self.token_ids.lock().await;
        if token_ids.contains_key(token_id) {
            return Err(StoreError::Duplicate(token_id.to_string()));
        }
        token_ids.insert(
            token_id.to_string(),
            TokenIdRow {
                session_id: session_id.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn consume_token_id(&self, token_id: &str) -> Result<bool, StoreError> {
        let mut token_ids = self.token_ids.lock().await;
        match token_ids.remove(token_id) {
            Some(row) if row.expires_at > Utc::now() => Ok(true),
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}
