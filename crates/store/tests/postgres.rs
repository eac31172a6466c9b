//! Postgres-backed store test. Ignored by default; to run it locally:
//! - Start Postgres and create an empty database
//! - Export `DATABASE_URL` pointing at it
//! - Run: `cargo test -p wscli-store -- --ignored postgres_round_trip`

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use wscli_store::{PgStore, PgStoreConfig, SessionRecord, SessionStore};

#[ignore]
#[tokio::test]
async fn postgres_round_trip() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    let store = PgStore::connect(&PgStoreConfig {
        url,
        max_connections: 5,
        idle_timeout: Duration::from_secs(30),
    })
    .await
    .expect("connect");
    store.migrate().await.expect("migrate");

    let session_id = Uuid::new_v4().to_string();
    let job_name = format!("wscli-{}", &session_id[..13]);
    let now = Utc::now();
    store
        .insert_session(SessionRecord {
            session_id: session_id.clone(),
            owner_id: "owner-pg".into(),
            job_name,
            pod_name: None,
            pod_ip: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(600),
        })
        .await
        .expect("insert session");

    store
        .update_session_pod(&session_id, "10.0.0.5", "pod-a")
        .await
        .expect("record pod");
    // Second update must not overwrite the recorded pod.
    store
        .update_session_pod(&session_id, "10.0.0.9", "pod-b")
        .await
        .expect("no-op update");

    let row = store
        .get_session(&session_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(row.pod_ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(row.pod_name.as_deref(), Some("pod-a"));

    let token_id = Uuid::new_v4().to_string();
    store
        .insert_token_id(&token_id, &session_id, now + chrono::Duration::seconds(600))
        .await
        .expect("insert token id");
    assert!(store.consume_token_id(&token_id).await.expect("consume"));
    assert!(!store.consume_token_id(&token_id).await.expect("replay"));
}
