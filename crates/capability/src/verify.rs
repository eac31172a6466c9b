use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::keys::KeySet;
use crate::mint::AttachClaims;

/// Verifies attach tokens against the controller's published key set.
///
/// The key set is fetched over HTTP on first use and cached by key id; a
/// token signed under a freshly rotated key forces one refresh before the
/// unknown-kid error is reported.
#[derive(Clone)]
pub struct Verifier {
    jwks_url: String,
    audience: String,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<JwksCache>>>,
    client: Client,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

impl JwksCache {
    fn stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token header missing kid")]
    MissingKid,
    #[error("unknown key id {0}")]
    UnknownKey(String),
    #[error("signature mismatch")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("audience mismatch")]
    Audience,
    #[error("key set fetch failed: {0}")]
    JwksFetch(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => VerifyError::Expired,
            ErrorKind::InvalidAudience => VerifyError::Audience,
            ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey => VerifyError::Signature,
            _ => VerifyError::Malformed(err.to_string()),
        }
    }
}

impl Verifier {
    pub fn new(jwks_url: String, audience: String, cache_ttl: Duration) -> Self {
        Self {
            jwks_url,
            audience,
            cache_ttl,
            cache: Arc::new(RwLock::new(None)),
            client: Client::new(),
        }
    }

    /// Validate signature, expiry, and audience; return the claim set.
    ///
    /// Expiry is strict: a token whose `exp` equals the current second is
    /// already rejected.
    pub async fn verify(&self, token: &str) -> Result<AttachClaims, VerifyError> {
        let header =
            decode_header(token).map_err(|err| VerifyError::Malformed(err.to_string()))?;
        let kid = header.kid.ok_or(VerifyError::MissingKid)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.leeway = 0;

        let data = decode::<AttachClaims>(token, &key, &validation)?;
        let claims = data.claims;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(VerifyError::Expired);
        }
        Ok(claims)
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if !cache.stale(self.cache_ttl) {
                    if let Some(key) = cache.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        {
            let mut cache = self.cache.write().await;
            let refresh_needed = cache
                .as_ref()
                .map(|c| c.stale(self.cache_ttl) || !c.keys.contains_key(kid))
                .unwrap_or(true);
            if refresh_needed {
                *cache = Some(self.fetch_jwks().await?);
            }

            if let Some(cache) = cache.as_ref() {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        Err(VerifyError::UnknownKey(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<JwksCache, VerifyError> {
        let response = self.client.get(&self.jwks_url).send().await?;
        if !response.status().is_success() {
            return Err(VerifyError::JwksFetch(format!(
                "status {}",
                response.status()
            )));
        }

        let body: KeySet = response.json().await?;
        let mut keys = HashMap::new();
        for entry in body.keys {
            if entry.kty != "EC" || entry.crv != "P-256" {
                continue;
            }
            let key = DecodingKey::from_ec_components(&entry.x, &entry.y)
                .map_err(|err| VerifyError::JwksFetch(err.to_string()))?;
            keys.insert(entry.kid, key);
        }
        if keys.is_empty() {
            return Err(VerifyError::JwksFetch("no usable keys returned".into()));
        }

        Ok(JwksCache {
            keys,
            fetched_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyMaterial, Minter, ATTACH_AUDIENCE};
    use axum::{routing::get, Json, Router};
    use chrono::Duration as ChronoDuration;

    async fn serve_key_set(set: KeySet) -> String {
        let app = Router::new().route("/.well-known/jwks.json", get(move || f(set.clone())));
        async fn f(set: KeySet) -> Json<KeySet> {
            Json(set)
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/.well-known/jwks.json", addr)
    }

    fn verifier(jwks_url: String) -> Verifier {
        Verifier::new(jwks_url, ATTACH_AUDIENCE.into(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn mint_then_verify_round_trip() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let jwks_url = serve_key_set(minter.key_set()).await;
        let minted = minter
            .mint(
                "owner-1",
                "11111111-1111-4111-8111-111111111111",
                ATTACH_AUDIENCE,
                ChronoDuration::seconds(60),
            )
            .unwrap();

        let claims = verifier(jwks_url).verify(&minted.token).await.unwrap();
        assert_eq!(claims.sub, "owner-1");
        assert_eq!(claims.sid, "11111111-1111-4111-8111-111111111111");
        assert_eq!(claims.jti, minted.token_id);
        assert_eq!(claims.aud, ATTACH_AUDIENCE);
    }

    #[tokio::test]
    async fn wrong_audience_rejected() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let jwks_url = serve_key_set(minter.key_set()).await;
        let minted = minter
            .mint("owner-1", "sess", "publish", ChronoDuration::seconds(60))
            .unwrap();

        let err = verifier(jwks_url).verify(&minted.token).await.unwrap_err();
        assert!(matches!(err, VerifyError::Audience));
    }

    #[tokio::test]
    async fn expiry_boundary_is_strict() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let jwks_url = serve_key_set(minter.key_set()).await;
        // exp == now, to the second
        let minted = minter
            .mint("owner-1", "sess", ATTACH_AUDIENCE, ChronoDuration::zero())
            .unwrap();

        let err = verifier(jwks_url).verify(&minted.token).await.unwrap_err();
        assert!(matches!(err, VerifyError::Expired));
    }

    #[tokio::test]
    async fn foreign_key_set_rejects_signature() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        // Key set published by a different key than the signer's.
        let other = Minter::new(KeyMaterial::generate().unwrap());
        let jwks_url = serve_key_set(other.key_set()).await;
        let minted = minter
            .mint("owner-1", "sess", ATTACH_AUDIENCE, ChronoDuration::seconds(60))
            .unwrap();

        let err = verifier(jwks_url).verify(&minted.token).await.unwrap_err();
        assert!(matches!(err, VerifyError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn rotation_keeps_old_tokens_verifiable() {
        // Token minted before rotation.
        let old_key = KeyMaterial::generate().unwrap();
        let minted_old = Minter::new(old_key.clone())
            .mint("owner-1", "sess", ATTACH_AUDIENCE, ChronoDuration::seconds(60))
            .unwrap();

        // Rotated: new active key, old key retiring but still published.
        let rotated = Minter::new(KeyMaterial::generate().unwrap()).with_retired(old_key);
        let jwks_url = serve_key_set(rotated.key_set()).await;
        let verifier = verifier(jwks_url);

        let claims = verifier.verify(&minted_old.token).await.unwrap();
        assert_eq!(claims.sub, "owner-1");

        let minted_new = rotated
            .mint("owner-1", "sess", ATTACH_AUDIENCE, ChronoDuration::seconds(60))
            .unwrap();
        verifier.verify(&minted_new.token).await.unwrap();
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let jwks_url = serve_key_set(minter.key_set()).await;
        let err = verifier(jwks_url).verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(_)));
    }
}
