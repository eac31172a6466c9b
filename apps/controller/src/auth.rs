use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("caller token rejected: {0}")]
    Invalid(String),
}

/// Maps the `Authorization: Bearer` value to an owner id, either through a
/// static api-key table or an external identity provider's JWKS.
#[derive(Clone)]
pub enum CallerAuth {
    ApiKey { keys: Arc<HashMap<String, String>> },
    Oidc(OidcVerifier),
}

impl CallerAuth {
    pub fn api_keys(keys: HashMap<String, String>) -> Self {
        Self::ApiKey {
            keys: Arc::new(keys),
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::Missing)?;
        match self {
            CallerAuth::ApiKey { keys } => keys
                .get(token)
                .cloned()
                .ok_or_else(|| AuthError::Invalid("unknown api key".into())),
            CallerAuth::Oidc(verifier) => {
                let claims = verifier
                    .verify(token)
                    .await
                    .map_err(|err| AuthError::Invalid(err.to_string()))?;
                if claims.sub.trim().is_empty() {
                    return Err(AuthError::Invalid("empty subject".into()));
                }
                Ok(claims.sub)
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
}

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("jwt header missing kid")]
    MissingKid,
    #[error("unknown jwk key id {0}")]
    UnknownKey(String),
    #[error("unsupported jwt algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Identity-provider token verification against a remote JWKS, cached by
/// key id with a staleness TTL.
#[derive(Clone)]
pub struct OidcVerifier {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<JwksCache>>>,
    client: reqwest::Client,
}

struct JwksCache {
    keys: HashMap<String, CachedDecodingKey>,
    fetched_at: Instant,
}

impl JwksCache {
    fn stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kty: String,
    kid: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Clone)]
struct CachedDecodingKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl OidcVerifier {
    pub fn new(
        jwks_url: String,
        issuer: Option<String>,
        audience: Option<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            jwks_url,
            issuer,
            audience,
            cache_ttl,
            cache: Arc::new(RwLock::new(None)),
            client: reqwest::Client::new(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<IdentityClaims, OidcError> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(OidcError::MissingKid)?;
        let key = self.decoding_key(&kid).await?;
        let algorithm = select_algorithm(header.alg, key.algorithm)?;

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<IdentityClaims>(token, &key.key, &validation)?;
        debug!(subject = %data.claims.sub, "caller identity verified");
        Ok(data.claims)
    }

    async fn decoding_key(&self, kid: &str) -> Result<CachedDecodingKey, OidcError> {
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

        let mut cache = self.cache.write().await;
        let needs_refresh = cache
            .as_ref()
            .map(|c| c.stale(self.cache_ttl) || !c.keys.contains_key(kid))
            .unwrap_or(true);
        if needs_refresh {
            *cache = Some(self.fetch_jwks().await?);
        }
        if let Some(cache) = cache.as_ref() {
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        Err(OidcError::UnknownKey(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<JwksCache, OidcError> {
        let resp = self.client.get(&self.jwks_url).send().await?;
        let resp = resp.error_for_status().map_err(|err| {
            OidcError::JwksFetch(format!("status {}", err.status().unwrap_or_default()))
        })?;
        let body: JwksResponse = resp.json().await?;

        let mut keys = HashMap::new();
        for jwk in body.keys {
            match jwk.kty.as_str() {
                "RSA" => {
                    let (Some(n), Some(e)) = (jwk.n, jwk.e) else {
                        continue;
                    };
                    keys.insert(
                        jwk.kid,
                        CachedDecodingKey {
                            key: DecodingKey::from_rsa_components(&n, &e)?,
                            algorithm: Algorithm::RS256,
                        },
                    );
                }
                "EC" => {
                    if jwk.crv.as_deref() != Some("P-256") {
                        continue;
                    }
                    let (Some(x), Some(y)) = (jwk.x, jwk.y) else {
                        continue;
                    };
                    keys.insert(
                        jwk.kid,
                        CachedDecodingKey {
                            key: DecodingKey::from_ec_components(&x, &y)?,
                            algorithm: Algorithm::ES256,
                        },
                    );
                }
                _ => continue,
            }
        }
        if keys.is_empty() {
            return Err(OidcError::JwksFetch("no usable keys returned".into()));
        }

        Ok(JwksCache {
            keys,
            fetched_at: Instant::now(),
        })
    }
}

fn select_algorithm(header_alg: Algorithm, key_alg: Algorithm) -> Result<Algorithm, OidcError> {
    match header_alg {
        Algorithm::RS256 | Algorithm::ES256 if header_alg == key_alg => Ok(header_alg),
        other => Err(OidcError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}
