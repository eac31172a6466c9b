use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::{KeyMaterial, KeySet};

/// Claims carried by an attach token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachClaims {
    /// Caller identity the token was minted for.
    pub sub: String,
    pub aud: String,
    /// Session binding; must equal the attach URL's session id.
    pub sid: String,
    /// Unique token id; its presence in the store grants exactly one attach.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MintError {
    #[error("token signing failed: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// Signs attach tokens under the controller's active key.
///
/// Rotation is by publication: the new key signs, while retiring keys stay
/// in the published set so tokens minted under them keep verifying until
/// their natural expiry.
#[derive(Clone)]
pub struct Minter {
    active: KeyMaterial,
    retired: Vec<KeyMaterial>,
}

impl Minter {
    pub fn new(active: KeyMaterial) -> Self {
        Self {
            active,
            retired: Vec::new(),
        }
    }

    /// Keep a retiring key in the published set. Safe to drop once the
    /// longest-lived token signed under it has expired.
    pub fn with_retired(mut self, key: KeyMaterial) -> Self {
        self.retired.push(key);
        self
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.active
    }

    /// The key set document served under the well-known path: the active
    /// key first, then every retiring key.
    pub fn key_set(&self) -> KeySet {
        let mut keys = vec![self.active.jwk().clone()];
        keys.extend(self.retired.iter().map(|key| key.jwk().clone()));
        KeySet { keys }
    }

    /// Mint a fresh token bound to `session_id`. The returned `token_id` is
    /// a new UUIDv4 and never repeats across calls.
    pub fn mint(
        &self,
        subject: &str,
        session_id: &str,
        audience: &str,
        ttl: Duration,
    ) -> Result<MintedToken, MintError> {
        let now = Utc::now();
        let expires_at = now + ttl;
        let token_id = Uuid::new_v4().to_string();
        let claims = AttachClaims {
            sub: subject.to_string(),
            aud: audience.to_string(),
            sid: session_id.to_string(),
            jti: token_id.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.active.kid().to_string());
        let token = jsonwebtoken::encode(&header, &claims, self.active.encoding_key())?;

        Ok(MintedToken {
            token_id,
            token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ATTACH_AUDIENCE;

    #[test]
    fn token_ids_never_repeat() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let a = minter
            .mint("owner-1", "sess-a", ATTACH_AUDIENCE, Duration::seconds(60))
            .unwrap();
        let b = minter
            .mint("owner-1", "sess-a", ATTACH_AUDIENCE, Duration::seconds(60))
            .unwrap();
        assert_ne!(a.token_id, b.token_id);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn header_kid_matches_key_set() {
        let minter = Minter::new(KeyMaterial::generate().unwrap());
        let minted = minter
            .mint("owner-1", "sess-a", ATTACH_AUDIENCE, Duration::seconds(60))
            .unwrap();
        let header = jsonwebtoken::decode_header(&minted.token).unwrap();
        assert_eq!(header.kid.as_deref(), Some(minter.key().kid()));
        assert_eq!(header.alg, Algorithm::ES256);
    }

    #[test]
    fn retired_keys_stay_published_behind_the_active_one() {
        let old = KeyMaterial::generate().unwrap();
        let minter = Minter::new(KeyMaterial::generate().unwrap()).with_retired(old.clone());

        let set = minter.key_set();
        assert_eq!(set.keys.len(), 2);
        assert_eq!(set.keys[0].kid, minter.key().kid());
        assert_eq!(set.keys[1].kid, old.kid());

        // New tokens sign under the active key only.
        let minted = minter
            .mint("owner-1", "sess-a", ATTACH_AUDIENCE, Duration::seconds(60))
            .unwrap();
        let header = jsonwebtoken::decode_header(&minted.token).unwrap();
        assert_eq!(header.kid.as_deref(), Some(minter.key().kid()));
    }
}
