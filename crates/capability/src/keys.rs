use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::EncodingKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unreadable key material: {0}")]
    Unreadable(String),
    #[error("key encoding failed: {0}")]
    Encoding(String),
}

/// One published verification key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub x: String,
    pub y: String,
}

/// The document served under the controller's well-known path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySet {
    pub keys: Vec<Jwk>,
}

/// Signing key plus everything needed to publish its public half.
///
/// The key identifier is derived from the public key itself, so every
/// rotation publishes a fresh, globally unique `kid` and old tokens keep
/// verifying against the retained entry until they expire.
#[derive(Clone)]
pub struct KeyMaterial {
    kid: String,
    encoding: EncodingKey,
    jwk: Jwk,
}

impl KeyMaterial {
    /// Load a P-256 private key from PEM (PKCS#8 or SEC1).
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .or_else(|_| SecretKey::from_sec1_pem(pem))
            .map_err(|err| KeyError::Unreadable(err.to_string()))?;
        Self::from_secret_key(secret)
    }

    /// Generate an ephemeral keypair. Tokens minted under it stop verifying
    /// on restart, which is acceptable for dev and single-replica setups.
    pub fn generate() -> Result<Self, KeyError> {
        Self::from_secret_key(SecretKey::random(&mut rand::rngs::OsRng))
    }

    fn from_secret_key(secret: SecretKey) -> Result<Self, KeyError> {
        let point = secret.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(KeyError::Encoding("public key is the identity point".into()));
        };

        let kid = hex::encode(&Sha256::digest(point.as_bytes())[..8]);
        let jwk = Jwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            kid: kid.clone(),
            alg: "ES256".into(),
            use_: "sig".into(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        };

        let pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| KeyError::Encoding(err.to_string()))?;
        let encoding = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|err| KeyError::Encoding(err.to_string()))?;

        Ok(Self { kid, encoding, jwk })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// The published form of this key's public half.
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }
}
