//! Capability tokens for sandbox terminal attach.
//!
//! A capability token is a short-lived ES256 JWT binding one caller to one
//! session attach. The controller mints tokens with [`Minter`] and publishes
//! the verification keys as a JWKS document; the gateway verifies presented
//! tokens with [`Verifier`] against that document. Single-use enforcement is
//! not handled here — the embedded `jti` is recorded and consumed through the
//! shared store.

mod keys;
mod mint;
mod verify;

pub use keys::{Jwk, KeyError, KeyMaterial, KeySet};
pub use mint::{AttachClaims, MintError, MintedToken, Minter};
pub use verify::{Verifier, VerifyError};

/// Audience claim carried by every attach token.
pub const ATTACH_AUDIENCE: &str = "attach";
