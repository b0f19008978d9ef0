//! App JWT generation.
//!
//! GitHub Apps authenticate app-level calls (installation lookup, token
//! exchange) with a short-lived RS256 JWT whose issuer is the app ID.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// GitHub rejects JWTs valid for more than ten minutes.
pub const MAX_JWT_TTL_SECS: i64 = 600;

/// Backdate `iat` to tolerate clock drift between us and GitHub.
const CLOCK_DRIFT_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Signs app JWTs with the key pair the app was registered with.
///
/// The key is parsed once; a credential's private key never changes, so a
/// signer built from it stays valid for the credential's lifetime.
#[derive(Clone)]
pub struct AppJwtSigner {
    app_id: String,
    key: EncodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for AppJwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppJwtSigner")
            .field("app_id", &self.app_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AppJwtSigner {
    pub fn new(app_id: impl Into<String>, private_key_pem: &str, ttl_secs: i64) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("Failed to parse private key PEM")?;
        Ok(Self {
            app_id: app_id.into(),
            key,
            ttl: Duration::seconds(ttl_secs.clamp(1, MAX_JWT_TTL_SECS)),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn sign(&self) -> Result<String> {
        let now = Utc::now();
        let claims = AppClaims {
            iat: (now - Duration::seconds(CLOCK_DRIFT_SECS)).timestamp(),
            exp: (now + self.ttl).timestamp(),
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key).context("Failed to encode JWT")
    }
}
