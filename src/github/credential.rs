//! Installation credentials and their persistence seam.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format GitHub used for `expires_at` before RFC 3339 became the norm
/// in stored metadata. Values in this form are UTC.
const NAIVE_EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Everything needed to authenticate as one GitHub App installation.
#[derive(Clone, Serialize, Deserialize)]
pub struct IntegrationCredential {
    /// Local integration id
    pub integration_id: String,
    /// GitHub installation id
    pub external_id: String,
    /// GitHub App id, used as the JWT issuer
    pub app_id: String,
    /// PEM private key of the app
    pub private_key: String,
    pub access_token: Option<String>,
    /// Token expiry as stored; parsed lazily so a malformed value only
    /// forces a refresh instead of failing the load.
    pub expires_at: Option<String>,
    pub verify_ssl: bool,
}

impl std::fmt::Debug for IntegrationCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationCredential")
            .field("integration_id", &self.integration_id)
            .field("external_id", &self.external_id)
            .field("app_id", &self.app_id)
            .field("has_access_token", &self.access_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl IntegrationCredential {
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().and_then(parse_expiry)
    }

    /// A token is usable only when present and its expiry parses to a
    /// point strictly after `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let has_token = self.access_token.as_deref().is_some_and(|t| !t.is_empty());
        has_token && self.expiry().is_some_and(|expiry| expiry > now)
    }

    /// Returns a copy carrying a fresh token. Token and expiry are always
    /// replaced together.
    pub fn with_token(&self, token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: Some(token),
            expires_at: Some(format_expiry(expires_at)),
            ..self.clone()
        }
    }
}

pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, NAIVE_EXPIRY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_expiry(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Durable home of installation credentials.
///
/// `save` must write the token and its expiry together or not at all.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, integration_id: &str) -> Result<IntegrationCredential>;
    async fn save(&self, credential: &IntegrationCredential) -> Result<()>;
}
