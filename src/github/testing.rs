//! Shared fixtures for GitHub module tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::credential::{format_expiry, CredentialStore, IntegrationCredential};
use crate::config::GitHubConfig;

pub const TEST_KEY: &str = include_str!("testdata/app_key.pem");
pub const TEST_PUBLIC_KEY: &str = include_str!("testdata/app_key.pub.pem");

/// Credential for installation 42 of app 1337 with no token yet.
pub fn credential() -> IntegrationCredential {
    IntegrationCredential {
        integration_id: "int-1".to_string(),
        external_id: "42".to_string(),
        app_id: "1337".to_string(),
        private_key: TEST_KEY.to_string(),
        access_token: None,
        expires_at: None,
        verify_ssl: true,
    }
}

pub fn valid_credential(token: &str) -> IntegrationCredential {
    credential().with_token(token.to_string(), Utc::now() + Duration::minutes(45))
}

pub fn stale_credential() -> IntegrationCredential {
    credential().with_token("ghs_stale".to_string(), Utc::now() - Duration::minutes(5))
}

/// Body of a successful token exchange, expiring in an hour.
pub fn issued_token(token: &str) -> Value {
    json!({
        "token": token,
        "expires_at": format_expiry(Utc::now() + Duration::hours(1)),
        "permissions": {"contents": "read", "issues": "write"},
        "repository_selection": "all"
    })
}

pub fn github_config(api_url: &str) -> GitHubConfig {
    GitHubConfig {
        api_url: api_url.to_string(),
        cache_ttl_secs: 60,
        ..GitHubConfig::default()
    }
}

pub struct MemoryCredentialStore {
    credential: Mutex<IntegrationCredential>,
    saves: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new(credential: IntegrationCredential) -> Self {
        Self {
            credential: Mutex::new(credential),
            saves: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> IntegrationCredential {
        self.credential.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, _integration_id: &str) -> Result<IntegrationCredential> {
        Ok(self.current())
    }

    async fn save(&self, credential: &IntegrationCredential) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        *self.credential.lock().unwrap() = credential.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
