//! Installation access-token lifecycle.
//!
//! GitHub Apps use two kinds of credentials:
//! 1. App JWT - short-lived, signed with the app's private key, accepted
//!    only by app-level endpoints such as the token exchange.
//! 2. Installation access token - scoped to one installation, used for
//!    every repository call. Expires after roughly an hour.
//!
//! [`TokenManager::get_token`] hands out the current installation token and
//! exchanges a fresh one when it is missing, expired, unparseable or the
//! caller forces it. Refreshes of one integration are serialized through
//! [`RefreshLocks`], which the server shares across every manager it
//! builds; a caller that waited on the lock first re-reads the store and
//! reuses a token persisted in the meantime. Separate processes may still
//! race, and the last persisted token wins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{HttpTransport, GITHUB_ACCEPT};
use super::credential::{parse_expiry, CredentialStore, IntegrationCredential};
use super::error::{GitHubError, Result};
use super::jwt::AppJwtSigner;
use super::models::InstallationToken;

/// Path of the token-exchange endpoint for an installation.
pub fn token_exchange_path(external_id: &str) -> String {
    format!("/app/installations/{}/access_tokens", external_id)
}

/// One refresh lock per integration id.
#[derive(Debug, Default)]
pub struct RefreshLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_integration(&self, integration_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(integration_id.to_string())
            .or_default()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct TokenManager {
    external_id: String,
    transport: HttpTransport,
    signer: AppJwtSigner,
    store: Arc<dyn CredentialStore>,
    credential: Mutex<IntegrationCredential>,
    refresh_lock: Arc<Mutex<()>>,
}

impl TokenManager {
    pub fn new(
        credential: IntegrationCredential,
        transport: HttpTransport,
        store: Arc<dyn CredentialStore>,
        jwt_ttl_secs: i64,
    ) -> anyhow::Result<Self> {
        let signer = AppJwtSigner::new(
            credential.app_id.clone(),
            &credential.private_key,
            jwt_ttl_secs,
        )?;

        Ok(Self {
            external_id: credential.external_id.clone(),
            transport,
            signer,
            store,
            credential: Mutex::new(credential),
            refresh_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Serialize refreshes with every other manager holding the same lock.
    pub fn with_refresh_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.refresh_lock = lock;
        self
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub async fn credential(&self) -> IntegrationCredential {
        self.credential.lock().await.clone()
    }

    /// Return a usable installation token, refreshing first when needed.
    ///
    /// A valid token is returned without any network call. After a refresh
    /// the new token and expiry are persisted together. If persisting fails
    /// the fresh token is still returned, but it is not kept in memory, so
    /// the next call refreshes (and tries to persist) again.
    pub async fn get_token(&self, force_refresh: bool) -> Result<String> {
        let mut current = self.credential.lock().await;

        if !force_refresh {
            if let Some(token) = usable_token(&current) {
                return Ok(token);
            }
        }

        let _refresh = self.refresh_lock.lock().await;

        if !force_refresh {
            if let Some(token) = self.adopt_stored_token(&mut current).await {
                return Ok(token);
            }
        }

        debug!(
            integration_id = %current.integration_id,
            force_refresh,
            "Refreshing installation token"
        );
        let refreshed = self.refresh(&current).await?;
        let token = refreshed.access_token.clone().unwrap_or_default();

        match self.store.save(&refreshed).await {
            Ok(()) => {
                info!(
                    integration_id = %refreshed.integration_id,
                    expires_at = refreshed.expires_at.as_deref().unwrap_or_default(),
                    "Installation token refreshed"
                );
                *current = refreshed;
            }
            Err(e) => {
                warn!(
                    integration_id = %refreshed.integration_id,
                    error = %e,
                    "Installation token refreshed but could not be persisted; it will be refreshed again on next use"
                );
            }
        }

        Ok(token)
    }

    /// Force a refresh and persist it. Unlike [`TokenManager::get_token`],
    /// a failed save is returned as an error.
    pub async fn refresh_and_persist(&self) -> Result<IntegrationCredential> {
        let mut current = self.credential.lock().await;
        let _refresh = self.refresh_lock.lock().await;

        let refreshed = self.refresh(&current).await?;
        self.store.save(&refreshed).await.map_err(|e| {
            GitHubError::Internal(e.context("Installation token refreshed but could not be persisted"))
        })?;

        info!(
            integration_id = %refreshed.integration_id,
            expires_at = refreshed.expires_at.as_deref().unwrap_or_default(),
            "Installation token refreshed"
        );
        *current = refreshed.clone();
        Ok(refreshed)
    }

    /// Pick up a token another manager persisted while this one waited.
    async fn adopt_stored_token(&self, current: &mut IntegrationCredential) -> Option<String> {
        match self.store.load(&current.integration_id).await {
            Ok(stored) => {
                let token = usable_token(&stored)?;
                debug!(
                    integration_id = %stored.integration_id,
                    "Reusing installation token refreshed concurrently"
                );
                *current = stored;
                Some(token)
            }
            Err(e) => {
                debug!(
                    integration_id = %current.integration_id,
                    error = %e,
                    "Could not re-read stored credential before refresh"
                );
                None
            }
        }
    }

    /// Exchange an app JWT for a new installation token and return the
    /// updated credential. Nothing is persisted here.
    pub async fn refresh(&self, credential: &IntegrationCredential) -> Result<IntegrationCredential> {
        let issued = self.create_token().await?;
        let expires_at = parse_token_expiry(&issued.expires_at)?;
        Ok(credential.with_token(issued.token, expires_at))
    }

    async fn create_token(&self) -> Result<InstallationToken> {
        let jwt = self
            .signer
            .sign()
            .map_err(|e| GitHubError::Authentication(format!("{:#}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", jwt))
                .map_err(|e| GitHubError::Authentication(e.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));

        let response = self
            .transport
            .send(
                Method::POST,
                &token_exchange_path(&self.external_id),
                headers,
                None,
                &[],
            )
            .await
            .map_err(|failure| GitHubError::Authentication(failure.to_string()))?;

        serde_json::from_value(response.body).map_err(|e| {
            GitHubError::Authentication(format!("Unexpected token exchange response: {}", e))
        })
    }
}

fn usable_token(credential: &IntegrationCredential) -> Option<String> {
    if credential.is_valid(Utc::now()) {
        credential.access_token.clone()
    } else {
        None
    }
}

fn parse_token_expiry(value: &str) -> Result<DateTime<Utc>> {
    parse_expiry(value).ok_or_else(|| {
        GitHubError::Authentication(format!("Unparseable token expiry: {}", value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::testing::{
        github_config, issued_token, stale_credential, valid_credential, MemoryCredentialStore,
    };
    use chrono::Duration;
    use serde_json::json;
    use wiremock::matchers::{header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(
        server: &MockServer,
        credential: IntegrationCredential,
        store: Arc<MemoryCredentialStore>,
    ) -> TokenManager {
        let config = github_config(&server.uri());
        let transport = HttpTransport::new(&config, true).unwrap();
        TokenManager::new(credential, transport, store, config.jwt_ttl_secs).unwrap()
    }

    async fn mount_exchange(server: &MockServer, token: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .and(header_regex("authorization", r"^Bearer [\w-]+\.[\w-]+\.[\w-]+$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(issued_token(token)))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_token_exchange_path() {
        let credential = IntegrationCredential {
            external_id: "42".into(),
            ..valid_credential("x")
        };
        assert_eq!(
            token_exchange_path(&credential.external_id),
            "/app/installations/42/access_tokens"
        );
    }

    #[tokio::test]
    async fn test_valid_token_makes_no_network_calls() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 0).await;

        let store = Arc::new(MemoryCredentialStore::new(valid_credential("ghs_valid")));
        let tokens = manager(&server, valid_credential("ghs_valid"), store.clone());

        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_valid");
        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_valid");
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 1).await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let tokens = manager(&server, stale, store.clone());

        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_new");
        // The refreshed token is now valid and reused.
        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_new");

        assert_eq!(store.save_count(), 1);
        let saved = store.current();
        assert_eq!(saved.access_token.as_deref(), Some("ghs_new"));
        assert!(saved.is_valid(Utc::now()));
    }

    #[tokio::test]
    async fn test_missing_token_or_expiry_refreshes() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 3).await;

        let mut no_token = valid_credential("ghs_valid");
        no_token.access_token = None;
        let mut no_expiry = valid_credential("ghs_valid");
        no_expiry.expires_at = None;
        let mut garbage_expiry = valid_credential("ghs_valid");
        garbage_expiry.expires_at = Some("next tuesday".into());

        for credential in [no_token, no_expiry, garbage_expiry] {
            let store = Arc::new(MemoryCredentialStore::new(credential.clone()));
            let tokens = manager(&server, credential, store);
            assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_new");
        }
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_valid_expiry() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_forced", 1).await;

        let store = Arc::new(MemoryCredentialStore::new(valid_credential("ghs_valid")));
        let tokens = manager(&server, valid_credential("ghs_valid"), store.clone());

        assert_eq!(tokens.get_token(true).await.unwrap(), "ghs_forced");
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_exchange_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"message": "A JSON web token could not be decoded"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let tokens = manager(&server, stale, store.clone());

        let err = tokens.get_token(false).await.unwrap_err();
        assert!(matches!(err, GitHubError::Authentication(_)));
        assert!(err.to_string().contains("could not be decoded"));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_exchange_response_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"token": "ghs_x", "expires_at": "soon"})),
            )
            .mount(&server)
            .await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let tokens = manager(&server, stale, store);

        let err = tokens.get_token(false).await.unwrap_err();
        assert!(matches!(err, GitHubError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_persist_failure_still_returns_token_but_refreshes_next_time() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_unsaved", 2).await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        store.fail_saves(true);
        let tokens = manager(&server, stale, store.clone());

        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_unsaved");
        assert_eq!(tokens.get_token(false).await.unwrap(), "ghs_unsaved");
        assert!(!tokens.credential().await.is_valid(Utc::now()));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 1).await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let tokens = Arc::new(manager(&server, stale, store.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.get_token(false).await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "ghs_new");
        }
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_managers_sharing_a_lock_refresh_once() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 1).await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let locks = RefreshLocks::new();

        // A fresh manager per caller, as each request builds its own client.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tokens = manager(&server, stale.clone(), store.clone())
                    .with_refresh_lock(locks.for_integration(&stale.integration_id));
                tokio::spawn(async move { tokens.get_token(false).await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "ghs_new");
        }
        assert_eq!(store.save_count(), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_refresh_locks_are_per_integration() {
        let locks = RefreshLocks::new();
        let a = locks.for_integration("int-1");
        assert!(Arc::ptr_eq(&a, &locks.for_integration("int-1")));
        assert!(!Arc::ptr_eq(&a, &locks.for_integration("int-2")));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_and_persist_reports_save_failure() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_unsaved", 1).await;

        let store = Arc::new(MemoryCredentialStore::new(valid_credential("ghs_old")));
        store.fail_saves(true);
        let tokens = manager(&server, valid_credential("ghs_old"), store.clone());

        let err = tokens.refresh_and_persist().await.unwrap_err();
        assert!(matches!(err, GitHubError::Internal(_)));
        assert_eq!(store.save_count(), 0);
        assert_eq!(
            tokens.credential().await.access_token.as_deref(),
            Some("ghs_old")
        );
    }

    #[tokio::test]
    async fn test_refresh_and_persist_saves_new_token() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_forced", 1).await;

        let store = Arc::new(MemoryCredentialStore::new(valid_credential("ghs_old")));
        let tokens = manager(&server, valid_credential("ghs_old"), store.clone());

        let refreshed = tokens.refresh_and_persist().await.unwrap();
        assert_eq!(refreshed.access_token.as_deref(), Some("ghs_forced"));
        assert_eq!(store.current().access_token.as_deref(), Some("ghs_forced"));
        assert_eq!(
            tokens.credential().await.access_token.as_deref(),
            Some("ghs_forced")
        );
    }

    #[tokio::test]
    async fn test_refresh_keeps_identity_and_key() {
        let server = MockServer::start().await;
        mount_exchange(&server, "ghs_new", 1).await;

        let stale = stale_credential();
        let store = Arc::new(MemoryCredentialStore::new(stale.clone()));
        let tokens = manager(&server, stale.clone(), store);

        let refreshed = tokens.refresh(&stale).await.unwrap();
        assert_eq!(refreshed.external_id, stale.external_id);
        assert_eq!(refreshed.private_key, stale.private_key);
        assert!(refreshed.expiry().unwrap() > Utc::now() + Duration::minutes(30));
    }
}
