//! Installing the GitHub App for an organization.
//!
//! The flow is: the user submits the app configuration, GitHub redirects
//! back with an installation id, we look the installation up with an app
//! JWT, store the integration and finally attach the organization's
//! existing GitHub repositories to it.

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::cache::ResponseCache;
use super::client::{GitHubAppsClient, HttpTransport, GITHUB_ACCEPT};
use super::error::{GitHubError, Result};
use super::integration::GitHubIntegration;
use super::jwt::AppJwtSigner;
use super::models::Installation;
use super::token_manager::RefreshLocks;
use crate::config::GitHubConfig;
use crate::crypto::SecretBox;
use crate::db::{
    self, DbPool, InstallationData, Integration, NewIntegration, SqliteCredentialStore,
    GITHUB_PROVIDER,
};

lazy_static! {
    static ref NON_SLUG_CHARS: Regex = Regex::new(r"[^\w\s-]").unwrap();
    static ref SLUG_SEPARATORS: Regex = Regex::new(r"[-\s]+").unwrap();
}

/// Lowercase, ASCII-only, hyphen-separated form of `value`, as GitHub uses
/// for app URLs.
pub fn slugify(value: &str) -> String {
    let ascii: String = value.chars().filter(char::is_ascii).collect();
    let cleaned = NON_SLUG_CHARS.replace_all(&ascii, "").to_lowercase();
    SLUG_SEPARATORS
        .replace_all(cleaned.trim(), "-")
        .trim_matches('-')
        .to_string()
}

/// What the install callback submits.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallState {
    pub installation_id: String,
    pub installation: InstallationData,
    /// Existing integration to move onto this installation
    #[serde(default)]
    pub reinstall_id: Option<String>,
}

#[derive(Clone)]
pub struct GitHubIntegrationProvider {
    config: GitHubConfig,
    secrets: SecretBox,
}

impl GitHubIntegrationProvider {
    pub fn new(config: GitHubConfig, secrets: SecretBox) -> Self {
        Self { config, secrets }
    }

    /// Page that starts the installation on GitHub.
    pub fn get_app_url(&self) -> anyhow::Result<String> {
        let name = self
            .config
            .app_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("github.app_name is not configured"))?;
        Ok(format!(
            "{}/apps/{}",
            self.config.web_url.trim_end_matches('/'),
            slugify(name)
        ))
    }

    /// Look up an installation, authenticating as the app itself.
    pub async fn get_installation_info(
        &self,
        installation_id: &str,
        app: &InstallationData,
    ) -> Result<Installation> {
        let signer = AppJwtSigner::new(app.id.clone(), &app.private_key, self.config.jwt_ttl_secs)?;
        let jwt = signer.sign()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", jwt))
                .map_err(|e| GitHubError::Internal(e.into()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));

        let transport = HttpTransport::new(&self.config, app.verify_ssl)?;
        let response = transport
            .send(
                Method::GET,
                &format!("/app/installations/{}", installation_id),
                headers,
                None,
                &[],
            )
            .await?;
        response.json()
    }

    /// Fetch the installation and turn it into an integration record.
    pub async fn build_integration(&self, state: &InstallState) -> Result<NewIntegration> {
        let installation = self
            .get_installation_info(&state.installation_id, &state.installation)
            .await?;
        let mut app = state.installation.clone();
        app.private_key = self.secrets.seal(&app.private_key)?;
        Ok(integration_from_installation(
            &installation,
            &state.installation_id,
            app,
        ))
    }

    /// Client-backed view of a stored installation. Token refreshes go
    /// through the integration's entry in `locks`.
    pub fn installation(
        &self,
        model: Integration,
        organization_id: i64,
        store: &SqliteCredentialStore,
        cache: Arc<ResponseCache>,
        locks: &RefreshLocks,
    ) -> anyhow::Result<GitHubIntegration> {
        let credential = store.credential_for(&model)?;
        let client =
            GitHubAppsClient::new(&self.config, credential, Arc::new(store.clone()), cache)?
                .with_refresh_lock(locks.for_integration(&model.id));
        GitHubIntegration::new(model, organization_id, client, &self.config.web_url)
    }

    /// Attach the organization's unlinked GitHub repositories to a freshly
    /// installed integration. Repositories the installation cannot reach
    /// are left alone. Returns the number linked.
    pub async fn post_install(&self, db: &DbPool, installation: &GitHubIntegration) -> Result<usize> {
        let integration_id = installation.model().id.clone();
        let organization_id = installation.organization_id();
        let candidates = db::Repository::list_unlinked_github(db, organization_id)
            .await
            .map_err(|e| GitHubError::Internal(e.into()))?;

        let mut linked = 0;
        for repo in candidates {
            if !installation.check_repo_access(&repo.name).await {
                warn!(
                    repository = %repo.name,
                    integration_id = %integration_id,
                    "Installation cannot access repository, leaving it unlinked"
                );
                continue;
            }
            db::Repository::link_integration(db, repo.id, &integration_id)
                .await
                .map_err(|e| GitHubError::Internal(e.into()))?;
            linked += 1;
        }

        info!(
            integration_id = %integration_id,
            organization_id,
            linked,
            "Linked existing repositories to GitHub installation"
        );
        Ok(linked)
    }
}

fn integration_from_installation(
    installation: &Installation,
    installation_id: &str,
    app: InstallationData,
) -> NewIntegration {
    let account = &installation.account;
    NewIntegration {
        provider: GITHUB_PROVIDER.to_string(),
        external_id: installation.id.to_string(),
        idp_external_id: Some(installation.app_id.to_string()),
        name: account.login.clone(),
        metadata: json!({
            "access_token": null,
            "expires_at": null,
            "icon": account.avatar_url,
            "domain_name": account.html_url.trim_start_matches("https://"),
            "account_type": account.account_type,
            "installation_id": installation_id,
            "installation": app,
        }),
    }
}
