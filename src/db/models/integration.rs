//! Integration models.
//!
//! Provider-specific state is kept as a JSON document in `metadata`; for
//! GitHub that is [`GitHubMetadata`], which also carries the installation
//! access token once one has been issued.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const GITHUB_PROVIDER: &str = "github";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Integration {
    /// Internal UUID
    pub id: String,
    pub provider: String,
    /// Installation id on the provider's side
    pub external_id: String,
    /// Identity on the provider's side; for GitHub the app id, since the
    /// identity belongs to the app rather than the installation
    pub idp_external_id: Option<String>,
    /// Account login the app was installed on
    pub name: String,
    /// JSON-encoded provider metadata
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubMetadata {
    /// Populated on first API use
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
    /// "User" or "Organization"
    pub account_type: String,
    pub installation_id: String,
    pub installation: InstallationData,
}

impl GitHubMetadata {
    pub fn is_user_account(&self) -> bool {
        self.account_type == "User"
    }
}

/// App configuration submitted when the integration was installed.
#[derive(Clone, Serialize, Deserialize)]
pub struct InstallationData {
    /// GitHub App id
    pub id: String,
    pub name: String,
    /// PEM private key (sealed when encryption is configured)
    pub private_key: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_verify_ssl() -> bool {
    true
}

impl std::fmt::Debug for InstallationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("verify_ssl", &self.verify_ssl)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Response DTO that excludes credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResponse {
    pub id: String,
    pub provider: String,
    pub external_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub domain_name: Option<String>,
    pub account_type: Option<String>,
    pub created_at: String,
}

impl From<Integration> for IntegrationResponse {
    fn from(integration: Integration) -> Self {
        let metadata = integration.github_metadata().ok();
        Self {
            icon: metadata.as_ref().and_then(|m| m.icon.clone()),
            domain_name: metadata.as_ref().and_then(|m| m.domain_name.clone()),
            account_type: metadata.map(|m| m.account_type),
            id: integration.id,
            provider: integration.provider,
            external_id: integration.external_id,
            name: integration.name,
            created_at: integration.created_at,
        }
    }
}

/// Values for a new or reinstalled integration.
#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub provider: String,
    pub external_id: String,
    pub idp_external_id: Option<String>,
    pub name: String,
    pub metadata: serde_json::Value,
}

impl Integration {
    pub fn github_metadata(&self) -> anyhow::Result<GitHubMetadata> {
        serde_json::from_str(&self.metadata).map_err(|e| {
            anyhow::anyhow!("Integration {} has invalid GitHub metadata: {}", self.id, e)
        })
    }

    pub async fn find(db: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM integrations WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_for_organization(
        db: &SqlitePool,
        organization_id: i64,
        id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT i.* FROM integrations i
            JOIN organization_integrations oi ON oi.integration_id = i.id
            WHERE oi.organization_id = ? AND i.id = ?
            "#,
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(db)
        .await
    }

    /// Insert the integration, or refresh name and metadata when the same
    /// installation is set up again.
    pub async fn upsert(db: &SqlitePool, new: &NewIntegration) -> Result<Self, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query_as(
            r#"
            INSERT INTO integrations (id, provider, external_id, idp_external_id, name, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, external_id) DO UPDATE SET
                idp_external_id = excluded.idp_external_id,
                name = excluded.name,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new.provider)
        .bind(&new.external_id)
        .bind(&new.idp_external_id)
        .bind(&new.name)
        .bind(new.metadata.to_string())
        .bind(&now)
        .bind(&now)
        .fetch_one(db)
        .await
    }

    /// Point an existing integration at a new installation, keeping its id
    /// and links. Returns `None` when no such integration exists for the
    /// provider.
    pub async fn reinstall(
        db: &SqlitePool,
        id: &str,
        new: &NewIntegration,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE integrations SET
                external_id = ?,
                idp_external_id = ?,
                name = ?,
                metadata = ?,
                updated_at = ?
            WHERE id = ? AND provider = ?
            RETURNING *
            "#,
        )
        .bind(&new.external_id)
        .bind(&new.idp_external_id)
        .bind(&new.name)
        .bind(new.metadata.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(id)
        .bind(&new.provider)
        .fetch_optional(db)
        .await
    }

    pub async fn link_organization(
        db: &SqlitePool,
        organization_id: i64,
        integration_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO organization_integrations (organization_id, integration_id) VALUES (?, ?)",
        )
        .bind(organization_id)
        .bind(integration_id)
        .execute(db)
        .await?;
        Ok(())
    }
}
