//! SQLite-backed credential store.
//!
//! Credentials are read out of the integration's GitHub metadata. Saving
//! rewrites `access_token` and `expires_at` in one `json_set` statement so
//! the pair never gets out of step.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{DbPool, Integration};
use crate::crypto::SecretBox;
use crate::github::{CredentialStore, IntegrationCredential};

#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    db: DbPool,
    secrets: SecretBox,
}

impl SqliteCredentialStore {
    pub fn new(db: DbPool, secrets: SecretBox) -> Self {
        Self { db, secrets }
    }

    /// Build a credential from an already-loaded integration row.
    pub fn credential_for(&self, integration: &Integration) -> Result<IntegrationCredential> {
        let metadata = integration.github_metadata()?;
        let private_key = self
            .secrets
            .open(&metadata.installation.private_key)
            .context("Failed to decrypt GitHub App private key")?;
        let access_token = metadata
            .access_token
            .as_deref()
            .map(|token| self.secrets.open(token))
            .transpose()
            .context("Failed to decrypt installation access token")?;

        Ok(IntegrationCredential {
            integration_id: integration.id.clone(),
            external_id: integration.external_id.clone(),
            app_id: metadata.installation.id,
            private_key,
            access_token,
            expires_at: metadata.expires_at,
            verify_ssl: metadata.installation.verify_ssl,
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, integration_id: &str) -> Result<IntegrationCredential> {
        let integration = Integration::find(&self.db, integration_id)
            .await?
            .with_context(|| format!("Integration {} not found", integration_id))?;
        self.credential_for(&integration)
    }

    async fn save(&self, credential: &IntegrationCredential) -> Result<()> {
        let sealed_token = credential
            .access_token
            .as_deref()
            .map(|token| self.secrets.seal(token))
            .transpose()?;
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET metadata = json_set(metadata, '$.access_token', ?, '$.expires_at', ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(sealed_token)
        .bind(&credential.expires_at)
        .bind(&now)
        .bind(&credential.integration_id)
        .execute(&self.db)
        .await
        .context("Failed to persist installation token")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Integration {} not found", credential.integration_id);
        }
        Ok(())
    }
}
