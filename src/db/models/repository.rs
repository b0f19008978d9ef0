//! Repositories recorded for an organization.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Provider of repositories added before the GitHub App integration existed.
pub const LEGACY_GITHUB_PROVIDER: &str = "github";
pub const INTEGRATION_GITHUB_PROVIDER: &str = "integrations:github";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: i64,
    pub organization_id: i64,
    /// Fully-qualified name, e.g. "acme/api"
    pub name: String,
    pub provider: Option<String>,
    pub external_id: Option<String>,
    pub integration_id: Option<String>,
    pub url: Option<String>,
    pub created_at: String,
}

impl Repository {
    pub async fn create(
        db: &SqlitePool,
        organization_id: i64,
        name: &str,
        provider: &str,
        integration_id: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO repositories (organization_id, name, provider, integration_id, url)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(organization_id)
        .bind(name)
        .bind(provider)
        .bind(integration_id)
        .bind(format!("https://github.com/{}", name))
        .fetch_one(db)
        .await
    }

    pub async fn list_for_provider(
        db: &SqlitePool,
        organization_id: i64,
        provider: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM repositories WHERE organization_id = ? AND provider = ? ORDER BY name ASC",
        )
        .bind(organization_id)
        .bind(provider)
        .fetch_all(db)
        .await
    }

    /// GitHub repositories of the organization not yet attached to any
    /// integration, under either provider name.
    pub async fn list_unlinked_github(
        db: &SqlitePool,
        organization_id: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM repositories
            WHERE organization_id = ?
              AND provider IN (?, ?)
              AND integration_id IS NULL
            ORDER BY name ASC
            "#,
        )
        .bind(organization_id)
        .bind(LEGACY_GITHUB_PROVIDER)
        .bind(INTEGRATION_GITHUB_PROVIDER)
        .fetch_all(db)
        .await
    }

    /// Attach the repository to an integration and move it to the
    /// integration provider.
    pub async fn link_integration(
        db: &SqlitePool,
        id: i64,
        integration_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE repositories SET integration_id = ?, provider = ? WHERE id = ?")
            .bind(integration_id)
            .bind(INTEGRATION_GITHUB_PROVIDER)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, Organization};

    #[tokio::test]
    async fn test_list_unlinked_covers_both_providers() {
        let pool = db::in_memory().await.unwrap();
        let org = Organization::create(&pool, "acme", "Acme").await.unwrap();
        let other = Organization::create(&pool, "other", "Other").await.unwrap();

        Repository::create(&pool, org.id, "acme/legacy", LEGACY_GITHUB_PROVIDER, None)
            .await
            .unwrap();
        Repository::create(&pool, org.id, "acme/api", INTEGRATION_GITHUB_PROVIDER, None)
            .await
            .unwrap();
        Repository::create(&pool, org.id, "acme/gitlab", "gitlab", None)
            .await
            .unwrap();
        Repository::create(&pool, other.id, "other/repo", LEGACY_GITHUB_PROVIDER, None)
            .await
            .unwrap();

        let unlinked = Repository::list_unlinked_github(&pool, org.id).await.unwrap();
        let names: Vec<_> = unlinked.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["acme/api", "acme/legacy"]);
    }

    #[tokio::test]
    async fn test_link_integration_moves_provider() {
        let pool = db::in_memory().await.unwrap();
        let org = Organization::create(&pool, "acme", "Acme").await.unwrap();
        let repo = Repository::create(&pool, org.id, "acme/api", LEGACY_GITHUB_PROVIDER, None)
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO integrations (id, provider, external_id, name, created_at, updated_at) VALUES ('int-1', 'github', '42', 'acme', '', '')",
        )
        .execute(&pool)
        .await
        .unwrap();
        Repository::link_integration(&pool, repo.id, "int-1").await.unwrap();

        assert!(Repository::list_unlinked_github(&pool, org.id)
            .await
            .unwrap()
            .is_empty());
        let linked = Repository::list_for_provider(&pool, org.id, INTEGRATION_GITHUB_PROVIDER)
            .await
            .unwrap();
        assert_eq!(linked[0].integration_id.as_deref(), Some("int-1"));
    }
}
