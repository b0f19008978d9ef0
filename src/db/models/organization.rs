//! Organization model.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub created_at: String,
}

impl Organization {
    pub async fn create(db: &SqlitePool, slug: &str, name: &str) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO organizations (slug, name)
            VALUES (?, ?)
            RETURNING id, slug, name, created_at
            "#,
        )
        .bind(slug)
        .bind(name)
        .fetch_one(db)
        .await
    }

    pub async fn find_by_slug(db: &SqlitePool, slug: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT id, slug, name, created_at FROM organizations WHERE slug = ?")
            .bind(slug)
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT id, slug, name, created_at FROM organizations ORDER BY slug ASC")
            .fetch_all(db)
            .await
    }
}
