pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod github;
pub mod outcomes;

pub use db::DbPool;

use config::Config;
use crypto::SecretBox;
use github::{GitHubIntegrationProvider, RefreshLocks, ResponseCache};
use outcomes::AggregationService;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub secrets: SecretBox,
    /// Shared by every installation client; keys are scoped per installation
    pub github_cache: Arc<ResponseCache>,
    /// Serializes installation token refreshes across requests
    pub refresh_locks: RefreshLocks,
    pub provider: GitHubIntegrationProvider,
    pub outcomes: Arc<dyn AggregationService>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, outcomes: Arc<dyn AggregationService>) -> Self {
        let secrets = SecretBox::new(config.auth.encryption_key.as_deref());
        let github_cache = Arc::new(ResponseCache::new(Duration::from_secs(
            config.github.cache_ttl_secs,
        )));
        let provider = GitHubIntegrationProvider::new(config.github.clone(), secrets.clone());

        Self {
            config,
            db,
            secrets,
            github_cache,
            refresh_locks: RefreshLocks::new(),
            provider,
            outcomes,
        }
    }

    pub fn credential_store(&self) -> db::SqliteCredentialStore {
        db::SqliteCredentialStore::new(self.db.clone(), self.secrets.clone())
    }
}
