//! GitHub App integration.
//!
//! This module provides:
//! - JWT signing for app-level authentication
//! - Installation access token management
//! - A REST client for installation-scoped operations
//! - Installation setup and repository linking

pub mod cache;
pub mod client;
pub mod credential;
pub mod error;
pub mod integration;
pub mod jwt;
pub mod models;
pub mod provider;
pub mod token_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{spawn_purge_task, ResponseCache};
pub use client::{ApiResponse, GitHubAppsClient, HttpTransport};
pub use credential::{CredentialStore, IntegrationCredential};
pub use error::{ApiFailure, GitHubError};
pub use integration::{classify_error, GitHubIntegration, RepositoryRef};
pub use provider::{GitHubIntegrationProvider, InstallState};
pub use token_manager::{RefreshLocks, TokenManager};
