//! Installation-level operations on top of [`GitHubAppsClient`].
//!
//! Also owns the translation of GitHub failures into messages that can be
//! shown to whoever triggered the call.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::client::GitHubAppsClient;
use super::error::{GitHubError, Result};
use super::models::{Issue, SearchResults};
use crate::db::{self, DbPool, GitHubMetadata, Integration, LEGACY_GITHUB_PROVIDER};

pub const ERR_UNAUTHORIZED: &str =
    "Unauthorized: either your access token was invalid or you do not have access";
pub const ERR_INTERNAL: &str = "An internal error occurred with the integration";

const ERR_NOT_FOUND: &str = "If this repository exists, ensure that your installation has \
     permission to access this repository (https://github.com/settings/installations).";

lazy_static! {
    static ref COMMIT_PATH: Regex = Regex::new(r"/repos/.*/(compare|commits)").unwrap();
}

fn guidance_for(code: u16) -> Option<&'static str> {
    match code {
        404 => Some(ERR_NOT_FOUND),
        401 => Some(ERR_UNAUTHORIZED),
        _ => None,
    }
}

/// Turn a failure into a user-facing message. Never fails.
pub fn classify_error(err: &GitHubError) -> String {
    let Some(failure) = err.as_api_failure() else {
        return ERR_INTERNAL.to_string();
    };

    let message = match failure.code.and_then(guidance_for) {
        Some(guidance) if failure.code == Some(404) && COMMIT_PATH.is_match(&failure.url) => {
            format!(
                "{} Please also confirm that the commits associated with the following URL have been pushed to GitHub: {}",
                guidance, failure.url
            )
        }
        Some(guidance) => guidance.to_string(),
        None => failure.message().unwrap_or("unknown error").to_string(),
    };

    match failure.code {
        Some(code) => format!("Error Communicating with GitHub (HTTP {}): {}", code, message),
        None => format!("Error Communicating with GitHub: {}", message),
    }
}

/// Search qualifier scoping a repository search to the installation's account.
pub fn build_repository_query(is_user_account: bool, account: &str, query: &str) -> String {
    let qualifier = if is_user_account { "user" } else { "org" };
    format!("{}:{} {}", qualifier, account, query)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRef {
    pub name: String,
    /// Fully-qualified name, e.g. "acme/api"
    pub identifier: String,
}

impl From<super::models::Repository> for RepositoryRef {
    fn from(repo: super::models::Repository) -> Self {
        Self {
            name: repo.name,
            identifier: repo.full_name,
        }
    }
}

/// Recorded repositories whose identifier is not in `accessible`.
pub fn unmigratable(
    existing: Vec<db::Repository>,
    accessible: &[RepositoryRef],
) -> Vec<db::Repository> {
    let accessible: HashSet<&str> = accessible.iter().map(|r| r.identifier.as_str()).collect();
    existing
        .into_iter()
        .filter(|repo| !accessible.contains(repo.name.as_str()))
        .collect()
}

pub struct GitHubIntegration {
    model: Integration,
    metadata: GitHubMetadata,
    organization_id: i64,
    client: GitHubAppsClient,
    web_url: String,
}

impl GitHubIntegration {
    pub fn new(
        model: Integration,
        organization_id: i64,
        client: GitHubAppsClient,
        web_url: &str,
    ) -> anyhow::Result<Self> {
        let metadata = model.github_metadata()?;
        Ok(Self {
            model,
            metadata,
            organization_id,
            client,
            web_url: web_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &Integration {
        &self.model
    }

    pub fn organization_id(&self) -> i64 {
        self.organization_id
    }

    pub fn client(&self) -> &GitHubAppsClient {
        &self.client
    }

    /// All accessible non-archived repositories, or the search matches
    /// within the installation's account when `query` is non-empty.
    pub async fn list_repositories(&self, query: Option<&str>) -> Result<Vec<RepositoryRef>> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let Some(query) = query else {
            let repos = self.client.get_repositories().await?;
            return Ok(repos.into_iter().map(RepositoryRef::from).collect());
        };

        let full_query =
            build_repository_query(self.metadata.is_user_account(), &self.model.name, query);
        let results = self.client.search_repositories(&full_query).await?;
        Ok(results.items.into_iter().map(RepositoryRef::from).collect())
    }

    pub async fn search_issues(&self, query: &str) -> Result<SearchResults<Issue>> {
        self.client.search_issues(query).await
    }

    /// Browser URL of a file. The existence check is a HEAD request, so
    /// there is no response URL to reuse.
    pub fn format_source_url(&self, repo: &str, filepath: &str, branch: &str) -> String {
        format!(
            "{}/{}/blob/{}/{}",
            self.web_url,
            repo,
            branch,
            filepath.trim_start_matches('/')
        )
    }

    /// Link to `filepath` at `version` if it exists there, else at
    /// `default_branch`.
    pub async fn get_stacktrace_link(
        &self,
        repo: &str,
        filepath: &str,
        default_branch: &str,
        version: Option<&str>,
    ) -> Option<String> {
        let refs = version
            .into_iter()
            .filter(|v| !v.is_empty())
            .chain(std::iter::once(default_branch));

        for git_ref in refs {
            match self.client.check_file(repo, filepath, git_ref).await {
                Ok(_) => return Some(self.format_source_url(repo, filepath, git_ref)),
                Err(e) => debug!(repo, filepath, git_ref, error = %e, "File not found at ref"),
            }
        }
        None
    }

    /// Legacy-provider repositories of the organization that this
    /// installation cannot see.
    pub async fn find_unmigratable_repositories(
        &self,
        db: &DbPool,
    ) -> Result<Vec<db::Repository>> {
        let accessible = self.list_repositories(None).await?;
        let existing =
            db::Repository::list_for_provider(db, self.organization_id, LEGACY_GITHUB_PROVIDER)
                .await
                .map_err(|e| GitHubError::Internal(e.into()))?;
        Ok(unmigratable(existing, &accessible))
    }

    /// Whether the installation can reach `repo`. Requests the hooks
    /// endpoint, which the app is granted explicitly; commits would also
    /// answer for public repositories.
    pub async fn check_repo_access(&self, repo: &str) -> bool {
        match self.client.repo_hooks(repo).await {
            Ok(_) => true,
            Err(GitHubError::Api(failure)) => {
                debug!(repo, error = %failure, "Installation has no access to repository");
                false
            }
            Err(e) => {
                warn!(repo, error = %e, "Repository access check failed");
                false
            }
        }
    }
}
