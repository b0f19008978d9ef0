//! GitHub REST client for installation-scoped operations.
//!
//! Every call is authenticated with the installation access token handed
//! out by [`TokenManager`]; callers that pass explicit headers bypass the
//! token lookup entirely. Commit, compare and file-check calls go through
//! the shared [`ResponseCache`].

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::cache::{cache_key, ResponseCache};
use super::credential::{CredentialStore, IntegrationCredential};
use super::error::{ApiFailure, GitHubError, Result};
use super::models::{
    Commit, Comparison, Hook, InstallationRepositories, Issue, IssueComment, NewComment, NewIssue,
    Repository, SearchResults, User,
};
use super::token_manager::TokenManager;
use crate::config::GitHubConfig;

/// Media type for the installation API.
pub const GITHUB_ACCEPT: &str = "application/vnd.github.machine-man-preview+json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A successful response. `body` is `Null` for empty bodies and HEAD requests.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .context("Failed to parse GitHub API response")
            .map_err(GitHubError::Internal)
    }
}

/// Raw HTTP plumbing shared by the client and the token exchange.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &GitHubConfig, verify_ssl: bool) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one request. Non-2xx statuses and transport errors both come
    /// back as [`ApiFailure`].
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        data: Option<&Value>,
        params: &[(&str, &str)],
    ) -> std::result::Result<ApiResponse, ApiFailure> {
        let url = self.url(path);
        let is_head = method == Method::HEAD;

        let mut request = self.http.request(method, &url).headers(headers);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(data) = data {
            request = request.json(data);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiFailure::transport(&url, &e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        debug!(status = status.as_u16(), url = %final_url, "GitHub API response");

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiFailure::from_response(status.as_u16(), final_url, text));
        }

        if is_head {
            return Ok(ApiResponse {
                status: status.as_u16(),
                body: Value::Null,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ApiFailure::transport(&final_url, &e))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

pub struct GitHubAppsClient {
    transport: HttpTransport,
    tokens: TokenManager,
    cache: Arc<ResponseCache>,
    page_size: u32,
}

impl GitHubAppsClient {
    pub fn new(
        config: &GitHubConfig,
        credential: IntegrationCredential,
        store: Arc<dyn CredentialStore>,
        cache: Arc<ResponseCache>,
    ) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(config, credential.verify_ssl)?;
        let tokens = TokenManager::new(credential, transport.clone(), store, config.jwt_ttl_secs)?;

        Ok(Self {
            transport,
            tokens,
            cache,
            page_size: config.repositories_page_size,
        })
    }

    /// Share token refreshes with every other client of the same integration.
    pub fn with_refresh_lock(mut self, lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.tokens = self.tokens.with_refresh_lock(lock);
        self
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn get_token(&self, force_refresh: bool) -> Result<String> {
        self.tokens.get_token(force_refresh).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        data: Option<&Value>,
        params: &[(&str, &str)],
    ) -> Result<ApiResponse> {
        let headers = match headers {
            Some(headers) => headers,
            None => self.default_headers().await?,
        };
        Ok(self.transport.send(method, path, headers, data, params).await?)
    }

    async fn default_headers(&self) -> Result<HeaderMap> {
        let token = self.tokens.get_token(false).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}", token))
                .context("Installation token is not a valid header value")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        Ok(headers)
    }

    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        self.request(Method::GET, path, None, None, params).await
    }

    pub async fn post<B: Serialize>(&self, path: &str, data: &B) -> Result<ApiResponse> {
        let data = serde_json::to_value(data).context("Failed to encode request body")?;
        self.request(Method::POST, path, None, Some(&data), &[]).await
    }

    pub async fn head(&self, path: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        self.request(Method::HEAD, path, None, None, params).await
    }

    pub async fn get_cached(&self, path: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        self.cached(Method::GET, path, params).await
    }

    pub async fn head_cached(&self, path: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        self.cached(Method::HEAD, path, params).await
    }

    async fn cached(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<ApiResponse> {
        let key = cache_key(self.tokens.external_id(), method.as_str(), path, params);
        if let Some(hit) = self.cache.get(&key) {
            debug!(path, "GitHub response served from cache");
            return Ok(hit);
        }

        let response = self.request(method, path, None, None, params).await?;
        self.cache.insert(key, response.clone());
        Ok(response)
    }

    // ---------------------------------------------------------------------
    // Repositories
    // ---------------------------------------------------------------------

    /// Repositories the installation can access, minus archived ones.
    pub async fn get_repositories(&self) -> Result<Vec<Repository>> {
        let per_page = self.page_size.to_string();
        let page: InstallationRepositories = self
            .get("/installation/repositories", &[("per_page", &per_page)])
            .await?
            .json()?;

        Ok(page
            .repositories
            .into_iter()
            .filter(|repo| !repo.archived)
            .collect())
    }

    pub async fn search_repositories(&self, query: &str) -> Result<SearchResults<Repository>> {
        self.get("/search/repositories", &[("q", query)]).await?.json()
    }

    pub async fn get_repo(&self, repo: &str) -> Result<Repository> {
        self.get(&format!("/repos/{}", repo), &[]).await?.json()
    }

    pub async fn repo_hooks(&self, repo: &str) -> Result<Vec<Hook>> {
        self.get(&format!("/repos/{}/hooks", repo), &[]).await?.json()
    }

    /// HEAD check for a file at `version`; succeeds only if it exists.
    pub async fn check_file(&self, repo: &str, path: &str, version: &str) -> Result<ApiResponse> {
        self.head_cached(
            &format!("/repos/{}/contents/{}", repo, path.trim_start_matches('/')),
            &[("ref", version)],
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Commits
    // ---------------------------------------------------------------------

    pub async fn get_commits(&self, repo: &str) -> Result<Vec<Commit>> {
        self.get(&format!("/repos/{}/commits", repo), &[]).await?.json()
    }

    /// The ~30 commits leading up to `end_sha`.
    pub async fn get_last_commits(&self, repo: &str, end_sha: &str) -> Result<Vec<Commit>> {
        self.get_cached(&format!("/repos/{}/commits", repo), &[("sha", end_sha)])
            .await?
            .json()
    }

    pub async fn get_commit(&self, repo: &str, sha: &str) -> Result<Commit> {
        self.get_cached(&format!("/repos/{}/commits/{}", repo, sha), &[])
            .await?
            .json()
    }

    /// `start_sha` is the oldest commit, `end_sha` the most recent.
    pub async fn compare_commits(
        &self,
        repo: &str,
        start_sha: &str,
        end_sha: &str,
    ) -> Result<Comparison> {
        self.get_cached(
            &format!("/repos/{}/compare/{}...{}", repo, start_sha, end_sha),
            &[],
        )
        .await?
        .json()
    }

    // ---------------------------------------------------------------------
    // Issues
    // ---------------------------------------------------------------------

    pub async fn get_assignees(&self, repo: &str) -> Result<Vec<User>> {
        self.get(&format!("/repos/{}/assignees", repo), &[]).await?.json()
    }

    pub async fn get_issues(&self, repo: &str) -> Result<Vec<Issue>> {
        self.get(&format!("/repos/{}/issues", repo), &[]).await?.json()
    }

    pub async fn search_issues(&self, query: &str) -> Result<SearchResults<Issue>> {
        self.get("/search/issues", &[("q", query)]).await?.json()
    }

    pub async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        self.get(&format!("/repos/{}/issues/{}", repo, number), &[])
            .await?
            .json()
    }

    pub async fn create_issue(&self, repo: &str, data: &NewIssue) -> Result<Issue> {
        self.post(&format!("/repos/{}/issues", repo), data)
            .await?
            .json()
    }

    pub async fn create_comment(
        &self,
        repo: &str,
        issue_id: u64,
        data: &NewComment,
    ) -> Result<IssueComment> {
        self.post(&format!("/repos/{}/issues/{}/comments", repo, issue_id), data)
            .await?
            .json()
    }

    pub async fn get_user(&self, login: &str) -> Result<User> {
        self.get(&format!("/users/{}", login), &[]).await?.json()
    }
}
