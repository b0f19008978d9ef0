//! GitHub integration endpoints: installation and installation-scoped
//! lookups.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::error::{ApiError, ValidationErrorBuilder};
use crate::db::{self, Integration, IntegrationResponse, Organization, GITHUB_PROVIDER};
use crate::github::models::{Issue, SearchResults};
use crate::github::{GitHubIntegration, InstallState, RepositoryRef};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StacktraceLinkQuery {
    pub repo: String,
    pub file: String,
    pub default_branch: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StacktraceLinkResponse {
    pub source_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstallResponse {
    pub integration: IntegrationResponse,
    pub linked_repositories: usize,
}

async fn find_organization(state: &AppState, slug: &str) -> Result<Organization, ApiError> {
    Organization::find_by_slug(&state.db, slug)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))
}

async fn load_installation(
    state: &AppState,
    org_slug: &str,
    integration_id: &str,
) -> Result<GitHubIntegration, ApiError> {
    let organization = find_organization(state, org_slug).await?;
    let model = Integration::find_for_organization(&state.db, organization.id, integration_id)
        .await?
        .filter(|i| i.provider == GITHUB_PROVIDER)
        .ok_or_else(|| ApiError::not_found("Integration not found"))?;

    Ok(state.provider.installation(
        model,
        organization.id,
        &state.credential_store(),
        state.github_cache.clone(),
        &state.refresh_locks,
    )?)
}

fn validate_install(state: &InstallState) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if state.installation_id.trim().is_empty() {
        errors.add("installation_id", "Installation id is required");
    }
    if state.installation.id.trim().is_empty() {
        errors.add("installation.id", "GitHub App id is required");
    }
    if !state.installation.private_key.trim_start().starts_with("-----BEGIN") {
        errors.add("installation.private_key", "Private key must be PEM encoded");
    }
    errors.finish()
}

/// Complete a GitHub App installation for an organization.
pub async fn install_github(
    State(state): State<Arc<AppState>>,
    Path(org_slug): Path<String>,
    Json(request): Json<InstallState>,
) -> Result<(StatusCode, Json<InstallResponse>), ApiError> {
    validate_install(&request)?;
    let organization = find_organization(&state, &org_slug).await?;

    if let Some(reinstall_id) = &request.reinstall_id {
        Integration::find_for_organization(&state.db, organization.id, reinstall_id)
            .await?
            .filter(|i| i.provider == GITHUB_PROVIDER)
            .ok_or_else(|| ApiError::not_found("Integration to reinstall not found"))?;
    }

    let new = state.provider.build_integration(&request).await?;
    let model = match &request.reinstall_id {
        Some(reinstall_id) => Integration::reinstall(&state.db, reinstall_id, &new)
            .await?
            .ok_or_else(|| ApiError::not_found("Integration to reinstall not found"))?,
        None => Integration::upsert(&state.db, &new).await?,
    };
    Integration::link_organization(&state.db, organization.id, &model.id).await?;

    info!(
        integration_id = %model.id,
        organization = %organization.slug,
        account = %model.name,
        "GitHub App installed"
    );

    let installation = state.provider.installation(
        model.clone(),
        organization.id,
        &state.credential_store(),
        state.github_cache.clone(),
        &state.refresh_locks,
    )?;
    let linked_repositories = state.provider.post_install(&state.db, &installation).await?;

    Ok((
        StatusCode::CREATED,
        Json(InstallResponse {
            integration: model.into(),
            linked_repositories,
        }),
    ))
}

/// Redirect to the app's GitHub page, where the installation starts.
pub async fn install_url(State(state): State<Arc<AppState>>) -> Result<Redirect, ApiError> {
    let url = state
        .provider
        .get_app_url()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Redirect::temporary(&url))
}

pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    Path((org_slug, integration_id)): Path<(String, String)>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<RepositoryRef>>, ApiError> {
    let installation = load_installation(&state, &org_slug, &integration_id).await?;
    let repos = installation
        .list_repositories(query.search.as_deref())
        .await?;
    Ok(Json(repos))
}

pub async fn search_issues(
    State(state): State<Arc<AppState>>,
    Path((org_slug, integration_id)): Path<(String, String)>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResults<Issue>>, ApiError> {
    let search = query
        .search
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::validation_field("search", "A search query is required"))?;

    let installation = load_installation(&state, &org_slug, &integration_id).await?;
    Ok(Json(installation.search_issues(&search).await?))
}

pub async fn unmigratable_repositories(
    State(state): State<Arc<AppState>>,
    Path((org_slug, integration_id)): Path<(String, String)>,
) -> Result<Json<Vec<db::Repository>>, ApiError> {
    let installation = load_installation(&state, &org_slug, &integration_id).await?;
    Ok(Json(
        installation.find_unmigratable_repositories(&state.db).await?,
    ))
}

pub async fn stacktrace_link(
    State(state): State<Arc<AppState>>,
    Path((org_slug, integration_id)): Path<(String, String)>,
    Query(query): Query<StacktraceLinkQuery>,
) -> Result<Json<StacktraceLinkResponse>, ApiError> {
    let installation = load_installation(&state, &org_slug, &integration_id).await?;
    let source_url = installation
        .get_stacktrace_link(
            &query.repo,
            &query.file,
            &query.default_branch,
            query.version.as_deref(),
        )
        .await;
    Ok(Json(StacktraceLinkResponse { source_url }))
}
