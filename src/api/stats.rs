use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;

use super::error::ApiError;
use crate::db::Organization;
use crate::outcomes::{get_date_range_rollup_from_params, AggregationService, QueryRequest, Row};
use crate::AppState;

/// Event counts for an organization, grouped by category, project and
/// time bucket.
///
/// Query parameters: `start`/`end` (UNIX seconds or RFC 3339) or
/// `statsPeriod`, and `rollup` (`1h` or `1d`).
pub async fn organization_stats_v2(
    State(state): State<Arc<AppState>>,
    Path(org_slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Row>>, ApiError> {
    let organization = Organization::find_by_slug(&state.db, &org_slug)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))?;

    let range = get_date_range_rollup_from_params(&params, "1h", true)?;
    let rows = state
        .outcomes
        .query(&QueryRequest::organization_stats(organization.id, range))
        .await?;

    Ok(Json(rows))
}
