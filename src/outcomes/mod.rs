//! Outcomes queries against the external aggregation service.
//!
//! Nothing is aggregated locally: a [`QueryRequest`] is translated to the
//! service's JSON query format and the rows it returns are passed through
//! in order.

mod date_range;

pub use date_range::{
    date_range_at, get_date_range_rollup_from_params, parse_rollup, parse_stats_period,
    DateRange, DateRangeError,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::OutcomesConfig;

/// One result row: grouped dimension values and aggregate values by name.
pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum OutcomesError {
    #[error("Aggregation service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Aggregation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected aggregation service response: {0}")]
    InvalidResponse(String),
}

/// `[function, column, alias]`, e.g. `["sum", "times_seen", "aggregate"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregation(pub String, pub String, pub String);

impl Aggregation {
    pub fn new(function: &str, column: &str, alias: &str) -> Self {
        Self(function.into(), column.into(), alias.into())
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub organization_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub rollup: i64,
    /// Extra `column IN values` filters besides the organization
    pub filters: BTreeMap<String, Vec<Value>>,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
}

impl QueryRequest {
    /// Event counts per category, project and time bucket for an
    /// organization.
    pub fn organization_stats(organization_id: i64, range: DateRange) -> Self {
        Self {
            organization_id,
            start: range.start,
            end: range.end,
            rollup: range.rollup,
            filters: BTreeMap::new(),
            group_by: vec![
                "category".to_string(),
                "project_id".to_string(),
                "timestamp".to_string(),
            ],
            aggregations: vec![Aggregation::new("sum", "times_seen", "aggregate")],
        }
    }

    fn conditions(&self) -> Vec<Value> {
        std::iter::once(json!(["org_id", "IN", [self.organization_id]]))
            .chain(
                self.filters
                    .iter()
                    .filter(|(column, _)| column.as_str() != "org_id")
                    .map(|(column, values)| json!([column, "IN", values])),
            )
            .collect()
    }

    /// Body of the service's query endpoint.
    pub fn to_wire(&self, dataset: &str) -> Value {
        json!({
            "dataset": dataset,
            "from_date": self.start.to_rfc3339(),
            "to_date": self.end.to_rfc3339(),
            "granularity": self.rollup,
            "groupby": self.group_by,
            "aggregations": self.aggregations,
            "conditions": self.conditions(),
        })
    }
}

#[async_trait]
pub trait AggregationService: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, OutcomesError>;
}

pub struct HttpAggregationService {
    http: reqwest::Client,
    query_url: String,
    dataset: String,
}

impl HttpAggregationService {
    pub fn new(config: &OutcomesConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create aggregation service client")?;

        Ok(Self {
            http,
            query_url: format!(
                "{}/{}/query",
                config.url.trim_end_matches('/'),
                config.dataset
            ),
            dataset: config.dataset.clone(),
        })
    }
}

#[async_trait]
impl AggregationService for HttpAggregationService {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>, OutcomesError> {
        let body = request.to_wire(&self.dataset);
        debug!(
            organization_id = request.organization_id,
            rollup = request.rollup,
            "Querying aggregation service"
        );

        let response = self.http.post(&self.query_url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutcomesError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut payload: Value = response
            .json()
            .await
            .map_err(|e| OutcomesError::InvalidResponse(e.to_string()))?;
        let rows = match payload.get_mut("data").map(Value::take) {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(OutcomesError::InvalidResponse(
                    "missing `data` array".to_string(),
                ))
            }
        };

        rows.into_iter()
            .map(|row| match row {
                Value::Object(row) => Ok(row),
                other => Err(OutcomesError::InvalidResponse(format!(
                    "row is not an object: {}",
                    other
                ))),
            })
            .collect()
    }
}
