//! Cost and usage reporting for the calling user.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::{error_response, internal_error, CostQuery, ExecutionQuery};
use crate::ledger::CostSummary;
use crate::store::{CostEntry, CostFilter, Execution, ExecutionFilter, ExecutionStatus, UsageMetrics};
use crate::util::parse_date_bound;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/costs", get(cost_summary))
        .route("/costs/detailed", get(cost_entries))
        .route("/usage", get(usage))
        .route("/executions", get(executions))
}

#[derive(Debug, Default, Deserialize)]
struct DateRange {
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    #[serde(flatten)]
    metrics: UsageMetrics,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn bound(
    value: Option<&str>,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, (StatusCode, String)> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_date_bound(raw, end_of_day).map(Some).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("Invalid date '{}': expected YYYY-MM-DD or RFC 3339", raw),
            )
        }),
    }
}

fn cost_filter(query: &CostQuery) -> Result<CostFilter, (StatusCode, String)> {
    Ok(CostFilter {
        cost_type: query
            .cost_type
            .clone()
            .filter(|t| !t.trim().is_empty()),
        start: bound(query.start_date.as_deref(), false)?,
        end: bound(query.end_date.as_deref(), true)?,
    })
}

async fn cost_summary(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<CostQuery>,
) -> Result<Json<CostSummary>, (StatusCode, String)> {
    let filter = cost_filter(&query)?;
    let summary = state
        .ledger
        .summarize(user.id, filter)
        .await
        .map_err(error_response)?;
    Ok(Json(summary))
}

async fn cost_entries(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<CostQuery>,
) -> Result<Json<Vec<CostEntry>>, (StatusCode, String)> {
    let filter = cost_filter(&query)?;
    let entries = state
        .ledger
        .entries(user.id, filter, query.skip, query.limit)
        .await
        .map_err(error_response)?;
    Ok(Json(entries))
}

async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(range): Query<DateRange>,
) -> Result<Json<UsageResponse>, (StatusCode, String)> {
    let start = bound(range.start_date.as_deref(), false)?;
    let end = bound(range.end_date.as_deref(), true)?;
    let metrics = state
        .db
        .usage_metrics(user.id, start, end)
        .await
        .map_err(internal_error)?;
    Ok(Json(UsageResponse {
        metrics,
        start_date: range.start_date,
        end_date: range.end_date,
    }))
}

async fn executions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<Vec<Execution>>, (StatusCode, String)> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(ExecutionStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("Unknown execution status '{}'", raw),
            )
        })?),
    };
    let executions = state
        .db
        .list_executions(
            user.id,
            ExecutionFilter {
                status,
                agent_id: query.agent_id,
                skip: query.skip,
                limit: query.limit,
            },
        )
        .await
        .map_err(internal_error)?;
    Ok(Json(executions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_only_bounds_cover_the_whole_day() {
        let start = bound(Some("2024-03-01"), false).unwrap().unwrap();
        let end = bound(Some("2024-03-01"), true).unwrap().unwrap();
        assert!(end > start);
        assert_eq!((end - start).num_hours(), 23);
    }

    #[test]
    fn blank_bounds_are_ignored_and_garbage_is_rejected() {
        assert_eq!(bound(None, false).unwrap(), None);
        assert_eq!(bound(Some("  "), true).unwrap(), None);
        let err = bound(Some("yesterday"), false).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_cost_type_means_all_types() {
        let query = CostQuery {
            cost_type: Some(" ".into()),
            limit: 10,
            ..CostQuery::default()
        };
        assert_eq!(cost_filter(&query).unwrap().cost_type, None);
    }
}
