//! Anomaly read endpoints and the operator-initiated detection trigger.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use headway_store::{AnomalyPage, AnomalyQuery, AnomalyStats};

use crate::state::AppState;

use super::{with_deadline, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub line: Option<String>,
    pub station: Option<String>,
    pub severity_min: Option<f64>,
    /// RFC3339 timestamps.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<AnomalyPage>> {
    with_deadline(&state, async {
        if let Some(min) = params.severity_min {
            if !(0.0..=1.0).contains(&min) {
                return Err(ApiError::bad_request("severity_min must be in [0,1]"));
            }
        }
        let query = AnomalyQuery {
            line: params.line,
            station: params.station,
            severity_min: params.severity_min,
            since: params.start,
            until: params.end,
            page: params.page,
            page_size: params.page_size,
        };
        let page = state
            .store
            .query_anomalies(&query)
            .await
            .map_err(ApiError::store)?;
        Ok(Json(page))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    #[serde(default = "default_hours")]
    pub hours: u32,
}

fn default_hours() -> u32 {
    24
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<AnomalyStats>> {
    with_deadline(&state, async {
        let stats = state
            .store
            .anomaly_stats(params.hours.min(24 * 31))
            .await
            .map_err(ApiError::store)?;
        Ok(Json(stats))
    })
    .await
}

#[derive(Serialize)]
pub struct DetectResponse {
    pub triggered: bool,
    pub run_id: u64,
}

/// One-shot scoring tick, queued behind the detection loop.
pub async fn detect(State(state): State<Arc<AppState>>) -> ApiResult<Json<DetectResponse>> {
    state
        .detect_trigger
        .try_send(())
        .map_err(|_| ApiError::bad_request("detection already queued"))?;
    let run_id = state.ingest.detection_runs.load(Ordering::Relaxed) + 1;
    Ok(Json(DetectResponse {
        triggered: true,
        run_id,
    }))
}
