//! Feed status and live position endpoints.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use headway_core::{FeedRun, TripUpdate};

use crate::state::AppState;

use super::{with_deadline, ApiError, ApiResult};

/// Most recent snapshot per trip on a line.
pub async fn positions(
    State(state): State<Arc<AppState>>,
    Path(line): Path<String>,
) -> ApiResult<Json<Vec<TripUpdate>>> {
    with_deadline(&state, async {
        let latest = state
            .store
            .latest_positions(&line)
            .await
            .map_err(ApiError::store)?;
        Ok(Json(latest))
    })
    .await
}

#[derive(Serialize)]
pub struct FeedStatusResponse {
    pub status: &'static str,
    pub last_runs: Vec<FeedRun>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<Json<FeedStatusResponse>> {
    with_deadline(&state, async {
        let last_runs = state
            .store
            .recent_feed_runs(32)
            .await
            .map_err(ApiError::store)?;

        let fresh_horizon = 2 * state.config.feed.update_interval_s as i64;
        let last_tick = state.ingest.last_tick_at.load(Ordering::Relaxed);
        let status = if Utc::now().timestamp() - last_tick <= fresh_horizon {
            "ok"
        } else {
            "stale"
        };

        Ok(Json(FeedStatusResponse { status, last_runs }))
    })
    .await
}
