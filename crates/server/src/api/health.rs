//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use headway_compute::detect::ModelKind;

use crate::state::AppState;

#[derive(Serialize)]
pub struct LiveResponse {
    pub status: &'static str,
}

pub async fn live() -> Json<LiveResponse> {
    Json(LiveResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub catalog: bool,
    pub store: bool,
    pub ingest_fresh: bool,
    pub outlier_model: &'static str,
    pub sequence_model: &'static str,
}

/// Ready = catalog loaded ∧ store reachable ∧ at least one FeedRun within
/// `2 × FEED_UPDATE_INTERVAL`.
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let catalog = state.catalog.station_count() > 0;
    let store = state.store.ping().await;

    let fresh_horizon = chrono::Duration::seconds(2 * state.config.feed.update_interval_s as i64);
    let ingest_fresh = match state.store.last_run_at().await {
        Ok(Some(last)) => Utc::now().signed_duration_since(last) <= fresh_horizon,
        _ => false,
    };

    let ready = catalog && store && ingest_fresh;
    let response = ReadyResponse {
        status: if ready { "ok" } else { "not_ready" },
        catalog,
        store,
        ingest_fresh,
        outlier_model: state.detector.state(ModelKind::Outlier).as_str(),
        sequence_model: state.detector.state(ModelKind::Sequence).as_str(),
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
