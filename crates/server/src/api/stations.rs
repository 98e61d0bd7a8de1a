//! Station catalog endpoint.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use headway_catalog::BoundingBox;
use headway_core::Station;

use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct StationParams {
    /// `min_lat,min_lon,max_lat,max_lon`.
    pub bbox: Option<String>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StationParams>,
) -> ApiResult<Json<Vec<Station>>> {
    let stations: Vec<Station> = match params.bbox.as_deref() {
        Some(raw) => {
            let bbox = parse_bbox(raw)
                .ok_or_else(|| ApiError::bad_request("bbox must be min_lat,min_lon,max_lat,max_lon"))?;
            state
                .catalog
                .stations_in_bounds(bbox)
                .into_iter()
                .cloned()
                .collect()
        }
        None => {
            let mut all: Vec<Station> = state.catalog.stations().cloned().collect();
            all.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));
            all
        }
    };
    Ok(Json(stations))
}

fn parse_bbox(raw: &str) -> Option<BoundingBox> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<f64>>>()?;
    if parts.len() != 4 {
        return None;
    }
    let bbox = BoundingBox {
        min_lat: parts[0],
        min_lon: parts[1],
        max_lat: parts[2],
        max_lon: parts[3],
    };
    (bbox.min_lat <= bbox.max_lat && bbox.min_lon <= bbox.max_lon).then_some(bbox)
}
