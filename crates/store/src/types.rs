//! Query/filter types and row mappings.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use headway_core::{Anomaly, AnomalyKind, Direction, FeedRun, FeedRunStatus, TripStatus, TripUpdate};

pub(crate) fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

// ── Positions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PositionQuery {
    pub line: Option<String>,
    pub station: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct PositionRow {
    pub trip_id: String,
    pub route_id: String,
    pub direction: String,
    pub observed_at: i64,
    pub current_stop_id: Option<String>,
    pub next_stop_id: Option<String>,
    pub arrival_time: Option<i64>,
    pub departure_time: Option<i64>,
    pub current_status: String,
    pub delay_seconds: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl PositionRow {
    pub fn into_record(self) -> TripUpdate {
        TripUpdate {
            trip_id: self.trip_id,
            route_id: self.route_id,
            direction: if self.direction == "south" {
                Direction::South
            } else {
                Direction::North
            },
            observed_at: from_epoch(self.observed_at),
            current_stop_id: self.current_stop_id,
            next_stop_id: self.next_stop_id,
            arrival_time: self.arrival_time.map(from_epoch),
            departure_time: self.departure_time.map(from_epoch),
            current_status: TripStatus::parse(&self.current_status).unwrap_or(TripStatus::InTransit),
            delay_seconds: self.delay_seconds,
            lat: self.lat,
            lon: self.lon,
        }
    }
}

pub(crate) fn direction_str(d: Direction) -> &'static str {
    match d {
        Direction::North => "north",
        Direction::South => "south",
    }
}

// ── Feed runs ─────────────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct FeedRunRow {
    pub run_id: i64,
    pub feed_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub entities_seen: i64,
    pub alerts_seen: i64,
    pub skipped: i64,
    pub status: String,
    pub duration_ms: i64,
}

impl FeedRunRow {
    pub fn into_record(self) -> FeedRun {
        FeedRun {
            run_id: self.run_id,
            feed_id: self.feed_id,
            started_at: from_epoch(self.started_at),
            finished_at: from_epoch(self.finished_at),
            entities_seen: self.entities_seen.max(0) as u32,
            alerts_seen: self.alerts_seen.max(0) as u32,
            skipped: self.skipped.max(0) as u32,
            status: FeedRunStatus::parse(&self.status).unwrap_or(FeedRunStatus::TransportError),
            duration_ms: self.duration_ms.max(0) as u64,
        }
    }
}

// ── Anomalies ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct AnomalyQuery {
    pub line: Option<String>,
    pub station: Option<String>,
    pub severity_min: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct AnomalyPage {
    pub anomalies: Vec<Anomaly>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct AnomalyRow {
    pub anomaly_id: String,
    pub detected_at: i64,
    pub station_id: Option<String>,
    pub route_id: Option<String>,
    pub kind: String,
    pub severity: f64,
    pub model_name: String,
    pub model_version: i64,
    pub features: String,
    pub resolved: i64,
    pub resolved_at: Option<i64>,
}

impl AnomalyRow {
    pub fn into_record(self) -> Anomaly {
        let features: BTreeMap<String, f64> =
            serde_json::from_str(&self.features).unwrap_or_default();
        Anomaly {
            anomaly_id: Uuid::parse_str(&self.anomaly_id).unwrap_or_else(|_| Uuid::nil()),
            detected_at: from_epoch(self.detected_at),
            station_id: self.station_id,
            route_id: self.route_id,
            kind: AnomalyKind::parse(&self.kind).unwrap_or(AnomalyKind::HeadwayOutlier),
            severity: self.severity,
            model_name: self.model_name,
            model_version: self.model_version,
            features,
            resolved: self.resolved != 0,
            resolved_at: self.resolved_at.map(from_epoch),
        }
    }
}

/// Aggregates backing `/anomalies/stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub total_today: i64,
    pub total_active: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_line: BTreeMap<String, i64>,
    pub severity_distribution: SeverityDistribution,
    pub trend_24h: Vec<TrendPoint>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SeverityDistribution {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Hour bucket start, unix seconds.
    pub hour: i64,
    pub count: i64,
    pub avg_severity: f64,
}

// ── Model artifacts ───────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct ArtifactRow {
    pub name: String,
    pub version: i64,
    pub trained_at: i64,
    pub payload: Vec<u8>,
    pub hyperparams: String,
    pub training_window_hours: i64,
}

impl ArtifactRow {
    pub fn into_record(self) -> headway_core::ModelArtifact {
        let hyperparams: BTreeMap<String, f64> =
            serde_json::from_str(&self.hyperparams).unwrap_or_default();
        headway_core::ModelArtifact {
            name: self.name,
            version: self.version,
            trained_at: from_epoch(self.trained_at),
            payload: self.payload,
            hyperparams,
            training_window_hours: self.training_window_hours.max(0) as u32,
        }
    }
}
