//! Canonical domain model shared by every crate.
//!
//! Realtime feed entities are normalized into [`TripUpdate`] records; the
//! feature engine turns those into [`FeatureFrame`]s; the detector turns
//! frames into [`Anomaly`] rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Catalog entities ──────────────────────────────────────────

/// A transit route (line) from the static schedule bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub display_name: String,
    pub color: String,
}

/// A station from the static schedule bundle.
///
/// Child platforms carry a `parent_id`; analytics always resolve them to the
/// parent station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub stop_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub routes_served: std::collections::BTreeSet<String>,
}

// ── Realtime records ──────────────────────────────────────────

/// Travel direction, derived from GTFS `direction_id` or the stop-id suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    South,
}

impl Direction {
    /// NYC-style stop ids end in N/S for the two platforms.
    pub fn from_stop_id(stop_id: &str) -> Option<Direction> {
        match stop_id.as_bytes().last() {
            Some(b'N') => Some(Direction::North),
            Some(b'S') => Some(Direction::South),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    AtStop,
    InTransit,
    Incoming,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::AtStop => "at_stop",
            TripStatus::InTransit => "in_transit",
            TripStatus::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Option<TripStatus> {
        match s {
            "at_stop" => Some(TripStatus::AtStop),
            "in_transit" => Some(TripStatus::InTransit),
            "incoming" => Some(TripStatus::Incoming),
            _ => None,
        }
    }
}

/// One normalized observation of a trip, merged from the feed's trip-update
/// and vehicle-position entities. Keyed by `(trip_id, route_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripUpdate {
    pub trip_id: String,
    pub route_id: String,
    pub direction: Direction,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<DateTime<Utc>>,
    pub current_status: TripStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

// ── Feed runs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRunStatus {
    Ok,
    TransportError,
    DecodeError,
    Partial,
}

impl FeedRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedRunStatus::Ok => "ok",
            FeedRunStatus::TransportError => "transport_error",
            FeedRunStatus::DecodeError => "decode_error",
            FeedRunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<FeedRunStatus> {
        match s {
            "ok" => Some(FeedRunStatus::Ok),
            "transport_error" => Some(FeedRunStatus::TransportError),
            "decode_error" => Some(FeedRunStatus::DecodeError),
            "partial" => Some(FeedRunStatus::Partial),
            _ => None,
        }
    }
}

/// One fetch-and-decode attempt for one upstream feed. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRun {
    /// Store-assigned, monotonic. 0 until inserted.
    #[serde(default)]
    pub run_id: i64,
    pub feed_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities_seen: u32,
    pub alerts_seen: u32,
    /// Entities dropped during decode (`partial` outcome detail).
    pub skipped: u32,
    pub status: FeedRunStatus,
    pub duration_ms: u64,
}

// ── Feature frames ────────────────────────────────────────────

/// The feature vector computed for one trip/stop observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub trip_id: String,
    pub route_id: String,
    pub stop_id: String,
    pub observed_at: DateTime<Utc>,
    /// Seconds since the previous train served this stop in this direction.
    pub headway_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_s: Option<f64>,
    pub delay_s: f64,
    /// clamp(delay_s / 600, -1, 1).
    pub schedule_adherence: f64,
    pub rolling_headway_mean: f64,
    pub rolling_headway_stdev: f64,
}

// ── Anomalies ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HeadwayOutlier,
    DwellOutlier,
    DelaySpike,
    SequenceReconstruction,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HeadwayOutlier => "headway_outlier",
            AnomalyKind::DwellOutlier => "dwell_outlier",
            AnomalyKind::DelaySpike => "delay_spike",
            AnomalyKind::SequenceReconstruction => "sequence_reconstruction",
        }
    }

    pub fn parse(s: &str) -> Option<AnomalyKind> {
        match s {
            "headway_outlier" => Some(AnomalyKind::HeadwayOutlier),
            "dwell_outlier" => Some(AnomalyKind::DwellOutlier),
            "delay_spike" => Some(AnomalyKind::DelaySpike),
            "sequence_reconstruction" => Some(AnomalyKind::SequenceReconstruction),
            _ => None,
        }
    }
}

/// A detected operational anomaly. `severity` is a float in [0,1]; the
/// low/medium/high buckets exist only at the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    pub kind: AnomalyKind,
    pub severity: f64,
    pub model_name: String,
    pub model_version: i64,
    pub features: BTreeMap<String, f64>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Severity bucket used by `/anomalies/stats`.
pub fn severity_bucket(severity: f64) -> &'static str {
    if severity >= 0.7 {
        "high"
    } else if severity >= 0.4 {
        "medium"
    } else {
        "low"
    }
}

// ── Model artifacts ───────────────────────────────────────────

/// Serialized, versioned model parameters plus hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    /// Monotonic per name, store-assigned.
    pub version: i64,
    pub trained_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub hyperparams: BTreeMap<String, f64>,
    pub training_window_hours: u32,
}
