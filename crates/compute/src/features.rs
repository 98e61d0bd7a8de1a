//! Sliding-window feature derivation.
//!
//! Windows are sharded by `(route, station, direction)`; each shard is only
//! ever touched by the single ingest task, so no locking happens here.
//! Windows are ephemeral — after a restart they are rebuilt by replaying
//! recent positions from the store.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use headway_catalog::Catalog;
use headway_core::config::FeatureConfig;
use headway_core::{FeatureFrame, TripStatus, TripUpdate};

use crate::stats::RollingStats;

/// Hard cap on window entries per shard key.
const MAX_PER_KEY: usize = 256;

/// Sweep the idempotence map when it grows past this.
const SEEN_SWEEP_THRESHOLD: usize = 100_000;

/// A frame plus the numeric vector the outlier model scores:
/// `[headway_s, dwell_s, delay_s, headway_z, dwell_z]`.
#[derive(Debug, Clone)]
pub struct FrameVector {
    pub frame: FeatureFrame,
    pub vector: [f64; 5],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShardKey {
    route_id: String,
    stop_id: String,
    direction: headway_core::Direction,
}

/// Per-shard state: recent arrivals plus rolling headway/dwell baselines.
struct Shard {
    /// (arrival, trip_id), sorted by arrival, pruned by window and cap.
    arrivals: Vec<(DateTime<Utc>, String)>,
    headway: RollingStats,
    dwell: RollingStats,
}

/// Last status observed per trip, for dwell transitions.
struct TripState {
    status: TripStatus,
    stop_id: Option<String>,
    at_stop_since: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

pub struct FeatureEngine {
    headway_window: Duration,
    rolling_window: Duration,
    shards: HashMap<ShardKey, Shard>,
    trips: HashMap<String, TripState>,
    /// Latest observed_at per (trip, stop) — enforces idempotence and
    /// monotonicity.
    seen: HashMap<(String, String), DateTime<Utc>>,
}

impl FeatureEngine {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            headway_window: Duration::minutes(config.headway_window_minutes as i64),
            rolling_window: Duration::hours(config.rolling_window_hours as i64),
            shards: HashMap::new(),
            trips: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    /// The widest window; replay after restart needs at least this much
    /// position history.
    pub fn replay_horizon(&self) -> Duration {
        self.headway_window.max(self.rolling_window)
    }

    /// Process one canonical record, returning at most one feature frame.
    ///
    /// Duplicate `(trip, stop)` observations and out-of-order arrivals are
    /// discarded, so replaying a payload is a no-op.
    pub fn update(&mut self, record: &TripUpdate, catalog: &Catalog) -> Option<FrameVector> {
        let raw_stop = record
            .next_stop_id
            .as_deref()
            .or(record.current_stop_id.as_deref())?;

        let seen_key = (record.trip_id.clone(), raw_stop.to_string());
        if let Some(last) = self.seen.get(&seen_key) {
            if *last >= record.observed_at {
                return None;
            }
        }
        self.seen.insert(seen_key, record.observed_at);
        self.maybe_sweep_seen(record.observed_at);

        let station = catalog.resolve_id(raw_stop).to_string();
        let key = ShardKey {
            route_id: record.route_id.clone(),
            stop_id: station.clone(),
            direction: record.direction,
        };

        let dwell_s = self.observe_trip_status(record);

        let arrival = record.arrival_time.unwrap_or(record.observed_at);
        let headway_window = self.headway_window;
        let rolling_window = self.rolling_window;
        let shard = self.shards.entry(key).or_insert_with(|| Shard {
            arrivals: Vec::new(),
            headway: RollingStats::new(rolling_window, MAX_PER_KEY),
            dwell: RollingStats::new(rolling_window, MAX_PER_KEY),
        });

        let headway_s = shard.observe_arrival(&record.trip_id, arrival, headway_window);

        // z-scores against the window *before* this observation joins it.
        let headway_z = headway_s.map(|h| shard.headway.zscore(h)).unwrap_or(0.0);
        let dwell_z = dwell_s.map(|d| shard.dwell.zscore(d)).unwrap_or(0.0);

        if let Some(h) = headway_s {
            shard.headway.push(arrival, h);
        }
        if let Some(d) = dwell_s {
            shard.dwell.push(record.observed_at, d);
        }

        let delay_s = derive_delay(record, catalog);
        let schedule_adherence = (delay_s / 600.0).clamp(-1.0, 1.0);

        let frame = FeatureFrame {
            trip_id: record.trip_id.clone(),
            route_id: record.route_id.clone(),
            stop_id: station,
            observed_at: record.observed_at,
            headway_s: headway_s.unwrap_or(0.0),
            dwell_s,
            delay_s,
            schedule_adherence,
            rolling_headway_mean: shard.headway.mean(),
            rolling_headway_stdev: shard.headway.stdev(),
        };

        let vector = [
            frame.headway_s,
            dwell_s.unwrap_or(0.0),
            delay_s,
            headway_z,
            dwell_z,
        ];
        Some(FrameVector { frame, vector })
    }

    /// Rebuild windows from persisted positions. Frames are not re-emitted.
    pub fn replay(&mut self, records: &[TripUpdate], catalog: &Catalog) -> usize {
        let mut rebuilt = 0;
        for record in records {
            if self.update(record, catalog).is_some() {
                rebuilt += 1;
            }
        }
        rebuilt
    }

    /// Track at_stop → in_transit transitions; returns the dwell once per
    /// transition.
    fn observe_trip_status(&mut self, record: &TripUpdate) -> Option<f64> {
        let state = self.trips.entry(record.trip_id.clone()).or_insert(TripState {
            status: record.current_status,
            stop_id: record.current_stop_id.clone(),
            at_stop_since: (record.current_status == TripStatus::AtStop)
                .then_some(record.observed_at),
            updated_at: record.observed_at,
        });

        // Several records of the same trip share one tick; only the first
        // advances the state machine.
        if record.observed_at <= state.updated_at && state.status == record.current_status {
            return None;
        }

        let mut dwell = None;
        if state.status == TripStatus::AtStop && record.current_status == TripStatus::InTransit {
            if let Some(since) = state.at_stop_since {
                let elapsed = record.observed_at.signed_duration_since(since);
                if elapsed > Duration::zero() {
                    dwell = Some(elapsed.num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        if record.current_status == TripStatus::AtStop {
            if state.status != TripStatus::AtStop || state.stop_id != record.current_stop_id {
                state.at_stop_since = Some(record.observed_at);
            }
        } else {
            state.at_stop_since = None;
        }
        state.status = record.current_status;
        state.stop_id = record.current_stop_id.clone();
        state.updated_at = record.observed_at;
        dwell
    }

    fn maybe_sweep_seen(&mut self, now: DateTime<Utc>) {
        if self.seen.len() < SEEN_SWEEP_THRESHOLD {
            return;
        }
        let horizon = now - self.replay_horizon() * 2;
        self.seen.retain(|_, t| *t >= horizon);
        self.trips.retain(|_, s| s.updated_at >= horizon);
    }
}

impl Shard {
    /// Record this trip's (possibly revised) arrival and return the headway
    /// against the previous distinct train, when one exists in the window.
    fn observe_arrival(
        &mut self,
        trip_id: &str,
        arrival: DateTime<Utc>,
        window: Duration,
    ) -> Option<f64> {
        // A revised prediction replaces the trip's old entry.
        self.arrivals.retain(|(_, t)| t != trip_id);

        let horizon = arrival - window;
        self.arrivals.retain(|(a, _)| *a >= horizon);
        if self.arrivals.len() >= MAX_PER_KEY {
            self.arrivals.remove(0);
        }

        let idx = self.arrivals.partition_point(|(a, _)| *a < arrival);
        let headway = idx
            .checked_sub(1)
            .map(|i| self.arrivals[i].0)
            .map(|prev| arrival.signed_duration_since(prev).num_milliseconds() as f64 / 1000.0)
            .filter(|h| *h > 0.0);

        self.arrivals.insert(idx, (arrival, trip_id.to_string()));
        headway
    }
}

/// Delay: the feed's explicit value wins; otherwise derive from the static
/// schedule when the bundle carried one; otherwise no signal.
fn derive_delay(record: &TripUpdate, catalog: &Catalog) -> f64 {
    if let Some(delay) = record.delay_seconds {
        return delay as f64;
    }

    let (Some(stop_id), Some(arrival)) = (record.next_stop_id.as_deref(), record.arrival_time)
    else {
        return 0.0;
    };
    let Some(scheduled) = catalog.scheduled_arrival(&record.trip_id, stop_id) else {
        return 0.0;
    };

    let observed_sod = arrival.timestamp().rem_euclid(86_400);
    let mut delta = observed_sod - (scheduled as i64 % 86_400);
    // Wrap around midnight.
    if delta > 43_200 {
        delta -= 86_400;
    } else if delta < -43_200 {
        delta += 86_400;
    }
    delta as f64
}
