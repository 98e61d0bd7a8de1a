//! Protobuf payload → canonical records.
//!
//! Each trip update fans out into one canonical record per stop_time_update;
//! vehicle positions fold trip-level state (status, coordinates, current
//! stop) into every record of their trip. A failing entity is skipped and
//! counted; the envelope only fails as a whole when the header itself cannot
//! be parsed.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use tracing::debug;

use headway_core::{Direction, TripStatus, TripUpdate};

use crate::error::DecodeError;
use crate::gtfs;

/// Everything one payload decoded to, plus the counters the FeedRun needs.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub records: Vec<TripUpdate>,
    pub header_timestamp: Option<DateTime<Utc>>,
    pub entities_seen: u32,
    pub alerts_seen: u32,
    pub skipped: u32,
}

impl DecodeOutcome {
    pub fn is_partial(&self) -> bool {
        self.skipped > 0
    }
}

/// Decode one feed payload into canonical per-stop trip records.
pub fn decode_feed(payload: &[u8]) -> Result<DecodeOutcome, DecodeError> {
    let feed = gtfs::FeedMessage::decode(payload).map_err(|e| DecodeError::Header(e.to_string()))?;

    let version = feed.header.gtfs_realtime_version.as_str();
    if version != "1.0" && version != "2.0" {
        return Err(DecodeError::Version(version.to_string()));
    }

    let header_ts = feed.header.timestamp.and_then(unix_ts);
    let mut outcome = DecodeOutcome {
        header_timestamp: header_ts,
        ..DecodeOutcome::default()
    };

    let mut records: Vec<TripUpdate> = Vec::new();
    // Trip-level vehicle state to fold in after the fan-out.
    let mut vehicles: HashMap<String, VehicleState> = HashMap::new();

    for entity in &feed.entity {
        let has_payload =
            entity.trip_update.is_some() || entity.vehicle.is_some() || entity.alert.is_some();
        if !has_payload {
            outcome.skipped += 1;
            continue;
        }

        if entity.alert.is_some() {
            outcome.alerts_seen += 1;
        }

        if let Some(tu) = &entity.trip_update {
            outcome.entities_seen += 1;
            match fan_out_trip_update(tu, header_ts) {
                Some(mut trip_records) => records.append(&mut trip_records),
                None => {
                    debug!(entity = %entity.id, "skipping undecodable trip update");
                    outcome.skipped += 1;
                }
            }
        }

        if let Some(vp) = &entity.vehicle {
            if entity.trip_update.is_none() {
                outcome.entities_seen += 1;
            }
            match VehicleState::from_proto(vp, header_ts) {
                Some((trip_id, state)) => {
                    vehicles.insert(trip_id, state);
                }
                None if entity.trip_update.is_none() => {
                    debug!(entity = %entity.id, "skipping undecodable vehicle position");
                    outcome.skipped += 1;
                }
                None => {}
            }
        }
    }

    apply_vehicle_state(&mut records, &mut vehicles);

    // Positions whose trip had no trip_update entity still become records.
    for (trip_id, state) in vehicles {
        if let Some(record) = state.into_record(trip_id) {
            records.push(record);
        }
    }

    outcome.records = normalize(records);
    Ok(outcome)
}

/// One canonical record per stop_time_update carrying a stop id.
fn fan_out_trip_update(
    tu: &gtfs::TripUpdate,
    header_ts: Option<DateTime<Utc>>,
) -> Option<Vec<TripUpdate>> {
    let trip_id = tu.trip.trip_id.as_deref().filter(|s| !s.is_empty())?;
    let route_id = tu.trip.route_id.as_deref().filter(|s| !s.is_empty())?;
    let observed_at = tu.timestamp.and_then(unix_ts).or(header_ts)?;

    let mut records = Vec::new();
    for stu in &tu.stop_time_update {
        let Some(stop_id) = stu.stop_id.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(direction) = direction_of(&tu.trip, Some(stop_id)) else {
            continue;
        };

        let arrival = stu.arrival.as_ref();
        let departure = stu.departure.as_ref();
        let delay_seconds = arrival
            .and_then(|a| a.delay)
            .map(i64::from)
            .or_else(|| tu.delay.map(i64::from));

        records.push(TripUpdate {
            trip_id: trip_id.to_string(),
            route_id: route_id.to_string(),
            direction,
            observed_at,
            current_stop_id: None,
            next_stop_id: Some(stop_id.to_string()),
            arrival_time: arrival.and_then(|a| a.time).and_then(|t| unix_ts(t as u64)),
            departure_time: departure.and_then(|d| d.time).and_then(|t| unix_ts(t as u64)),
            current_status: TripStatus::Incoming,
            delay_seconds,
            lat: None,
            lon: None,
        });
    }

    Some(records)
}

/// Trip-level state from a vehicle position entity.
struct VehicleState {
    route_id: Option<String>,
    stop_id: Option<String>,
    status: TripStatus,
    observed_at: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
    applied: bool,
}

impl VehicleState {
    fn from_proto(
        vp: &gtfs::VehiclePosition,
        header_ts: Option<DateTime<Utc>>,
    ) -> Option<(String, VehicleState)> {
        let trip = vp.trip.as_ref()?;
        let trip_id = trip.trip_id.as_deref().filter(|s| !s.is_empty())?;

        let status = match vp.current_status.and_then(|s| gtfs::VehicleStopStatus::try_from(s).ok())
        {
            Some(gtfs::VehicleStopStatus::StoppedAt) => TripStatus::AtStop,
            Some(gtfs::VehicleStopStatus::IncomingAt) => TripStatus::Incoming,
            _ => TripStatus::InTransit,
        };

        Some((
            trip_id.to_string(),
            VehicleState {
                route_id: trip.route_id.clone().filter(|s| !s.is_empty()),
                stop_id: vp.stop_id.clone(),
                status,
                observed_at: vp.timestamp.and_then(unix_ts).or(header_ts),
                lat: vp.position.as_ref().map(|p| p.latitude as f64),
                lon: vp.position.as_ref().map(|p| p.longitude as f64),
                applied: false,
            },
        ))
    }

    /// Standalone record for a position whose trip had no trip_update.
    fn into_record(self, trip_id: String) -> Option<TripUpdate> {
        if self.applied {
            return None;
        }
        let route_id = self.route_id?;
        let observed_at = self.observed_at?;
        let direction = self.stop_id.as_deref().and_then(Direction::from_stop_id)?;
        Some(TripUpdate {
            trip_id,
            route_id,
            direction,
            observed_at,
            current_stop_id: self.stop_id,
            next_stop_id: None,
            arrival_time: None,
            departure_time: None,
            current_status: self.status,
            delay_seconds: None,
            lat: self.lat,
            lon: self.lon,
        })
    }
}

fn apply_vehicle_state(records: &mut [TripUpdate], vehicles: &mut HashMap<String, VehicleState>) {
    for record in records.iter_mut() {
        let Some(state) = vehicles.get_mut(&record.trip_id) else {
            continue;
        };
        state.applied = true;
        record.current_stop_id = state.stop_id.clone();
        record.current_status = state.status;
        record.lat = state.lat;
        record.lon = state.lon;
        // Entity-level timestamps win over the envelope's.
        if let Some(ts) = state.observed_at {
            if ts > record.observed_at {
                record.observed_at = ts;
            }
        }
    }
}

fn direction_of(trip: &gtfs::TripDescriptor, stop_id: Option<&str>) -> Option<Direction> {
    // The platform suffix is the better signal when both are present.
    stop_id
        .and_then(Direction::from_stop_id)
        .or(match trip.direction_id {
            Some(0) => Some(Direction::North),
            Some(_) => Some(Direction::South),
            None => None,
        })
}

fn unix_ts(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs as i64, 0).single()
}

/// Tick-level ordering: for duplicate `(trip_id, stop_id)` the later
/// `observed_at` wins; output is sorted by `observed_at`.
pub fn normalize(records: Vec<TripUpdate>) -> Vec<TripUpdate> {
    let mut latest: HashMap<(String, Option<String>), TripUpdate> = HashMap::new();
    for record in records {
        let key = (
            record.trip_id.clone(),
            record.next_stop_id.clone().or_else(|| record.current_stop_id.clone()),
        );
        match latest.get(&key) {
            Some(existing) if existing.observed_at >= record.observed_at => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }

    let mut out: Vec<TripUpdate> = latest.into_values().collect();
    out.sort_by(|a, b| {
        a.observed_at
            .cmp(&b.observed_at)
            .then_with(|| a.trip_id.cmp(&b.trip_id))
            .then_with(|| a.next_stop_id.cmp(&b.next_stop_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    const HEADER_TS: u64 = 1_700_000_000;

    fn header() -> gtfs::FeedHeader {
        gtfs::FeedHeader {
            gtfs_realtime_version: "2.0".into(),
            timestamp: Some(HEADER_TS),
        }
    }

    fn stop_time(stop_id: &str, arrival: u64, delay: i32) -> gtfs::StopTimeUpdate {
        gtfs::StopTimeUpdate {
            stop_sequence: None,
            stop_id: Some(stop_id.into()),
            arrival: Some(gtfs::StopTimeEvent {
                delay: Some(delay),
                time: Some(arrival as i64),
            }),
            departure: None,
        }
    }

    fn trip_entity(
        id: &str,
        trip_id: &str,
        route_id: &str,
        stops: Vec<gtfs::StopTimeUpdate>,
    ) -> gtfs::FeedEntity {
        gtfs::FeedEntity {
            id: id.into(),
            trip_update: Some(gtfs::TripUpdate {
                trip: gtfs::TripDescriptor {
                    trip_id: Some(trip_id.into()),
                    route_id: Some(route_id.into()),
                    direction_id: None,
                },
                stop_time_update: stops,
                timestamp: None,
                delay: None,
            }),
            vehicle: None,
            alert: None,
        }
    }

    #[test]
    fn trip_updates_fan_out_per_stop() {
        let msg = gtfs::FeedMessage {
            header: header(),
            entity: (0..3)
                .map(|i| {
                    trip_entity(
                        &format!("e{}", i),
                        &format!("trip-{}", i),
                        "6",
                        (0..4)
                            .map(|j| {
                                stop_time(&format!("63{}N", j), HEADER_TS + 60 * (j as u64 + 1), 30)
                            })
                            .collect(),
                    )
                })
                .collect(),
        };

        let outcome = decode_feed(&msg.encode_to_vec()).unwrap();
        assert_eq!(outcome.entities_seen, 3);
        assert_eq!(outcome.skipped, 0);
        // One record per (trip, stop_time_update).
        assert_eq!(outcome.records.len(), 12);
        assert!(!outcome.is_partial());

        let r = outcome
            .records
            .iter()
            .find(|r| r.trip_id == "trip-0" && r.next_stop_id.as_deref() == Some("630N"))
            .unwrap();
        assert_eq!(r.route_id, "6");
        assert_eq!(r.direction, Direction::North);
        assert_eq!(r.delay_seconds, Some(30));
        assert_eq!(r.observed_at.timestamp(), HEADER_TS as i64);
        assert_eq!(r.arrival_time.unwrap().timestamp(), (HEADER_TS + 60) as i64);
    }

    #[test]
    fn malformed_entity_is_skipped_not_fatal() {
        let good = trip_entity("good", "trip-0", "6", vec![stop_time("635N", HEADER_TS + 60, 0)]);
        // No route id: undecodable entity.
        let bad = gtfs::FeedEntity {
            id: "bad".into(),
            trip_update: Some(gtfs::TripUpdate {
                trip: gtfs::TripDescriptor {
                    trip_id: Some("trip-x".into()),
                    route_id: None,
                    direction_id: None,
                },
                stop_time_update: vec![],
                timestamp: None,
                delay: None,
            }),
            vehicle: None,
            alert: None,
        };

        let msg = gtfs::FeedMessage {
            header: header(),
            entity: vec![good, bad],
        };
        let outcome = decode_feed(&msg.encode_to_vec()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.is_partial());
    }

    #[test]
    fn garbage_header_is_decode_error() {
        let err = decode_feed(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::Header(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let msg = gtfs::FeedMessage {
            header: gtfs::FeedHeader {
                gtfs_realtime_version: "3.0".into(),
                timestamp: Some(HEADER_TS),
            },
            entity: vec![],
        };
        let err = decode_feed(&msg.encode_to_vec()).unwrap_err();
        assert!(matches!(err, DecodeError::Version(v) if v == "3.0"));
    }

    #[test]
    fn vehicle_position_folds_into_trip_records() {
        let mut entity = trip_entity(
            "e0",
            "trip-0",
            "6",
            vec![
                stop_time("635N", HEADER_TS + 60, 0),
                stop_time("634N", HEADER_TS + 180, 0),
            ],
        );
        entity.vehicle = Some(gtfs::VehiclePosition {
            trip: Some(gtfs::TripDescriptor {
                trip_id: Some("trip-0".into()),
                route_id: Some("6".into()),
                direction_id: None,
            }),
            position: Some(gtfs::Position {
                latitude: 40.73,
                longitude: -73.99,
            }),
            current_stop_sequence: Some(3),
            current_status: Some(gtfs::VehicleStopStatus::StoppedAt as i32),
            timestamp: Some(HEADER_TS + 5),
            stop_id: Some("636N".into()),
        });

        let msg = gtfs::FeedMessage {
            header: header(),
            entity: vec![entity],
        };
        let outcome = decode_feed(&msg.encode_to_vec()).unwrap();
        assert_eq!(outcome.records.len(), 2);
        for r in &outcome.records {
            assert_eq!(r.current_status, TripStatus::AtStop);
            assert_eq!(r.current_stop_id.as_deref(), Some("636N"));
            // Entity-level timestamp wins over the header's.
            assert_eq!(r.observed_at.timestamp(), (HEADER_TS + 5) as i64);
            assert!((r.lat.unwrap() - 40.73).abs() < 1e-4);
            assert!((r.lon.unwrap() + 73.99).abs() < 1e-4);
        }
    }

    #[test]
    fn standalone_vehicle_position_becomes_a_record() {
        let entity = gtfs::FeedEntity {
            id: "v0".into(),
            trip_update: None,
            vehicle: Some(gtfs::VehiclePosition {
                trip: Some(gtfs::TripDescriptor {
                    trip_id: Some("trip-9".into()),
                    route_id: Some("L".into()),
                    direction_id: None,
                }),
                position: None,
                current_stop_sequence: None,
                current_status: Some(gtfs::VehicleStopStatus::InTransitTo as i32),
                timestamp: None,
                stop_id: Some("L08S".into()),
            }),
            alert: None,
        };

        let msg = gtfs::FeedMessage {
            header: header(),
            entity: vec![entity],
        };
        let outcome = decode_feed(&msg.encode_to_vec()).unwrap();
        assert_eq!(outcome.entities_seen, 1);
        assert_eq!(outcome.records.len(), 1);
        let r = &outcome.records[0];
        assert_eq!(r.trip_id, "trip-9");
        assert_eq!(r.direction, Direction::South);
        assert_eq!(r.current_status, TripStatus::InTransit);
    }

    #[test]
    fn reencoded_envelope_decodes_identically() {
        let msg = gtfs::FeedMessage {
            header: header(),
            entity: vec![
                trip_entity("e0", "trip-0", "6", vec![stop_time("635N", HEADER_TS + 60, 10)]),
                trip_entity("e1", "trip-1", "L", vec![stop_time("L08S", HEADER_TS + 90, -5)]),
            ],
        };

        let bytes = msg.encode_to_vec();
        let first = decode_feed(&bytes).unwrap();

        let reencoded = gtfs::FeedMessage::decode(bytes.as_slice())
            .unwrap()
            .encode_to_vec();
        let second = decode_feed(&reencoded).unwrap();

        let canon = |o: &DecodeOutcome| {
            o.records
                .iter()
                .map(|r| (r.trip_id.clone(), r.next_stop_id.clone(), r.observed_at))
                .collect::<Vec<_>>()
        };
        assert_eq!(canon(&first), canon(&second));
    }

    #[test]
    fn normalize_keeps_latest_per_trip_stop() {
        let base = canonical("trip-0", "635N", HEADER_TS);
        let newer = canonical("trip-0", "635N", HEADER_TS + 30);
        let other = canonical("trip-1", "635N", HEADER_TS + 10);

        let out = normalize(vec![newer.clone(), base, other]);
        assert_eq!(out.len(), 2);
        let kept = out.iter().find(|r| r.trip_id == "trip-0").unwrap();
        assert_eq!(kept.observed_at, newer.observed_at);
        // Sorted by observed_at.
        assert!(out[0].observed_at <= out[1].observed_at);
    }

    fn canonical(trip_id: &str, stop: &str, ts: u64) -> TripUpdate {
        TripUpdate {
            trip_id: trip_id.into(),
            route_id: "6".into(),
            direction: Direction::North,
            observed_at: unix_ts(ts).unwrap(),
            current_stop_id: None,
            next_stop_id: Some(stop.into()),
            arrival_time: None,
            departure_time: None,
            current_status: TripStatus::Incoming,
            delay_seconds: None,
            lat: None,
            lon: None,
        }
    }
}
