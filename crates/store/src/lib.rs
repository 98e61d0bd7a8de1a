//! Append-only, time-partitioned state store over SQLite.
//!
//! Owns the durable records: positions, feed runs, anomalies, model
//! artifacts, and the mirrored station/route catalog. At-least-once ingest
//! is expected upstream, so position inserts are idempotent on
//! `(trip_id, stop_id, observed_at)`.

mod error;
mod latency;
mod types;

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use headway_core::{Anomaly, FeedRun, ModelArtifact, Route, Station, TripUpdate};

pub use error::StoreError;
pub use latency::WriteLatency;
pub use types::{
    AnomalyPage, AnomalyQuery, AnomalyStats, PositionQuery, SeverityDistribution, TrendPoint,
};

use types::{direction_str, from_epoch, to_epoch, AnomalyRow, ArtifactRow, FeedRunRow, PositionRow};

const POSITION_COLUMNS: &str = "trip_id, route_id, direction, observed_at, current_stop_id, \
     next_stop_id, arrival_time, departure_time, current_status, delay_seconds, lat, lon";

pub struct StateStore {
    pool: SqlitePool,
    write_latency: WriteLatency,
}

impl StateStore {
    /// Open (creating if missing) and migrate the database.
    pub async fn connect(database_url: &str) -> Result<StateStore, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("State store ready at {}", database_url);
        Ok(StateStore {
            pool,
            write_latency: WriteLatency::new(),
        })
    }

    /// In-memory store for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn connect_in_memory() -> Result<StateStore, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(StateStore {
            pool,
            write_latency: WriteLatency::new(),
        })
    }

    /// Liveness probe for `/health/ready`.
    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Rolling p95 write latency, fed to backpressure decisions.
    pub fn write_p95(&self) -> Duration {
        self.write_latency.p95()
    }

    // ── Positions ─────────────────────────────────────────────

    /// Bulk insert; duplicate `(trip_id, stop_id, observed_at)` rows are
    /// silently ignored. Returns the number of rows actually inserted.
    pub async fn insert_positions(&self, batch: &[TripUpdate]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for p in batch {
            let stop_key = p
                .next_stop_id
                .clone()
                .or_else(|| p.current_stop_id.clone())
                .unwrap_or_default();

            let result = sqlx::query(
                "INSERT OR IGNORE INTO positions \
                 (trip_id, route_id, direction, stop_id, observed_at, current_stop_id, \
                  next_stop_id, arrival_time, departure_time, current_status, delay_seconds, lat, lon) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&p.trip_id)
            .bind(&p.route_id)
            .bind(direction_str(p.direction))
            .bind(&stop_key)
            .bind(to_epoch(p.observed_at))
            .bind(&p.current_stop_id)
            .bind(&p.next_stop_id)
            .bind(p.arrival_time.map(to_epoch))
            .bind(p.departure_time.map(to_epoch))
            .bind(p.current_status.as_str())
            .bind(p.delay_seconds)
            .bind(p.lat)
            .bind(p.lon)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        self.write_latency.record(started.elapsed());
        Ok(inserted)
    }

    pub async fn query_positions(&self, q: &PositionQuery) -> Result<Vec<TripUpdate>, StoreError> {
        let mut qb = sqlx::QueryBuilder::new(format!(
            "SELECT {} FROM positions WHERE 1=1",
            POSITION_COLUMNS
        ));
        if let Some(line) = &q.line {
            qb.push(" AND route_id = ").push_bind(line);
        }
        if let Some(station) = &q.station {
            qb.push(" AND stop_id = ").push_bind(station);
        }
        if let Some(since) = q.since {
            qb.push(" AND observed_at >= ").push_bind(to_epoch(since));
        }
        if let Some(until) = q.until {
            qb.push(" AND observed_at < ").push_bind(to_epoch(until));
        }
        qb.push(" ORDER BY observed_at ASC LIMIT ")
            .push_bind(if q.limit > 0 { q.limit } else { 1000 });

        let rows: Vec<PositionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(PositionRow::into_record).collect())
    }

    /// Most recent observation per trip on a line.
    pub async fn latest_positions(&self, line: &str) -> Result<Vec<TripUpdate>, StoreError> {
        let rows: Vec<PositionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM positions WHERE route_id = ? ORDER BY observed_at DESC LIMIT 500",
            POSITION_COLUMNS
        ))
        .bind(line)
        .fetch_all(&self.pool)
        .await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut latest = Vec::new();
        for row in rows {
            if seen.insert(row.trip_id.clone()) {
                latest.push(row.into_record());
            }
        }
        Ok(latest)
    }

    /// One ingest outcome: the FeedRun and its surviving positions commit in
    /// a single transaction. Returns `(run_id, positions_inserted)`.
    pub async fn record_ingest(
        &self,
        run: &FeedRun,
        positions: &[TripUpdate],
    ) -> Result<(i64, u64), StoreError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO feed_runs \
             (feed_id, started_at, finished_at, entities_seen, alerts_seen, skipped, status, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.feed_id)
        .bind(to_epoch(run.started_at))
        .bind(to_epoch(run.finished_at))
        .bind(run.entities_seen as i64)
        .bind(run.alerts_seen as i64)
        .bind(run.skipped as i64)
        .bind(run.status.as_str())
        .bind(run.duration_ms as i64)
        .execute(&mut *tx)
        .await?;
        let run_id = result.last_insert_rowid();

        let mut inserted = 0u64;
        for p in positions {
            let stop_key = p
                .next_stop_id
                .clone()
                .or_else(|| p.current_stop_id.clone())
                .unwrap_or_default();
            let result = sqlx::query(
                "INSERT OR IGNORE INTO positions \
                 (trip_id, route_id, direction, stop_id, observed_at, current_stop_id, \
                  next_stop_id, arrival_time, departure_time, current_status, delay_seconds, lat, lon) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&p.trip_id)
            .bind(&p.route_id)
            .bind(direction_str(p.direction))
            .bind(&stop_key)
            .bind(to_epoch(p.observed_at))
            .bind(&p.current_stop_id)
            .bind(&p.next_stop_id)
            .bind(p.arrival_time.map(to_epoch))
            .bind(p.departure_time.map(to_epoch))
            .bind(p.current_status.as_str())
            .bind(p.delay_seconds)
            .bind(p.lat)
            .bind(p.lon)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        self.write_latency.record(started.elapsed());
        Ok((run_id, inserted))
    }

    // ── Feed runs ─────────────────────────────────────────────

    pub async fn insert_feed_run(&self, run: &FeedRun) -> Result<i64, StoreError> {
        let started = Instant::now();
        let result = sqlx::query(
            "INSERT INTO feed_runs \
             (feed_id, started_at, finished_at, entities_seen, alerts_seen, skipped, status, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.feed_id)
        .bind(to_epoch(run.started_at))
        .bind(to_epoch(run.finished_at))
        .bind(run.entities_seen as i64)
        .bind(run.alerts_seen as i64)
        .bind(run.skipped as i64)
        .bind(run.status.as_str())
        .bind(run.duration_ms as i64)
        .execute(&self.pool)
        .await?;
        self.write_latency.record(started.elapsed());
        Ok(result.last_insert_rowid())
    }

    /// Latest runs across all feeds, newest first.
    pub async fn recent_feed_runs(&self, limit: i64) -> Result<Vec<FeedRun>, StoreError> {
        let rows: Vec<FeedRunRow> = sqlx::query_as(
            "SELECT run_id, feed_id, started_at, finished_at, entities_seen, alerts_seen, \
                    skipped, status, duration_ms \
             FROM feed_runs ORDER BY run_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedRunRow::into_record).collect())
    }

    /// When the last run (of any outcome) finished; readiness freshness check.
    pub async fn last_run_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(finished_at) FROM feed_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(from_epoch))
    }

    // ── Anomalies ─────────────────────────────────────────────

    pub async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StoreError> {
        let started = Instant::now();
        let features = serde_json::to_string(&anomaly.features)?;
        let result = sqlx::query(
            "INSERT INTO anomalies \
             (anomaly_id, detected_at, station_id, route_id, kind, severity, model_name, \
              model_version, features, resolved, resolved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(anomaly.anomaly_id.to_string())
        .bind(to_epoch(anomaly.detected_at))
        .bind(&anomaly.station_id)
        .bind(&anomaly.route_id)
        .bind(anomaly.kind.as_str())
        .bind(anomaly.severity)
        .bind(&anomaly.model_name)
        .bind(anomaly.model_version)
        .bind(features)
        .bind(anomaly.resolved as i64)
        .bind(anomaly.resolved_at.map(to_epoch))
        .execute(&self.pool)
        .await;

        self.write_latency.record(started.elapsed());
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateAnomaly(anomaly.anomaly_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Suppression-window merge: severity only ever goes up.
    pub async fn raise_anomaly_severity(
        &self,
        anomaly_id: Uuid,
        severity: f64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE anomalies SET severity = MAX(severity, ?) WHERE anomaly_id = ?")
            .bind(severity)
            .bind(anomaly_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn query_anomalies(&self, q: &AnomalyQuery) -> Result<AnomalyPage, StoreError> {
        let page = q.page.max(1);
        let page_size = if q.page_size > 0 { q.page_size.min(500) } else { 50 };

        let push_filters = |qb: &mut sqlx::QueryBuilder<sqlx::Sqlite>| {
            if let Some(line) = &q.line {
                qb.push(" AND route_id = ").push_bind(line.clone());
            }
            if let Some(station) = &q.station {
                qb.push(" AND station_id = ").push_bind(station.clone());
            }
            if let Some(min) = q.severity_min {
                qb.push(" AND severity >= ").push_bind(min);
            }
            if let Some(since) = q.since {
                qb.push(" AND detected_at >= ").push_bind(to_epoch(since));
            }
            if let Some(until) = q.until {
                qb.push(" AND detected_at < ").push_bind(to_epoch(until));
            }
        };

        let mut count_qb = sqlx::QueryBuilder::new("SELECT COUNT(*) FROM anomalies WHERE 1=1");
        push_filters(&mut count_qb);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut qb = sqlx::QueryBuilder::new(
            "SELECT anomaly_id, detected_at, station_id, route_id, kind, severity, model_name, \
             model_version, features, resolved, resolved_at FROM anomalies WHERE 1=1",
        );
        push_filters(&mut qb);
        qb.push(" ORDER BY detected_at DESC LIMIT ")
            .push_bind(page_size)
            .push(" OFFSET ")
            .push_bind((page - 1) * page_size);

        let rows: Vec<AnomalyRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(AnomalyPage {
            anomalies: rows.into_iter().map(AnomalyRow::into_record).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn anomaly_stats(&self, hours: u32) -> Result<AnomalyStats, StoreError> {
        let since = to_epoch(Utc::now() - chrono::Duration::hours(hours as i64));

        let total_today: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM anomalies WHERE detected_at >= ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;

        let total_active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM anomalies WHERE detected_at >= ? AND resolved = 0",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, COUNT(*) FROM anomalies WHERE detected_at >= ? GROUP BY kind",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let by_line: Vec<(String, i64)> = sqlx::query_as(
            "SELECT route_id, COUNT(*) FROM anomalies \
             WHERE detected_at >= ? AND route_id IS NOT NULL GROUP BY route_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let (low, medium, high): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COALESCE(SUM(CASE WHEN severity < 0.4 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN severity >= 0.4 AND severity < 0.7 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN severity >= 0.7 THEN 1 ELSE 0 END), 0) \
             FROM anomalies WHERE detected_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let trend: Vec<(i64, i64, f64)> = sqlx::query_as(
            "SELECT (detected_at / 3600) * 3600 AS hour, COUNT(*), COALESCE(AVG(severity), 0) \
             FROM anomalies WHERE detected_at >= ? GROUP BY hour ORDER BY hour ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(AnomalyStats {
            total_today,
            total_active,
            by_type: by_type.into_iter().collect(),
            by_line: by_line.into_iter().collect(),
            severity_distribution: SeverityDistribution { low, medium, high },
            trend_24h: trend
                .into_iter()
                .map(|(hour, count, avg_severity)| TrendPoint {
                    hour,
                    count,
                    avg_severity,
                })
                .collect(),
        })
    }

    // ── Retention ─────────────────────────────────────────────

    /// Delete all time-partitioned rows older than `ts`. Returns rows removed.
    pub async fn purge_before(&self, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let epoch = to_epoch(ts);
        let mut tx = self.pool.begin().await?;
        let mut purged = 0u64;
        for sql in [
            "DELETE FROM positions WHERE observed_at < ?",
            "DELETE FROM feed_runs WHERE finished_at < ?",
            "DELETE FROM anomalies WHERE detected_at < ?",
        ] {
            purged += sqlx::query(sql).bind(epoch).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(purged)
    }

    // ── Model artifacts ───────────────────────────────────────

    /// Persist a trained model; the next version number is assigned inside
    /// one transaction so concurrent trainers cannot collide.
    pub async fn put_model_artifact(
        &self,
        name: &str,
        payload: &[u8],
        hyperparams: &BTreeMap<String, f64>,
        training_window_hours: u32,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_artifacts WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO model_artifacts (name, version, trained_at, payload, hyperparams, training_window_hours) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(version)
        .bind(to_epoch(Utc::now()))
        .bind(payload)
        .bind(serde_json::to_string(hyperparams)?)
        .bind(training_window_hours as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version)
    }

    pub async fn get_latest_artifact(&self, name: &str) -> Result<Option<ModelArtifact>, StoreError> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            "SELECT name, version, trained_at, payload, hyperparams, training_window_hours \
             FROM model_artifacts WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ArtifactRow::into_record))
    }

    /// Whether `(name, version)` existed at or before `at`. Used to audit the
    /// model-causality invariant.
    pub async fn artifact_existed_at(
        &self,
        name: &str,
        version: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM model_artifacts WHERE name = ? AND version = ? AND trained_at <= ?",
        )
        .bind(name)
        .bind(version)
        .bind(to_epoch(at))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ── Catalog mirror ────────────────────────────────────────

    /// Idempotent upsert: concurrent loaders keep the existing row.
    pub async fn upsert_stations(&self, stations: &[Station]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for s in stations {
            sqlx::query(
                "INSERT INTO stations (stop_id, name, lat, lon, parent_id, routes_served) \
                 VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (stop_id) DO NOTHING",
            )
            .bind(&s.stop_id)
            .bind(&s.name)
            .bind(s.lat)
            .bind(s.lon)
            .bind(&s.parent_id)
            .bind(serde_json::to_string(&s.routes_served)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_routes(&self, routes: &[Route]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for r in routes {
            sqlx::query(
                "INSERT INTO routes (route_id, display_name, color) \
                 VALUES (?, ?, ?) ON CONFLICT (route_id) DO NOTHING",
            )
            .bind(&r.route_id)
            .bind(&r.display_name)
            .bind(&r.color)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use headway_core::{AnomalyKind, Direction, FeedRunStatus, TripStatus};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn position(trip: &str, stop: &str, observed: i64) -> TripUpdate {
        TripUpdate {
            trip_id: trip.into(),
            route_id: "6".into(),
            direction: Direction::North,
            observed_at: at(observed),
            current_stop_id: None,
            next_stop_id: Some(stop.into()),
            arrival_time: Some(at(observed + 120)),
            departure_time: None,
            current_status: TripStatus::Incoming,
            delay_seconds: Some(30),
            lat: None,
            lon: None,
        }
    }

    fn anomaly(id: Uuid, detected: i64, severity: f64) -> Anomaly {
        Anomaly {
            anomaly_id: id,
            detected_at: at(detected),
            station_id: Some("635".into()),
            route_id: Some("6".into()),
            kind: AnomalyKind::HeadwayOutlier,
            severity,
            model_name: "isolation_forest".into(),
            model_version: 1,
            features: [("headway_s".to_string(), 900.0)].into_iter().collect(),
            resolved: false,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn position_insert_is_idempotent() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let batch = vec![position("t1", "635N", 1_700_000_000), position("t2", "635N", 1_700_000_010)];

        assert_eq!(store.insert_positions(&batch).await.unwrap(), 2);
        // Re-ingesting the identical snapshot inserts nothing.
        assert_eq!(store.insert_positions(&batch).await.unwrap(), 0);

        let rows = store.query_positions(&PositionQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn positions_are_ordered_and_filterable() {
        let store = StateStore::connect_in_memory().await.unwrap();
        store
            .insert_positions(&[
                position("t1", "635N", 1_700_000_300),
                position("t2", "631N", 1_700_000_100),
                position("t3", "635N", 1_700_000_200),
            ])
            .await
            .unwrap();

        let all = store.query_positions(&PositionQuery::default()).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].observed_at <= w[1].observed_at));

        let q = PositionQuery {
            station: Some("635N".into()),
            ..Default::default()
        };
        assert_eq!(store.query_positions(&q).await.unwrap().len(), 2);

        let q = PositionQuery {
            since: Some(at(1_700_000_150)),
            until: Some(at(1_700_000_250)),
            ..Default::default()
        };
        let windowed = store.query_positions(&q).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].trip_id, "t3");
    }

    #[tokio::test]
    async fn feed_run_ids_are_monotonic() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let run = FeedRun {
            run_id: 0,
            feed_id: "ace".into(),
            started_at: at(1_700_000_000),
            finished_at: at(1_700_000_001),
            entities_seen: 3,
            alerts_seen: 0,
            skipped: 0,
            status: FeedRunStatus::Ok,
            duration_ms: 840,
        };
        let first = store.insert_feed_run(&run).await.unwrap();
        let second = store.insert_feed_run(&run).await.unwrap();
        assert!(second > first);

        let runs = store.recent_feed_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[0].status, FeedRunStatus::Ok);

        assert_eq!(store.last_run_at().await.unwrap(), Some(at(1_700_000_001)));
    }

    #[tokio::test]
    async fn record_ingest_commits_run_and_positions_together() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let run = FeedRun {
            run_id: 0,
            feed_id: "1234567".into(),
            started_at: at(1_700_000_000),
            finished_at: at(1_700_000_001),
            entities_seen: 2,
            alerts_seen: 0,
            skipped: 0,
            status: FeedRunStatus::Ok,
            duration_ms: 500,
        };
        let batch = vec![position("t1", "635N", 1_700_000_000), position("t2", "631N", 1_700_000_000)];

        let (run_id, inserted) = store.record_ingest(&run, &batch).await.unwrap();
        assert_eq!(run_id, 1);
        assert_eq!(inserted, 2);

        // Re-ingest is idempotent on positions but still records the attempt.
        let (run_id, inserted) = store.record_ingest(&run, &batch).await.unwrap();
        assert_eq!(run_id, 2);
        assert_eq!(inserted, 0);
    }

    #[tokio::test]
    async fn duplicate_anomaly_id_is_rejected() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.insert_anomaly(&anomaly(id, 1_700_000_000, 0.8)).await.unwrap();
        let err = store.insert_anomaly(&anomaly(id, 1_700_000_100, 0.9)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAnomaly(dup) if dup == id));
    }

    #[tokio::test]
    async fn severity_is_only_raised() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.insert_anomaly(&anomaly(id, 1_700_000_000, 0.6)).await.unwrap();

        store.raise_anomaly_severity(id, 0.9).await.unwrap();
        let page = store.query_anomalies(&AnomalyQuery::default()).await.unwrap();
        assert!((page.anomalies[0].severity - 0.9).abs() < 1e-9);

        // A lower score never lowers the stored severity.
        store.raise_anomaly_severity(id, 0.2).await.unwrap();
        let page = store.query_anomalies(&AnomalyQuery::default()).await.unwrap();
        assert!((page.anomalies[0].severity - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn anomaly_queries_filter_and_page() {
        let store = StateStore::connect_in_memory().await.unwrap();
        for i in 0..25 {
            let mut a = anomaly(Uuid::new_v4(), 1_700_000_000 + i * 60, 0.5);
            if i % 5 == 0 {
                a.route_id = Some("L".into());
                a.severity = 0.85;
            }
            store.insert_anomaly(&a).await.unwrap();
        }

        let q = AnomalyQuery {
            page: 1,
            page_size: 10,
            ..Default::default()
        };
        let page = store.query_anomalies(&q).await.unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.anomalies.len(), 10);
        // Newest first.
        assert!(page.anomalies[0].detected_at >= page.anomalies[9].detected_at);

        let q = AnomalyQuery {
            line: Some("L".into()),
            severity_min: Some(0.7),
            page: 1,
            page_size: 10,
            ..Default::default()
        };
        let filtered = store.query_anomalies(&q).await.unwrap();
        assert_eq!(filtered.total, 5);
        assert!(filtered.anomalies.iter().all(|a| a.route_id.as_deref() == Some("L")));
    }

    #[tokio::test]
    async fn stats_bucket_severities() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let now = Utc::now().timestamp();
        for (i, sev) in [0.1, 0.5, 0.75, 0.95].iter().enumerate() {
            store
                .insert_anomaly(&anomaly(Uuid::new_v4(), now - i as i64 * 60, *sev))
                .await
                .unwrap();
        }

        let stats = store.anomaly_stats(24).await.unwrap();
        assert_eq!(stats.total_today, 4);
        assert_eq!(stats.total_active, 4);
        assert_eq!(stats.severity_distribution.low, 1);
        assert_eq!(stats.severity_distribution.medium, 1);
        assert_eq!(stats.severity_distribution.high, 2);
        assert_eq!(stats.by_type.get("headway_outlier"), Some(&4));
        assert!(!stats.trend_24h.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_old_rows_everywhere() {
        let store = StateStore::connect_in_memory().await.unwrap();
        store
            .insert_positions(&[position("t1", "635N", 1_000), position("t2", "635N", 10_000)])
            .await
            .unwrap();
        store.insert_anomaly(&anomaly(Uuid::new_v4(), 1_000, 0.5)).await.unwrap();
        store.insert_anomaly(&anomaly(Uuid::new_v4(), 10_000, 0.5)).await.unwrap();

        let purged = store.purge_before(at(5_000)).await.unwrap();
        assert_eq!(purged, 2);

        let positions = store.query_positions(&PositionQuery::default()).await.unwrap();
        assert!(positions.iter().all(|p| p.observed_at >= at(5_000)));
        let anomalies = store.query_anomalies(&AnomalyQuery::default()).await.unwrap();
        assert_eq!(anomalies.total, 1);
    }

    #[tokio::test]
    async fn artifact_versions_are_monotonic_per_name() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let hp: BTreeMap<String, f64> = [("trees".to_string(), 100.0)].into_iter().collect();

        let v1 = store.put_model_artifact("isolation_forest", b"one", &hp, 168).await.unwrap();
        let v2 = store.put_model_artifact("isolation_forest", b"two", &hp, 168).await.unwrap();
        let other = store.put_model_artifact("autoencoder", b"ae", &hp, 168).await.unwrap();
        assert_eq!((v1, v2, other), (1, 2, 1));

        let latest = store.get_latest_artifact("isolation_forest").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.payload, b"two");
        assert_eq!(latest.hyperparams.get("trees"), Some(&100.0));

        assert!(store.artifact_existed_at("isolation_forest", 2, Utc::now()).await.unwrap());
        assert!(!store.artifact_existed_at("isolation_forest", 3, Utc::now()).await.unwrap());

        assert!(store.get_latest_artifact("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn catalog_upsert_keeps_existing() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let station = Station {
            stop_id: "635".into(),
            name: "14 St - Union Sq".into(),
            lat: 40.73,
            lon: -73.99,
            parent_id: None,
            routes_served: ["6".to_string()].into_iter().collect(),
        };
        store.upsert_stations(std::slice::from_ref(&station)).await.unwrap();

        // Conflicting reload: existing row wins.
        let renamed = Station {
            name: "renamed".into(),
            ..station.clone()
        };
        store.upsert_stations(&[renamed]).await.unwrap();

        let name: String = sqlx::query_scalar("SELECT name FROM stations WHERE stop_id = '635'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(name, "14 St - Union Sq");
    }
}
