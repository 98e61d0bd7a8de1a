//! Ensemble scoring with duplicate suppression and hot model swaps.
//!
//! The detector never blocks scoring on training: models swap in atomically
//! via `arc-swap`, and scoring against an absent model returns an empty,
//! `model_cold`-annotated outcome.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use headway_core::config::DetectorConfig;
use headway_core::{Anomaly, AnomalyKind};

use crate::features::FrameVector;
use crate::train::{
    OutlierModel, SequenceModel, SequenceStep, OUTLIER_MODEL_NAME, SEQUENCE_MODEL_NAME,
};

/// Per-model lifecycle: `absent → training → ready → refreshing → ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Absent,
    Training,
    Ready,
    Refreshing,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Absent => "absent",
            ModelState::Training => "training",
            ModelState::Ready => "ready",
            ModelState::Refreshing => "refreshing",
        }
    }
}

/// What the scheduler should do with one scored result. Anomalies are only
/// published to subscribers after the store write succeeds, so the detector
/// hands out decisions instead of side effects.
#[derive(Debug, Clone)]
pub enum ScoreDecision {
    Insert(Anomaly),
    /// Duplicate within the suppression window: raise severity in place.
    Raise { anomaly_id: Uuid, severity: f64 },
}

#[derive(Debug, Default)]
pub struct ScoreOutcome {
    pub decisions: Vec<ScoreDecision>,
    /// True when scoring was requested against an absent model.
    pub model_cold: bool,
}

struct SuppressEntry {
    anomaly_id: Uuid,
    emitted_at: DateTime<Utc>,
    severity: f64,
}

pub struct Detector {
    config: DetectorConfig,
    outlier: ArcSwapOption<OutlierModel>,
    sequence: ArcSwapOption<SequenceModel>,
    outlier_state: Mutex<ModelState>,
    sequence_state: Mutex<ModelState>,
    /// (target, kind) → last emission, for the suppression window.
    suppress: Mutex<HashMap<(String, AnomalyKind), SuppressEntry>>,
    /// Live per-line sequence buffers fed once per detection tick.
    lines: Mutex<HashMap<String, VecDeque<SequenceStep>>>,
    last_sequence_eval: Mutex<HashMap<String, DateTime<Utc>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Outlier,
    Sequence,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Detector {
            config,
            outlier: ArcSwapOption::empty(),
            sequence: ArcSwapOption::empty(),
            outlier_state: Mutex::new(ModelState::Absent),
            sequence_state: Mutex::new(ModelState::Absent),
            suppress: Mutex::new(HashMap::new()),
            lines: Mutex::new(HashMap::new()),
            last_sequence_eval: Mutex::new(HashMap::new()),
        }
    }

    // ── Model lifecycle ───────────────────────────────────────

    pub fn state(&self, kind: ModelKind) -> ModelState {
        if kind == ModelKind::Sequence && !self.config.sequence_model_enabled {
            return ModelState::Absent;
        }
        *self.state_lock(kind).lock().unwrap()
    }

    fn state_lock(&self, kind: ModelKind) -> &Mutex<ModelState> {
        match kind {
            ModelKind::Outlier => &self.outlier_state,
            ModelKind::Sequence => &self.sequence_state,
        }
    }

    /// `absent → training` or `ready → refreshing`.
    pub fn begin_training(&self, kind: ModelKind) {
        let mut state = self.state_lock(kind).lock().unwrap();
        *state = match *state {
            ModelState::Absent | ModelState::Training => ModelState::Training,
            ModelState::Ready | ModelState::Refreshing => ModelState::Refreshing,
        };
    }

    /// A failed run keeps whatever was serving before.
    pub fn training_failed(&self, kind: ModelKind) {
        let mut state = self.state_lock(kind).lock().unwrap();
        *state = match *state {
            ModelState::Refreshing => ModelState::Ready,
            _ => ModelState::Absent,
        };
    }

    /// Atomic swap; readers always observe a consistent (model, threshold).
    pub fn install_outlier(&self, model: OutlierModel) {
        self.outlier.store(Some(std::sync::Arc::new(model)));
        *self.outlier_state.lock().unwrap() = ModelState::Ready;
    }

    pub fn install_sequence(&self, model: SequenceModel) {
        self.sequence.store(Some(std::sync::Arc::new(model)));
        *self.sequence_state.lock().unwrap() = ModelState::Ready;
    }

    pub fn outlier_version(&self) -> Option<i64> {
        self.outlier.load().as_ref().map(|m| m.version)
    }

    pub fn sequence_version(&self) -> Option<i64> {
        self.sequence.load().as_ref().map(|m| m.version)
    }

    // ── Frame scoring (M1) ────────────────────────────────────

    pub fn score_frames(&self, frames: &[FrameVector], now: DateTime<Utc>) -> ScoreOutcome {
        let Some(model) = self.outlier.load_full() else {
            return ScoreOutcome {
                decisions: Vec::new(),
                model_cold: true,
            };
        };

        let mut outcome = ScoreOutcome::default();
        for fv in frames {
            let score = model.forest.score(&fv.vector);
            if score < model.threshold {
                continue;
            }

            let kind = dominant_kind(&fv.vector);
            let severity = score.clamp(0.0, 1.0);
            let target = fv.frame.stop_id.clone();

            let mut features: BTreeMap<String, f64> = BTreeMap::new();
            features.insert("headway_s".into(), fv.vector[0]);
            features.insert("dwell_s".into(), fv.vector[1]);
            features.insert("delay_s".into(), fv.vector[2]);
            features.insert("headway_z".into(), fv.vector[3]);
            features.insert("dwell_z".into(), fv.vector[4]);
            features.insert("score".into(), score);

            let anomaly = Anomaly {
                anomaly_id: Uuid::new_v4(),
                detected_at: now,
                station_id: Some(fv.frame.stop_id.clone()),
                route_id: Some(fv.frame.route_id.clone()),
                kind,
                severity,
                model_name: OUTLIER_MODEL_NAME.to_string(),
                model_version: model.version,
                features,
                resolved: false,
                resolved_at: None,
            };

            if let Some(decision) = self.suppress_or_insert(target, anomaly, now) {
                outcome.decisions.push(decision);
            }
        }
        outcome
    }

    // ── Sequence scoring (M2) ─────────────────────────────────

    /// Feed this tick's frames into the per-line sequence buffers. One call
    /// = one tick = one step per line.
    pub fn observe_tick(&self, frames: &[FrameVector]) {
        if !self.config.sequence_model_enabled {
            return;
        }

        // (sum, count) per dimension per line.
        let mut agg: HashMap<&str, ([f64; 3], [usize; 3])> = HashMap::new();
        for fv in frames {
            let entry = agg.entry(&fv.frame.route_id).or_default();
            if fv.frame.headway_s > 0.0 {
                entry.0[0] += fv.frame.headway_s;
                entry.1[0] += 1;
            }
            entry.0[1] += fv.frame.delay_s;
            entry.1[1] += 1;
            if let Some(dwell) = fv.frame.dwell_s {
                entry.0[2] += dwell;
                entry.1[2] += 1;
            }
        }

        let cap = self.config.sequence_length as usize;
        let mut lines = self.lines.lock().unwrap();
        for (line, (sums, counts)) in agg {
            let mut step = [0.0; 3];
            for d in 0..3 {
                if counts[d] > 0 {
                    step[d] = sums[d] / counts[d] as f64;
                }
            }
            let buffer = lines.entry(line.to_string()).or_default();
            buffer.push_back(step);
            while buffer.len() > cap {
                buffer.pop_front();
            }
        }
    }

    /// Evaluate lines whose buffers are full and whose cadence is due.
    pub fn score_sequences(&self, now: DateTime<Utc>) -> ScoreOutcome {
        if !self.config.sequence_model_enabled {
            return ScoreOutcome::default();
        }
        let Some(model) = self.sequence.load_full() else {
            return ScoreOutcome {
                decisions: Vec::new(),
                model_cold: true,
            };
        };

        let tick = Duration::seconds(self.config.sequence_tick_s as i64);
        let mut outcome = ScoreOutcome::default();
        let lines = self.lines.lock().unwrap();

        for (line, buffer) in lines.iter() {
            if buffer.len() < model.sequence_length {
                continue;
            }
            {
                let mut last_eval = self.last_sequence_eval.lock().unwrap();
                match last_eval.get(line) {
                    Some(last) if now.signed_duration_since(*last) < tick => continue,
                    _ => {
                        last_eval.insert(line.clone(), now);
                    }
                }
            }

            let window: Vec<SequenceStep> = buffer
                .iter()
                .rev()
                .take(model.sequence_length)
                .rev()
                .copied()
                .collect();
            let error = model.error_for(&window);
            if !model.is_anomalous(error) {
                continue;
            }

            let severity = model.severity_for(error);
            debug!(line = %line, error, severity, "sequence reconstruction anomaly");

            let mut features: BTreeMap<String, f64> = BTreeMap::new();
            features.insert("reconstruction_error".into(), error);
            features.insert("error_p95".into(), model.error_p95);
            features.insert("error_p99".into(), model.error_p99);

            let anomaly = Anomaly {
                anomaly_id: Uuid::new_v4(),
                detected_at: now,
                station_id: None,
                route_id: Some(line.clone()),
                kind: AnomalyKind::SequenceReconstruction,
                severity,
                model_name: SEQUENCE_MODEL_NAME.to_string(),
                model_version: model.version,
                features,
                resolved: false,
                resolved_at: None,
            };

            if let Some(decision) = self.suppress_or_insert(line.clone(), anomaly, now) {
                outcome.decisions.push(decision);
            }
        }
        outcome
    }

    // ── Suppression ───────────────────────────────────────────

    /// Within the suppression window, a repeat at the same (target, kind)
    /// raises the stored severity to the max instead of inserting.
    fn suppress_or_insert(
        &self,
        target: String,
        anomaly: Anomaly,
        now: DateTime<Utc>,
    ) -> Option<ScoreDecision> {
        let window = Duration::seconds(self.config.suppress_window_s as i64);
        let mut suppress = self.suppress.lock().unwrap();
        let key = (target, anomaly.kind);

        if let Some(entry) = suppress.get_mut(&key) {
            if now.signed_duration_since(entry.emitted_at) < window {
                let raised = entry.severity.max(anomaly.severity);
                if raised > entry.severity {
                    entry.severity = raised;
                    return Some(ScoreDecision::Raise {
                        anomaly_id: entry.anomaly_id,
                        severity: raised,
                    });
                }
                return None;
            }
        }

        suppress.insert(
            key,
            SuppressEntry {
                anomaly_id: anomaly.anomaly_id,
                emitted_at: now,
                severity: anomaly.severity,
            },
        );
        Some(ScoreDecision::Insert(anomaly))
    }
}

/// The signal that dominates the vector names the anomaly kind.
fn dominant_kind(vector: &[f64; 5]) -> AnomalyKind {
    let headway = vector[3].abs();
    let dwell = vector[4].abs();
    let delay = vector[2].abs() / 600.0;
    if headway >= dwell && headway >= delay {
        AnomalyKind::HeadwayOutlier
    } else if dwell >= delay {
        AnomalyKind::DwellOutlier
    } else {
        AnomalyKind::DelaySpike
    }
}
