//! Model fitting and artifact (de)serialization.
//!
//! Training is pure: the scheduler loads recent positions, replays them
//! through a fresh [`FeatureEngine`](crate::FeatureEngine), and hands the
//! resulting vectors here. Artifacts are MessagePack blobs versioned by the
//! store.

use std::collections::{BTreeMap, HashMap};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::algorithms::iforest::{self, IsolationForest, DEFAULT_SUBSAMPLE, DEFAULT_TREES, FEATURE_DIM};
use crate::algorithms::Autoencoder;
use crate::error::ComputeError;
use crate::features::FrameVector;

pub const OUTLIER_MODEL_NAME: &str = "isolation_forest";
pub const SEQUENCE_MODEL_NAME: &str = "sequence_autoencoder";

/// Minimum frames before the outlier model trains at all.
pub const MIN_TRAINING_FRAMES: usize = 100;

/// Minimum flattened sequences before the sequence model trains.
pub const MIN_TRAINING_SEQUENCES: usize = 32;

const AUTOENCODER_EPOCHS: usize = 60;
const AUTOENCODER_LR: f64 = 0.005;

/// Per-line aggregates for one feed tick: `[mean_headway, mean_delay, mean_dwell]`.
pub type SequenceStep = [f64; 3];

// ── Outlier model (M1) ────────────────────────────────────────

/// Fitted isolation forest plus its decision threshold. The version is
/// attached when the artifact round-trips through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierModel {
    pub forest: IsolationForest,
    /// Empirical `(1 - contamination)` quantile of training scores.
    pub threshold: f64,
    pub contamination: f64,
    #[serde(default)]
    pub version: i64,
}

pub fn fit_outlier_model(
    vectors: &[[f64; FEATURE_DIM]],
    contamination: f64,
    seed: u64,
) -> Result<OutlierModel, ComputeError> {
    if vectors.len() < MIN_TRAINING_FRAMES {
        return Err(ComputeError::InsufficientData {
            needed: MIN_TRAINING_FRAMES,
            got: vectors.len(),
        });
    }

    let forest = IsolationForest::fit(vectors, DEFAULT_TREES, DEFAULT_SUBSAMPLE, seed);
    let scores: Vec<f64> = vectors.iter().map(|v| forest.score(v)).collect();
    let threshold = iforest::quantile(&scores, 1.0 - contamination);

    Ok(OutlierModel {
        forest,
        threshold,
        contamination,
        version: 0,
    })
}

impl OutlierModel {
    pub fn hyperparams(&self) -> BTreeMap<String, f64> {
        [
            ("trees".to_string(), self.forest.tree_count() as f64),
            ("subsample".to_string(), DEFAULT_SUBSAMPLE as f64),
            ("contamination".to_string(), self.contamination),
            ("threshold".to_string(), self.threshold),
        ]
        .into_iter()
        .collect()
    }
}

// ── Sequence model (M2) ───────────────────────────────────────

/// Autoencoder over flattened per-line sequences, plus the training-error
/// percentiles that anchor severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    pub autoencoder: Autoencoder,
    pub sequence_length: usize,
    pub error_p50: f64,
    pub error_p95: f64,
    pub error_p99: f64,
    /// Min-max scaling bounds per step dimension.
    pub feature_min: SequenceStep,
    pub feature_max: SequenceStep,
    #[serde(default)]
    pub version: i64,
}

pub fn fit_sequence_model(
    series: &HashMap<String, Vec<SequenceStep>>,
    sequence_length: usize,
    hidden_size: usize,
    seed: u64,
) -> Result<SequenceModel, ComputeError> {
    let mut feature_min = [f64::INFINITY; 3];
    let mut feature_max = [f64::NEG_INFINITY; 3];
    for steps in series.values() {
        for step in steps {
            for d in 0..3 {
                feature_min[d] = feature_min[d].min(step[d]);
                feature_max[d] = feature_max[d].max(step[d]);
            }
        }
    }

    // Sliding windows per line, flattened.
    let mut windows: Vec<Vec<f64>> = Vec::new();
    for steps in series.values() {
        if steps.len() < sequence_length {
            continue;
        }
        for window in steps.windows(sequence_length) {
            windows.push(flatten_scaled(window, &feature_min, &feature_max));
        }
    }

    if windows.len() < MIN_TRAINING_SEQUENCES {
        return Err(ComputeError::InsufficientData {
            needed: MIN_TRAINING_SEQUENCES,
            got: windows.len(),
        });
    }

    let input = sequence_length * 3;
    let sizes = [input, hidden_size, 64, 32, 64, hidden_size, input];
    let mut autoencoder = Autoencoder::new(&sizes, seed);
    autoencoder.train(&windows, AUTOENCODER_EPOCHS, AUTOENCODER_LR, seed ^ 0x5eed);

    let mut errors: Vec<f64> = windows
        .iter()
        .map(|w| autoencoder.reconstruction_error(w))
        .collect();
    errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pct = |q: f64| {
        let idx = ((errors.len() as f64 - 1.0) * q).round() as usize;
        errors[idx]
    };

    Ok(SequenceModel {
        autoencoder,
        sequence_length,
        error_p50: pct(0.50),
        error_p95: pct(0.95),
        error_p99: pct(0.99),
        feature_min,
        feature_max,
        version: 0,
    })
}

impl SequenceModel {
    /// Reconstruction error of a live window.
    pub fn error_for(&self, window: &[SequenceStep]) -> f64 {
        let flat = flatten_scaled(window, &self.feature_min, &self.feature_max);
        self.autoencoder.reconstruction_error(&flat)
    }

    /// severity = clamp((err − p50) / (p99 − p50), 0, 1).
    pub fn severity_for(&self, error: f64) -> f64 {
        let span = self.error_p99 - self.error_p50;
        if span <= f64::EPSILON {
            return if error >= self.error_p95 { 1.0 } else { 0.0 };
        }
        ((error - self.error_p50) / span).clamp(0.0, 1.0)
    }

    pub fn is_anomalous(&self, error: f64) -> bool {
        error >= self.error_p95
    }

    pub fn hyperparams(&self) -> BTreeMap<String, f64> {
        [
            ("sequence_length".to_string(), self.sequence_length as f64),
            ("input_size".to_string(), self.autoencoder.input_size() as f64),
            ("error_p50".to_string(), self.error_p50),
            ("error_p95".to_string(), self.error_p95),
            ("error_p99".to_string(), self.error_p99),
        ]
        .into_iter()
        .collect()
    }
}

fn flatten_scaled(window: &[SequenceStep], min: &SequenceStep, max: &SequenceStep) -> Vec<f64> {
    let mut flat = Vec::with_capacity(window.len() * 3);
    for step in window {
        for d in 0..3 {
            let span = max[d] - min[d];
            flat.push(if span <= f64::EPSILON {
                0.0
            } else {
                ((step[d] - min[d]) / span).clamp(0.0, 1.0)
            });
        }
    }
    flat
}

// ── Artifact codec ────────────────────────────────────────────

pub fn encode_artifact<T: Serialize>(model: &T) -> Result<Vec<u8>, ComputeError> {
    rmp_serde::to_vec(model).map_err(|e| ComputeError::Artifact(e.to_string()))
}

pub fn decode_artifact<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ComputeError> {
    rmp_serde::from_slice(payload).map_err(|e| ComputeError::Artifact(e.to_string()))
}

// ── Training-set assembly ─────────────────────────────────────

/// Bucket frames into per-line tick aggregates ordered by time. One step =
/// one feed tick.
pub fn build_line_series(
    frames: &[FrameVector],
    tick: Duration,
) -> HashMap<String, Vec<SequenceStep>> {
    let tick_s = tick.num_seconds().max(1);

    // (line, bucket) -> sums
    let mut buckets: HashMap<String, BTreeMap<i64, ([f64; 3], [usize; 3])>> = HashMap::new();
    for fv in frames {
        let bucket = fv.frame.observed_at.timestamp() / tick_s;
        let entry = buckets
            .entry(fv.frame.route_id.clone())
            .or_default()
            .entry(bucket)
            .or_insert(([0.0; 3], [0; 3]));

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

    buckets
        .into_iter()
        .map(|(line, ticks)| {
            let steps = ticks
                .into_values()
                .map(|(sums, counts)| {
                    let mut step = [0.0; 3];
                    for d in 0..3 {
                        if counts[d] > 0 {
                            step[d] = sums[d] / counts[d] as f64;
                        }
                    }
                    step
                })
                .collect();
            (line, steps)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use headway_core::FeatureFrame;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn vectors(n: usize, seed: u64) -> Vec<[f64; FEATURE_DIM]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                [
                    180.0 + rng.gen_range(-30.0..30.0),
                    30.0 + rng.gen_range(-5.0..5.0),
                    rng.gen_range(-60.0..120.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                ]
            })
            .collect()
    }

    #[test]
    fn outlier_training_needs_enough_frames() {
        let few = vectors(10, 1);
        let err = fit_outlier_model(&few, 0.05, 7).unwrap_err();
        assert!(matches!(err, ComputeError::InsufficientData { .. }));
    }

    #[test]
    fn outlier_model_flags_extreme_vector() {
        let data = vectors(400, 2);
        let model = fit_outlier_model(&data, 0.05, 7).unwrap();
        assert!(model.threshold > 0.0 && model.threshold < 1.0);

        let outlier_score = model.forest.score(&[900.0, 400.0, 1800.0, 24.0, 10.0]);
        assert!(outlier_score >= model.threshold);

        let inlier_score = model.forest.score(&data[0]);
        assert!(inlier_score < outlier_score);
    }

    #[test]
    fn outlier_artifact_roundtrip() {
        let data = vectors(200, 3);
        let model = fit_outlier_model(&data, 0.05, 7).unwrap();
        let payload = encode_artifact(&model).unwrap();
        let restored: OutlierModel = decode_artifact(&payload).unwrap();
        let x = [500.0, 60.0, 600.0, 8.0, 3.0];
        assert_eq!(model.forest.score(&x), restored.forest.score(&x));
        assert_eq!(model.threshold, restored.threshold);
    }

    fn steady_series(lines: &[&str], len: usize) -> HashMap<String, Vec<SequenceStep>> {
        let mut rng = StdRng::seed_from_u64(11);
        lines
            .iter()
            .map(|line| {
                let steps = (0..len)
                    .map(|_| {
                        [
                            180.0 + rng.gen_range(-20.0..20.0),
                            30.0 + rng.gen_range(-15.0..15.0),
                            25.0 + rng.gen_range(-5.0..5.0),
                        ]
                    })
                    .collect();
                (line.to_string(), steps)
            })
            .collect()
    }

    #[test]
    fn sequence_model_scores_disrupted_window_higher() {
        let series = steady_series(&["6", "L"], 60);
        let model = fit_sequence_model(&series, 12, 16, 5).unwrap();

        let normal: Vec<SequenceStep> = series["6"][0..12].to_vec();
        let normal_err = model.error_for(&normal);

        // Sustained 15-minute headways: far off the training manifold.
        let disrupted: Vec<SequenceStep> = (0..12).map(|_| [900.0, 600.0, 200.0]).collect();
        let disrupted_err = model.error_for(&disrupted);

        assert!(disrupted_err > normal_err, "{} vs {}", disrupted_err, normal_err);
        assert!(model.is_anomalous(disrupted_err));

        let severity = model.severity_for(disrupted_err);
        assert!((0.0..=1.0).contains(&severity));
        assert!(severity > 0.5);
    }

    #[test]
    fn sequence_training_needs_enough_windows() {
        let series = steady_series(&["6"], 5);
        let err = fit_sequence_model(&series, 12, 16, 5).unwrap_err();
        assert!(matches!(err, ComputeError::InsufficientData { .. }));
    }

    #[test]
    fn sequence_artifact_roundtrip() {
        let series = steady_series(&["6", "L"], 50);
        let model = fit_sequence_model(&series, 12, 16, 5).unwrap();
        let payload = encode_artifact(&model).unwrap();
        let restored: SequenceModel = decode_artifact(&payload).unwrap();
        let window: Vec<SequenceStep> = series["L"][0..12].to_vec();
        assert_eq!(model.error_for(&window), restored.error_for(&window));
    }

    #[test]
    fn line_series_buckets_by_tick() {
        let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap();
        let frame = |line: &str, secs: i64, headway: f64| FrameVector {
            frame: FeatureFrame {
                trip_id: "t".into(),
                route_id: line.into(),
                stop_id: "635".into(),
                observed_at: at(secs),
                headway_s: headway,
                dwell_s: Some(20.0),
                delay_s: 60.0,
                schedule_adherence: 0.1,
                rolling_headway_mean: headway,
                rolling_headway_stdev: 10.0,
            },
            vector: [headway, 20.0, 60.0, 0.0, 0.0],
        };

        let frames = vec![
            frame("6", 0, 170.0),
            frame("6", 10, 190.0),
            frame("6", 40, 200.0),
            frame("L", 5, 240.0),
        ];
        let series = build_line_series(&frames, Duration::seconds(30));

        let six = &series["6"];
        assert_eq!(six.len(), 2);
        // First tick averages the two frames.
        assert!((six[0][0] - 180.0).abs() < 1e-9);
        assert!((six[1][0] - 200.0).abs() < 1e-9);
        assert_eq!(series["L"].len(), 1);
    }
}
