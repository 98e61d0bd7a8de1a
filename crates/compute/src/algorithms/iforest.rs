//! Isolation forest (Liu, Ting, Zhou) over fixed-width feature vectors.
//!
//! Scores land in [0,1]; higher means more isolated, i.e. more anomalous.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// `[headway_s, dwell_s, delay_s, headway_z, dwell_z]`.
pub const FEATURE_DIM: usize = 5;

pub const DEFAULT_TREES: usize = 100;
pub const DEFAULT_SUBSAMPLE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Node>,
    subsample: usize,
}

impl IsolationForest {
    /// Fit `n_trees` trees, each on a random subsample. Deterministic for a
    /// given seed; trees build in parallel.
    pub fn fit(data: &[[f64; FEATURE_DIM]], n_trees: usize, subsample: usize, seed: u64) -> Self {
        let subsample = subsample.min(data.len()).max(2);
        let height_limit = (subsample as f64).log2().ceil() as usize;

        let trees: Vec<Node> = (0..n_trees)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let mut sample: Vec<&[f64; FEATURE_DIM]> = Vec::with_capacity(subsample);
                // Reservoir sample without replacement.
                for (j, row) in data.iter().enumerate() {
                    if j < subsample {
                        sample.push(row);
                    } else {
                        let k = rng.gen_range(0..=j);
                        if k < subsample {
                            sample[k] = row;
                        }
                    }
                }
                build_tree(&mut rng, &sample, 0, height_limit)
            })
            .collect();

        IsolationForest { trees, subsample }
    }

    /// Anomaly score `2^(-E[h(x)] / c(n))` in [0,1].
    pub fn score(&self, x: &[f64; FEATURE_DIM]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trees.iter().map(|t| path_length(t, x, 0.0)).sum();
        let mean_path = total / self.trees.len() as f64;
        let norm = average_path_length(self.subsample);
        if norm <= f64::EPSILON {
            return 0.0;
        }
        2f64.powf(-mean_path / norm)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

fn build_tree(rng: &mut StdRng, sample: &[&[f64; FEATURE_DIM]], depth: usize, limit: usize) -> Node {
    if depth >= limit || sample.len() <= 1 {
        return Node::Leaf { size: sample.len() };
    }

    // Features with any spread in this sample.
    let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(FEATURE_DIM);
    for f in 0..FEATURE_DIM {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for row in sample {
            min = min.min(row[f]);
            max = max.max(row[f]);
        }
        if max - min > f64::EPSILON {
            candidates.push((f, min, max));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: sample.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left, right): (Vec<&[f64; FEATURE_DIM]>, Vec<&[f64; FEATURE_DIM]>) =
        sample.iter().copied().partition(|row| row[feature] < threshold);
    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: sample.len() };
    }

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(rng, &left, depth + 1, limit)),
        right: Box::new(build_tree(rng, &right, depth + 1, limit)),
    }
}

fn path_length(node: &Node, x: &[f64; FEATURE_DIM], depth: f64) -> f64 {
    match node {
        Node::Leaf { size } => depth + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if x[*feature] < *threshold {
                path_length(left, x, depth + 1.0)
            } else {
                path_length(right, x, depth + 1.0)
            }
        }
    }
}

/// c(n): expected path length of an unsuccessful BST search over n points.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.577_215_664_901_532_9) - 2.0 * (n - 1.0) / n
}

/// Empirical quantile used to turn contamination into a score threshold.
pub fn quantile(scores: &[f64], q: f64) -> f64 {
    if scores.is_empty() {
        return 0.5;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 - 1.0) * q.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(seed: u64, n: usize) -> Vec<[f64; FEATURE_DIM]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                [
                    180.0 + rng.gen_range(-30.0..30.0),
                    30.0 + rng.gen_range(-10.0..10.0),
                    60.0 + rng.gen_range(-60.0..60.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                ]
            })
            .collect()
    }

    #[test]
    fn outliers_score_above_inliers() {
        let data = cluster(7, 500);
        let forest = IsolationForest::fit(&data, DEFAULT_TREES, DEFAULT_SUBSAMPLE, 42);

        let inlier_scores: Vec<f64> = data.iter().take(50).map(|x| forest.score(x)).collect();
        let inlier_mean = inlier_scores.iter().sum::<f64>() / inlier_scores.len() as f64;

        let outlier = [900.0, 400.0, 1800.0, 24.0, 12.0];
        let outlier_score = forest.score(&outlier);

        assert!(
            outlier_score > inlier_mean + 0.1,
            "outlier {} vs inlier mean {}",
            outlier_score,
            inlier_mean
        );
    }

    #[test]
    fn scores_are_in_unit_interval() {
        let data = cluster(3, 300);
        let forest = IsolationForest::fit(&data, 50, 128, 1);
        for x in data.iter().take(100) {
            let s = forest.score(x);
            assert!((0.0..=1.0).contains(&s), "score {}", s);
        }
        let s = forest.score(&[1e9, 1e9, 1e9, 1e9, 1e9]);
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let data = cluster(11, 200);
        let a = IsolationForest::fit(&data, 20, 64, 99);
        let b = IsolationForest::fit(&data, 20, 64, 99);
        let x = [500.0, 100.0, 300.0, 5.0, 2.0];
        assert_eq!(a.score(&x), b.score(&x));
    }

    #[test]
    fn contamination_quantile_separates_tail() {
        let data = cluster(5, 400);
        let forest = IsolationForest::fit(&data, DEFAULT_TREES, DEFAULT_SUBSAMPLE, 8);
        let scores: Vec<f64> = data.iter().map(|x| forest.score(x)).collect();
        let threshold = quantile(&scores, 0.95);

        let above = scores.iter().filter(|s| **s >= threshold).count();
        // Roughly the contamination share of training points crosses it.
        assert!(above <= data.len() / 10, "{} above threshold", above);
        assert!(threshold > 0.0 && threshold < 1.0);
    }

    #[test]
    fn quantile_edges() {
        assert_eq!(quantile(&[], 0.95), 0.5);
        let v = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(quantile(&v, 0.0), 0.1);
        assert_eq!(quantile(&v, 1.0), 0.5);
    }
}
