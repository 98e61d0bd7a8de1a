//! Dense reconstruction autoencoder trained with Adam.
//!
//! Hidden layers use ReLU, the output layer is linear, loss is MSE. Inputs
//! are expected to be scaled to [0,1] by the caller before training and
//! scoring. Optimizer state lives only for the duration of a training run;
//! artifacts carry weights and biases alone.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Layer {
    /// weights[out][in]
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autoencoder {
    layers: Vec<Layer>,
}

/// Adam first/second-moment accumulators, mirroring one layer's shapes.
struct AdamLayer {
    m_weights: Vec<Vec<f64>>,
    v_weights: Vec<Vec<f64>>,
    m_biases: Vec<f64>,
    v_biases: Vec<f64>,
}

struct AdamState {
    updates: u64,
    layers: Vec<AdamLayer>,
}

impl AdamState {
    fn for_layers(layers: &[Layer]) -> Self {
        AdamState {
            updates: 0,
            layers: layers
                .iter()
                .map(|l| AdamLayer {
                    m_weights: l.weights.iter().map(|r| vec![0.0; r.len()]).collect(),
                    v_weights: l.weights.iter().map(|r| vec![0.0; r.len()]).collect(),
                    m_biases: vec![0.0; l.biases.len()],
                    v_biases: vec![0.0; l.biases.len()],
                })
                .collect(),
        }
    }
}

/// Bias-corrected Adam update for one parameter.
#[inline]
fn adam_update(param: &mut f64, m: &mut f64, v: &mut f64, g: f64, lr: f64, bias1: f64, bias2: f64) {
    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
    *param -= lr * (*m / bias1) / ((*v / bias2).sqrt() + ADAM_EPS);
}

impl Autoencoder {
    /// Build with the given layer widths, e.g. `[72, 128, 64, 32, 64, 128, 72]`.
    /// Xavier-uniform init, deterministic per seed.
    pub fn new(sizes: &[usize], seed: u64) -> Self {
        assert!(sizes.len() >= 2, "autoencoder needs at least two layers");
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = sizes
            .windows(2)
            .map(|w| {
                let (n_in, n_out) = (w[0], w[1]);
                let bound = (6.0 / (n_in + n_out) as f64).sqrt();
                Layer {
                    weights: (0..n_out)
                        .map(|_| (0..n_in).map(|_| rng.gen_range(-bound..bound)).collect())
                        .collect(),
                    biases: vec![0.0; n_out],
                }
            })
            .collect();
        Autoencoder { layers }
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.weights[0].len()).unwrap_or(0)
    }

    /// Forward pass returning every layer's activations (input first).
    fn forward(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.to_vec());
        let last = self.layers.len() - 1;

        for (i, layer) in self.layers.iter().enumerate() {
            let prev = &activations[i];
            let out: Vec<f64> = layer
                .weights
                .iter()
                .zip(&layer.biases)
                .map(|(row, b)| {
                    let z: f64 = row.iter().zip(prev).map(|(w, a)| w * a).sum::<f64>() + b;
                    if i == last {
                        z
                    } else {
                        z.max(0.0)
                    }
                })
                .collect();
            activations.push(out);
        }
        activations
    }

    pub fn reconstruct(&self, x: &[f64]) -> Vec<f64> {
        self.forward(x).pop().unwrap_or_default()
    }

    /// Mean squared reconstruction error.
    pub fn reconstruction_error(&self, x: &[f64]) -> f64 {
        let y = self.reconstruct(x);
        if y.is_empty() {
            return 0.0;
        }
        x.iter().zip(&y).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / y.len() as f64
    }

    /// Per-sample Adam (β1 0.9, β2 0.999) over shuffled epochs. Returns the
    /// final epoch's mean training error.
    pub fn train(&mut self, data: &[Vec<f64>], epochs: usize, lr: f64, seed: u64) -> f64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut adam = AdamState::for_layers(&self.layers);
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut last_epoch_error = 0.0;

        for _ in 0..epochs {
            // Fisher-Yates shuffle.
            for i in (1..order.len()).rev() {
                let j = rng.gen_range(0..=i);
                order.swap(i, j);
            }

            let mut epoch_error = 0.0;
            for &idx in &order {
                epoch_error += self.step(&mut adam, &data[idx], lr);
            }
            last_epoch_error = if data.is_empty() {
                0.0
            } else {
                epoch_error / data.len() as f64
            };
        }
        last_epoch_error
    }

    /// One backprop step; returns this sample's error before the update.
    fn step(&mut self, adam: &mut AdamState, x: &[f64], lr: f64) -> f64 {
        let activations = self.forward(x);
        let output = activations.last().unwrap();
        let n_out = output.len() as f64;
        let error: f64 = x.iter().zip(output).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / n_out;

        adam.updates += 1;
        let bias1 = 1.0 - ADAM_BETA1.powi(adam.updates.min(i32::MAX as u64) as i32);
        let bias2 = 1.0 - ADAM_BETA2.powi(adam.updates.min(i32::MAX as u64) as i32);

        // dL/dy for MSE.
        let mut delta: Vec<f64> = output
            .iter()
            .zip(x)
            .map(|(y, t)| 2.0 * (y - t) / n_out)
            .collect();

        for i in (0..self.layers.len()).rev() {
            let input = activations[i].clone();
            let next_delta = if i > 0 {
                // Backprop through this layer's weights, then the previous
                // layer's ReLU gate.
                let layer = &self.layers[i];
                let mut nd = vec![0.0; input.len()];
                for (o, row) in layer.weights.iter().enumerate() {
                    for (j, w) in row.iter().enumerate() {
                        nd[j] += w * delta[o];
                    }
                }
                for (j, g) in nd.iter_mut().enumerate() {
                    if input[j] <= 0.0 {
                        *g = 0.0;
                    }
                }
                Some(nd)
            } else {
                None
            };

            let layer = &mut self.layers[i];
            let moments = &mut adam.layers[i];
            for (o, row) in layer.weights.iter_mut().enumerate() {
                for (j, w) in row.iter_mut().enumerate() {
                    let g = delta[o] * input[j];
                    adam_update(
                        w,
                        &mut moments.m_weights[o][j],
                        &mut moments.v_weights[o][j],
                        g,
                        lr,
                        bias1,
                        bias2,
                    );
                }
                adam_update(
                    &mut layer.biases[o],
                    &mut moments.m_biases[o],
                    &mut moments.v_biases[o],
                    delta[o],
                    lr,
                    bias1,
                    bias2,
                );
            }

            if let Some(nd) = next_delta {
                delta = nd;
            }
        }

        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Samples along a 1-D manifold embedded in 4 dims.
    fn manifold(seed: u64, n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let t: f64 = rng.gen_range(0.0..1.0);
                vec![t, 1.0 - t, 0.5 * t, 0.2 + 0.3 * t]
            })
            .collect()
    }

    #[test]
    fn learns_to_reconstruct_training_manifold() {
        let data = manifold(1, 200);
        let mut ae = Autoencoder::new(&[4, 8, 2, 8, 4], 7);
        let before: f64 =
            data.iter().map(|x| ae.reconstruction_error(x)).sum::<f64>() / data.len() as f64;
        let after = ae.train(&data, 300, 0.005, 13);
        assert!(after < before, "training error {} -> {}", before, after);
        assert!(after < 0.01, "final error {}", after);
    }

    #[test]
    fn off_manifold_input_reconstructs_worse() {
        let data = manifold(2, 200);
        let mut ae = Autoencoder::new(&[4, 8, 2, 8, 4], 3);
        ae.train(&data, 300, 0.005, 5);

        let on: f64 =
            data.iter().map(|x| ae.reconstruction_error(x)).sum::<f64>() / data.len() as f64;
        // A point violating the manifold's structure.
        let off = ae.reconstruction_error(&[1.0, 1.0, 1.0, 1.0]);
        assert!(off > on * 3.0, "on {} off {}", on, off);
    }

    #[test]
    fn deterministic_for_fixed_seeds() {
        let data = manifold(4, 50);
        let mut a = Autoencoder::new(&[4, 6, 4], 21);
        let mut b = Autoencoder::new(&[4, 6, 4], 21);
        a.train(&data, 50, 0.005, 9);
        b.train(&data, 50, 0.005, 9);
        let x = vec![0.3, 0.7, 0.15, 0.29];
        assert_eq!(a.reconstruction_error(&x), b.reconstruction_error(&x));
    }

    #[test]
    fn serde_roundtrip_preserves_behavior() {
        let data = manifold(6, 100);
        let mut ae = Autoencoder::new(&[4, 8, 2, 8, 4], 1);
        ae.train(&data, 100, 0.005, 2);

        let bytes = rmp_serde::to_vec(&ae).unwrap();
        let restored: Autoencoder = rmp_serde::from_slice(&bytes).unwrap();
        let x = vec![0.5, 0.5, 0.25, 0.35];
        assert_eq!(ae.reconstruction_error(&x), restored.reconstruction_error(&x));
    }
}
