//! Small fully connected value network.
//!
//! Maps a state vector to a scalar score: ReLU hidden layers followed by a
//! single linear output. Trained with Adam on mean-squared error; updates are
//! produced on a copy so a failed step never touches the live parameters.

use rand::Rng;
use serde::{Deserialize, Serialize};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major `outputs x inputs`.
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
}

impl DenseLayer {
    fn he_init<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let std = (2.0 / inputs.max(1) as f64).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| sample_normal(rng) * std)
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            bias: vec![0.0; outputs],
        }
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        (0..self.outputs)
            .map(|o| {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + self.bias[o]
            })
            .collect()
    }

    fn param_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub m: Vec<f64>,
    pub v: Vec<f64>,
    pub t: u64,
}

impl AdamState {
    fn new(size: usize) -> Self {
        Self {
            m: vec![0.0; size],
            v: vec![0.0; size],
            t: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNetwork {
    layers: Vec<DenseLayer>,
    adam: AdamState,
    learning_rate: f64,
}

/// Result of one successful optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub loss: f64,
    pub grad_norm: f64,
}

impl ValueNetwork {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden: &[usize],
        learning_rate: f64,
        rng: &mut R,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut prev = input_dim;
        for &width in hidden {
            layers.push(DenseLayer::he_init(prev, width, rng));
            prev = width;
        }
        layers.push(DenseLayer::he_init(prev, 1, rng));
        let size = layers.iter().map(DenseLayer::param_count).sum();
        Self {
            layers,
            adam: AdamState::new(size),
            learning_rate,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.inputs).unwrap_or(0)
    }

    pub fn hidden_widths(&self) -> Vec<usize> {
        let n = self.layers.len();
        self.layers
            .iter()
            .take(n.saturating_sub(1))
            .map(|l| l.outputs)
            .collect()
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(DenseLayer::param_count).sum()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Structural sanity check used when restoring persisted parameters.
    pub fn is_well_formed(&self) -> bool {
        let mut prev = None;
        for layer in &self.layers {
            if layer.weights.len() != layer.inputs * layer.outputs || layer.bias.len() != layer.outputs {
                return false;
            }
            if let Some(p) = prev {
                if layer.inputs != p {
                    return false;
                }
            }
            prev = Some(layer.outputs);
        }
        let size = self.param_count();
        prev == Some(1)
            && self.adam.m.len() == size
            && self.adam.v.len() == size
            && self.all_finite()
    }

    pub fn predict(&self, input: &[f64]) -> f64 {
        let mut activation = input.to_vec();
        let last = self.layers.len().saturating_sub(1);
        for (idx, layer) in self.layers.iter().enumerate() {
            activation = layer.forward(&activation);
            if idx < last {
                relu_in_place(&mut activation);
            }
        }
        activation.first().copied().unwrap_or(0.0)
    }

    /// Compute one Adam step on `(input, target)` pairs and return the
    /// updated network. `self` is left untouched.
    pub fn stepped(
        &self,
        samples: &[(Vec<f64>, f64)],
        max_grad_norm: f64,
    ) -> Result<(ValueNetwork, StepReport), String> {
        if samples.is_empty() {
            return Err("empty training batch".to_string());
        }
        let (mut grads, loss) = self.gradients(samples);
        let grad_norm = grads.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !grad_norm.is_finite() || !loss.is_finite() {
            return Err(format!("non-finite gradient (loss={loss}, norm={grad_norm})"));
        }
        if max_grad_norm > 0.0 && grad_norm > max_grad_norm {
            let scale = max_grad_norm / (grad_norm + EPSILON);
            for g in grads.iter_mut() {
                *g *= scale;
            }
        }

        let mut next = self.clone();
        next.apply_adam(&grads);
        if !next.all_finite() {
            return Err("parameters became non-finite".to_string());
        }
        Ok((next, StepReport { loss, grad_norm }))
    }

    fn gradients(&self, samples: &[(Vec<f64>, f64)]) -> (Vec<f64>, f64) {
        let mut grads: Vec<Vec<f64>> = self
            .layers
            .iter()
            .map(|l| vec![0.0; l.param_count()])
            .collect();
        let n = samples.len() as f64;
        let last = self.layers.len() - 1;
        let mut loss = 0.0;

        for (input, target) in samples {
            // activations[0] is the input; activations[i + 1] is layer i's output
            let mut activations = Vec::with_capacity(self.layers.len() + 1);
            activations.push(input.clone());
            for (idx, layer) in self.layers.iter().enumerate() {
                let mut out = layer.forward(&activations[idx]);
                if idx < last {
                    relu_in_place(&mut out);
                }
                activations.push(out);
            }

            let prediction = activations[self.layers.len()][0];
            let error = prediction - target;
            loss += error * error / n;

            let mut delta = vec![2.0 * error / n];
            for idx in (0..self.layers.len()).rev() {
                let layer = &self.layers[idx];
                let prev = &activations[idx];
                let grad = &mut grads[idx];
                for o in 0..layer.outputs {
                    let row = o * layer.inputs;
                    for i in 0..layer.inputs {
                        grad[row + i] += delta[o] * prev[i];
                    }
                    grad[layer.weights.len() + o] += delta[o];
                }
                if idx == 0 {
                    break;
                }
                let mut prev_delta = vec![0.0; layer.inputs];
                for (i, pd) in prev_delta.iter_mut().enumerate() {
                    // prev is a ReLU output, so a zero activation blocks the gradient
                    if prev[i] <= 0.0 {
                        continue;
                    }
                    *pd = (0..layer.outputs)
                        .map(|o| layer.weights[o * layer.inputs + i] * delta[o])
                        .sum();
                }
                delta = prev_delta;
            }
        }

        (grads.into_iter().flatten().collect(), loss)
    }

    fn apply_adam(&mut self, grads: &[f64]) {
        self.adam.t += 1;
        let t = self.adam.t as i32;
        let bias1 = 1.0 - ADAM_BETA1.powi(t);
        let bias2 = 1.0 - ADAM_BETA2.powi(t);
        let lr = self.learning_rate;

        let mut offset = 0;
        for layer in self.layers.iter_mut() {
            let params = layer.weights.iter_mut().chain(layer.bias.iter_mut());
            for (k, p) in params.enumerate() {
                let idx = offset + k;
                let g = grads[idx];
                let m = ADAM_BETA1 * self.adam.m[idx] + (1.0 - ADAM_BETA1) * g;
                let v = ADAM_BETA2 * self.adam.v[idx] + (1.0 - ADAM_BETA2) * g * g;
                self.adam.m[idx] = m;
                self.adam.v[idx] = v;
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
            }
            offset += layer.param_count();
        }
    }

    fn all_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().chain(l.bias.iter()).all(|v| v.is_finite()))
            && self.adam.m.iter().chain(self.adam.v.iter()).all(|v| v.is_finite())
    }
}

fn relu_in_place(values: &mut [f64]) {
    for v in values.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Box-Muller standard normal sample.
fn sample_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(EPSILON);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn network(seed: u64) -> ValueNetwork {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        ValueNetwork::new(3, &[8, 8], 0.01, &mut rng)
    }

    #[test]
    fn test_shapes() {
        let net = network(1);
        assert_eq!(net.input_dim(), 3);
        assert_eq!(net.hidden_widths(), vec![8, 8]);
        assert_eq!(net.param_count(), 3 * 8 + 8 + 8 * 8 + 8 + 8 + 1);
        assert!(net.is_well_formed());
    }

    #[test]
    fn test_same_seed_same_network() {
        assert_eq!(network(9), network(9));
        assert_ne!(network(9), network(10));
    }

    #[test]
    fn test_step_does_not_mutate_original() {
        let net = network(2);
        let before = net.clone();
        let samples = vec![(vec![0.1, 0.2, 0.3], 1.0)];
        let (next, report) = net.stepped(&samples, 5.0).unwrap();
        assert_eq!(net, before);
        assert_ne!(next, before);
        assert!(report.loss >= 0.0);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut net = network(3);
        let samples: Vec<(Vec<f64>, f64)> = (0..16)
            .map(|i| {
                let x = i as f64 / 16.0;
                (vec![x, 1.0 - x, 0.5], 2.0 * x - 0.5)
            })
            .collect();
        let initial: f64 = samples
            .iter()
            .map(|(x, y)| (net.predict(x) - y).powi(2))
            .sum();
        for _ in 0..300 {
            let (next, _) = net.stepped(&samples, 5.0).unwrap();
            net = next;
        }
        let trained: f64 = samples
            .iter()
            .map(|(x, y)| (net.predict(x) - y).powi(2))
            .sum();
        assert!(trained < initial, "loss {trained} should drop below {initial}");
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let net = network(4);
        let samples = vec![(vec![0.3, -0.2, 0.9], 0.7), (vec![-0.5, 0.4, 0.1], -0.2)];
        let (grads, _) = net.gradients(&samples);

        let loss_of = |n: &ValueNetwork| -> f64 {
            samples
                .iter()
                .map(|(x, y)| (n.predict(x) - y).powi(2))
                .sum::<f64>()
                / samples.len() as f64
        };

        let h = 1e-6;
        // spot-check the output layer bias, whose gradient is always defined
        let last = net.layers.len() - 1;
        let offset: usize = net.layers[..last].iter().map(DenseLayer::param_count).sum();
        let bias_idx = offset + net.layers[last].weights.len();
        let mut plus = net.clone();
        plus.layers[last].bias[0] += h;
        let mut minus = net.clone();
        minus.layers[last].bias[0] -= h;
        let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * h);
        assert!((numeric - grads[bias_idx]).abs() < 1e-5);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let net = network(5);
        assert!(net.stepped(&[], 1.0).is_err());
    }
}
