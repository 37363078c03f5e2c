//! Simulated on-device training.
//!
//! Every device gets a stable offset in `[0, 1)` from a SHA-256 of its id. The offset
//! shapes its loss/accuracy curves, sample count and pseudo-gradient, so the same device
//! produces comparable curves in every round. Per-epoch noise comes from a `StdRng`
//! seeded with the device and round, which keeps a given (round, device) pair
//! reproducible while different rounds differ slightly.
//!
//! A real deployment replaces `epoch_metrics` and `local_update` with actual training.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::model::{GlobalModel, Layer, LocalMetrics, LocalModelUpdate};
use crate::store::Hyperparameters;

const INITIAL_LOSS: f64 = 2.3;
const LOSS_FLOOR: f64 = 0.15;
const ACCURACY_BASE: f64 = 0.1;
const ACCURACY_CEILING: f64 = 0.95;
const DECAY_RATE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: u32,
    pub loss: f64,
    pub accuracy: f64,
}

/// Stable 64-bit seed for an arbitrary id.
pub fn stable_seed(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub fn device_offset(device_id: &str) -> f64 {
    // top 53 bits give a uniformly spaced f64 in [0, 1)
    (stable_seed(device_id) >> 11) as f64 / (1u64 << 53) as f64
}

pub struct DeviceTrainer {
    device_id: String,
    offset: f64,
    hyper: Hyperparameters,
    rng: StdRng,
}

impl DeviceTrainer {
    pub fn new(device_id: impl Into<String>, round_id: Uuid, hyper: Hyperparameters) -> Self {
        let device_id = device_id.into();
        let seed = stable_seed(&device_id) ^ stable_seed(&round_id.to_string());
        Self { offset: device_offset(&device_id), device_id, hyper, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn device_id(&self) -> &str { &self.device_id }
    pub fn offset(&self) -> f64 { self.offset }

    /// Simulated sample count, between 100 and 1000 depending on the device.
    pub fn sample_count(&self) -> u64 { 100 + (self.offset * 900.0).round() as u64 }

    /// Noise-free curve value before the first epoch. Leaves the noise sequence untouched.
    pub fn baseline(&self) -> EpochMetrics {
        let loss = LOSS_FLOOR + (INITIAL_LOSS - LOSS_FLOOR) * (0.9 + 0.2 * self.offset);
        let accuracy = ACCURACY_BASE - 0.05 * self.offset;
        EpochMetrics { epoch: 0, loss, accuracy: accuracy.clamp(0.0, 1.0) }
    }

    pub fn epoch_metrics(&mut self, epoch: u32) -> EpochMetrics {
        let total = self.hyper.local_epochs.max(1) as f64;
        let progress = (epoch as f64 / total).clamp(0.0, 1.0);
        let decay = (-DECAY_RATE * progress).exp();
        let loss_noise: f64 = self.rng.gen_range(-0.02..0.02);
        let acc_noise: f64 = self.rng.gen_range(-0.01..0.01);
        let loss = LOSS_FLOOR + (INITIAL_LOSS - LOSS_FLOOR) * decay * (0.9 + 0.2 * self.offset) + loss_noise;
        let accuracy = ACCURACY_CEILING - (ACCURACY_CEILING - ACCURACY_BASE) * decay - 0.05 * self.offset + acc_noise;
        EpochMetrics { epoch, loss: loss.max(0.0), accuracy: accuracy.clamp(0.0, 1.0) }
    }

    /// Applies the deterministic pseudo-gradient step to every weight and bias of `global`.
    pub fn local_update(&self, global: &GlobalModel, last: EpochMetrics) -> LocalModelUpdate {
        let step = self.hyper.learning_rate * self.hyper.local_epochs as f64;
        let layers = global.layers.iter().enumerate().map(|(li, layer)| Layer {
            name: layer.name.clone(),
            weights: layer.weights.iter().enumerate().map(|(i, w)| w - step * pseudo_gradient(li, i, self.offset)).collect(),
            biases: layer.biases.iter().enumerate().map(|(i, b)| b - step * pseudo_gradient(li, i + layer.weights.len(), self.offset)).collect(),
        }).collect();
        LocalModelUpdate {
            device_id: self.device_id.clone(),
            sample_count: self.sample_count(),
            layers,
            metrics: LocalMetrics { loss: last.loss, accuracy: last.accuracy, epochs: last.epoch },
        }
    }
}

fn pseudo_gradient(layer: usize, position: usize, offset: f64) -> f64 {
    0.01 * ((position as f64 + 1.0) * (1.0 + offset) + layer as f64).sin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::model::DEFAULT_TOPOLOGY;

    fn hyper(epochs: u32) -> Hyperparameters { Hyperparameters { learning_rate: 0.01, batch_size: 32, local_epochs: epochs } }

    #[test]
    fn offset_is_stable_and_bounded() {
        assert_eq!(device_offset("edge-01"), device_offset("edge-01"));
        assert_ne!(device_offset("edge-01"), device_offset("edge-02"));
        for id in ["a", "b", "edge-7", "sensor/42"] { let o = device_offset(id); assert!((0.0..1.0).contains(&o)); }
    }

    #[test]
    fn curves_are_reproducible_per_round() {
        let round = Uuid::new_v4();
        let mut a = DeviceTrainer::new("edge-01", round, hyper(5));
        let mut b = DeviceTrainer::new("edge-01", round, hyper(5));
        for e in 1..=5 { assert_eq!(a.epoch_metrics(e), b.epoch_metrics(e)); }
    }

    #[test]
    fn baseline_does_not_shift_epoch_noise() {
        let round = Uuid::new_v4();
        let mut plain = DeviceTrainer::new("edge-02", round, hyper(4));
        let mut with_baseline = DeviceTrainer::new("edge-02", round, hyper(4));
        let base = with_baseline.baseline();
        assert_eq!(base.epoch, 0);
        assert!(base.loss > with_baseline.epoch_metrics(1).loss);
        let mut plain_again = DeviceTrainer::new("edge-02", round, hyper(4));
        assert_eq!(plain.epoch_metrics(1), plain_again.epoch_metrics(1));
        assert_eq!(plain.epoch_metrics(2), with_baseline.epoch_metrics(2));
    }

    #[test]
    fn loss_falls_and_accuracy_rises() {
        let mut t = DeviceTrainer::new("edge-01", Uuid::new_v4(), hyper(10));
        let first = t.epoch_metrics(1);
        let last = (2..=10).map(|e| t.epoch_metrics(e)).last().unwrap();
        assert!(last.loss < first.loss);
        assert!(last.accuracy > first.accuracy);
        assert!(last.loss >= LOSS_FLOOR - 0.05);
        assert!(last.accuracy <= ACCURACY_CEILING + 0.01);
    }

    #[test]
    fn local_update_is_deterministic_and_shaped_like_global() {
        let global = GlobalModel::initialize("m", &DEFAULT_TOPOLOGY, 1);
        let round = Uuid::new_v4();
        let t1 = DeviceTrainer::new("edge-03", round, hyper(3));
        let t2 = DeviceTrainer::new("edge-03", Uuid::new_v4(), hyper(3));
        let last = EpochMetrics { epoch: 3, loss: 0.4, accuracy: 0.8 };
        let u1 = t1.local_update(&global, last);
        let u2 = t2.local_update(&global, last);
        assert_eq!(u1.layers, u2.layers);
        assert_eq!(u1.layers.len(), global.layers.len());
        assert_eq!(u1.layers[1].weights.len(), global.layers[1].weights.len());
        assert_ne!(u1.layers[0].weights, global.layers[0].weights);
        assert_eq!(u1.metrics.epochs, 3);
        assert!((100..=1000).contains(&u1.sample_count));
    }
}
