//! Model representation used by the round simulation.
//!
//! Weights are opaque `f64` vectors per layer; no tensor semantics are implied.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl Layer {
    pub fn parameter_count(&self) -> usize { self.weights.len() + self.biases.len() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    pub name: String,
    pub layers: Vec<Layer>,
}

/// Shape of one dense layer in the synthetic topology.
#[derive(Debug, Clone, Copy)]
pub struct LayerSpec { pub name: &'static str, pub inputs: usize, pub outputs: usize }

pub const DEFAULT_TOPOLOGY: [LayerSpec; 3] = [
    LayerSpec { name: "dense_0", inputs: 8, outputs: 16 },
    LayerSpec { name: "dense_1", inputs: 16, outputs: 8 },
    LayerSpec { name: "output", inputs: 8, outputs: 2 },
];

impl GlobalModel {
    /// Builds a model with small random parameters in `[-0.1, 0.1)`; same seed, same model.
    pub fn initialize(name: impl Into<String>, topology: &[LayerSpec], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = topology.iter().map(|spec| Layer {
            name: spec.name.to_string(),
            weights: (0..spec.inputs * spec.outputs).map(|_| rng.gen_range(-0.1..0.1)).collect(),
            biases: (0..spec.outputs).map(|_| rng.gen_range(-0.1..0.1)).collect(),
        }).collect();
        Self { name: name.into(), layers }
    }

    pub fn parameter_count(&self) -> usize { self.layers.iter().map(Layer::parameter_count).sum() }

    pub fn summary(&self) -> ModelSummary {
        let layers = self.layers.iter().map(|l| {
            let all: Vec<f64> = l.weights.iter().chain(l.biases.iter()).copied().collect();
            let n = all.len().max(1) as f64;
            LayerSummary {
                name: l.name.clone(),
                weight_count: l.weights.len(),
                bias_count: l.biases.len(),
                mean: all.iter().sum::<f64>() / n,
                l2_norm: all.iter().map(|v| v * v).sum::<f64>().sqrt(),
            }
        }).collect();
        ModelSummary { name: self.name.clone(), parameter_count: self.parameter_count(), layers }
    }
}

/// Final metrics a device reports with its update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub epochs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModelUpdate {
    pub device_id: String,
    pub sample_count: u64,
    pub layers: Vec<Layer>,
    pub metrics: LocalMetrics,
}

/// Compact description stored with a model version in place of full weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub parameter_count: usize,
    pub layers: Vec<LayerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub weight_count: usize,
    pub bias_count: usize,
    pub mean: f64,
    pub l2_norm: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_seeded() {
        let a = GlobalModel::initialize("m", &DEFAULT_TOPOLOGY, 7);
        let b = GlobalModel::initialize("m", &DEFAULT_TOPOLOGY, 7);
        let c = GlobalModel::initialize("m", &DEFAULT_TOPOLOGY, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.layers.len(), 3);
        assert_eq!(a.layers[0].weights.len(), 8 * 16);
        assert_eq!(a.layers[0].biases.len(), 16);
        assert!(a.layers.iter().flat_map(|l| l.weights.iter()).all(|w| w.abs() <= 0.1));
    }

    #[test]
    fn summary_counts_parameters() {
        let model = GlobalModel { name: "m".into(), layers: vec![Layer { name: "l".into(), weights: vec![3.0, 4.0], biases: vec![0.0] }] };
        let s = model.summary();
        assert_eq!(s.parameter_count, 3);
        assert!((s.layers[0].l2_norm - 5.0).abs() < 1e-12);
        assert!((s.layers[0].mean - 7.0 / 3.0).abs() < 1e-12);
    }
}
