//! Aggregation strategies for local model updates.
//!
//! `aggregate` is pure: it reads the global model only to validate shapes and name the
//! result, and performs no I/O.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use super::model::{GlobalModel, Layer, LocalModelUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    #[serde(rename = "fedavg")]
    FedAvg,
    #[serde(rename = "weighted_fedavg")]
    WeightedFedAvg,
}

impl AggregationMethod {
    pub fn as_str(self) -> &'static str {
        match self { AggregationMethod::FedAvg => "fedavg", AggregationMethod::WeightedFedAvg => "weighted_fedavg" }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for AggregationMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fedavg" => Ok(AggregationMethod::FedAvg),
            "weighted_fedavg" => Ok(AggregationMethod::WeightedFedAvg),
            other => Err(format!("unknown aggregation method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub f1_score: f64,
    pub device_count: usize,
    pub total_samples: u64,
    pub method: AggregationMethod,
}

pub fn aggregate(global: &GlobalModel, updates: &[LocalModelUpdate], method: AggregationMethod) -> Result<(GlobalModel, AggregationMetrics), AggregationError> {
    if updates.is_empty() { return Err(AggregationError::NoUpdates); }
    for u in updates { check_shape(global, u)?; }

    let total_samples: u64 = updates.iter().map(|u| u.sample_count).sum();
    let coefficients: Vec<f64> = match method {
        AggregationMethod::WeightedFedAvg if total_samples > 0 => updates.iter().map(|u| u.sample_count as f64 / total_samples as f64).collect(),
        // unweighted mean, also used when no device reported samples
        _ => vec![1.0 / updates.len() as f64; updates.len()],
    };

    let layers = global.layers.iter().enumerate().map(|(idx, layer)| {
        let mut weights = vec![0.0f64; layer.weights.len()];
        let mut biases = vec![0.0f64; layer.biases.len()];
        for (u, c) in updates.iter().zip(&coefficients) {
            let src = &u.layers[idx];
            for (acc, v) in weights.iter_mut().zip(&src.weights) { *acc += v * c; }
            for (acc, v) in biases.iter_mut().zip(&src.biases) { *acc += v * c; }
        }
        Layer { name: layer.name.clone(), weights, biases }
    }).collect();

    let n = updates.len() as f64;
    let accuracy = updates.iter().map(|u| u.metrics.accuracy).sum::<f64>() / n;
    let loss = updates.iter().map(|u| u.metrics.loss).sum::<f64>() / n;
    let metrics = AggregationMetrics { accuracy, loss, f1_score: f1_like(accuracy, loss), device_count: updates.len(), total_samples, method };
    Ok((GlobalModel { name: global.name.clone(), layers }, metrics))
}

/// Harmonic mean of accuracy and a loss-derived score squashed into `[0, 1)`.
pub fn f1_like(accuracy: f64, loss: f64) -> f64 {
    let loss_score = 1.0 - loss.max(0.0) / (1.0 + loss.max(0.0));
    if accuracy + loss_score <= 0.0 { return 0.0; }
    2.0 * accuracy * loss_score / (accuracy + loss_score)
}

fn check_shape(global: &GlobalModel, u: &LocalModelUpdate) -> Result<(), AggregationError> {
    let mismatch = |reason: String| AggregationError::ShapeMismatch { device_id: u.device_id.clone(), reason };
    if u.layers.len() != global.layers.len() {
        return Err(mismatch(format!("expected {} layers, got {}", global.layers.len(), u.layers.len())));
    }
    for (g, l) in global.layers.iter().zip(&u.layers) {
        if g.name != l.name { return Err(mismatch(format!("layer {} where {} was expected", l.name, g.name))); }
        if g.weights.len() != l.weights.len() || g.biases.len() != l.biases.len() {
            return Err(mismatch(format!("layer {} has {}+{} parameters, expected {}+{}", l.name, l.weights.len(), l.biases.len(), g.weights.len(), g.biases.len())));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::model::LocalMetrics;

    fn global() -> GlobalModel {
        GlobalModel { name: "g".into(), layers: vec![
            Layer { name: "a".into(), weights: vec![0.0; 3], biases: vec![0.0] },
            Layer { name: "b".into(), weights: vec![0.0; 2], biases: vec![0.0; 2] },
        ] }
    }

    fn update(id: &str, base: f64, samples: u64, accuracy: f64, loss: f64) -> LocalModelUpdate {
        LocalModelUpdate {
            device_id: id.into(),
            sample_count: samples,
            layers: vec![
                Layer { name: "a".into(), weights: vec![base, base * 2.0, base * 3.0], biases: vec![base] },
                Layer { name: "b".into(), weights: vec![-base, base + 1.0], biases: vec![base / 2.0, 0.5] },
            ],
            metrics: LocalMetrics { loss, accuracy, epochs: 5 },
        }
    }

    #[test]
    fn fedavg_is_arithmetic_mean() {
        let updates = vec![update("d1", 0.1, 10, 0.8, 0.4), update("d2", 0.3, 30, 0.9, 0.2)];
        let (model, metrics) = aggregate(&global(), &updates, AggregationMethod::FedAvg).unwrap();
        assert!((model.layers[0].weights[0] - 0.2).abs() < 1e-12);
        assert!((model.layers[0].weights[2] - 0.6).abs() < 1e-12);
        assert!((model.layers[1].weights[1] - 1.2).abs() < 1e-12);
        assert!((metrics.accuracy - 0.85).abs() < 1e-12);
        assert!((metrics.loss - 0.3).abs() < 1e-12);
        assert_eq!(metrics.device_count, 2);
        assert_eq!(metrics.total_samples, 40);
        assert_eq!(metrics.method, AggregationMethod::FedAvg);
    }

    #[test]
    fn weighted_fedavg_uses_sample_counts() {
        let updates = vec![update("d1", 0.1, 10, 0.8, 0.4), update("d2", 0.2, 30, 0.9, 0.2)];
        let (model, _) = aggregate(&global(), &updates, AggregationMethod::WeightedFedAvg).unwrap();
        // (0.1*10 + 0.2*30) / 40
        assert!((model.layers[0].weights[0] - 0.175).abs() < 1e-12);
    }

    #[test]
    fn fedavg_is_order_independent() {
        let updates = vec![update("d1", 0.11, 12, 0.7, 0.5), update("d2", -0.37, 40, 0.8, 0.3), update("d3", 0.93, 7, 0.9, 0.1)];
        let (forward, _) = aggregate(&global(), &updates, AggregationMethod::FedAvg).unwrap();
        for perm in [[2usize, 0, 1], [1, 2, 0], [2, 1, 0]] {
            let shuffled: Vec<_> = perm.iter().map(|&i| updates[i].clone()).collect();
            let (other, _) = aggregate(&global(), &shuffled, AggregationMethod::FedAvg).unwrap();
            for (a, b) in forward.layers.iter().zip(&other.layers) {
                for (x, y) in a.weights.iter().chain(&a.biases).zip(b.weights.iter().chain(&b.biases)) { assert!((x - y).abs() < 1e-9); }
            }
        }
    }

    #[test]
    fn weighted_reduces_to_plain_with_equal_samples() {
        let updates = vec![update("d1", 0.4, 50, 0.7, 0.5), update("d2", -0.2, 50, 0.8, 0.3), update("d3", 0.9, 50, 0.9, 0.1)];
        let (plain, _) = aggregate(&global(), &updates, AggregationMethod::FedAvg).unwrap();
        let (weighted, _) = aggregate(&global(), &updates, AggregationMethod::WeightedFedAvg).unwrap();
        for (a, b) in plain.layers.iter().zip(&weighted.layers) {
            for (x, y) in a.weights.iter().zip(&b.weights) { assert!((x - y).abs() < 1e-9); }
        }
    }

    #[test]
    fn weighted_with_zero_samples_falls_back_to_mean() {
        let updates = vec![update("d1", 0.2, 0, 0.7, 0.5), update("d2", 0.4, 0, 0.8, 0.3)];
        let (model, _) = aggregate(&global(), &updates, AggregationMethod::WeightedFedAvg).unwrap();
        assert!((model.layers[0].weights[0] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_updates_rejected() {
        assert_eq!(aggregate(&global(), &[], AggregationMethod::FedAvg).unwrap_err(), AggregationError::NoUpdates);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut bad = update("d9", 0.1, 1, 0.5, 0.5);
        bad.layers[1].weights.push(1.0);
        let err = aggregate(&global(), &[bad], AggregationMethod::FedAvg).unwrap_err();
        assert!(matches!(err, AggregationError::ShapeMismatch { ref device_id, .. } if device_id == "d9"));
    }

    #[test]
    fn method_parses_wire_names() {
        assert_eq!("weighted_fedavg".parse::<AggregationMethod>().unwrap(), AggregationMethod::WeightedFedAvg);
        assert_eq!(serde_json::to_string(&AggregationMethod::FedAvg).unwrap(), "\"fedavg\"");
        assert!("fedprox".parse::<AggregationMethod>().is_err());
    }

    #[test]
    fn f1_is_bounded() {
        assert!(f1_like(1.0, 0.0) > 0.99);
        assert_eq!(f1_like(0.0, 10.0), 0.0);
        let mid = f1_like(0.8, 0.25);
        assert!(mid > 0.0 && mid < 1.0);
    }
}
