//! Federated learning simulation: model representation, device trainer, aggregation.

pub mod aggregator;
pub mod model;
pub mod trainer;

pub use aggregator::{aggregate, AggregationMethod, AggregationMetrics};
pub use model::{GlobalModel, Layer, LayerSpec, LocalMetrics, LocalModelUpdate, ModelSummary, DEFAULT_TOPOLOGY};
pub use trainer::{device_offset, stable_seed, DeviceTrainer, EpochMetrics};
