//! Layered configuration: struct defaults, then an optional file named by
//! `FEDROUND_CONFIG_FILE`, then `FEDROUND__*` environment variables.

use std::time::Duration;
use anyhow::Result;
use serde::Deserialize;

use crate::resilience::RetryConfig;

pub const ENV_PREFIX: &str = "FEDROUND";
pub const CONFIG_FILE_ENV: &str = "FEDROUND_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub distribution_delay_ms: u64,
    pub epoch_delay_ms: u64,
    pub upload_delay_ms: u64,
    pub aggregation_delay_ms: u64,
    pub privacy_budget_limit: f64,
    pub observer_buffer: usize,
    pub store_retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            distribution_delay_ms: 500,
            epoch_delay_ms: 200,
            upload_delay_ms: 300,
            aggregation_delay_ms: 300,
            privacy_budget_limit: 10.0,
            observer_buffer: 256,
            store_retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Same simulated delay everywhere; handy for tests and demos.
    pub fn with_uniform_delay(delay_ms: u64) -> Self {
        Self { distribution_delay_ms: delay_ms, epoch_delay_ms: delay_ms, upload_delay_ms: delay_ms, aggregation_delay_ms: delay_ms, ..Self::default() }
    }

    pub fn distribution_delay(&self) -> Duration { Duration::from_millis(self.distribution_delay_ms) }
    pub fn epoch_delay(&self) -> Duration { Duration::from_millis(self.epoch_delay_ms) }
    pub fn upload_delay(&self) -> Duration { Duration::from_millis(self.upload_delay_ms) }
    pub fn aggregation_delay(&self) -> Duration { Duration::from_millis(self.aggregation_delay_ms) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_name: String,
    pub http_port: u16,
    pub sled_path: Option<String>,
    pub seed_demo: bool,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { service_name: "round-coordinator".into(), http_port: 8088, sled_path: None, seed_demo: true, orchestrator: OrchestratorConfig::default() }
    }
}

pub fn load_config() -> Result<ServiceConfig> {
    let mut builder = config::Config::builder();
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sources_keep_defaults() {
        let cfg: ServiceConfig = config::Config::builder()
            .add_source(config::File::from_str("http_port: 9000\norchestrator:\n  epoch_delay_ms: 5\n  store_retry:\n    max_retries: 1\n", config::FileFormat::Yaml))
            .build().unwrap()
            .try_deserialize().unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.orchestrator.epoch_delay_ms, 5);
        assert_eq!(cfg.orchestrator.upload_delay_ms, 300);
        assert_eq!(cfg.orchestrator.store_retry.max_retries, 1);
        assert_eq!(cfg.orchestrator.store_retry.base_delay_ms, 25);
        assert!(cfg.seed_demo);
    }

    #[test]
    fn uniform_delay() {
        let cfg = OrchestratorConfig::with_uniform_delay(3);
        assert_eq!(cfg.epoch_delay(), Duration::from_millis(3));
        assert_eq!(cfg.privacy_budget_limit, 10.0);
    }
}
