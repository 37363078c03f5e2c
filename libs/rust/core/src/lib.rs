//! Core of the federated round coordinator: round orchestration, simulated device
//! training, aggregation, model versioning, privacy accounting and progress fan-out.

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod config;
pub mod error;
pub mod federated_learning;
pub mod lifecycle;
pub mod model_registry;
pub mod orchestrator;
pub mod privacy;
pub mod progress_bus;
pub mod resilience;
pub mod store;

pub use config::{load_config, OrchestratorConfig, ServiceConfig};
pub use error::{AggregationError, OrchestratorError, StoreError, StoreResult};
pub use federated_learning::{aggregate, AggregationMethod, AggregationMetrics, GlobalModel, LocalModelUpdate};
pub use lifecycle::{ContributionStatus, RoundStatus};
pub use model_registry::{next_version, ModelVersion};
pub use orchestrator::{Orchestrator, SessionSnapshot, StartAck};
pub use privacy::{PrivacyBudgetLogEntry, PrivacyParams};
pub use progress_bus::{round_topic, EventKind, ProgressBus, ProgressEvent};
pub use resilience::{retry_async, RetryConfig};
pub use store::{InMemoryRoundStore, RoundStore, SledRoundStore};

pub const JSON_LOG_ENV: &str = "FEDROUND_JSON_LOG";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

fn env_flag(name: &str) -> bool {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Installs the global subscriber once per process. `RUST_LOG` controls filtering
/// (default `info`); `FEDROUND_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = if env_flag(JSON_LOG_ENV) {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "fedround", service, "tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_flags_toggle() {
        clear_ready();
        assert!(!is_ready());
        mark_ready();
        assert!(is_ready());
        assert!(is_live());
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("test").unwrap();
        init_tracing("test").unwrap();
    }
}
