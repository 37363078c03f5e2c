//! Persistence boundary for rounds, contributions, model versions and the privacy ledger.
//!
//! The orchestrator only talks to `RoundStore`; backings must be safe to share between
//! concurrently running rounds.

mod memory;
mod sled_store;

pub use memory::InMemoryRoundStore;
pub use sled_store::SledRoundStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::federated_learning::{AggregationMethod, AggregationMetrics, LocalMetrics};
use crate::lifecycle::{ContributionStatus, RoundStatus};
use crate::model_registry::ModelVersion;
use crate::privacy::{PrivacyBudgetLogEntry, PrivacyParams};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    pub batch_size: u32,
    pub local_epochs: u32,
}

impl Default for Hyperparameters { fn default() -> Self { Self { learning_rate: 0.01, batch_size: 32, local_epochs: 5 } } }

impl Hyperparameters {
    /// Values a round actually runs with: at least one epoch and one sample per batch,
    /// and a positive finite learning rate.
    pub fn effective(self) -> Self {
        let defaults = Self::default();
        Self {
            learning_rate: if self.learning_rate.is_finite() && self.learning_rate > 0.0 { self.learning_rate } else { defaults.learning_rate },
            batch_size: self.batch_size.max(1),
            local_epochs: self.local_epochs.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self { Self { id: id.into(), name: name.into(), created_at: Utc::now() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn online(id: impl Into<String>) -> Self { let id = id.into(); Self { name: id.clone(), id, online: true, last_seen: Utc::now() } }
    pub fn offline(id: impl Into<String>) -> Self { Self { online: false, ..Self::online(id) } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRound {
    pub id: Uuid,
    pub model_id: String,
    pub round_number: u64,
    pub status: RoundStatus,
    pub aggregation_method: AggregationMethod,
    pub hyperparameters: Hyperparameters,
    pub privacy: PrivacyParams,
    pub target_devices: Vec<String>,
    pub participating_devices: Vec<String>,
    pub metrics: Option<AggregationMetrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields the caller chooses when creating a round; identity and numbering come from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRound {
    pub model_id: String,
    pub aggregation_method: AggregationMethod,
    pub hyperparameters: Hyperparameters,
    pub privacy: PrivacyParams,
    pub target_devices: Vec<String>,
    pub participating_devices: Vec<String>,
}

impl NewRound {
    pub fn new(model_id: impl Into<String>) -> Self { Self { model_id: model_id.into(), ..Default::default() } }
    pub fn with_devices<I: IntoIterator<Item = S>, S: Into<String>>(mut self, devices: I) -> Self { self.participating_devices = devices.into_iter().map(Into::into).collect(); self }
    pub fn with_targets<I: IntoIterator<Item = S>, S: Into<String>>(mut self, devices: I) -> Self { self.target_devices = devices.into_iter().map(Into::into).collect(); self }
    pub fn with_method(mut self, method: AggregationMethod) -> Self { self.aggregation_method = method; self }
    pub fn with_epochs(mut self, local_epochs: u32) -> Self { self.hyperparameters.local_epochs = local_epochs; self }
    pub fn with_epsilon(mut self, epsilon: f64) -> Self { self.privacy.epsilon = epsilon; self }

    fn into_round(self, round_number: u64) -> TrainingRound {
        TrainingRound {
            id: Uuid::new_v4(),
            model_id: self.model_id,
            round_number,
            status: RoundStatus::Pending,
            aggregation_method: self.aggregation_method,
            hyperparameters: self.hyperparameters,
            privacy: self.privacy,
            target_devices: self.target_devices,
            participating_devices: self.participating_devices,
            metrics: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundPatch {
    pub status: Option<RoundStatus>,
    pub participating_devices: Option<Vec<String>>,
    pub metrics: Option<AggregationMetrics>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RoundPatch {
    pub fn status(status: RoundStatus) -> Self { Self { status: Some(status), ..Default::default() } }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { status: Some(RoundStatus::Failed), error_message: Some(message.into()), completed_at: Some(Utc::now()), ..Default::default() }
    }

    pub fn cancelled() -> Self { Self { status: Some(RoundStatus::Cancelled), completed_at: Some(Utc::now()), ..Default::default() } }

    pub fn completed(metrics: AggregationMetrics) -> Self {
        Self { status: Some(RoundStatus::Completed), metrics: Some(metrics), completed_at: Some(Utc::now()), ..Default::default() }
    }

    /// Applies the patch, refusing to touch terminal rounds or skip phases.
    pub fn apply(self, round: &mut TrainingRound) -> StoreResult<()> {
        if round.status.is_terminal() { return Err(StoreError::TerminalState { round_id: round.id, status: round.status }); }
        if let Some(next) = self.status {
            if !round.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition { round_id: round.id, from: round.status, to: next });
            }
            round.status = next;
        }
        if let Some(devices) = self.participating_devices { round.participating_devices = devices; }
        if let Some(metrics) = self.metrics { round.metrics = Some(metrics); }
        if let Some(msg) = self.error_message { round.error_message = Some(msg); }
        if let Some(ts) = self.started_at { round.started_at = Some(ts); }
        if let Some(ts) = self.completed_at { round.completed_at = Some(ts); }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceContribution {
    pub round_id: Uuid,
    pub device_id: String,
    pub status: ContributionStatus,
    pub epochs_completed: u32,
    pub metrics: Option<LocalMetrics>,
    pub sample_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceContribution {
    pub fn pending(round_id: Uuid, device_id: impl Into<String>) -> Self {
        Self { round_id, device_id: device_id.into(), status: ContributionStatus::Pending, epochs_completed: 0, metrics: None, sample_count: None, duration_ms: None, error_message: None, updated_at: Utc::now() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributionPatch {
    pub status: Option<ContributionStatus>,
    pub epochs_completed: Option<u32>,
    pub metrics: Option<LocalMetrics>,
    pub sample_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl ContributionPatch {
    pub fn status(status: ContributionStatus) -> Self { Self { status: Some(status), ..Default::default() } }

    pub fn failed(message: impl Into<String>) -> Self { Self { status: Some(ContributionStatus::Failed), error_message: Some(message.into()), ..Default::default() } }

    pub fn apply(self, c: &mut DeviceContribution) {
        if let Some(s) = self.status { c.status = s; }
        if let Some(e) = self.epochs_completed { c.epochs_completed = e; }
        if let Some(m) = self.metrics { c.metrics = Some(m); }
        if let Some(n) = self.sample_count { c.sample_count = Some(n); }
        if let Some(d) = self.duration_ms { c.duration_ms = Some(d); }
        if let Some(msg) = self.error_message { c.error_message = Some(msg); }
        c.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn create_model(&self, model: ModelRecord) -> StoreResult<ModelRecord>;
    async fn get_model(&self, model_id: &str) -> StoreResult<Option<ModelRecord>>;
    async fn register_device(&self, device: DeviceRecord) -> StoreResult<()>;
    async fn list_online_devices(&self) -> StoreResult<Vec<DeviceRecord>>;

    async fn create_round(&self, round: NewRound) -> StoreResult<TrainingRound>;
    async fn get_round(&self, round_id: Uuid) -> StoreResult<Option<TrainingRound>>;
    async fn update_round(&self, round_id: Uuid, patch: RoundPatch) -> StoreResult<TrainingRound>;

    async fn create_device_contributions(&self, round_id: Uuid, device_ids: &[String]) -> StoreResult<Vec<DeviceContribution>>;
    async fn update_device_contribution(&self, round_id: Uuid, device_id: &str, patch: ContributionPatch) -> StoreResult<DeviceContribution>;
    async fn list_device_contributions(&self, round_id: Uuid) -> StoreResult<Vec<DeviceContribution>>;

    async fn get_latest_model_version(&self, model_id: &str) -> StoreResult<Option<ModelVersion>>;
    async fn create_model_version(&self, version: ModelVersion) -> StoreResult<ModelVersion>;
    async fn list_model_versions(&self, model_id: &str) -> StoreResult<Vec<ModelVersion>>;

    async fn get_latest_privacy_log(&self, model_id: &str) -> StoreResult<Option<PrivacyBudgetLogEntry>>;
    async fn append_privacy_log(&self, entry: PrivacyBudgetLogEntry) -> StoreResult<PrivacyBudgetLogEntry>;
    async fn list_privacy_logs(&self, model_id: &str) -> StoreResult<Vec<PrivacyBudgetLogEntry>>;
}

fn ledger_check(entry: &PrivacyBudgetLogEntry, previous: Option<&PrivacyBudgetLogEntry>) -> StoreResult<()> {
    if entry.follows(previous) { return Ok(()); }
    Err(StoreError::LedgerMismatch {
        model_id: entry.model_id.clone(),
        expected: previous.map(|p| p.cumulative_epsilon).unwrap_or(0.0) + entry.epsilon_consumed,
        got: entry.cumulative_epsilon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round() -> TrainingRound { NewRound::new("m").with_devices(["a"]).into_round(1) }

    #[test]
    fn patch_follows_state_machine() {
        let mut r = round();
        RoundPatch::status(RoundStatus::Distributing).apply(&mut r).unwrap();
        let err = RoundPatch::status(RoundStatus::Completed).apply(&mut r).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: RoundStatus::Distributing, to: RoundStatus::Completed, .. }));
        RoundPatch::cancelled().apply(&mut r).unwrap();
        assert_eq!(r.status, RoundStatus::Cancelled);
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn effective_hyperparameters_clamp_degenerate_values() {
        let h = Hyperparameters { learning_rate: -1.0, batch_size: 0, local_epochs: 0 }.effective();
        assert_eq!(h, Hyperparameters { learning_rate: 0.01, batch_size: 1, local_epochs: 1 });
        let ok = Hyperparameters { learning_rate: 0.2, batch_size: 8, local_epochs: 3 };
        assert_eq!(ok.effective(), ok);
    }

    #[test]
    fn terminal_round_rejects_everything() {
        let mut r = round();
        RoundPatch::failed("boom").apply(&mut r).unwrap();
        let err = RoundPatch { error_message: Some("other".into()), ..Default::default() }.apply(&mut r).unwrap_err();
        assert!(matches!(err, StoreError::TerminalState { status: RoundStatus::Failed, .. }));
        assert_eq!(r.error_message.as_deref(), Some("boom"));
    }
}
