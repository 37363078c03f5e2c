//! Background half of a round: distribute the global model, train every device in
//! sequence, aggregate, then record the new model version and privacy spend.
//!
//! Every store write and progress event goes through the session's persist gate after
//! a cancellation check. Once cancellation has been persisted nothing else is written
//! for the round; once completion is being recorded, cancellation backs off.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use opentelemetry::KeyValue;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::metrics::ROUND_METRICS;
use super::session::SessionHandle;
use super::{fail_open_contributions, Shared};
use crate::error::{OrchestratorError, StoreError, StoreResult};
use crate::federated_learning::{aggregate, stable_seed, AggregationMetrics, DeviceTrainer, GlobalModel, ModelSummary, DEFAULT_TOPOLOGY};
use crate::lifecycle::{ContributionStatus, RoundStatus};
use crate::model_registry::{next_version, ModelVersion};
use crate::privacy::PrivacyBudgetLogEntry;
use crate::progress_bus::{round_topic, EventKind};
use crate::resilience::retry_async;
use crate::store::{ContributionPatch, Hyperparameters, RoundPatch, TrainingRound};

#[instrument(skip_all, fields(round_id = %round.id))]
pub(super) async fn run(shared: Arc<Shared>, handle: Arc<SessionHandle>, round: TrainingRound, hyper: Hyperparameters) {
    let flow = Workflow { shared: &shared, handle: &handle, round: &round, hyper, topic: round_topic(round.id) };
    match flow.execute().await {
        Ok(()) => {}
        Err(OrchestratorError::Cancelled(_)) => debug!("workflow stopped after cancellation"),
        Err(e) => flow.fail(e).await,
    }
    shared.sessions.remove(&handle);
}

struct Workflow<'a> {
    shared: &'a Shared,
    handle: &'a SessionHandle,
    round: &'a TrainingRound,
    hyper: Hyperparameters,
    topic: String,
}

impl Workflow<'_> {
    fn id(&self) -> Uuid { self.round.id }

    fn cancelled(&self) -> OrchestratorError { OrchestratorError::Cancelled(self.id()) }

    async fn pause(&self, delay: Duration) -> Result<(), OrchestratorError> {
        tokio::select! {
            _ = self.handle.cancel.cancelled() => Err(self.cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Performs `write` and publishes `event` while holding the persist gate.
    async fn commit<T, F, Fut>(&self, write: F, event: Option<(EventKind, Value)>) -> Result<T, OrchestratorError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let _gate = self.handle.persist_gate.lock().await;
        if self.handle.is_cancelled() { return Err(self.cancelled()); }
        let out = retry_async(&self.shared.config.store_retry, StoreError::is_transient, write).await?;
        if let Some((kind, data)) = event { self.shared.bus.emit(&self.topic, kind, data); }
        Ok(out)
    }

    async fn announce(&self, kind: EventKind, data: Value) -> Result<(), OrchestratorError> {
        let _gate = self.handle.persist_gate.lock().await;
        if self.handle.is_cancelled() { return Err(self.cancelled()); }
        self.shared.bus.emit(&self.topic, kind, data);
        Ok(())
    }

    fn progress(&self) -> f64 { self.handle.with_state(|s| s.progress()) }

    async fn enter_phase(&self, phase: RoundStatus, message: &str) -> Result<(), OrchestratorError> {
        let (id, store) = (self.id(), self.shared.store.as_ref());
        let event = json!({ "round_id": id, "phase": phase, "message": message, "progress": self.progress() });
        self.commit(move |_| store.update_round(id, RoundPatch::status(phase)), Some((EventKind::Progress, event))).await?;
        self.handle.advance(phase);
        debug!(%phase, "phase_entered");
        Ok(())
    }

    async fn set_device_phase(&self, device_id: &str, phase: ContributionStatus, event: Value) -> Result<(), OrchestratorError> {
        let (id, store) = (self.id(), self.shared.store.as_ref());
        self.commit(move |_| store.update_device_contribution(id, device_id, ContributionPatch::status(phase)), Some((EventKind::Progress, event))).await?;
        self.handle.with_state(|s| if let Some(d) = s.device_mut(device_id) { d.phase = phase; });
        Ok(())
    }

    async fn execute(&self) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let store = self.shared.store.as_ref();
        let cfg = &self.shared.config;

        let model = store.get_model(&self.round.model_id).await?
            .ok_or_else(|| StoreError::ModelNotFound(self.round.model_id.clone()))?;
        let global = GlobalModel::initialize(model.name.clone(), &DEFAULT_TOPOLOGY, stable_seed(&self.round.id.to_string()));
        self.handle.with_state(|s| s.global_model = Some(global.clone()));

        self.enter_phase(RoundStatus::Distributing, "Distributing global model to devices").await?;
        self.pause(cfg.distribution_delay()).await?;

        self.enter_phase(RoundStatus::Training, "Local training started").await?;
        let devices = &self.round.participating_devices;
        for (index, device_id) in devices.iter().enumerate() {
            self.train_device(index, devices.len(), device_id, &global).await?;
        }

        self.enter_phase(RoundStatus::Aggregating, "Aggregating model updates").await?;
        self.pause(cfg.aggregation_delay()).await?;
        let updates = self.handle.with_state(|s| s.ordered_updates());
        let agg_started = Instant::now();
        let (aggregated, metrics) = aggregate(&global, &updates, self.round.aggregation_method)?;
        let method = KeyValue::new("method", self.round.aggregation_method.as_str());
        ROUND_METRICS.aggregation_latency_ms.record(agg_started.elapsed().as_secs_f64() * 1000.0, &[method.clone()]);
        let summary = aggregated.summary();
        self.handle.with_state(|s| s.global_model = Some(aggregated));

        {
            let _gate = self.handle.persist_gate.lock().await;
            if self.handle.is_cancelled() { return Err(self.cancelled()); }
            self.handle.mark_finalizing();
            let (id, m) = (self.id(), metrics.clone());
            retry_async(&cfg.store_retry, StoreError::is_transient, move |_| store.update_round(id, RoundPatch::completed(m.clone()))).await?;
            self.handle.advance(RoundStatus::Completed);
        }

        let (version, ledger) = self.record_outputs(&metrics, summary).await?;
        if ledger.exceeded() {
            warn!(model_id = %self.round.model_id, cumulative_epsilon = ledger.cumulative_epsilon, budget_limit = ledger.budget_limit, "privacy budget exceeded");
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut data = json!({
            "round_id": self.id(),
            "metrics": metrics,
            "model_version_id": version.id,
            "version": version.version,
            "elapsed_ms": elapsed_ms,
            "cumulative_epsilon": ledger.cumulative_epsilon,
            "privacy_budget_remaining": ledger.remaining(),
        });
        if ledger.exceeded() { data["budget_exceeded"] = json!(true); }
        self.shared.bus.emit(&self.topic, EventKind::TrainingCompleted, data);

        ROUND_METRICS.rounds_completed.add(1, &[method.clone()]);
        ROUND_METRICS.round_duration_ms.record(elapsed_ms as f64, &[method]);
        info!(version = %version.version, accuracy = metrics.accuracy, loss = metrics.loss, devices = metrics.device_count, elapsed_ms, "round_completed");
        Ok(())
    }

    async fn train_device(&self, index: usize, count: usize, device_id: &str, global: &GlobalModel) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let (id, store, cfg) = (self.id(), self.shared.store.as_ref(), &self.shared.config);
        let epochs = self.hyper.local_epochs;

        self.set_device_phase(device_id, ContributionStatus::Training, json!({
            "round_id": id,
            "phase": RoundStatus::Training,
            "device_id": device_id,
            "message": format!("Training on device {}/{}", index + 1, count),
            "progress": self.progress(),
        })).await?;

        let mut trainer = DeviceTrainer::new(device_id, id, self.hyper);
        let mut last = trainer.baseline();
        for epoch in 1..=epochs {
            let m = trainer.epoch_metrics(epoch);
            self.pause(cfg.epoch_delay()).await?;
            let device_progress = epoch as f64 / epochs as f64 * 100.0;
            let round_progress = self.handle.with_state(|s| {
                if let Some(d) = s.device_mut(device_id) {
                    d.current_epoch = epoch;
                    d.progress = device_progress;
                    d.metrics = Some(m);
                }
                s.progress()
            });
            self.announce(EventKind::DeviceProgress, json!({
                "round_id": id,
                "device_id": device_id,
                "epoch": epoch,
                "total_epochs": epochs,
                "progress": device_progress,
                "round_progress": round_progress,
                "metrics": m,
            })).await?;
            last = m;
        }

        self.set_device_phase(device_id, ContributionStatus::Uploading, json!({
            "round_id": id,
            "phase": RoundStatus::Training,
            "device_id": device_id,
            "message": format!("Uploading update from device {}/{}", index + 1, count),
            "progress": self.progress(),
        })).await?;
        self.pause(cfg.upload_delay()).await?;

        let update = trainer.local_update(global, last);
        let (local, samples) = (update.metrics, update.sample_count);
        let duration_ms = started.elapsed().as_millis() as u64;
        let patch = ContributionPatch {
            status: Some(ContributionStatus::Completed),
            epochs_completed: Some(epochs),
            metrics: Some(local),
            sample_count: Some(samples),
            duration_ms: Some(duration_ms),
            error_message: None,
        };
        let event = json!({ "round_id": id, "device_id": device_id, "metrics": local, "sample_count": samples, "duration_ms": duration_ms });
        self.commit(move |_| store.update_device_contribution(id, device_id, patch.clone()), Some((EventKind::DeviceCompleted, event))).await?;
        self.handle.with_state(|s| {
            if let Some(d) = s.device_mut(device_id) { d.phase = ContributionStatus::Completed; d.progress = 100.0; }
            s.updates.insert(device_id.to_string(), update);
        });
        ROUND_METRICS.device_updates.add(1, &[]);
        debug!(device_id, samples, loss = local.loss, accuracy = local.accuracy, "device_update_collected");
        Ok(())
    }

    /// Appends the next model version and privacy ledger entry for the round's model.
    async fn record_outputs(&self, metrics: &AggregationMetrics, summary: ModelSummary) -> Result<(ModelVersion, PrivacyBudgetLogEntry), OrchestratorError> {
        let (id, store, cfg) = (self.id(), self.shared.store.as_ref(), &self.shared.config);
        let model_id = self.round.model_id.as_str();
        let _ledger = self.shared.ledger_lock.lock().await;

        let latest = store.get_latest_model_version(model_id).await?;
        let version = ModelVersion::new(model_id, next_version(latest.as_ref().map(|v| v.version.as_str())), id, metrics.clone(), summary);
        let version = retry_async(&cfg.store_retry, StoreError::is_transient, move |_| store.create_model_version(version.clone())).await?;

        let previous = store.get_latest_privacy_log(model_id).await?;
        let entry = PrivacyBudgetLogEntry::next(previous.as_ref(), model_id, id, self.round.privacy.epsilon, cfg.privacy_budget_limit);
        let entry = retry_async(&cfg.store_retry, StoreError::is_transient, move |_| store.append_privacy_log(entry.clone())).await?;
        Ok((version, entry))
    }

    /// Records an unexpected failure. A round whose completion was already persisted keeps
    /// its status; observers still get `training_failed` naming what went wrong.
    async fn fail(&self, err: OrchestratorError) {
        let message = err.to_string();
        let _gate = self.handle.persist_gate.lock().await;
        if self.handle.is_cancelled() { return; }
        let phase = self.handle.phase();
        let persisted_status = if self.handle.is_finalizing() {
            RoundStatus::Completed
        } else {
            self.handle.mark_finalizing();
            self.handle.advance(RoundStatus::Failed);
            let (id, store, msg) = (self.id(), self.shared.store.as_ref(), message.clone());
            let res = retry_async(&self.shared.config.store_retry, StoreError::is_transient, move |_| store.update_round(id, RoundPatch::failed(msg.clone()))).await;
            if let Err(e) = res { error!(error = %e, "could not persist round failure"); }
            fail_open_contributions(self.shared, id, &message).await;
            RoundStatus::Failed
        };
        error!(error = %message, %phase, %persisted_status, "round_failed");
        self.shared.bus.emit(&self.topic, EventKind::TrainingFailed, json!({
            "round_id": self.id(),
            "error": message,
            "phase": phase,
            "persisted_status": persisted_status,
        }));
        ROUND_METRICS.rounds_failed.add(1, &[KeyValue::new("reason", "workflow")]);
    }
}
