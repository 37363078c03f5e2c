//! Round orchestration.
//!
//! `start` validates a pending round, claims its devices and spawns the workflow task;
//! `cancel` stops a running round cooperatively; `status` reads the live session.
//! Sessions are owned by one `Orchestrator` instance, so several orchestrators (for
//! example one per test) never observe each other's rounds.

mod metrics;
pub mod session;
mod workflow;

pub use metrics::{RoundMetrics, ROUND_METRICS};
pub use session::{DeviceState, SessionSnapshot};

use std::collections::HashSet;
use std::sync::Arc;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, StoreError};
use crate::lifecycle::{ContributionStatus, RoundStatus};
use crate::progress_bus::{round_topic, EventKind, ProgressBus};
use crate::resilience::retry_async;
use crate::store::{ContributionPatch, Hyperparameters, RoundPatch, RoundStore, TrainingRound};
use session::{SessionHandle, SessionRegistry};

pub const NO_DEVICES_MESSAGE: &str = "No devices assigned to round and no online devices available";
pub const CANCELLED_MESSAGE: &str = "Training round cancelled";

/// Acknowledgement returned once a round's workflow has been spawned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartAck {
    pub round_id: Uuid,
    pub status: &'static str,
    pub device_count: usize,
    pub hyperparameters: Hyperparameters,
}

pub(crate) struct Shared {
    pub store: Arc<dyn RoundStore>,
    pub bus: Arc<ProgressBus>,
    pub config: OrchestratorConfig,
    pub sessions: SessionRegistry,
    // serializes read-latest-then-append for model versions and the privacy ledger
    pub ledger_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RoundStore>, bus: Arc<ProgressBus>, config: OrchestratorConfig) -> Self {
        Self { shared: Arc::new(Shared { store, bus, config, sessions: SessionRegistry::default(), ledger_lock: tokio::sync::Mutex::new(()) }) }
    }

    pub fn store(&self) -> &Arc<dyn RoundStore> { &self.shared.store }
    pub fn bus(&self) -> &Arc<ProgressBus> { &self.shared.bus }
    pub fn config(&self) -> &OrchestratorConfig { &self.shared.config }

    /// Starts a pending round and returns as soon as its workflow is running.
    #[instrument(skip(self), fields(round_id = %round_id))]
    pub async fn start(&self, round_id: Uuid) -> Result<StartAck, OrchestratorError> {
        let shared = &self.shared;
        if shared.sessions.contains(round_id) { return Err(OrchestratorError::AlreadyRunning(round_id)); }
        let round = shared.store.get_round(round_id).await?.ok_or(OrchestratorError::RoundNotFound(round_id))?;
        if round.status != RoundStatus::Pending {
            return Err(OrchestratorError::InvalidState { round_id, status: round.status });
        }

        let devices = self.resolve_devices(&round).await?;
        if devices.is_empty() {
            warn!(model_id = %round.model_id, "no devices available for round");
            shared.store.update_round(round_id, RoundPatch::failed(NO_DEVICES_MESSAGE)).await?;
            ROUND_METRICS.rounds_failed.add(1, &[KeyValue::new("reason", "no_devices")]);
            return Err(OrchestratorError::NoDevicesAssigned(round_id));
        }

        let hyper = round.hyperparameters.effective();
        let handle = SessionHandle::new(round_id, &devices, hyper.local_epochs);
        // a cancel arriving mid-setup waits here until every contribution row exists
        let gate = handle.persist_gate.lock().await;
        if !shared.sessions.try_insert(handle.clone()) { return Err(OrchestratorError::AlreadyRunning(round_id)); }

        let patch = RoundPatch { participating_devices: Some(devices.clone()), started_at: Some(Utc::now()), ..Default::default() };
        let setup = async {
            let round = shared.store.update_round(round_id, patch).await?;
            shared.store.create_device_contributions(round_id, &devices).await?;
            Ok::<_, StoreError>(round)
        }.await;
        let round = match setup {
            Ok(round) => round,
            Err(e) => { shared.sessions.remove(&handle); return Err(e.into()); }
        };
        drop(gate);

        info!(devices = devices.len(), method = %round.aggregation_method, local_epochs = hyper.local_epochs, "round_started");
        ROUND_METRICS.rounds_started.add(1, &[KeyValue::new("method", round.aggregation_method.as_str())]);
        tokio::spawn(workflow::run(self.shared.clone(), handle, round, hyper));

        Ok(StartAck { round_id, status: "started", device_count: devices.len(), hyperparameters: hyper })
    }

    /// Explicit participants win; otherwise every online device, narrowed to the round's
    /// targets when it names any.
    async fn resolve_devices(&self, round: &TrainingRound) -> Result<Vec<String>, OrchestratorError> {
        let candidates = if !round.participating_devices.is_empty() {
            round.participating_devices.clone()
        } else {
            let online = self.shared.store.list_online_devices().await?;
            online.into_iter()
                .map(|d| d.id)
                .filter(|id| round.target_devices.is_empty() || round.target_devices.contains(id))
                .collect()
        };
        Ok(dedup_devices(candidates))
    }

    /// Stops a round. Returns true only when a live session was stopped by this call.
    ///
    /// Without a live session a non-terminal round is marked cancelled (false is still
    /// returned) and a terminal round is left untouched. A round whose completion is
    /// already being recorded cannot be cancelled.
    #[instrument(skip(self), fields(round_id = %round_id))]
    pub async fn cancel(&self, round_id: Uuid) -> Result<bool, OrchestratorError> {
        let shared = &self.shared;
        if let Some(handle) = shared.sessions.get(round_id) {
            let _gate = handle.persist_gate.lock().await;
            if handle.is_finalizing() || handle.is_cancelled() { return Ok(false); }
            // nothing is cancelled until the write lands
            if let Err(e) = retry_async(&shared.config.store_retry, StoreError::is_transient, |_| shared.store.update_round(round_id, RoundPatch::cancelled())).await {
                warn!(error = %e, "could not persist cancellation; round keeps running");
                return Err(e.into());
            }
            handle.cancel.cancel();
            let phase = handle.phase();
            handle.advance(RoundStatus::Cancelled);
            shared.sessions.remove(&handle);
            fail_open_contributions(shared, round_id, CANCELLED_MESSAGE).await;

            let snapshot = handle.snapshot();
            let completed = snapshot.devices.iter().filter(|d| d.phase == ContributionStatus::Completed).count();
            shared.bus.emit(&round_topic(round_id), EventKind::TrainingCancelled, json!({
                "round_id": round_id,
                "phase": phase,
                "devices_completed": completed,
                "elapsed_ms": snapshot.elapsed_ms,
            }));
            ROUND_METRICS.rounds_cancelled.add(1, &[]);
            info!(%phase, devices_completed = completed, "round_cancelled");
            return Ok(true);
        }

        let round = shared.store.get_round(round_id).await?.ok_or(OrchestratorError::RoundNotFound(round_id))?;
        if round.status.is_terminal() { return Ok(false); }
        shared.store.update_round(round_id, RoundPatch::cancelled()).await?;
        fail_open_contributions(shared, round_id, CANCELLED_MESSAGE).await;
        info!(previous = %round.status, "round_cancelled_without_session");
        Ok(false)
    }

    /// Live view of a running round; `None` once the round has ended.
    pub fn status(&self, round_id: Uuid) -> Option<SessionSnapshot> { self.shared.sessions.get(round_id).map(|h| h.snapshot()) }

    pub fn active_rounds(&self) -> Vec<Uuid> { self.shared.sessions.round_ids() }
}

/// Marks every contribution that has not completed as failed. Errors are logged only.
/// Drops repeated device ids, keeping the first occurrence of each.
fn dedup_devices(devices: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    devices.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

pub(crate) async fn fail_open_contributions(shared: &Shared, round_id: Uuid, message: &str) {
    let rows = match shared.store.list_device_contributions(round_id).await {
        Ok(rows) => rows,
        Err(e) => { warn!(%round_id, error = %e, "could not list contributions"); return; }
    };
    for row in rows.into_iter().filter(|c| !c.status.is_settled()) {
        let res = retry_async(&shared.config.store_retry, StoreError::is_transient, |_| {
            shared.store.update_device_contribution(round_id, &row.device_id, ContributionPatch::failed(message))
        }).await;
        if let Err(e) = res { warn!(%round_id, device_id = %row.device_id, error = %e, "could not fail contribution"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeviceRecord, InMemoryRoundStore, ModelRecord, NewRound};

    async fn fixture() -> (Orchestrator, Arc<InMemoryRoundStore>) {
        let store = Arc::new(InMemoryRoundStore::new());
        store.create_model(ModelRecord::new("m", "demo")).await.unwrap();
        let orch = Orchestrator::new(store.clone(), Arc::new(ProgressBus::default()), OrchestratorConfig::with_uniform_delay(5));
        (orch, store)
    }

    #[tokio::test]
    async fn start_rejects_unknown_and_non_pending_rounds() {
        let (orch, store) = fixture().await;
        assert!(matches!(orch.start(Uuid::new_v4()).await, Err(OrchestratorError::RoundNotFound(_))));
        let round = store.create_round(NewRound::new("m").with_devices(["d1"])).await.unwrap();
        store.update_round(round.id, RoundPatch::cancelled()).await.unwrap();
        let err = orch.start(round.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { status: RoundStatus::Cancelled, .. }));
    }

    #[tokio::test]
    async fn falls_back_to_online_targets() {
        let (orch, store) = fixture().await;
        for d in ["a", "b", "c"] { store.register_device(DeviceRecord::online(d)).await.unwrap(); }
        store.register_device(DeviceRecord::offline("z")).await.unwrap();
        let round = store.create_round(NewRound::new("m").with_targets(["b", "c", "z"])).await.unwrap();
        let ack = orch.start(round.id).await.unwrap();
        assert_eq!(ack.device_count, 2);
        assert_eq!(ack.status, "started");
        let stored = store.get_round(round.id).await.unwrap().unwrap();
        assert_eq!(stored.participating_devices, vec!["b", "c"]);
        assert!(stored.started_at.is_some());
        assert_eq!(store.list_device_contributions(round.id).await.unwrap().len(), 2);
        assert!(orch.cancel(round.id).await.unwrap());
    }

    #[tokio::test]
    async fn ack_carries_effective_hyperparameters() {
        let (orch, store) = fixture().await;
        let round = store.create_round(NewRound::new("m").with_devices(["d1"]).with_epochs(0)).await.unwrap();
        let ack = orch.start(round.id).await.unwrap();
        assert_eq!(ack.hyperparameters.local_epochs, 1);
        assert!(orch.status(round.id).is_some());
        orch.cancel(round.id).await.unwrap();
        assert!(orch.status(round.id).is_none());
        assert!(orch.active_rounds().is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_round_is_not_found() {
        let (orch, _) = fixture().await;
        assert!(matches!(orch.cancel(Uuid::new_v4()).await, Err(OrchestratorError::RoundNotFound(_))));
    }

    #[tokio::test]
    async fn cancel_pending_round_without_session() {
        let (orch, store) = fixture().await;
        let round = store.create_round(NewRound::new("m").with_devices(["d1"])).await.unwrap();
        assert!(!orch.cancel(round.id).await.unwrap());
        assert_eq!(store.get_round(round.id).await.unwrap().unwrap().status, RoundStatus::Cancelled);
    }

    #[test]
    fn repeated_devices_collapse_in_order() {
        let devices = ["d2", "d1", "d2", "d3", "d1"].map(String::from).to_vec();
        assert_eq!(dedup_devices(devices), vec!["d2", "d1", "d3"]);
    }

    #[tokio::test]
    async fn duplicate_participants_get_one_contribution_each() {
        let (orch, store) = fixture().await;
        let round = store.create_round(NewRound::new("m").with_devices(["d1", "d1", "d2"])).await.unwrap();
        let ack = orch.start(round.id).await.unwrap();
        assert_eq!(ack.device_count, 2);
        let stored = store.get_round(round.id).await.unwrap().unwrap();
        assert_eq!(stored.participating_devices, vec!["d1", "d2"]);
        assert_eq!(store.list_device_contributions(round.id).await.unwrap().len(), 2);
        assert_eq!(orch.status(round.id).unwrap().devices.len(), 2);
        assert!(orch.cancel(round.id).await.unwrap());
    }
}
