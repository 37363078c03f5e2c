use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::federated_learning::{EpochMetrics, GlobalModel, LocalModelUpdate};
use crate::lifecycle::{ContributionStatus, PhaseClock, RoundStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    pub phase: ContributionStatus,
    pub progress: f64,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub metrics: Option<EpochMetrics>,
}

/// Working state of one running round. Never persisted.
#[derive(Debug)]
pub struct Session {
    pub round_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub clock: PhaseClock,
    pub global_model: Option<GlobalModel>,
    pub devices: Vec<DeviceState>,
    pub updates: HashMap<String, LocalModelUpdate>,
}

impl Session {
    fn new(round_id: Uuid, devices: &[String], total_epochs: u32) -> Self {
        Self {
            round_id,
            started_at: Utc::now(),
            clock: PhaseClock::new(),
            global_model: None,
            devices: devices.iter().map(|d| DeviceState { device_id: d.clone(), phase: ContributionStatus::Pending, progress: 0.0, current_epoch: 0, total_epochs, metrics: None }).collect(),
            updates: HashMap::new(),
        }
    }

    pub fn device_mut(&mut self, device_id: &str) -> Option<&mut DeviceState> { self.devices.iter_mut().find(|d| d.device_id == device_id) }

    /// Overall completion across every device, in percent.
    pub fn progress(&self) -> f64 {
        if self.devices.is_empty() { return 0.0; }
        self.devices.iter().map(|d| d.progress).sum::<f64>() / self.devices.len() as f64
    }

    /// Collected updates in participating-device order.
    pub fn ordered_updates(&self) -> Vec<LocalModelUpdate> {
        self.devices.iter().filter_map(|d| self.updates.get(&d.device_id).cloned()).collect()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            round_id: self.round_id,
            phase: self.clock.phase(),
            started_at: self.started_at,
            elapsed_ms: self.clock.elapsed().as_millis() as u64,
            progress: self.progress(),
            devices: self.devices.clone(),
            updates_collected: self.updates.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub round_id: Uuid,
    pub phase: RoundStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub progress: f64,
    pub devices: Vec<DeviceState>,
    pub updates_collected: usize,
}

/// Shared handle between the registry, the workflow task and `cancel`.
///
/// Every store write and event for the round happens while holding `persist_gate`, after
/// checking `cancel`. `cancel` takes the same gate, so nothing is written for a round
/// once its cancellation has been persisted.
pub struct SessionHandle {
    pub round_id: Uuid,
    pub cancel: CancellationToken,
    pub persist_gate: tokio::sync::Mutex<()>,
    finalizing: AtomicBool,
    state: Mutex<Session>,
}

impl SessionHandle {
    pub fn new(round_id: Uuid, devices: &[String], total_epochs: u32) -> Arc<Self> {
        Arc::new(Self {
            round_id,
            cancel: CancellationToken::new(),
            persist_gate: tokio::sync::Mutex::new(()),
            finalizing: AtomicBool::new(false),
            state: Mutex::new(Session::new(round_id, devices, total_epochs)),
        })
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R { f(&mut self.state.lock()) }

    pub fn snapshot(&self) -> SessionSnapshot { self.state.lock().snapshot() }

    pub fn phase(&self) -> RoundStatus { self.state.lock().clock.phase() }

    pub fn advance(&self, next: RoundStatus) -> bool { self.state.lock().clock.advance(next) }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Once set, the round's terminal status belongs to the workflow and `cancel` backs off.
    pub fn mark_finalizing(&self) { self.finalizing.store(true, Ordering::SeqCst); }
    pub fn is_finalizing(&self) -> bool { self.finalizing.load(Ordering::SeqCst) }
}

/// Active sessions keyed by round id, owned by one orchestrator.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn contains(&self, round_id: Uuid) -> bool { self.sessions.lock().contains_key(&round_id) }

    pub fn get(&self, round_id: Uuid) -> Option<Arc<SessionHandle>> { self.sessions.lock().get(&round_id).cloned() }

    /// Inserts unless a session for the round already exists.
    pub fn try_insert(&self, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&handle.round_id) { return false; }
        sessions.insert(handle.round_id, handle);
        true
    }

    /// Removes the entry only if it still refers to `handle`.
    pub fn remove(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&handle.round_id) {
            Some(current) if Arc::ptr_eq(current, handle) => { sessions.remove(&handle.round_id); true }
            _ => false,
        }
    }

    pub fn round_ids(&self) -> Vec<Uuid> { self.sessions.lock().keys().copied().collect() }

    pub fn len(&self) -> usize { self.sessions.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicates_and_stale_removals() {
        let reg = SessionRegistry::default();
        let id = Uuid::new_v4();
        let first = SessionHandle::new(id, &["d1".into()], 3);
        let second = SessionHandle::new(id, &["d1".into()], 3);
        assert!(reg.try_insert(first.clone()));
        assert!(!reg.try_insert(second.clone()));
        assert!(!reg.remove(&second));
        assert!(reg.contains(id));
        assert!(reg.remove(&first));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_reports_device_progress() {
        let handle = SessionHandle::new(Uuid::new_v4(), &["a".into(), "b".into()], 4);
        handle.advance(RoundStatus::Distributing);
        handle.advance(RoundStatus::Training);
        handle.with_state(|s| {
            let d = s.device_mut("a").unwrap();
            d.phase = ContributionStatus::Completed;
            d.progress = 100.0;
            d.current_epoch = 4;
        });
        let snap = handle.snapshot();
        assert_eq!(snap.phase, RoundStatus::Training);
        assert_eq!(snap.devices.len(), 2);
        assert!((snap.progress - 50.0).abs() < 1e-9);
        assert_eq!(snap.devices[0].current_epoch, 4);
        assert_eq!(snap.updates_collected, 0);
    }
}
