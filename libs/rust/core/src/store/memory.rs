use std::collections::HashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct Inner {
    models: HashMap<String, ModelRecord>,
    devices: HashMap<String, DeviceRecord>,
    rounds: HashMap<Uuid, TrainingRound>,
    round_counters: HashMap<String, u64>,
    contributions: HashMap<Uuid, Vec<DeviceContribution>>,
    versions: HashMap<String, Vec<ModelVersion>>,
    privacy: HashMap<String, Vec<PrivacyBudgetLogEntry>>,
}

/// Process-local store; contents are lost on drop.
#[derive(Default)]
pub struct InMemoryRoundStore {
    inner: RwLock<Inner>,
}

impl InMemoryRoundStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl RoundStore for InMemoryRoundStore {
    async fn create_model(&self, model: ModelRecord) -> StoreResult<ModelRecord> {
        self.inner.write().models.insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn get_model(&self, model_id: &str) -> StoreResult<Option<ModelRecord>> { Ok(self.inner.read().models.get(model_id).cloned()) }

    async fn register_device(&self, device: DeviceRecord) -> StoreResult<()> {
        self.inner.write().devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn list_online_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let mut online: Vec<DeviceRecord> = self.inner.read().devices.values().filter(|d| d.online).cloned().collect();
        online.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(online)
    }

    async fn create_round(&self, round: NewRound) -> StoreResult<TrainingRound> {
        let mut inner = self.inner.write();
        let counter = inner.round_counters.entry(round.model_id.clone()).or_insert(0);
        *counter += 1;
        let round = round.into_round(*counter);
        inner.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn get_round(&self, round_id: Uuid) -> StoreResult<Option<TrainingRound>> { Ok(self.inner.read().rounds.get(&round_id).cloned()) }

    async fn update_round(&self, round_id: Uuid, patch: RoundPatch) -> StoreResult<TrainingRound> {
        let mut inner = self.inner.write();
        let round = inner.rounds.get_mut(&round_id).ok_or(StoreError::RoundNotFound(round_id))?;
        // apply on a copy so a rejected patch leaves no partial writes
        let mut updated = round.clone();
        patch.apply(&mut updated)?;
        *round = updated.clone();
        Ok(updated)
    }

    async fn create_device_contributions(&self, round_id: Uuid, device_ids: &[String]) -> StoreResult<Vec<DeviceContribution>> {
        let mut inner = self.inner.write();
        if !inner.rounds.contains_key(&round_id) { return Err(StoreError::RoundNotFound(round_id)); }
        let mut rows: Vec<DeviceContribution> = Vec::with_capacity(device_ids.len());
        for d in device_ids {
            if rows.iter().any(|c| &c.device_id == d) { continue; }
            rows.push(DeviceContribution::pending(round_id, d.clone()));
        }
        inner.contributions.insert(round_id, rows.clone());
        Ok(rows)
    }

    async fn update_device_contribution(&self, round_id: Uuid, device_id: &str, patch: ContributionPatch) -> StoreResult<DeviceContribution> {
        let mut inner = self.inner.write();
        let row = inner.contributions.get_mut(&round_id)
            .and_then(|rows| rows.iter_mut().find(|c| c.device_id == device_id))
            .ok_or_else(|| StoreError::ContributionNotFound { round_id, device_id: device_id.to_string() })?;
        patch.apply(row);
        Ok(row.clone())
    }

    async fn list_device_contributions(&self, round_id: Uuid) -> StoreResult<Vec<DeviceContribution>> {
        Ok(self.inner.read().contributions.get(&round_id).cloned().unwrap_or_default())
    }

    async fn get_latest_model_version(&self, model_id: &str) -> StoreResult<Option<ModelVersion>> {
        Ok(self.inner.read().versions.get(model_id).and_then(|v| v.last().cloned()))
    }

    async fn create_model_version(&self, version: ModelVersion) -> StoreResult<ModelVersion> {
        self.inner.write().versions.entry(version.model_id.clone()).or_default().push(version.clone());
        Ok(version)
    }

    async fn list_model_versions(&self, model_id: &str) -> StoreResult<Vec<ModelVersion>> {
        Ok(self.inner.read().versions.get(model_id).cloned().unwrap_or_default())
    }

    async fn get_latest_privacy_log(&self, model_id: &str) -> StoreResult<Option<PrivacyBudgetLogEntry>> {
        Ok(self.inner.read().privacy.get(model_id).and_then(|l| l.last().cloned()))
    }

    async fn append_privacy_log(&self, entry: PrivacyBudgetLogEntry) -> StoreResult<PrivacyBudgetLogEntry> {
        let mut inner = self.inner.write();
        let ledger = inner.privacy.entry(entry.model_id.clone()).or_default();
        ledger_check(&entry, ledger.last())?;
        ledger.push(entry.clone());
        Ok(entry)
    }

    async fn list_privacy_logs(&self, model_id: &str) -> StoreResult<Vec<PrivacyBudgetLogEntry>> {
        Ok(self.inner.read().privacy.get(model_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_numbers_increase_per_model() {
        let store = InMemoryRoundStore::new();
        let a1 = store.create_round(NewRound::new("a")).await.unwrap();
        let a2 = store.create_round(NewRound::new("a")).await.unwrap();
        let b1 = store.create_round(NewRound::new("b")).await.unwrap();
        assert_eq!((a1.round_number, a2.round_number, b1.round_number), (1, 2, 1));
        assert_ne!(a1.id, a2.id);
    }

    #[tokio::test]
    async fn rejected_patch_leaves_round_untouched() {
        let store = InMemoryRoundStore::new();
        let r = store.create_round(NewRound::new("a")).await.unwrap();
        let bad = RoundPatch { status: Some(RoundStatus::Completed), error_message: Some("x".into()), ..Default::default() };
        assert!(store.update_round(r.id, bad).await.is_err());
        let stored = store.get_round(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RoundStatus::Pending);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn repeated_device_ids_share_one_row() {
        let store = InMemoryRoundStore::new();
        let r = store.create_round(NewRound::new("a")).await.unwrap();
        let ids = vec!["d1".to_string(), "d1".to_string(), "d2".to_string()];
        assert_eq!(store.create_device_contributions(r.id, &ids).await.unwrap().len(), 2);
        store.update_device_contribution(r.id, "d1", ContributionPatch::status(ContributionStatus::Completed)).await.unwrap();
        let rows = store.list_device_contributions(r.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, ContributionStatus::Completed);
    }

    #[tokio::test]
    async fn contributions_keep_device_order() {
        let store = InMemoryRoundStore::new();
        let r = store.create_round(NewRound::new("a")).await.unwrap();
        let ids = vec!["z".to_string(), "a".to_string(), "m".to_string()];
        store.create_device_contributions(r.id, &ids).await.unwrap();
        store.update_device_contribution(r.id, "a", ContributionPatch::status(ContributionStatus::Training)).await.unwrap();
        let rows = store.list_device_contributions(r.id).await.unwrap();
        assert_eq!(rows.iter().map(|c| c.device_id.as_str()).collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(rows[1].status, ContributionStatus::Training);
        let missing = store.update_device_contribution(r.id, "nope", ContributionPatch::default()).await;
        assert!(matches!(missing, Err(StoreError::ContributionNotFound { .. })));
    }

    #[tokio::test]
    async fn ledger_rejects_broken_cumulative() {
        let store = InMemoryRoundStore::new();
        let first = PrivacyBudgetLogEntry::next(None, "m", Uuid::new_v4(), 1.0, 10.0);
        store.append_privacy_log(first.clone()).await.unwrap();
        let stale = PrivacyBudgetLogEntry::next(None, "m", Uuid::new_v4(), 1.0, 10.0);
        assert!(matches!(store.append_privacy_log(stale).await, Err(StoreError::LedgerMismatch { .. })));
        let good = PrivacyBudgetLogEntry::next(Some(&first), "m", Uuid::new_v4(), 1.0, 10.0);
        store.append_privacy_log(good).await.unwrap();
        assert_eq!(store.get_latest_privacy_log("m").await.unwrap().unwrap().cumulative_epsilon, 2.0);
    }

    #[tokio::test]
    async fn only_online_devices_listed() {
        let store = InMemoryRoundStore::new();
        store.register_device(DeviceRecord::online("b")).await.unwrap();
        store.register_device(DeviceRecord::offline("c")).await.unwrap();
        store.register_device(DeviceRecord::online("a")).await.unwrap();
        let ids: Vec<String> = store.list_online_devices().await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
