use std::path::Path;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::*;

/// Durable store backed by sled. One tree per record kind, JSON values.
///
/// Versions and ledger entries are keyed `<len>:<model_id>/<seq>` with a zero-padded sequence
/// from `Db::generate_id`, so the last key under a model prefix is the latest record. The
/// length prefix keeps a model id that extends another (`m` and `m/x`) out of its scans.
pub struct SledRoundStore {
    db: sled::Db,
    models: sled::Tree,
    devices: sled::Tree,
    rounds: sled::Tree,
    round_counters: sled::Tree,
    contributions: sled::Tree,
    versions: sled::Tree,
    privacy: sled::Tree,
    // read-modify-write sections on rounds, contributions and the ledger
    write_lock: Mutex<()>,
}

impl SledRoundStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> { Self::from_db(sled::open(path)?) }

    pub fn temporary() -> StoreResult<Self> { Self::from_db(sled::Config::new().temporary(true).open()?) }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            models: db.open_tree("models")?,
            devices: db.open_tree("devices")?,
            rounds: db.open_tree("rounds")?,
            round_counters: db.open_tree("round_counters")?,
            contributions: db.open_tree("contributions")?,
            versions: db.open_tree("model_versions")?,
            privacy: db.open_tree("privacy_log")?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> StoreResult<()> { self.db.flush()?; Ok(()) }

    fn seq_key(&self, model_id: &str) -> StoreResult<String> { Ok(format!("{}{:020}", model_prefix(model_id), self.db.generate_id()?)) }
}

fn put<T: Serialize>(tree: &sled::Tree, key: impl AsRef<[u8]>, value: &T) -> StoreResult<()> {
    tree.insert(key.as_ref(), serde_json::to_vec(value)?)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: impl AsRef<[u8]>) -> StoreResult<Option<T>> {
    match tree.get(key.as_ref())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn scan<T: DeserializeOwned>(tree: &sled::Tree, prefix: &str) -> StoreResult<Vec<T>> {
    tree.scan_prefix(prefix.as_bytes()).map(|kv| -> StoreResult<T> { let (_, v) = kv?; Ok(serde_json::from_slice(&v)?) }).collect()
}

fn last<T: DeserializeOwned>(tree: &sled::Tree, prefix: &str) -> StoreResult<Option<T>> {
    match tree.scan_prefix(prefix.as_bytes()).next_back() {
        Some(kv) => { let (_, v) = kv?; Ok(Some(serde_json::from_slice(&v)?)) }
        None => Ok(None),
    }
}

fn model_prefix(model_id: &str) -> String { format!("{}:{model_id}/", model_id.len()) }

fn contribution_key(round_id: Uuid, device_id: &str) -> String { format!("{round_id}/{device_id}") }

#[async_trait]
impl RoundStore for SledRoundStore {
    async fn create_model(&self, model: ModelRecord) -> StoreResult<ModelRecord> {
        put(&self.models, &model.id, &model)?;
        Ok(model)
    }

    async fn get_model(&self, model_id: &str) -> StoreResult<Option<ModelRecord>> { get(&self.models, model_id) }

    async fn register_device(&self, device: DeviceRecord) -> StoreResult<()> { put(&self.devices, &device.id, &device) }

    async fn list_online_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let all: Vec<DeviceRecord> = scan(&self.devices, "")?;
        Ok(all.into_iter().filter(|d| d.online).collect())
    }

    async fn create_round(&self, round: NewRound) -> StoreResult<TrainingRound> {
        let counter = self.round_counters.update_and_fetch(round.model_id.as_bytes(), |old| {
            let prev = old.and_then(|b| <[u8; 8]>::try_from(b).ok()).map(u64::from_be_bytes).unwrap_or(0);
            Some((prev + 1).to_be_bytes().to_vec())
        })?;
        let number = counter.and_then(|b| <[u8; 8]>::try_from(&b[..]).ok()).map(u64::from_be_bytes)
            .ok_or_else(|| StoreError::Backend("round counter missing after update".into()))?;
        let round = round.into_round(number);
        put(&self.rounds, round.id.as_bytes(), &round)?;
        Ok(round)
    }

    async fn get_round(&self, round_id: Uuid) -> StoreResult<Option<TrainingRound>> { get(&self.rounds, round_id.as_bytes()) }

    async fn update_round(&self, round_id: Uuid, patch: RoundPatch) -> StoreResult<TrainingRound> {
        let _guard = self.write_lock.lock();
        let mut round: TrainingRound = get(&self.rounds, round_id.as_bytes())?.ok_or(StoreError::RoundNotFound(round_id))?;
        patch.apply(&mut round)?;
        put(&self.rounds, round_id.as_bytes(), &round)?;
        Ok(round)
    }

    async fn create_device_contributions(&self, round_id: Uuid, device_ids: &[String]) -> StoreResult<Vec<DeviceContribution>> {
        if !self.rounds.contains_key(round_id.as_bytes())? { return Err(StoreError::RoundNotFound(round_id)); }
        let _guard = self.write_lock.lock();
        let mut batch = sled::Batch::default();
        let mut rows: Vec<DeviceContribution> = Vec::with_capacity(device_ids.len());
        for d in device_ids {
            if rows.iter().any(|c| &c.device_id == d) { continue; }
            let row = DeviceContribution::pending(round_id, d.clone());
            batch.insert(contribution_key(round_id, d).as_bytes(), serde_json::to_vec(&row)?);
            rows.push(row);
        }
        self.contributions.apply_batch(batch)?;
        Ok(rows)
    }

    async fn update_device_contribution(&self, round_id: Uuid, device_id: &str, patch: ContributionPatch) -> StoreResult<DeviceContribution> {
        let key = contribution_key(round_id, device_id);
        let _guard = self.write_lock.lock();
        let mut row: DeviceContribution = get(&self.contributions, &key)?
            .ok_or_else(|| StoreError::ContributionNotFound { round_id, device_id: device_id.to_string() })?;
        patch.apply(&mut row);
        put(&self.contributions, &key, &row)?;
        Ok(row)
    }

    async fn list_device_contributions(&self, round_id: Uuid) -> StoreResult<Vec<DeviceContribution>> {
        scan(&self.contributions, &format!("{round_id}/"))
    }

    async fn get_latest_model_version(&self, model_id: &str) -> StoreResult<Option<ModelVersion>> {
        last(&self.versions, &model_prefix(model_id))
    }

    async fn create_model_version(&self, version: ModelVersion) -> StoreResult<ModelVersion> {
        put(&self.versions, self.seq_key(&version.model_id)?, &version)?;
        Ok(version)
    }

    async fn list_model_versions(&self, model_id: &str) -> StoreResult<Vec<ModelVersion>> { scan(&self.versions, &model_prefix(model_id)) }

    async fn get_latest_privacy_log(&self, model_id: &str) -> StoreResult<Option<PrivacyBudgetLogEntry>> {
        last(&self.privacy, &model_prefix(model_id))
    }

    async fn append_privacy_log(&self, entry: PrivacyBudgetLogEntry) -> StoreResult<PrivacyBudgetLogEntry> {
        let _guard = self.write_lock.lock();
        let previous: Option<PrivacyBudgetLogEntry> = last(&self.privacy, &model_prefix(&entry.model_id))?;
        ledger_check(&entry, previous.as_ref())?;
        put(&self.privacy, self.seq_key(&entry.model_id)?, &entry)?;
        Ok(entry)
    }

    async fn list_privacy_logs(&self, model_id: &str) -> StoreResult<Vec<PrivacyBudgetLogEntry>> { scan(&self.privacy, &model_prefix(model_id)) }
}
