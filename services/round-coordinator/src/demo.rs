use fedround_core::store::{DeviceRecord, ModelRecord, NewRound, RoundStore};
use fedround_core::StoreResult;
use uuid::Uuid;

pub const DEMO_MODEL: &str = "demo-model";
pub const DEMO_DEVICES: [&str; 3] = ["edge-01", "edge-02", "edge-03"];

/// Registers a model and three online devices, then creates a pending round with no
/// explicit participants so it picks up the online fleet when started.
pub async fn seed(store: &dyn RoundStore) -> StoreResult<Uuid> {
    store.create_model(ModelRecord::new(DEMO_MODEL, "intrusion-detector")).await?;
    for device in DEMO_DEVICES { store.register_device(DeviceRecord::online(device)).await?; }
    let round = store.create_round(NewRound::new(DEMO_MODEL)).await?;
    Ok(round.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedround_core::InMemoryRoundStore;

    #[tokio::test]
    async fn seeds_pending_round_and_fleet() {
        let store = InMemoryRoundStore::new();
        let id = seed(&store).await.unwrap();
        let round = store.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.model_id, DEMO_MODEL);
        assert!(round.participating_devices.is_empty());
        assert_eq!(store.list_online_devices().await.unwrap().len(), 3);
    }
}
