//! Plant store: the in-memory plant list for the logged-in user, kept in
//! `SharedState`, written through to a [`PlantBackend`].
//!
//! Updates and deletes are optimistic: the cache changes first, the backend
//! write follows, and a failed write rolls the cache back. Creation waits for
//! the backend because the id comes from there.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::clock::Clock;
use crate::db::Db;
use crate::plant::{NewPlant, Plant, PlantPatch};
use crate::state::SharedState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("plant {0} not found")]
    NotFound(i64),
    #[error("invalid plant: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// What the reminder scheduler needs from the plant store.
#[async_trait]
pub trait PlantStore: Send + Sync {
    /// Snapshot of the current plants (empty while logged out).
    async fn list_plants(&self) -> Vec<Plant>;
    async fn set_needs_water(&self, plant_id: i64, needs_water: bool) -> Result<(), StoreError>;
}

/// Durable side of the store.
#[async_trait]
pub trait PlantBackend: Send + Sync {
    async fn fetch_plants(&self, user_id: &str) -> anyhow::Result<Vec<Plant>>;
    async fn create_plant(
        &self,
        user_id: &str,
        plant: &NewPlant,
        created_at: OffsetDateTime,
    ) -> anyhow::Result<Plant>;
    /// Persist only the fields `patch` sets.
    async fn update_plant(
        &self,
        plant_id: i64,
        patch: &PlantPatch,
        watered_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()>;
    async fn delete_plant(&self, plant_id: i64) -> anyhow::Result<()>;
}

#[async_trait]
impl PlantBackend for Db {
    async fn fetch_plants(&self, user_id: &str) -> anyhow::Result<Vec<Plant>> {
        self.load_plants(user_id).await
    }

    async fn create_plant(
        &self,
        user_id: &str,
        plant: &NewPlant,
        created_at: OffsetDateTime,
    ) -> anyhow::Result<Plant> {
        self.insert_plant(user_id, plant, created_at).await
    }

    async fn update_plant(
        &self,
        plant_id: i64,
        patch: &PlantPatch,
        watered_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        if !Db::update_plant(self, plant_id, patch, watered_at).await? {
            anyhow::bail!("plant {plant_id} no longer exists");
        }
        Ok(())
    }

    async fn delete_plant(&self, plant_id: i64) -> anyhow::Result<()> {
        if !Db::delete_plant(self, plant_id).await? {
            anyhow::bail!("plant {plant_id} no longer exists");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlantData
// ---------------------------------------------------------------------------

pub struct PlantData {
    shared: SharedState,
    backend: Arc<dyn PlantBackend>,
    clock: Arc<dyn Clock>,
}

impl PlantData {
    pub fn new(shared: SharedState, backend: Arc<dyn PlantBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared,
            backend,
            clock,
        }
    }

    /// Replace the cache with `user_id`'s plants. Returns how many loaded.
    pub async fn load(&self, user_id: &str) -> Result<usize, StoreError> {
        let plants = self.backend.fetch_plants(user_id).await?;
        let n = plants.len();
        self.shared.write().await.replace_plants(user_id, plants);
        Ok(n)
    }

    pub async fn clear(&self) {
        self.shared.write().await.clear_session();
    }

    pub async fn plants(&self) -> Result<Vec<Plant>, StoreError> {
        let st = self.shared.read().await;
        if st.user_id.is_none() {
            return Err(StoreError::NotAuthenticated);
        }
        Ok(st.plants.clone())
    }

    pub async fn get(&self, plant_id: i64) -> Result<Plant, StoreError> {
        let st = self.shared.read().await;
        if st.user_id.is_none() {
            return Err(StoreError::NotAuthenticated);
        }
        st.plant(plant_id).cloned().ok_or(StoreError::NotFound(plant_id))
    }

    pub async fn add(&self, plant: NewPlant) -> Result<Plant, StoreError> {
        let plant = plant.validated()?;
        let user_id = self
            .shared
            .read()
            .await
            .user_id
            .clone()
            .ok_or(StoreError::NotAuthenticated)?;

        let created = self
            .backend
            .create_plant(&user_id, &plant, self.clock.now())
            .await?;

        let mut st = self.shared.write().await;
        st.prepend(created.clone());
        st.record_system(format!("added {}", created.name));
        info!(plant = created.id, name = %created.name, "plant added");
        Ok(created)
    }

    pub async fn update(&self, plant_id: i64, patch: PlantPatch) -> Result<Plant, StoreError> {
        let patch = patch.validated()?;
        self.patch_with(plant_id, move |_| patch).await
    }

    /// Flip `needsWater`; turning it off records the watering time.
    pub async fn toggle_water(&self, plant_id: i64) -> Result<Plant, StoreError> {
        self.patch_with(plant_id, |current| {
            PlantPatch::needs_water(!current.needs_water)
        })
        .await
    }

    /// Build the patch from the cached plant and apply it under one write
    /// lock, then write the patched fields through to the backend.
    async fn patch_with<F>(&self, plant_id: i64, make: F) -> Result<Plant, StoreError>
    where
        F: FnOnce(&Plant) -> PlantPatch,
    {
        let now = self.clock.now();

        let (undo, updated, patch) = {
            let mut st = self.shared.write().await;
            if st.user_id.is_none() {
                return Err(StoreError::NotAuthenticated);
            }
            let current = st.plant(plant_id).ok_or(StoreError::NotFound(plant_id))?;
            let patch = make(current);
            let (undo, updated) = st
                .apply_patch(plant_id, &patch, now)
                .ok_or(StoreError::NotFound(plant_id))?;
            (undo, updated, patch)
        };

        let watered_at = undo.watered().then_some(now);
        match self.backend.update_plant(plant_id, &patch, watered_at).await {
            Ok(()) => {
                if patch.needs_water.is_some() {
                    self.shared.write().await.record_watering(&updated);
                }
                drop(undo);
                Ok(updated)
            }
            Err(e) => {
                error!(plant = plant_id, "update failed, rolling back: {e:#}");
                let mut st = self.shared.write().await;
                st.rollback(undo);
                st.record_error(format!("failed to update {}: {e}", updated.name));
                Err(StoreError::Backend(e))
            }
        }
    }

    pub async fn delete(&self, plant_id: i64) -> Result<(), StoreError> {
        let undo = {
            let mut st = self.shared.write().await;
            if st.user_id.is_none() {
                return Err(StoreError::NotAuthenticated);
            }
            st.apply_removal(plant_id)
                .ok_or(StoreError::NotFound(plant_id))?
        };

        match self.backend.delete_plant(plant_id).await {
            Ok(()) => {
                drop(undo);
                info!(plant = plant_id, "plant deleted");
                Ok(())
            }
            Err(e) => {
                error!(plant = plant_id, "delete failed, rolling back: {e:#}");
                let mut st = self.shared.write().await;
                st.rollback(undo);
                st.record_error(format!("failed to delete plant {plant_id}: {e}"));
                Err(StoreError::Backend(e))
            }
        }
    }
}

#[async_trait]
impl PlantStore for PlantData {
    async fn list_plants(&self) -> Vec<Plant> {
        self.shared.read().await.plants.clone()
    }

    async fn set_needs_water(&self, plant_id: i64, needs_water: bool) -> Result<(), StoreError> {
        self.update(plant_id, PlantPatch::needs_water(needs_water))
            .await
            .map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::test_db;
    use crate::state::{AppState, EventKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use time::macros::datetime;
    use tokio::sync::Notify;

    const NOW: OffsetDateTime = datetime!(2024-01-01 07:00 UTC);

    /// Wraps a real Db and fails writes on demand. Renames can also be
    /// held until `release` is notified, and then fail.
    struct FlakyBackend {
        db: Db,
        fail_writes: AtomicBool,
        hold_renames: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl PlantBackend for FlakyBackend {
        async fn fetch_plants(&self, user_id: &str) -> anyhow::Result<Vec<Plant>> {
            self.db.fetch_plants(user_id).await
        }

        async fn create_plant(
            &self,
            user_id: &str,
            plant: &NewPlant,
            created_at: OffsetDateTime,
        ) -> anyhow::Result<Plant> {
            self.db.create_plant(user_id, plant, created_at).await
        }

        async fn update_plant(
            &self,
            plant_id: i64,
            patch: &PlantPatch,
            watered_at: Option<OffsetDateTime>,
        ) -> anyhow::Result<()> {
            if patch.name.is_some() && self.hold_renames.load(Ordering::SeqCst) {
                self.release.notified().await;
                anyhow::bail!("network down");
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("network down");
            }
            PlantBackend::update_plant(&self.db, plant_id, patch, watered_at).await
        }

        async fn delete_plant(&self, plant_id: i64) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("network down");
            }
            PlantBackend::delete_plant(&self.db, plant_id).await
        }
    }

    async fn setup() -> (PlantData, Arc<FlakyBackend>, SharedState) {
        let backend = Arc::new(FlakyBackend {
            db: test_db().await,
            fail_writes: AtomicBool::new(false),
            hold_renames: AtomicBool::new(false),
            release: Notify::new(),
        });
        let shared = AppState::shared();
        let data = PlantData::new(
            shared.clone(),
            backend.clone(),
            Arc::new(FixedClock::new(NOW)),
        );
        (data, backend, shared)
    }

    fn fern() -> NewPlant {
        NewPlant {
            name: "Fern".into(),
            watering_schedule: vec!["07:00".into()],
            ..NewPlant::default()
        }
    }

    #[tokio::test]
    async fn logged_out_operations_are_rejected() {
        let (data, _, _) = setup().await;
        assert!(matches!(data.plants().await, Err(StoreError::NotAuthenticated)));
        assert!(matches!(data.add(fern()).await, Err(StoreError::NotAuthenticated)));
        assert!(matches!(
            data.update(1, PlantPatch::needs_water(true)).await,
            Err(StoreError::NotAuthenticated)
        ));
        assert!(data.list_plants().await.is_empty());
    }

    #[tokio::test]
    async fn add_prepends_and_persists() {
        let (data, backend, _) = setup().await;
        data.load("u1").await.unwrap();
        let first = data.add(fern()).await.unwrap();
        let second = data
            .add(NewPlant {
                name: "Basil".into(),
                ..NewPlant::default()
            })
            .await
            .unwrap();

        let cached: Vec<_> = data.plants().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(cached, vec![second.id, first.id]);
        assert_eq!(backend.db.count_plants("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn load_replaces_cache_with_backend_rows() {
        let (data, backend, _) = setup().await;
        backend.db.insert_plant("u1", &fern(), NOW).await.unwrap();
        backend.db.insert_plant("u2", &fern(), NOW).await.unwrap();

        assert_eq!(data.load("u1").await.unwrap(), 1);
        assert_eq!(data.plants().await.unwrap()[0].user_id, "u1");
    }

    #[tokio::test]
    async fn set_needs_water_confirms_on_success() {
        let (data, backend, shared) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();

        data.set_needs_water(p.id, true).await.unwrap();

        assert!(data.get(p.id).await.unwrap().needs_water);
        assert!(backend.db.load_plants("u1").await.unwrap()[0].needs_water);
        let st = shared.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Watering);
    }

    #[tokio::test]
    async fn failed_update_rolls_back() {
        let (data, backend, shared) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();
        backend.fail_writes.store(true, Ordering::SeqCst);

        let err = data.set_needs_water(p.id, true).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!data.get(p.id).await.unwrap().needs_water);
        assert!(!backend.db.load_plants("u1").await.unwrap()[0].needs_water);
        let st = shared.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn toggle_water_off_stamps_last_watered_at() {
        let (data, _, _) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();

        let on = data.toggle_water(p.id).await.unwrap();
        assert!(on.needs_water);
        assert_eq!(on.last_watered_at, None);

        let off = data.toggle_water(p.id).await.unwrap();
        assert!(!off.needs_water);
        assert_eq!(off.last_watered_at, Some(NOW));
    }

    #[tokio::test]
    async fn update_unknown_plant_is_not_found() {
        let (data, _, _) = setup().await;
        data.load("u1").await.unwrap();
        assert!(matches!(
            data.update(99, PlantPatch::needs_water(true)).await,
            Err(StoreError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn invalid_patch_never_reaches_cache() {
        let (data, _, _) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();

        let err = data
            .update(
                p.id,
                PlantPatch {
                    watering_schedule: Some(vec!["7am".into()]),
                    ..PlantPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(data.get(p.id).await.unwrap().watering_schedule, vec!["07:00"]);
    }

    #[tokio::test]
    async fn failed_delete_restores_plant() {
        let (data, backend, _) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();
        backend.fail_writes.store(true, Ordering::SeqCst);

        assert!(data.delete(p.id).await.is_err());
        assert_eq!(data.plants().await.unwrap().len(), 1);

        backend.fail_writes.store(false, Ordering::SeqCst);
        data.delete(p.id).await.unwrap();
        assert!(data.plants().await.unwrap().is_empty());
        assert_eq!(backend.db.count_plants("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_logs_out_cache() {
        let (data, _, _) = setup().await;
        data.load("u1").await.unwrap();
        data.add(fern()).await.unwrap();
        data.clear().await;
        assert!(data.list_plants().await.is_empty());
        assert!(matches!(data.plants().await, Err(StoreError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn failed_rename_keeps_concurrent_water_flag() {
        let (data, backend, _) = setup().await;
        let data = Arc::new(data);
        data.load("u1").await.unwrap();
        let id = data.add(fern()).await.unwrap().id;
        backend.hold_renames.store(true, Ordering::SeqCst);

        let rename = {
            let data = data.clone();
            tokio::spawn(async move {
                data.update(
                    id,
                    PlantPatch {
                        name: Some("Renamed".into()),
                        ..PlantPatch::default()
                    },
                )
                .await
            })
        };
        while data.get(id).await.unwrap().name != "Renamed" {
            tokio::task::yield_now().await;
        }

        // The scheduler flags the plant while the rename is in flight.
        data.set_needs_water(id, true).await.unwrap();

        backend.release.notify_one();
        assert!(rename.await.unwrap().is_err());

        let cached = data.get(id).await.unwrap();
        assert_eq!(cached.name, "Fern");
        assert!(cached.needs_water);

        let stored = backend.db.find_plant_by_name("u1", "Fern").await.unwrap().unwrap();
        assert!(stored.needs_water);
        assert_eq!(stored, cached);
    }

    #[tokio::test]
    async fn toggle_reads_flag_under_the_write_lock() {
        let (data, backend, _) = setup().await;
        data.load("u1").await.unwrap();
        let p = data.add(fern()).await.unwrap();

        data.set_needs_water(p.id, true).await.unwrap();
        let toggled = data.toggle_water(p.id).await.unwrap();

        assert!(!toggled.needs_water);
        assert_eq!(toggled.last_watered_at, Some(NOW));
        let stored = backend.db.load_plants("u1").await.unwrap().remove(0);
        assert!(!stored.needs_water);
        assert_eq!(stored.last_watered_at, Some(NOW));
    }
}
