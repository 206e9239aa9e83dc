use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::plant::{Plant, PlantPatch, Revert};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<AppState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct AppState {
    pub started_at: Instant,
    /// Logged-in user; `None` while logged out.
    pub user_id: Option<String>,
    pub scheduler_running: bool,
    /// The session user's plants, newest first.
    pub plants: Vec<Plant>,
    pub events: VecDeque<AppEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AppEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reminder,
    Watering,
    Error,
    System,
}

/// Undo record for a change applied to the cache ahead of the backend write.
/// Dropping it confirms the change; [`AppState::rollback`] reverts it.
#[derive(Debug)]
#[must_use]
pub enum Optimistic {
    Updated { plant_id: i64, revert: Revert },
    Removed { index: usize, plant: Plant },
}

impl Optimistic {
    /// Whether the change marked a plant as watered.
    pub fn watered(&self) -> bool {
        matches!(self, Optimistic::Updated { revert, .. } if revert.watered())
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub user_id: Option<String>,
    pub scheduler_running: bool,
    pub plant_count: usize,
    pub plants_needing_water: usize,
    pub events: Vec<AppEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl AppState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            user_id: None,
            scheduler_running: false,
            plants: Vec::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Install a freshly loaded plant list for `user_id`.
    pub fn replace_plants(&mut self, user_id: &str, plants: Vec<Plant>) {
        self.user_id = Some(user_id.to_string());
        self.plants = plants;
    }

    pub fn clear_session(&mut self) {
        self.user_id = None;
        self.plants.clear();
    }

    pub fn plant(&self, plant_id: i64) -> Option<&Plant> {
        self.plants.iter().find(|p| p.id == plant_id)
    }

    pub fn prepend(&mut self, plant: Plant) {
        self.plants.insert(0, plant);
    }

    /// Patch a cached plant. Returns the undo record and the patched copy.
    pub fn apply_patch(
        &mut self,
        plant_id: i64,
        patch: &PlantPatch,
        now: OffsetDateTime,
    ) -> Option<(Optimistic, Plant)> {
        let plant = self.plants.iter_mut().find(|p| p.id == plant_id)?;
        let revert = plant.apply(patch, now);
        Some((Optimistic::Updated { plant_id, revert }, plant.clone()))
    }

    pub fn apply_removal(&mut self, plant_id: i64) -> Option<Optimistic> {
        let index = self.plants.iter().position(|p| p.id == plant_id)?;
        let plant = self.plants.remove(index);
        Some(Optimistic::Removed { index, plant })
    }

    pub fn rollback(&mut self, undo: Optimistic) {
        match undo {
            Optimistic::Updated { plant_id, revert } => {
                if let Some(p) = self.plants.iter_mut().find(|p| p.id == plant_id) {
                    p.revert(revert);
                }
            }
            Optimistic::Removed { index, plant } => {
                if self.plant(plant.id).is_none() {
                    let index = index.min(self.plants.len());
                    self.plants.insert(index, plant);
                }
            }
        }
    }

    /// Record a scheduler-raised watering reminder.
    pub fn record_reminder(&mut self, detail: String) {
        self.push_event(EventKind::Reminder, detail);
    }

    /// Record a needs-water flag change.
    pub fn record_watering(&mut self, plant: &Plant) {
        let detail = if plant.needs_water {
            format!("{} needs water", plant.name)
        } else {
            format!("{} watered", plant.name)
        };
        self.push_event(EventKind::Watering, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            user_id: self.user_id.clone(),
            scheduler_running: self.scheduler_running,
            plant_count: self.plants.len(),
            plants_needing_water: self.plants.iter().filter(|p| p.needs_water).count(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(AppEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::sample;
    use time::macros::datetime;

    fn state_with(plants: Vec<Plant>) -> AppState {
        let mut st = AppState::new();
        st.replace_plants("u1", plants);
        st
    }

    // -- optimistic update ------------------------------------------------

    #[test]
    fn apply_patch_then_rollback_restores_previous() {
        let mut st = state_with(vec![sample(1, "Fern", &[])]);
        let (undo, patched) = st
            .apply_patch(1, &PlantPatch::needs_water(true), datetime!(2024-01-01 07:00 UTC))
            .unwrap();
        assert!(patched.needs_water);
        assert!(st.plant(1).unwrap().needs_water);

        st.rollback(undo);
        assert!(!st.plant(1).unwrap().needs_water);
    }

    #[test]
    fn rollback_keeps_interleaved_change_to_other_field() {
        let mut st = state_with(vec![sample(1, "Fern", &[])]);
        let rename = PlantPatch {
            name: Some("Renamed".into()),
            ..PlantPatch::default()
        };
        let (undo, _) = st.apply_patch(1, &rename, datetime!(2024-01-01 07:00 UTC)).unwrap();
        let (flag, _) = st
            .apply_patch(1, &PlantPatch::needs_water(true), datetime!(2024-01-01 07:00 UTC))
            .unwrap();
        drop(flag);

        st.rollback(undo);
        let p = st.plant(1).unwrap();
        assert_eq!(p.name, "Fern");
        assert!(p.needs_water);
    }

    #[test]
    fn apply_patch_unknown_plant_is_none() {
        let mut st = state_with(vec![sample(1, "Fern", &[])]);
        assert!(st
            .apply_patch(9, &PlantPatch::needs_water(true), datetime!(2024-01-01 07:00 UTC))
            .is_none());
    }

    #[test]
    fn confirmed_patch_sticks() {
        let mut st = state_with(vec![sample(1, "Fern", &[])]);
        let (undo, _) = st
            .apply_patch(1, &PlantPatch::needs_water(true), datetime!(2024-01-01 07:00 UTC))
            .unwrap();
        drop(undo);
        assert!(st.plant(1).unwrap().needs_water);
    }

    // -- optimistic removal -----------------------------------------------

    #[test]
    fn removal_rollback_reinserts_at_original_position() {
        let mut st = state_with(vec![
            sample(3, "C", &[]),
            sample(2, "B", &[]),
            sample(1, "A", &[]),
        ]);
        let undo = st.apply_removal(2).unwrap();
        assert_eq!(st.plants.len(), 2);

        st.rollback(undo);
        let ids: Vec<_> = st.plants.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn removal_rollback_after_list_shrank_appends() {
        let mut st = state_with(vec![sample(2, "B", &[]), sample(1, "A", &[])]);
        let undo = st.apply_removal(1).unwrap();
        st.plants.clear();
        st.rollback(undo);
        assert_eq!(st.plants.len(), 1);
        assert_eq!(st.plants[0].id, 1);
    }

    // -- session ----------------------------------------------------------

    #[test]
    fn clear_session_drops_plants_and_user() {
        let mut st = state_with(vec![sample(1, "Fern", &[])]);
        st.clear_session();
        assert!(st.user_id.is_none());
        assert!(st.plants.is_empty());
    }

    // -- events -----------------------------------------------------------

    #[test]
    fn events_ring_buffer_is_bounded() {
        let mut st = AppState::new();
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e10");
    }

    #[test]
    fn status_lists_newest_event_first_and_counts_thirsty_plants() {
        let mut thirsty = sample(2, "Basil", &[]);
        thirsty.needs_water = true;
        let mut st = state_with(vec![thirsty.clone(), sample(1, "Fern", &[])]);
        st.record_system("first".into());
        st.record_watering(&thirsty);

        let status = st.to_status();
        assert_eq!(status.user_id.as_deref(), Some("u1"));
        assert_eq!(status.plant_count, 2);
        assert_eq!(status.plants_needing_water, 1);
        assert_eq!(status.events[0].detail, "Basil needs water");
        assert_eq!(status.events[0].kind, EventKind::Watering);
    }
}
