//! Login/logout lifecycle. A session owns exactly one reminder timer: it is
//! started on login, replaced when a different user logs in, and stopped on
//! logout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::scheduler::{ReminderScheduler, SchedulerHandle};
use crate::state::SharedState;
use crate::store::{PlantData, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

/// Session channel. The sender goes to [`SessionManager`], receivers to
/// whoever needs to know whether someone is logged in.
pub fn channel() -> (
    watch::Sender<Option<Session>>,
    watch::Receiver<Option<Session>>,
) {
    watch::channel(None)
}

pub struct SessionManager {
    tx: watch::Sender<Option<Session>>,
    plants: Arc<PlantData>,
    scheduler: Arc<ReminderScheduler>,
    shared: SharedState,
    tick: Duration,
    timer: Mutex<Option<SchedulerHandle>>,
}

impl SessionManager {
    pub fn new(
        tx: watch::Sender<Option<Session>>,
        plants: Arc<PlantData>,
        scheduler: Arc<ReminderScheduler>,
        shared: SharedState,
        tick: Duration,
    ) -> Self {
        Self {
            tx,
            plants,
            scheduler,
            shared,
            tick,
            timer: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    /// Log `user_id` in, load their plants and (re)start the timer.
    /// Logging in again as the current user is a no-op.
    pub async fn login(&self, user_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(StoreError::Invalid("user_id is empty".into()));
        }

        let mut timer = self.timer.lock().await;
        let same_user = self
            .tx
            .borrow()
            .as_ref()
            .is_some_and(|s| s.user_id == user_id);
        if same_user && timer.is_some() {
            return Ok(());
        }

        if let Some(handle) = timer.take() {
            handle.stop().await;
        }

        let count = match self.plants.load(user_id).await {
            Ok(n) => n,
            Err(e) => {
                self.tx.send_replace(None);
                self.plants.clear().await;
                self.shared.write().await.scheduler_running = false;
                return Err(e);
            }
        };

        self.tx.send_replace(Some(Session {
            user_id: user_id.to_string(),
        }));
        *timer = Some(self.scheduler.start(self.tick));

        {
            let mut st = self.shared.write().await;
            st.scheduler_running = true;
            st.record_system(format!("{user_id} logged in ({count} plants)"));
        }
        info!(user = %user_id, plants = count, "session started");
        Ok(())
    }

    /// Stop the timer and drop the session's plants.
    pub async fn logout(&self) {
        let mut timer = self.timer.lock().await;
        if let Some(handle) = timer.take() {
            handle.stop().await;
        }

        let previous = self.tx.send_replace(None);
        self.plants.clear().await;

        let mut st = self.shared.write().await;
        st.scheduler_running = false;
        if let Some(s) = previous {
            st.record_system(format!("{} logged out", s.user_id));
            info!(user = %s.user_id, "session ended");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
