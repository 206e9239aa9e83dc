//! Watering-reminder scheduler: on every tick, compares each plant's daily
//! `HH:MM` schedule with the local wall clock and, the first time a
//! (plant, time, day) comes due, notifies the user and flags the plant as
//! needing water.
//!
//! ## Per-tick flow
//!
//! ```text
//! tick ─▶ logged in? ─▶ plants? ─▶ for each plant:
//!           │              │         schedule has HH:MM now? ─no─▶ skip
//!           ▼              ▼         ledger has key?        ─yes─▶ skip
//!          skip           skip       notify (if permitted)   ┐ spawned,
//!                                    set_needs_water(true)   ┘ not awaited
//!                                    ledger.put(key), drop yesterday's key
//! ```
//!
//! The ledger key is written whether or not the mutation succeeds: each
//! occurrence is attempted at most once and never retried on a later tick.
//! A missed minute (process suspended, clock jump) is not caught up.

use std::sync::Arc;
use std::time::Duration;

use time::Date;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::ledger::{ledger_key, DedupLedger};
use crate::notify::{Notification, NotificationSink};
use crate::plant::Plant;
use crate::schedule::WateringTime;
use crate::session::Session;
use crate::state::SharedState;
use crate::store::PlantStore;

/// Default tick period. Must stay under a minute so every `HH:MM` is seen.
pub const DEFAULT_TICK_SEC: u64 = 15;

// ---------------------------------------------------------------------------
// Tick results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LoggedOut,
    NoPlants,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredReminder {
    pub plant_id: i64,
    pub time: WateringTime,
    pub key: String,
    /// False when notifications are not permitted.
    pub notified: bool,
}

#[derive(Default)]
pub struct TickReport {
    pub skipped: Option<SkipReason>,
    pub fired: Vec<FiredReminder>,
    pending: Vec<JoinHandle<()>>,
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Wait for the notification and mutation calls this tick spawned.
    pub async fn settle(mut self) -> Self {
        for handle in self.pending.drain(..) {
            if let Err(e) = handle.await {
                error!("reminder: spawned call panicked: {e}");
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct ReminderScheduler {
    store: Arc<dyn PlantStore>,
    sink: Arc<dyn NotificationSink>,
    ledger: Arc<dyn DedupLedger>,
    clock: Arc<dyn Clock>,
    session: watch::Receiver<Option<Session>>,
    shared: SharedState,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn PlantStore>,
        sink: Arc<dyn NotificationSink>,
        ledger: Arc<dyn DedupLedger>,
        clock: Arc<dyn Clock>,
        session: watch::Receiver<Option<Session>>,
        shared: SharedState,
    ) -> Self {
        Self {
            store,
            sink,
            ledger,
            clock,
            session,
            shared,
        }
    }

    /// Evaluate every plant once against the current minute.
    pub async fn tick(&self) -> TickReport {
        let logged_in = self.session.borrow().is_some();
        if !logged_in {
            return TickReport::skipped(SkipReason::LoggedOut);
        }

        let plants = self.store.list_plants().await;
        if plants.is_empty() {
            return TickReport::skipped(SkipReason::NoPlants);
        }

        let now = self.clock.now();
        let current = WateringTime::of(now);
        let today = now.date();

        let mut report = TickReport::default();
        for plant in &plants {
            if !is_due(plant, current) {
                continue;
            }

            let key = ledger_key(plant.id, current, today);
            match self.ledger.has(&key).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(plant = plant.id, %key, "reminder: ledger lookup failed: {e:#}");
                    continue;
                }
            }

            let fired = self.fire(plant, current, today, key, &mut report.pending).await;
            report.fired.push(fired);
        }
        report
    }

    async fn fire(
        &self,
        plant: &Plant,
        time: WateringTime,
        today: Date,
        key: String,
        pending: &mut Vec<JoinHandle<()>>,
    ) -> FiredReminder {
        let plant_id = plant.id;
        info!(plant = plant_id, name = %plant.name, %time, "reminder: watering due");

        let notification = Notification::watering(plant, time);
        self.shared
            .write()
            .await
            .record_reminder(notification.title.clone());

        let notified = self.sink.is_permitted();
        if notified {
            let sink = Arc::clone(&self.sink);
            pending.push(tokio::spawn(async move {
                sink.notify(&notification).await;
            }));
        } else {
            debug!(plant = plant_id, "reminder: notifications not permitted, flagging only");
        }

        let store = Arc::clone(&self.store);
        pending.push(tokio::spawn(async move {
            if let Err(e) = store.set_needs_water(plant_id, true).await {
                error!(plant = plant_id, "reminder: failed to flag plant: {e}");
            }
        }));

        if let Err(e) = self.ledger.put(&key).await {
            error!(plant = plant_id, %key, "reminder: ledger write failed: {e:#}");
        }
        if let Some(yesterday) = today.previous_day() {
            let stale = ledger_key(plant_id, time, yesterday);
            if let Err(e) = self.ledger.remove(&stale).await {
                warn!(plant = plant_id, key = %stale, "reminder: ledger cleanup failed: {e:#}");
            }
        }

        FiredReminder {
            plant_id,
            time,
            key,
            notified,
        }
    }

    /// Spawn the recurring timer. The first tick runs immediately.
    pub fn start(self: &Arc<Self>, every: Duration) -> SchedulerHandle {
        let scheduler = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_sec = every.as_secs(), "reminder scheduler started");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let report = scheduler.tick().await;
                        if !report.fired.is_empty() {
                            debug!(fired = report.fired.len(), "reminder tick");
                        }
                    }
                }
            }

            info!("reminder scheduler stopped");
        });

        SchedulerHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Owner of a running timer. Dropping it aborts the timer task.
pub struct SchedulerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop after the in-progress tick (if any) finishes. Calls already
    /// spawned by earlier ticks keep running.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("reminder scheduler task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether `plant` has `current` in its schedule. Malformed entries are
/// skipped with a warning.
fn is_due(plant: &Plant, current: WateringTime) -> bool {
    let mut due = false;
    for entry in &plant.watering_schedule {
        match entry.parse::<WateringTime>() {
            Ok(t) => due |= t == current,
            Err(e) => warn!(plant = plant.id, "reminder: skipping schedule entry: {e}"),
        }
    }
    due
}

// ===========================================================================
// Tests
// ===========================================================================
