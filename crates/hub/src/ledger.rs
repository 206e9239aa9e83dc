//! Dedup ledger: remembers which reminders were already raised so each
//! (plant, time, day) fires at most once, across restarts.

use anyhow::Result;
use async_trait::async_trait;
use time::{Date, OffsetDateTime};

use crate::db::Db;
use crate::schedule::{date_key, WateringTime};

#[async_trait]
pub trait DedupLedger: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool>;
    async fn put(&self, key: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// `notif-<plant>-<HH:MM>-<YYYY-MM-DD>`
pub fn ledger_key(plant_id: i64, time: WateringTime, date: Date) -> String {
    format!("notif-{plant_id}-{time}-{}", date_key(date))
}

/// Ledger persisted in the hub's SQLite database.
pub struct SqliteLedger {
    db: Db,
}

impl SqliteLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DedupLedger for SqliteLedger {
    async fn has(&self, key: &str) -> Result<bool> {
        self.db.ledger_contains(key).await
    }

    async fn put(&self, key: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.db.ledger_insert(key, now).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db.ledger_delete(key).await
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryLedger;
