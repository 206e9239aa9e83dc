//! TOML config file loading, validation, and database seeding for plants.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use time::{OffsetDateTime, UtcOffset};

use crate::clock::parse_utc_offset;
use crate::db::Db;
use crate::plant::{NewPlant, PlantPatch};
use crate::scheduler::DEFAULT_TICK_SEC;
use crate::schedule::{normalize_schedule, WateringTime};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Log this user in at startup.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_sec: u64,
    /// `+HH:MM`; the host's local offset when unset.
    pub utc_offset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// False behaves like a denied notification permission.
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub name: String,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub watering_schedule: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_sec: DEFAULT_TICK_SEC,
            utc_offset: None,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        if let Some(user) = &self.user_id {
            if user.trim().is_empty() {
                errors.push("user_id is empty".to_string());
            }
        }

        // Every wall-clock minute must contain at least one tick.
        if !(1..=59).contains(&self.scheduler.tick_sec) {
            errors.push(format!(
                "scheduler.tick_sec {} out of range [1, 59]",
                self.scheduler.tick_sec
            ));
        }

        if let Some(offset) = &self.scheduler.utc_offset {
            if let Err(e) = parse_utc_offset(offset) {
                errors.push(format!("scheduler.utc_offset: {e}"));
            }
        }

        if let Some(url) = &self.notifications.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!(
                    "notifications.webhook_url '{url}' must be an http(s) URL"
                ));
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        if !self.plants.is_empty() && self.user_id.is_none() {
            errors.push("plants are listed but user_id is not set".to_string());
        }

        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.name.trim().is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(p.name.trim()) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            // ── Schedule ────────────────────────────────────────
            let mut seen_times: HashSet<WateringTime> = HashSet::new();
            for entry in &p.watering_schedule {
                match entry.parse::<WateringTime>() {
                    Ok(t) => {
                        if !seen_times.insert(t) {
                            errors.push(format!("{}: duplicate watering time {t}", ctx()));
                        }
                    }
                    Err(e) => errors.push(format!("{}: watering_schedule: {e}", ctx())),
                }
            }
        }
    }

    /// The configured UTC offset, if any. Call after [`validate`](Self::validate).
    pub fn utc_offset(&self) -> Result<Option<UtcOffset>> {
        self.scheduler
            .utc_offset
            .as_deref()
            .map(parse_utc_offset)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert the configured plants for `user_id`, matching existing rows by
/// name. Water state and history on existing rows are left alone.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let Some(user_id) = config.user_id.as_deref().map(str::trim) else {
        return Ok(());
    };

    for entry in &config.plants {
        let name = entry.name.trim();
        let schedule = normalize_schedule(&entry.watering_schedule)
            .with_context(|| format!("plant '{name}': bad watering_schedule"))?;

        match db.find_plant_by_name(user_id, name).await? {
            Some(existing) => {
                let patch = PlantPatch {
                    species: Some(entry.species.clone()),
                    location: Some(entry.location.clone()),
                    image_url: Some(entry.image_url.clone()),
                    watering_schedule: Some(schedule),
                    ..PlantPatch::default()
                };
                db.update_plant(existing.id, &patch, None)
                    .await
                    .with_context(|| format!("failed to update plant '{name}'"))?;
            }
            None => {
                let new = NewPlant {
                    name: name.to_string(),
                    species: entry.species.clone(),
                    location: entry.location.clone(),
                    image_url: entry.image_url.clone(),
                    watering_schedule: schedule,
                };
                db.insert_plant(user_id, &new, OffsetDateTime::now_utc())
                    .await
                    .with_context(|| format!("failed to insert plant '{name}'"))?;
            }
        }
    }

    let total = db.count_plants(user_id).await?;
    tracing::info!(
        user = %user_id,
        seeded = config.plants.len(),
        total,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
