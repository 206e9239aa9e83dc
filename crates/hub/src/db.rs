use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::plant::{NewPlant, Plant, PlantPatch};
use crate::profile::Profile;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, FromRow)]
struct PlantRow {
    id: i64,
    user_id: String,
    name: String,
    species: Option<String>,
    location: Option<String>,
    image_url: Option<String>,
    watering_schedule: String,
    needs_water: bool,
    last_watered_at: Option<i64>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    user_id: String,
    display_name: Option<String>,
    bio: Option<String>,
    profile_photo_url: Option<String>,
    updated_at: i64,
}

const PLANT_COLUMNS: &str = "id, user_id, name, species, location, image_url, \
     watering_schedule, needs_water, last_watered_at, created_at";

impl TryFrom<PlantRow> for Plant {
    type Error = anyhow::Error;

    fn try_from(r: PlantRow) -> Result<Self> {
        let watering_schedule: Vec<String> = serde_json::from_str(&r.watering_schedule)
            .with_context(|| format!("plant {}: bad watering_schedule json", r.id))?;
        let last_watered_at = r
            .last_watered_at
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .with_context(|| format!("plant {}: bad last_watered_at", r.id))?;
        let created_at = OffsetDateTime::from_unix_timestamp(r.created_at)
            .with_context(|| format!("plant {}: bad created_at", r.id))?;

        Ok(Plant {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            species: r.species,
            location: r.location,
            image_url: r.image_url,
            watering_schedule,
            needs_water: r.needs_water,
            last_watered_at,
            created_at,
        })
    }
}

impl TryFrom<ProfileRow> for Profile {
    type Error = anyhow::Error;

    fn try_from(r: ProfileRow) -> Result<Self> {
        let updated_at = OffsetDateTime::from_unix_timestamp(r.updated_at)
            .with_context(|| format!("profile {}: bad updated_at", r.user_id))?;
        Ok(Profile {
            user_id: r.user_id,
            display_name: r.display_name,
            bio: r.bio,
            profile_photo_url: r.profile_photo_url,
            updated_at: Some(updated_at),
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plantcare/plantcare.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so tests must
        // share exactly one connection that never gets recycled.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Plants
    // ----------------------------

    pub async fn insert_plant(
        &self,
        user_id: &str,
        p: &NewPlant,
        created_at: OffsetDateTime,
    ) -> Result<Plant> {
        let schedule = serde_json::to_string(&p.watering_schedule)?;
        let created_ts = created_at.unix_timestamp();
        let res = sqlx::query(
            r#"
            INSERT INTO plants (
              user_id, name, species, location, image_url,
              watering_schedule, needs_water, last_watered_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(user_id)
        .bind(&p.name)
        .bind(p.species.as_deref())
        .bind(p.location.as_deref())
        .bind(p.image_url.as_deref())
        .bind(&schedule)
        .bind(created_ts)
        .execute(&self.pool)
        .await
        .context("insert_plant failed")?;

        Ok(Plant {
            id: res.last_insert_rowid(),
            user_id: user_id.to_string(),
            name: p.name.clone(),
            species: p.species.clone(),
            location: p.location.clone(),
            image_url: p.image_url.clone(),
            watering_schedule: p.watering_schedule.clone(),
            needs_water: false,
            last_watered_at: None,
            created_at: OffsetDateTime::from_unix_timestamp(created_ts)?,
        })
    }

    /// Newest first.
    pub async fn load_plants(&self, user_id: &str) -> Result<Vec<Plant>> {
        let rows: Vec<PlantRow> = sqlx::query_as(&format!(
            "SELECT {PLANT_COLUMNS} FROM plants WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("load_plants failed")?;

        rows.into_iter().map(Plant::try_from).collect()
    }

    pub async fn find_plant_by_name(&self, user_id: &str, name: &str) -> Result<Option<Plant>> {
        let row: Option<PlantRow> = sqlx::query_as(&format!(
            "SELECT {PLANT_COLUMNS} FROM plants WHERE user_id = ? AND name = ? ORDER BY id LIMIT 1"
        ))
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("find_plant_by_name failed")?;

        row.map(Plant::try_from).transpose()
    }

    /// Write only the columns `patch` sets; `watered_at` stamps
    /// `last_watered_at`. Returns false when the row is gone.
    pub async fn update_plant(
        &self,
        plant_id: i64,
        patch: &PlantPatch,
        watered_at: Option<OffsetDateTime>,
    ) -> Result<bool> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE plants SET id = id");
        if let Some(name) = &patch.name {
            qb.push(", name = ").push_bind(name.clone());
        }
        if let Some(species) = &patch.species {
            qb.push(", species = ").push_bind(species.clone());
        }
        if let Some(location) = &patch.location {
            qb.push(", location = ").push_bind(location.clone());
        }
        if let Some(image_url) = &patch.image_url {
            qb.push(", image_url = ").push_bind(image_url.clone());
        }
        if let Some(schedule) = &patch.watering_schedule {
            qb.push(", watering_schedule = ")
                .push_bind(serde_json::to_string(schedule)?);
        }
        if let Some(needs_water) = patch.needs_water {
            qb.push(", needs_water = ").push_bind(needs_water);
        }
        if let Some(at) = watered_at {
            qb.push(", last_watered_at = ").push_bind(at.unix_timestamp());
        }
        qb.push(" WHERE id = ").push_bind(plant_id);

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("update_plant failed")?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn delete_plant(&self, plant_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM plants WHERE id = ?")
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("delete_plant failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn count_plants(&self, user_id: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plants WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("count_plants failed")?;
        Ok(n)
    }

    // ----------------------------
    // Profiles
    // ----------------------------

    pub async fn load_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT user_id, display_name, bio, profile_photo_url, updated_at \
             FROM profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("load_profile failed")?;

        row.map(Profile::try_from).transpose()
    }

    /// Insert or replace the profile row for `p.user_id`.
    pub async fn save_profile(&self, p: &Profile) -> Result<()> {
        let updated_at = p
            .updated_at
            .unwrap_or_else(OffsetDateTime::now_utc)
            .unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, display_name, bio, profile_photo_url, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              display_name      = excluded.display_name,
              bio               = excluded.bio,
              profile_photo_url = excluded.profile_photo_url,
              updated_at        = excluded.updated_at
            "#,
        )
        .bind(&p.user_id)
        .bind(p.display_name.as_deref())
        .bind(p.bio.as_deref())
        .bind(p.profile_photo_url.as_deref())
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("save_profile failed")?;
        Ok(())
    }

    // ----------------------------
    // Notification ledger
    // ----------------------------

    pub async fn ledger_contains(&self, key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM notification_ledger WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("ledger_contains failed")?;
        Ok(row.is_some())
    }

    pub async fn ledger_insert(&self, key: &str, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_ledger (key, created_at)
            VALUES (?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("ledger_insert failed")?;
        Ok(())
    }

    pub async fn ledger_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM notification_ledger WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("ledger_delete failed")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

// ===========================================================================
// Tests
// ===========================================================================
