//! Plant records and the write shapes used to create and patch them.

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::schedule::normalize_schedule;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub species: Option<String>,
    pub location: Option<String>,
    pub image_url: Option<String>,
    /// Daily `HH:MM` reminder times, sorted and unique.
    #[serde(default)]
    pub watering_schedule: Vec<String>,
    #[serde(rename = "needsWater")]
    pub needs_water: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_watered_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPlant {
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

/// Partial update. `None` leaves a field untouched; for the optional text
/// fields `Some(None)` (JSON `null`) clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlantPatch {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub species: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub location: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub image_url: Option<Option<String>>,
    pub watering_schedule: Option<Vec<String>>,
    #[serde(rename = "needsWater")]
    pub needs_water: Option<bool>,
}

/// Previous values of exactly the fields a patch overwrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Revert {
    name: Option<String>,
    species: Option<Option<String>>,
    location: Option<Option<String>>,
    image_url: Option<Option<String>>,
    watering_schedule: Option<Vec<String>>,
    needs_water: Option<(bool, Option<OffsetDateTime>)>,
    watered: bool,
}

/// Present-but-null becomes `Some(None)`; absence is handled by `default`.
pub(crate) fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl NewPlant {
    pub fn validated(mut self) -> Result<Self, StoreError> {
        self.name = valid_name(&self.name)?;
        self.watering_schedule = normalize_schedule(&self.watering_schedule)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(self)
    }
}

impl PlantPatch {
    pub fn needs_water(needs_water: bool) -> Self {
        Self {
            needs_water: Some(needs_water),
            ..Self::default()
        }
    }

    pub fn validated(mut self) -> Result<Self, StoreError> {
        if let Some(name) = &self.name {
            self.name = Some(valid_name(name)?);
        }
        if let Some(schedule) = &self.watering_schedule {
            self.watering_schedule = Some(
                normalize_schedule(schedule).map_err(|e| StoreError::Invalid(e.to_string()))?,
            );
        }
        Ok(self)
    }
}

impl Revert {
    /// Whether the patch marked the plant as watered (stamped `last_watered_at`).
    pub fn watered(&self) -> bool {
        self.watered
    }
}

impl Plant {
    /// Apply `patch` in place and return what it overwrote. `last_watered_at`
    /// is stamped only on a needs-water → watered transition.
    pub fn apply(&mut self, patch: &PlantPatch, now: OffsetDateTime) -> Revert {
        let mut revert = Revert::default();
        if let Some(name) = &patch.name {
            revert.name = Some(std::mem::replace(&mut self.name, name.clone()));
        }
        if let Some(species) = &patch.species {
            revert.species = Some(std::mem::replace(&mut self.species, species.clone()));
        }
        if let Some(location) = &patch.location {
            revert.location = Some(std::mem::replace(&mut self.location, location.clone()));
        }
        if let Some(image_url) = &patch.image_url {
            revert.image_url = Some(std::mem::replace(&mut self.image_url, image_url.clone()));
        }
        if let Some(schedule) = &patch.watering_schedule {
            revert.watering_schedule = Some(std::mem::replace(
                &mut self.watering_schedule,
                schedule.clone(),
            ));
        }
        if let Some(needs_water) = patch.needs_water {
            revert.needs_water = Some((self.needs_water, self.last_watered_at));
            if self.needs_water && !needs_water {
                self.last_watered_at = Some(now);
                revert.watered = true;
            }
            self.needs_water = needs_water;
        }
        revert
    }

    /// Undo a patch. Fields the patch did not touch keep their current
    /// values, including changes made by other writers since.
    pub fn revert(&mut self, revert: Revert) {
        if let Some(name) = revert.name {
            self.name = name;
        }
        if let Some(species) = revert.species {
            self.species = species;
        }
        if let Some(location) = revert.location {
            self.location = location;
        }
        if let Some(image_url) = revert.image_url {
            self.image_url = image_url;
        }
        if let Some(schedule) = revert.watering_schedule {
            self.watering_schedule = schedule;
        }
        if let Some((needs_water, last_watered_at)) = revert.needs_water {
            self.needs_water = needs_water;
            self.last_watered_at = last_watered_at;
        }
    }
}

fn valid_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Invalid("name is empty".into()));
    }
    Ok(name.to_string())
}

/// Minimal plant for tests in other modules.
#[cfg(test)]
pub(crate) fn sample(id: i64, name: &str, schedule: &[&str]) -> Plant {
    Plant {
        id,
        user_id: "u1".into(),
        name: name.into(),
        species: None,
        location: None,
        image_url: None,
        watering_schedule: schedule.iter().map(|s| s.to_string()).collect(),
        needs_water: false,
        last_watered_at: None,
        created_at: time::macros::datetime!(2024-01-01 00:00 UTC),
    }
}
