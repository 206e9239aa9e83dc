//! User profile: display name, bio and a profile photo URL for the
//! session user.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plant::nullable;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub profile_photo_url: Option<String>,
    /// `None` until the profile is first saved.
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Body of `PUT /api/profile`. Absent fields are kept, `null` clears.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, deserialize_with = "nullable")]
    pub display_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub bio: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub profile_photo_url: Option<Option<String>>,
}

impl Profile {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            bio: None,
            profile_photo_url: None,
            updated_at: None,
        }
    }

    pub fn apply(&mut self, update: ProfileUpdate, now: OffsetDateTime) {
        if let Some(display_name) = update.display_name {
            self.display_name = display_name;
        }
        if let Some(bio) = update.bio {
            self.bio = bio;
        }
        if let Some(url) = update.profile_photo_url {
            self.profile_photo_url = url;
        }
        self.updated_at = Some(now);
    }
}

impl ProfileUpdate {
    /// Trim text fields (blank becomes `None`) and check the photo URL.
    pub fn validated(mut self) -> Result<Self, StoreError> {
        self.display_name = self.display_name.map(blank_to_none);
        self.bio = self.bio.map(blank_to_none);
        self.profile_photo_url = self.profile_photo_url.map(blank_to_none);

        if let Some(Some(url)) = &self.profile_photo_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(StoreError::Invalid(format!(
                    "profile_photo_url must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(self)
    }
}

fn blank_to_none(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
