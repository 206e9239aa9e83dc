//! Daily watering times (`HH:MM`, 24-hour local time) and the helpers the
//! reminder scheduler uses to match them against the wall clock.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time};

/// A time of day at minute resolution, e.g. `07:30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WateringTime {
    hour: u8,
    minute: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("'{0}' is not in HH:MM format")]
    Format(String),
    #[error("'{0}' is out of range (00:00-23:59)")]
    Range(String),
}

impl WateringTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// The minute of the day `at` falls in.
    pub fn of(at: OffsetDateTime) -> Self {
        Self {
            hour: at.hour(),
            minute: at.minute(),
        }
    }
}

impl FromStr for WateringTime {
    type Err = TimeParseError;

    /// Strict `HH:MM`: exactly two digits, a colon, two digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Time::parse(s, format_description!("[hour]:[minute]")) {
            Ok(t) => {
                Self::new(t.hour(), t.minute()).ok_or_else(|| TimeParseError::Range(s.to_string()))
            }
            Err(_) if is_two_by_two_digits(s) => Err(TimeParseError::Range(s.to_string())),
            Err(_) => Err(TimeParseError::Format(s.to_string())),
        }
    }
}

impl fmt::Display for WateringTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// `DD:DD`, used to tell an out-of-range time from a malformed one.
fn is_two_by_two_digits(s: &str) -> bool {
    s.len() == 5
        && s.bytes()
            .enumerate()
            .all(|(i, b)| if i == 2 { b == b':' } else { b.is_ascii_digit() })
}

/// Parse, sort and dedup a schedule. Fails on the first malformed entry.
pub fn normalize_schedule<S: AsRef<str>>(entries: &[S]) -> Result<Vec<String>, TimeParseError> {
    let times = entries
        .iter()
        .map(|e| e.as_ref().parse::<WateringTime>())
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(times.iter().map(ToString::to_string).collect())
}

/// `YYYY-MM-DD` for a calendar date.
pub fn date_key(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month() as u8, date.day())
}

// ===========================================================================
// Tests
// ===========================================================================
