//! Wall-clock source for the reminder scheduler. Everything that depends on
//! "now" takes a `Clock` so tests can pin arbitrary dates and times.

use anyhow::{Context, Result};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    /// Current time in the device's local offset.
    fn now(&self) -> OffsetDateTime;
}

/// Real clock pinned to one UTC offset for the lifetime of the process.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Parse a `+HH:MM` / `-HH:MM` offset string.
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(
        s.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("invalid utc offset '{s}' (expected e.g. +07:00)"))
}

#[cfg(test)]
pub(crate) use fixed::FixedClock;
