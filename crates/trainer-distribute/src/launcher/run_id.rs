//! Run identity shared by every worker of one launch.

use std::fmt;

use chrono::{DateTime, Local, TimeZone};

const RUN_ID_FORMAT: &str = "%Y_%m_%d-%H%M%S";

/// Sortable timestamp token, e.g. `2024_03_01-142530`.
///
/// Resolution is one second: two launches started within the same second get
/// the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(String);

impl RunId {
    /// Stamp the current local time.
    pub fn generate() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz>(at: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self(at.format(RUN_ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value passed to workers as `--group_id`.
    pub fn group_tag(&self) -> String {
        format!("group_{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
