use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Instant assigned by the remote store; the only ordering authority for documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    #[serde(rename = "nanoseconds")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let total = seconds as i128 * NANOS_PER_SECOND as i128 + nanos as i128;
        Self::from_total_nanos(total)
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_total_nanos(millis as i128 * 1_000_000)
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + (self.nanos / 1_000_000) as i64
    }

    /// Returns the instant `nanos` nanoseconds after this one.
    pub fn plus_nanos(&self, nanos: i64) -> Self {
        Self::from_total_nanos(self.total_nanos() + nanos as i128)
    }

    pub fn to_rfc3339(&self) -> Option<String> {
        DateTime::<Utc>::from_timestamp(self.seconds, self.nanos as u32)
            .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn to_json(&self) -> Value {
        json!({ "seconds": self.seconds, "nanoseconds": self.nanos })
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH
                + Duration::from_secs(self.seconds as u64)
                + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs((-self.seconds) as u64)
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    fn total_nanos(&self) -> i128 {
        self.seconds as i128 * NANOS_PER_SECOND as i128 + self.nanos as i128
    }

    fn from_total_nanos(total: i128) -> Self {
        let per_second = NANOS_PER_SECOND as i128;
        Self {
            seconds: total.div_euclid(per_second) as i64,
            nanos: total.rem_euclid(per_second) as i32,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.to_rfc3339() {
            Some(text) => f.write_str(&text),
            None => write!(f, "{}.{:09}s", self.seconds, self.nanos),
        }
    }
}
