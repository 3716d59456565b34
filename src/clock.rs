//! Fixed-offset timezone clock: produces usage-bucket keys.
//!
//! `SystemTime::now().duration_since(UNIX_EPOCH)` is pulled into one small
//! typed helper instead of being scattered at each call site, since it now
//! feeds a genuinely configurable offset rather than always meaning "now,
//! in UTC".

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, Utc};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Produces `day`/`month`/`hour` bucket keys for usage counters
/// in a fixed UTC offset. Bucket keys are computed from `UTC(now) + offset`,
/// reading back UTC components — the offset only shifts which calendar day
/// a given instant falls into, it never changes the printed values' label.
#[derive(Debug, Clone, Copy)]
pub struct TzClock {
    offset_hours: i32,
}

impl TzClock {
    /// `offset_hours` is clamped to the valid UTC offset range, `[-12, 14]`.
    pub fn new(offset_hours: i32) -> Self {
        Self { offset_hours: offset_hours.clamp(-12, 14) }
    }

    fn shifted_now(&self) -> DateTime<Utc> {
        let now = DateTime::<Utc>::from_timestamp_millis(now_millis()).unwrap_or_else(Utc::now);
        now + Duration::hours(self.offset_hours as i64)
    }

    /// `YYYY-MM-DD`.
    pub fn day_bucket(&self) -> String {
        self.shifted_now().format("%Y-%m-%d").to_string()
    }

    /// `YYYY-MM`.
    pub fn month_bucket(&self) -> String {
        self.shifted_now().format("%Y-%m").to_string()
    }

    /// `YYYY-MM-DD:HH`.
    pub fn hour_bucket(&self) -> String {
        self.shifted_now().format("%Y-%m-%d:%H").to_string()
    }

    pub fn buckets(&self) -> (String, String, String) {
        let now = self.shifted_now();
        (
            now.format("%Y-%m-%d").to_string(),
            now.format("%Y-%m").to_string(),
            now.format("%Y-%m-%d:%H").to_string(),
        )
    }
}

impl Default for TzClock {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_TZ_OFFSET_HOURS)
    }
}
