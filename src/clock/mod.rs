use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Seconds in one week.
const WEEK_SECS: i64 = 7 * 86_400;

/// Bucket granularity: timestamps are truncated to the start of the
/// bucket they fall in, relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketUnit {
    Minute,
    Hour,
    Day,
    Week,
}

impl BucketUnit {
    /// Bucket width in seconds.
    pub fn secs(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => WEEK_SECS,
        }
    }

    /// Truncate a unix timestamp to the start of its bucket.
    pub fn truncate(self, unix_secs: i64) -> i64 {
        unix_secs - unix_secs.rem_euclid(self.secs())
    }

    /// Query-string form used by the aggregation API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }
}

impl fmt::Display for BucketUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-selectable chart range. A range fixes both the bucket
/// granularity and the retention window; the two always change
/// together so buckets of mixed granularity never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartRange {
    Hour,
    Day,
    Week,
}

impl ChartRange {
    /// Granularity of the buckets backing this range.
    pub fn bucket_unit(self) -> BucketUnit {
        match self {
            Self::Hour => BucketUnit::Minute,
            Self::Day => BucketUnit::Hour,
            Self::Week => BucketUnit::Day,
        }
    }

    /// Width of the retention window in seconds.
    pub fn window_secs(self) -> i64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => WEEK_SECS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    /// Half-open fetch range `[from, to)` covering the window ending
    /// at `now`, both ends truncated to the bucket granularity.
    pub fn fetch_range(self, now: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let unit = self.bucket_unit();
        let to = unit.truncate(now);
        let from = unit.truncate(now - self.window_secs());
        (utc(from), utc(to))
    }
}

impl fmt::Display for ChartRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn utc(unix_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
