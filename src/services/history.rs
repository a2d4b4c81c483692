//! Dwell statistics over stored samples

use crate::domain::types::LocationRecord;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Upper bound on samples read for one stats request
pub const STATS_QUERY_LIMIT: usize = 10_000;

/// Window used when a request gives no start
pub const DEFAULT_STATS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// Fill missing bounds: end defaults to `now`, start to the default window before end
    pub fn resolve(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let end = end.unwrap_or(now);
        let start = start.unwrap_or(end - Duration::hours(DEFAULT_STATS_WINDOW_HOURS));
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Share {
    pub count: usize,
    pub percentage: f64,
}

impl Share {
    fn of(count: usize, total: usize) -> Self {
        let percentage = if total == 0 { 0.0 } else { count as f64 / total as f64 * 100.0 };
        Self { count, percentage }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub period: Period,
    pub total_locations: usize,
    pub in_zone: Share,
    pub unknown: Share,
    /// Sample count per zone name
    pub zones: BTreeMap<String, usize>,
    /// Seconds between the first and last sample
    pub duration_seconds: i64,
}

/// Summarize time-ordered samples for one device
pub fn compute_stats(device_id: &str, period: Period, records: &[LocationRecord]) -> DeviceStats {
    let total = records.len();
    let in_zone = records.iter().filter(|r| r.in_zone).count();

    let mut zones: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        *zones.entry(record.zone_name.clone()).or_default() += 1;
    }

    let duration_seconds = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (last.time - first.time).num_seconds().max(0),
        _ => 0,
    };

    DeviceStats {
        device_id: device_id.to_string(),
        period,
        total_locations: total,
        in_zone: Share::of(in_zone, total),
        unknown: Share::of(total - in_zone, total),
        zones,
        duration_seconds,
    }
}
