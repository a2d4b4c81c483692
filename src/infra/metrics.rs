//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the scheduler and the control API can record without
//! contending on a lock. Monotonic totals are never reset; the per-report
//! poll latency histogram is swapped to zero on each `report()`.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not drive scheduling decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Poll duration bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Scheduler ticks (monotonic)
    ticks_total: AtomicU64,
    /// Devices found due and polled (monotonic)
    polls_total: AtomicU64,
    /// Polls that produced no sample: fetch failure or no location (monotonic)
    poll_failures_total: AtomicU64,
    /// Samples accepted by the sink (monotonic)
    samples_written_total: AtomicU64,
    /// Samples rejected by the sink (monotonic)
    sink_failures_total: AtomicU64,
    /// Samples recorded inside a zone (monotonic)
    in_zone_total: AtomicU64,
    /// Successful zone snapshot refreshes (monotonic)
    zone_refresh_total: AtomicU64,
    /// Failed zone snapshot refreshes (monotonic)
    zone_refresh_failures_total: AtomicU64,
    /// Tracked devices seen on the last tick
    tracked_devices: AtomicU64,
    /// Zones in the current snapshot
    zones: AtomicU64,
    /// Poll duration histogram (reset on report)
    poll_duration_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of poll durations in ms (reset on report)
    poll_duration_sum_ms: AtomicU64,
    /// Max poll duration in ms (reset on report)
    poll_duration_max_ms: AtomicU64,
    /// Process start, for uptime
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            polls_total: AtomicU64::new(0),
            poll_failures_total: AtomicU64::new(0),
            samples_written_total: AtomicU64::new(0),
            sink_failures_total: AtomicU64::new(0),
            in_zone_total: AtomicU64::new(0),
            zone_refresh_total: AtomicU64::new(0),
            zone_refresh_failures_total: AtomicU64::new(0),
            tracked_devices: AtomicU64::new(0),
            zones: AtomicU64::new(0),
            poll_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_duration_sum_ms: AtomicU64::new(0),
            poll_duration_max_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn record_tick(&self, tracked_devices: usize) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.tracked_devices.store(tracked_devices as u64, Ordering::Relaxed);
    }

    /// Record one device poll and how long it took end to end
    #[inline]
    pub fn record_poll(&self, duration_ms: u64) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.poll_duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.poll_duration_buckets[bucket_index(duration_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.poll_duration_max_ms, duration_ms);
    }

    #[inline]
    pub fn record_poll_failure(&self) {
        self.poll_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_written(&self, in_zone: bool) {
        self.samples_written_total.fetch_add(1, Ordering::Relaxed);
        if in_zone {
            self.in_zone_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_sink_failure(&self) {
        self.sink_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_refresh(&self, ok: bool) {
        if ok {
            self.zone_refresh_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.zone_refresh_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_zones(&self, zones: usize) {
        self.zones.store(zones as u64, Ordering::Relaxed);
    }

    pub fn samples_written_total(&self) -> u64 {
        self.samples_written_total.load(Ordering::Relaxed)
    }

    pub fn polls_total(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    /// Snapshot all counters and reset the per-report histogram
    pub fn report(&self) -> MetricsSummary {
        let poll_duration_buckets = swap_buckets(&self.poll_duration_buckets);
        let sum_ms = self.poll_duration_sum_ms.swap(0, Ordering::Relaxed);
        let max_ms = self.poll_duration_max_ms.swap(0, Ordering::Relaxed);
        let count: u64 = poll_duration_buckets.iter().sum();

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            polls_total: self.polls_total.load(Ordering::Relaxed),
            poll_failures_total: self.poll_failures_total.load(Ordering::Relaxed),
            samples_written_total: self.samples_written_total.load(Ordering::Relaxed),
            sink_failures_total: self.sink_failures_total.load(Ordering::Relaxed),
            in_zone_total: self.in_zone_total.load(Ordering::Relaxed),
            zone_refresh_total: self.zone_refresh_total.load(Ordering::Relaxed),
            zone_refresh_failures_total: self.zone_refresh_failures_total.load(Ordering::Relaxed),
            tracked_devices: self.tracked_devices.load(Ordering::Relaxed),
            zones: self.zones.load(Ordering::Relaxed),
            poll_duration_avg_ms: if count > 0 { sum_ms / count } else { 0 },
            poll_duration_max_ms: max_ms,
            poll_duration_p95_ms: percentile_from_buckets(&poll_duration_buckets, 0.95),
            poll_duration_sum_ms: sum_ms,
            poll_duration_buckets,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub ticks_total: u64,
    pub polls_total: u64,
    pub poll_failures_total: u64,
    pub samples_written_total: u64,
    pub sink_failures_total: u64,
    pub in_zone_total: u64,
    pub zone_refresh_total: u64,
    pub zone_refresh_failures_total: u64,
    pub tracked_devices: u64,
    pub zones: u64,
    /// Poll duration histogram since last report
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600 ms
    pub poll_duration_buckets: [u64; NUM_BUCKETS],
    pub poll_duration_sum_ms: u64,
    pub poll_duration_avg_ms: u64,
    pub poll_duration_max_ms: u64,
    pub poll_duration_p95_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            ticks = %self.ticks_total,
            polls = %self.polls_total,
            poll_failures = %self.poll_failures_total,
            samples = %self.samples_written_total,
            sink_failures = %self.sink_failures_total,
            tracked_devices = %self.tracked_devices,
            zones = %self.zones,
            poll_avg_ms = %self.poll_duration_avg_ms,
            poll_p95_ms = %self.poll_duration_p95_ms,
            "metrics"
        );
    }
}
