//! Adaptive poll scheduler
//!
//! One loop wakes on a fixed base tick. Each tick it may refresh the zone
//! snapshot, reads the live tracked-device list from the preference store,
//! works out which devices are due and polls them one at a time.
//!
//! Poll bookkeeping (`last_poll`) is in-memory only, so every device is due
//! on the first tick after a restart.

use crate::domain::types::LocationSample;
use crate::infra::config::Config;
use crate::infra::logging::fmt_coords;
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{SampleSink, StateSource};
use crate::services::prefs::PreferenceStore;
use crate::services::zone_detector::SharedZones;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Why a single-device poll produced no sample
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("state unavailable for {0}")]
    StateUnavailable(String),
    #[error("no usable location for {0}")]
    NoLocation(String),
    #[error("sink rejected sample for {0}")]
    SinkRejected(String),
}

/// Fetch, classify and write one device
///
/// Shared by the tick loop and the control API's force refresh. The sample
/// carries `now` as its timestamp. The zone lock is only held for the
/// classification itself, never across a network call.
pub async fn poll_device(
    source: &dyn StateSource,
    sink: &dyn SampleSink,
    zones: &SharedZones,
    entity_id: &str,
    now: DateTime<Utc>,
) -> Result<LocationSample, PollError> {
    let state = source
        .fetch_device_state(entity_id)
        .await
        .ok_or_else(|| PollError::StateUnavailable(entity_id.to_string()))?;

    let location = state.location().ok_or_else(|| PollError::NoLocation(entity_id.to_string()))?;

    let zone = zones.read().check_zone(location.latitude, location.longitude).map(str::to_string);
    let sample = LocationSample::new(&state, location, zone, now);

    if !sink.write_sample(&sample).await {
        return Err(PollError::SinkRejected(entity_id.to_string()));
    }
    Ok(sample)
}

/// Outcome of one tick, for logging and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Some(ok) when this tick attempted a zone refresh
    pub zones_refreshed: Option<bool>,
    pub tracked: usize,
    pub due: Vec<String>,
    pub written: usize,
    pub failed: usize,
}

pub struct Scheduler {
    prefs: Arc<PreferenceStore>,
    zones: SharedZones,
    source: Arc<dyn StateSource>,
    sink: Arc<dyn SampleSink>,
    metrics: Arc<Metrics>,
    base_tick: Duration,
    zone_refresh_every: u64,
    tick_count: u64,
    /// entity_id -> unix seconds of the last poll attempt
    last_poll: FxHashMap<String, i64>,
    mask_coords: bool,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        prefs: Arc<PreferenceStore>,
        zones: SharedZones,
        source: Arc<dyn StateSource>,
        sink: Arc<dyn SampleSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            prefs,
            zones,
            source,
            sink,
            metrics,
            base_tick: Duration::from_secs(config.base_tick_secs().max(1)),
            zone_refresh_every: u64::from(config.zone_refresh_ticks().max(1)),
            tick_count: 0,
            last_poll: FxHashMap::default(),
            mask_coords: config.mask_sensitive_logs(),
        }
    }

    /// Unix time of the last poll attempt for a device
    pub fn last_poll(&self, entity_id: &str) -> Option<i64> {
        self.last_poll.get(entity_id).copied()
    }

    /// Run until the shutdown channel flips to true (or its sender is dropped)
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick_interval = interval(self.base_tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            base_tick_secs = %self.base_tick.as_secs(),
            zone_refresh_ticks = %self.zone_refresh_every,
            "scheduler_started"
        );

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let report = self.tick_at(Utc::now()).await;
                    if !report.due.is_empty() {
                        info!(
                            tick = %report.tick,
                            due = %report.due.len(),
                            written = %report.written,
                            failed = %report.failed,
                            "tick_complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler_shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Execute one tick with `now` as the reference time
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        self.tick_count += 1;
        let mut report = TickReport { tick: self.tick_count, ..TickReport::default() };

        if self.tick_count % self.zone_refresh_every == 0 {
            report.zones_refreshed = Some(self.refresh_zones().await);
        }

        // Fresh read each tick so control-surface edits apply without restart
        let devices = self.prefs.tracked_with_intervals();
        report.tracked = devices.len();
        self.metrics.record_tick(devices.len());
        self.last_poll
            .retain(|id, _| devices.iter().any(|d| d.enabled && d.entity_id == *id));

        let now_secs = now.timestamp();
        for device in devices.iter().filter(|d| d.enabled) {
            let last = self.last_poll.get(&device.entity_id).copied().unwrap_or(0);
            if now_secs - last >= device.interval_secs() {
                // Marked before the fetch so a slow or failing device is not re-polled every tick
                self.last_poll.insert(device.entity_id.clone(), now_secs);
                report.due.push(device.entity_id.clone());
            } else {
                debug!(
                    entity_id = %device.entity_id,
                    next_in_secs = %(device.interval_secs() - (now_secs - last)),
                    "device_not_due"
                );
            }
        }

        for entity_id in &report.due {
            if self.poll_one(entity_id, now).await {
                report.written += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    async fn poll_one(&self, entity_id: &str, now: DateTime<Utc>) -> bool {
        let started = Instant::now();
        let result =
            poll_device(self.source.as_ref(), self.sink.as_ref(), &self.zones, entity_id, now).await;
        self.metrics.record_poll(started.elapsed().as_millis() as u64);

        match result {
            Ok(sample) => {
                self.metrics.record_sample_written(sample.in_zone);
                info!(
                    entity_id = %entity_id,
                    coords = %fmt_coords(sample.latitude, sample.longitude, self.mask_coords),
                    zone = %sample.zone_name,
                    "location_recorded"
                );
                true
            }
            Err(e @ PollError::SinkRejected(_)) => {
                self.metrics.record_sink_failure();
                warn!(entity_id = %entity_id, error = %e, "sample_write_failed");
                false
            }
            Err(e) => {
                self.metrics.record_poll_failure();
                warn!(entity_id = %entity_id, error = %e, "device_poll_failed");
                false
            }
        }
    }

    /// Replace the zone snapshot; keep the old one if the fetch fails
    async fn refresh_zones(&self) -> bool {
        match self.source.fetch_zones().await {
            Ok(zones) => {
                let count = zones.len();
                self.zones.write().update_zones(zones);
                self.metrics.record_zone_refresh(true);
                self.metrics.set_zones(count);
                info!(zones = %count, "zones_refreshed");
                true
            }
            Err(e) => {
                self.metrics.record_zone_refresh(false);
                warn!(error = %e, kept = %self.zones.read().len(), "zone_refresh_failed");
                false
            }
        }
    }
}
