//! Durable tracking preferences
//!
//! The preference record is a small JSON file:
//!
//! ```json
//! { "tracked_devices": ["device_tracker.phone"], "device_intervals": { "device_tracker.phone": 5 } }
//! ```
//!
//! One mutex guards the in-memory copy and the file write, so every operation
//! is linearizable and every mutation is written through before it returns.
//! Writes go to a temp file and are renamed into place, so readers never see
//! a half-written record.

use crate::domain::types::TrackedDevice;
use crate::infra::config::DeviceConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// On-disk layout of the preference record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefsRecord {
    #[serde(default)]
    pub tracked_devices: Vec<String>,
    #[serde(default)]
    pub device_intervals: BTreeMap<String, u32>,
}

impl PrefsRecord {
    fn is_tracked(&self, entity_id: &str) -> bool {
        self.tracked_devices.iter().any(|id| id == entity_id)
    }

    fn interval(&self, entity_id: &str, default: u32) -> u32 {
        self.device_intervals.get(entity_id).copied().unwrap_or(default).max(1)
    }

    /// Drop duplicate ids, keeping first occurrence
    fn dedup(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.tracked_devices.len());
        self.tracked_devices.retain(|id| {
            if seen.contains(id) {
                false
            } else {
                seen.push(id.clone());
                true
            }
        });
        self
    }
}

/// Outcome of merging configured devices into the store
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Concurrency-safe, write-through store of tracked devices and intervals
pub struct PreferenceStore {
    path: PathBuf,
    default_interval: u32,
    cache: Mutex<PrefsRecord>,
}

impl PreferenceStore {
    /// Open the store, treating a missing or unreadable record as empty
    pub fn open<P: AsRef<Path>>(path: P, default_interval: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        let record = read_record(&path);
        info!(
            path = %path.display(),
            tracked = %record.tracked_devices.len(),
            "preferences_loaded"
        );
        Self { path, default_interval: default_interval.max(1), cache: Mutex::new(record) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_interval(&self) -> u32 {
        self.default_interval
    }

    pub fn is_tracked(&self, entity_id: &str) -> bool {
        self.cache.lock().is_tracked(entity_id)
    }

    pub fn tracked_devices(&self) -> Vec<String> {
        self.cache.lock().tracked_devices.clone()
    }

    /// Start tracking a device. Returns false (and leaves the interval alone)
    /// if it is already tracked.
    pub fn add_device(&self, entity_id: &str, interval_minutes: u32) -> bool {
        let mut cache = self.cache.lock();
        if cache.is_tracked(entity_id) {
            debug!(entity_id = %entity_id, "device_already_tracked");
            return false;
        }

        let interval = interval_minutes.max(1);
        cache.tracked_devices.push(entity_id.to_string());
        cache.device_intervals.insert(entity_id.to_string(), interval);
        info!(entity_id = %entity_id, interval_minutes = %interval, "device_added");

        self.persist(&cache);
        true
    }

    /// Stop tracking a device. Returns false if it was not tracked.
    pub fn remove_device(&self, entity_id: &str) -> bool {
        let mut cache = self.cache.lock();
        if !cache.is_tracked(entity_id) {
            debug!(entity_id = %entity_id, "device_not_tracked");
            return false;
        }

        cache.tracked_devices.retain(|id| id != entity_id);
        cache.device_intervals.remove(entity_id);
        info!(entity_id = %entity_id, "device_removed");

        self.persist(&cache);
        true
    }

    /// Flip tracking for a device and return the resulting state
    pub fn toggle_device(&self, entity_id: &str, interval_minutes: u32) -> bool {
        let mut cache = self.cache.lock();
        let now_tracked = if cache.is_tracked(entity_id) {
            cache.tracked_devices.retain(|id| id != entity_id);
            cache.device_intervals.remove(entity_id);
            false
        } else {
            cache.tracked_devices.push(entity_id.to_string());
            cache.device_intervals.insert(entity_id.to_string(), interval_minutes.max(1));
            true
        };
        info!(entity_id = %entity_id, tracked = %now_tracked, "device_toggled");

        self.persist(&cache);
        now_tracked
    }

    pub fn get_interval(&self, entity_id: &str, default: u32) -> u32 {
        self.cache.lock().interval(entity_id, default)
    }

    /// Overwrite a device's interval. Allowed for untracked ids too; the value
    /// is kept and used if the device is tracked later through the record.
    pub fn set_interval(&self, entity_id: &str, interval_minutes: u32) {
        let mut cache = self.cache.lock();
        let interval = interval_minutes.max(1);
        cache.device_intervals.insert(entity_id.to_string(), interval);
        info!(entity_id = %entity_id, interval_minutes = %interval, "interval_set");

        self.persist(&cache);
    }

    /// Tracked devices in tracking order with their effective intervals
    pub fn tracked_with_intervals(&self) -> Vec<TrackedDevice> {
        let cache = self.cache.lock();
        cache
            .tracked_devices
            .iter()
            .map(|id| TrackedDevice {
                entity_id: id.clone(),
                interval_minutes: cache.interval(id, self.default_interval),
                enabled: true,
            })
            .collect()
    }

    /// Discard the cache and re-read the durable record
    pub fn reload(&self) {
        let mut cache = self.cache.lock();
        *cache = read_record(&self.path);
        info!(tracked = %cache.tracked_devices.len(), "preferences_reloaded");
    }

    /// Merge configured devices at startup
    ///
    /// Configuration owns interval values: new devices are added and already
    /// tracked ones get the configured interval. Disabled and placeholder
    /// entries are skipped.
    pub fn reconcile(&self, devices: &[DeviceConfig]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut cache = self.cache.lock();

        for device in devices {
            if !device.enabled || device.is_placeholder() {
                debug!(entity_id = %device.entity_id, "config_device_skipped");
                report.skipped += 1;
                continue;
            }

            let interval = device.interval_minutes.max(1);
            if cache.is_tracked(&device.entity_id) {
                if cache.device_intervals.get(&device.entity_id) != Some(&interval) {
                    report.updated += 1;
                }
            } else {
                cache.tracked_devices.push(device.entity_id.clone());
                report.added += 1;
            }
            cache.device_intervals.insert(device.entity_id.clone(), interval);
        }

        if report.added > 0 || report.updated > 0 {
            self.persist(&cache);
        }
        info!(
            added = %report.added,
            updated = %report.updated,
            skipped = %report.skipped,
            "config_devices_reconciled"
        );
        report
    }

    /// Write the record; on failure the cache stays authoritative
    fn persist(&self, record: &PrefsRecord) {
        match write_record(&self.path, record) {
            Ok(()) => debug!(path = %self.path.display(), "preferences_saved"),
            Err(e) => error!(path = %self.path.display(), error = %e, "preferences_save_failed"),
        }
    }
}

fn read_record(path: &Path) -> PrefsRecord {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "preferences_file_missing");
            return PrefsRecord::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "preferences_read_failed");
            return PrefsRecord::default();
        }
    };

    match serde_json::from_str::<PrefsRecord>(&content) {
        Ok(record) => record.dedup(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "preferences_malformed");
            PrefsRecord::default()
        }
    }
}

fn write_record(path: &Path, record: &PrefsRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_vec_pretty(record)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}
