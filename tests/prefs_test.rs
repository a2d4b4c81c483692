//! Integration tests for the preference store public API

use findmy_history::infra::{Config, DeviceConfig};
use findmy_history::services::PreferenceStore;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn device(entity_id: &str, interval_minutes: u32, enabled: bool) -> DeviceConfig {
    DeviceConfig { entity_id: entity_id.to_string(), interval_minutes, enabled }
}

#[test]
fn test_interval_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tracked_devices.json");

    let store = PreferenceStore::open(&path, 5);
    assert!(store.add_device("device_tracker.phone", 5));
    store.set_interval("device_tracker.phone", 15);
    drop(store);

    let reopened = PreferenceStore::open(&path, 5);
    assert!(reopened.is_tracked("device_tracker.phone"));
    assert_eq!(reopened.get_interval("device_tracker.phone", 5), 15);
}

#[test]
fn test_startup_reconciliation_from_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tracked_devices.json");

    let config = Config::from_toml_str(
        r#"
[[devices]]
entity_id = "device_tracker.phone"
interval_minutes = 2

[[devices]]
entity_id = "device_tracker.watch"
enabled = false

[[devices]]
entity_id = "device_tracker.your_device"
"#,
        "inline",
    )
    .unwrap();

    let store = PreferenceStore::open(&path, 5);
    store.add_device("device_tracker.tablet", 30);
    let report = store.reconcile(config.devices());

    assert_eq!(report.added, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(store.tracked_devices(), vec!["device_tracker.tablet", "device_tracker.phone"]);

    let tracked = store.tracked_with_intervals();
    assert_eq!(tracked[1].interval_minutes, 2);
    assert!(tracked.iter().all(|d| d.enabled));

    // Config owns intervals for devices already tracked
    let report = store.reconcile(&[device("device_tracker.tablet", 60, true)]);
    assert_eq!(report.updated, 1);
    assert_eq!(store.get_interval("device_tracker.tablet", 5), 60);
}

#[test]
fn test_concurrent_toggles_stay_consistent_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tracked_devices.json");
    let store = Arc::new(PreferenceStore::open(&path, 5));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let id = format!("device_tracker.device_{i}");
                // Odd number of toggles leaves every device tracked
                for _ in 0..5 {
                    store.toggle_device(&id, i + 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.tracked_devices().len(), 8);

    let reopened = PreferenceStore::open(&path, 5);
    assert_eq!(reopened.tracked_devices().len(), 8);
    for i in 0..8u32 {
        assert_eq!(reopened.get_interval(&format!("device_tracker.device_{i}"), 5), i + 1);
    }
}

#[test]
fn test_malformed_record_is_empty_and_repaired() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tracked_devices.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = PreferenceStore::open(&path, 5);
    assert!(store.tracked_devices().is_empty());

    assert!(store.toggle_device("device_tracker.phone", 5));
    let reopened = PreferenceStore::open(&path, 5);
    assert_eq!(reopened.tracked_devices(), vec!["device_tracker.phone"]);
}
