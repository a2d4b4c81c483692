//! Tests for the Scheduler module

use super::*;
use crate::domain::types::Zone;
use crate::io::collaborators::mock::{MockSink, MockSource};
use crate::services::zone_detector::ZoneDetector;
use chrono::TimeZone;
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    scheduler: Scheduler,
    prefs: Arc<PreferenceStore>,
    zones: SharedZones,
    source: Arc<MockSource>,
    sink: Arc<MockSink>,
    metrics: Arc<Metrics>,
    _dir: TempDir,
}

fn harness(zones: Vec<Zone>) -> Harness {
    let dir = TempDir::new().unwrap();
    let prefs = Arc::new(PreferenceStore::open(dir.path().join("prefs.json"), 5));
    let zones = ZoneDetector::shared(zones);
    let source = Arc::new(MockSource::default());
    let sink = Arc::new(MockSink::default());
    let metrics = Arc::new(Metrics::new());
    let scheduler = Scheduler::new(
        &Config::default(),
        prefs.clone(),
        zones.clone(),
        source.clone(),
        sink.clone(),
        metrics.clone(),
    );
    Harness { scheduler, prefs, zones, source, sink, metrics, _dir: dir }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

fn home() -> Zone {
    Zone::new("home", 54.8985, 23.9036, 100.0)
}

// ============================================================================
// Due-device selection
// ============================================================================

#[tokio::test]
async fn test_five_minute_interval_waits_for_five_minutes_of_ticks() {
    let mut h = harness(vec![]);
    h.prefs.add_device("device_tracker.phone", 5);
    h.source.set_location("device_tracker.phone", 54.0, 23.0);

    let first = h.scheduler.tick_at(at(0)).await;
    assert_eq!(first.due, vec!["device_tracker.phone"]);

    for minute in 1..5 {
        let report = h.scheduler.tick_at(at(minute * 60)).await;
        assert!(report.due.is_empty(), "polled early at minute {minute}");
    }

    let fifth = h.scheduler.tick_at(at(300)).await;
    assert_eq!(fifth.due, vec!["device_tracker.phone"]);
    assert_eq!(h.sink.samples().len(), 2);
    assert_eq!(h.scheduler.last_poll("device_tracker.phone"), Some(at(300).timestamp()));
}

#[tokio::test]
async fn test_devices_keep_independent_cadences() {
    let mut h = harness(vec![]);
    h.prefs.add_device("device_tracker.fast", 1);
    h.prefs.add_device("device_tracker.slow", 3);
    h.source.set_location("device_tracker.fast", 54.0, 23.0);
    h.source.set_location("device_tracker.slow", 54.0, 23.0);

    let mut polls: Vec<(i64, Vec<String>)> = Vec::new();
    for minute in 0..4 {
        let report = h.scheduler.tick_at(at(minute * 60)).await;
        polls.push((minute, report.due));
    }

    assert_eq!(polls[0].1, vec!["device_tracker.fast", "device_tracker.slow"]);
    assert_eq!(polls[1].1, vec!["device_tracker.fast"]);
    assert_eq!(polls[2].1, vec!["device_tracker.fast"]);
    assert_eq!(polls[3].1, vec!["device_tracker.fast", "device_tracker.slow"]);
}

#[tokio::test]
async fn test_store_edits_apply_on_next_tick() {
    let mut h = harness(vec![]);
    h.source.set_location("device_tracker.phone", 54.0, 23.0);

    let report = h.scheduler.tick_at(at(0)).await;
    assert_eq!(report.tracked, 0);
    assert!(report.due.is_empty());

    assert!(h.prefs.toggle_device("device_tracker.phone", 5));
    let report = h.scheduler.tick_at(at(60)).await;
    assert_eq!(report.due, vec!["device_tracker.phone"]);

    assert!(!h.prefs.toggle_device("device_tracker.phone", 5));
    let report = h.scheduler.tick_at(at(600)).await;
    assert_eq!(report.tracked, 0);
    assert!(report.due.is_empty());
}

#[tokio::test]
async fn test_untracked_devices_leave_poll_state() {
    let mut h = harness(vec![]);
    h.prefs.add_device("device_tracker.phone", 5);
    h.prefs.add_device("device_tracker.tablet", 5);
    h.source.set_location("device_tracker.phone", 54.0, 23.0);
    h.source.set_location("device_tracker.tablet", 54.0, 23.0);

    h.scheduler.tick_at(at(0)).await;
    assert_eq!(h.scheduler.last_poll("device_tracker.tablet"), Some(at(0).timestamp()));

    h.prefs.remove_device("device_tracker.tablet");
    h.scheduler.tick_at(at(60)).await;
    assert_eq!(h.scheduler.last_poll("device_tracker.tablet"), None);
    assert_eq!(h.scheduler.last_poll("device_tracker.phone"), Some(at(0).timestamp()));

    // Re-tracking starts a fresh cadence
    h.prefs.add_device("device_tracker.tablet", 5);
    assert_eq!(h.scheduler.tick_at(at(120)).await.due, vec!["device_tracker.tablet"]);
}

#[tokio::test]
async fn test_interval_change_applies_without_restart() {
    let mut h = harness(vec![]);
    h.prefs.add_device("device_tracker.phone", 10);
    h.source.set_location("device_tracker.phone", 54.0, 23.0);

    h.scheduler.tick_at(at(0)).await;
    assert!(h.scheduler.tick_at(at(120)).await.due.is_empty());

    h.prefs.set_interval("device_tracker.phone", 2);
    assert_eq!(h.scheduler.tick_at(at(180)).await.due, vec!["device_tracker.phone"]);
}

// ============================================================================
// Classification and samples
// ============================================================================

#[tokio::test]
async fn test_home_zone_classification() {
    let mut h = harness(vec![home()]);
    h.prefs.add_device("device_tracker.at_home", 5);
    h.prefs.add_device("device_tracker.away", 5);
    h.source.set_location("device_tracker.at_home", 54.8985, 23.9036);
    h.source.set_location("device_tracker.away", 55.0, 24.0);

    let report = h.scheduler.tick_at(at(0)).await;
    assert_eq!(report.written, 2);

    let samples = h.sink.samples();
    let at_home = samples.iter().find(|s| s.device_id == "device_tracker.at_home").unwrap();
    assert!(at_home.in_zone);
    assert_eq!(at_home.zone_name, "home");

    let away = samples.iter().find(|s| s.device_id == "device_tracker.away").unwrap();
    assert!(!away.in_zone);
    assert_eq!(away.zone_name, "unknown");
}

#[tokio::test]
async fn test_sample_uses_poll_time_not_source_time() {
    let mut h = harness(vec![home()]);
    h.prefs.add_device("device_tracker.phone", 5);
    h.source.set_state(json!({
        "entity_id": "device_tracker.phone",
        "state": "home",
        "last_updated": "2020-01-01T00:00:00+00:00",
        "attributes": {"latitude": 54.8985, "longitude": 23.9036, "friendly_name": "Phone"}
    }));

    h.scheduler.tick_at(at(0)).await;
    h.scheduler.tick_at(at(300)).await;

    let samples = h.sink.samples();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].timestamp, at(0));
    assert_eq!(samples[1].timestamp, at(300));
    assert_eq!(samples[0].device_name, "Phone");
}

#[tokio::test]
async fn test_location_from_state_string() {
    let mut h = harness(vec![home()]);
    h.prefs.add_device("device_tracker.watch", 5);
    h.source.set_state(json!({
        "entity_id": "device_tracker.watch",
        "state": "54.8985, 23.9036",
        "attributes": {}
    }));

    let report = h.scheduler.tick_at(at(0)).await;
    assert_eq!(report.written, 1);
    assert_eq!(h.sink.samples()[0].zone_name, "home");
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_failures_are_isolated_per_device() {
    let mut h = harness(vec![]);
    h.prefs.add_device("device_tracker.missing", 5);
    h.prefs.add_device("device_tracker.no_gps", 5);
    h.prefs.add_device("device_tracker.rejected", 5);
    h.prefs.add_device("device_tracker.good", 5);
    h.source.set_state(json!({
        "entity_id": "device_tracker.no_gps",
        "state": "unavailable",
        "attributes": {}
    }));
    h.source.set_location("device_tracker.rejected", 54.0, 23.0);
    h.source.set_location("device_tracker.good", 54.0, 23.0);
    h.sink.reject("device_tracker.rejected");

    let report = h.scheduler.tick_at(at(0)).await;
    assert_eq!(report.due.len(), 4);
    assert_eq!(report.written, 1);
    assert_eq!(report.failed, 3);
    assert_eq!(h.sink.samples()[0].device_id, "device_tracker.good");

    // Every due device was marked, including the failing ones
    for id in &report.due {
        assert_eq!(h.scheduler.last_poll(id), Some(at(0).timestamp()));
    }

    // No retry within the interval
    let report = h.scheduler.tick_at(at(60)).await;
    assert!(report.due.is_empty());

    let summary = h.metrics.report();
    assert_eq!(summary.polls_total, 4);
    assert_eq!(summary.poll_failures_total, 2);
    assert_eq!(summary.sink_failures_total, 1);
    assert_eq!(summary.samples_written_total, 1);
}

#[tokio::test]
async fn test_polls_are_sequential_in_tracking_order() {
    let mut h = harness(vec![]);
    for id in ["device_tracker.c", "device_tracker.a", "device_tracker.b"] {
        h.prefs.add_device(id, 5);
        h.source.set_location(id, 54.0, 23.0);
    }

    h.scheduler.tick_at(at(0)).await;
    assert_eq!(
        h.source.fetched(),
        vec!["device_tracker.c", "device_tracker.a", "device_tracker.b"]
    );
}

// ============================================================================
// Zone refresh
// ============================================================================

#[tokio::test]
async fn test_zone_refresh_every_tenth_tick() {
    let mut h = harness(vec![]);
    h.source.set_zones(Some(vec![home()]));

    for tick in 1..10 {
        let report = h.scheduler.tick_at(at(tick * 60)).await;
        assert_eq!(report.zones_refreshed, None);
    }
    assert_eq!(h.source.zone_fetches(), 0);
    assert!(h.zones.read().is_empty());

    let report = h.scheduler.tick_at(at(600)).await;
    assert_eq!(report.tick, 10);
    assert_eq!(report.zones_refreshed, Some(true));
    assert_eq!(h.zones.read().len(), 1);
    assert_eq!(h.metrics.report().zones, 1);
}

#[tokio::test]
async fn test_zone_refresh_failure_keeps_stale_snapshot() {
    let mut h = harness(vec![home()]);
    h.prefs.add_device("device_tracker.phone", 1);
    h.source.set_location("device_tracker.phone", 54.8985, 23.9036);
    h.source.set_zones(None);

    let mut refreshes = Vec::new();
    for tick in 0..10 {
        let report = h.scheduler.tick_at(at(tick * 60)).await;
        refreshes.extend(report.zones_refreshed);
    }

    assert_eq!(refreshes, vec![false]);
    assert_eq!(h.zones.read().zones(), &[home()]);
    // Polling carried on through the failed refresh
    let samples = h.sink.samples();
    assert_eq!(samples.len(), 10);
    assert!(samples.iter().all(|s| s.zone_name == "home"));
    assert_eq!(h.metrics.report().zone_refresh_failures_total, 1);
}

// ============================================================================
// Single-device poll
// ============================================================================

#[tokio::test]
async fn test_poll_device_errors() {
    let h = harness(vec![]);
    h.source.set_state(json!({"entity_id": "device_tracker.no_gps", "state": "home", "attributes": {}}));
    h.source.set_location("device_tracker.rejected", 54.0, 23.0);
    h.sink.reject("device_tracker.rejected");

    let source: &dyn StateSource = h.source.as_ref();
    let sink: &dyn SampleSink = h.sink.as_ref();

    assert_eq!(
        poll_device(source, sink, &h.zones, "device_tracker.none", at(0)).await,
        Err(PollError::StateUnavailable("device_tracker.none".to_string()))
    );
    assert_eq!(
        poll_device(source, sink, &h.zones, "device_tracker.no_gps", at(0)).await,
        Err(PollError::NoLocation("device_tracker.no_gps".to_string()))
    );
    assert_eq!(
        poll_device(source, sink, &h.zones, "device_tracker.rejected", at(0)).await,
        Err(PollError::SinkRejected("device_tracker.rejected".to_string()))
    );
}

#[tokio::test]
async fn test_poll_device_ignores_tracking_state() {
    let h = harness(vec![home()]);
    h.source.set_location("device_tracker.guest", 54.8985, 23.9036);

    let sample = poll_device(
        h.source.as_ref(),
        h.sink.as_ref(),
        &h.zones,
        "device_tracker.guest",
        at(42),
    )
    .await
    .unwrap();

    assert!(sample.in_zone);
    assert_eq!(sample.timestamp, at(42));
    assert_eq!(h.sink.samples().len(), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let mut h = harness(vec![]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        h.scheduler.run(shutdown_rx).await;
        h.scheduler.tick_count
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let ticks = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    // The first interval tick fires immediately
    assert_eq!(ticks, 1);
}
