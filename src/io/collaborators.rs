//! Contracts between the polling core and the external services
//!
//! The scheduler and control API only see these traits; the REST and
//! time-series clients implement them, and tests substitute in-memory fakes.

use crate::domain::types::{EntityState, LocationRecord, LocationSample, Zone};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of live entity state (device trackers and zones)
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Current state of one entity; None on any transport or parse failure
    async fn fetch_device_state(&self, entity_id: &str) -> Option<EntityState>;

    /// All `device_tracker.*` entities; empty on failure
    async fn fetch_all_trackers(&self) -> Vec<EntityState>;

    /// Zone snapshot. A transport failure is an error so callers can keep
    /// their previous snapshot; use `unwrap_or_default()` for "empty on failure".
    async fn fetch_zones(&self) -> anyhow::Result<Vec<Zone>>;
}

/// Destination for classified samples
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Write one sample; false on failure
    async fn write_sample(&self, sample: &LocationSample) -> bool;
}

/// Read side of the sample store
#[async_trait]
pub trait LocationHistory: Send + Sync {
    /// Samples in `[start, end]`, oldest first; empty on failure
    async fn query_locations(
        &self,
        device_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<LocationRecord>;

    /// Device ids that have stored samples; empty on failure
    async fn unique_devices(&self) -> Vec<String>;
}
