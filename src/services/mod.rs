//! Services - polling core and state management
//!
//! This module contains the core business logic services:
//! - `scheduler` - Adaptive poll loop and single-device poll
//! - `zone_detector` - Geofence classification
//! - `prefs` - Durable, concurrency-safe tracking preferences
//! - `history` - Dwell statistics over stored samples

pub mod history;
pub mod prefs;
pub mod scheduler;
pub mod zone_detector;

// Re-export commonly used types
pub use prefs::PreferenceStore;
pub use scheduler::{poll_device, PollError, Scheduler};
pub use zone_detector::{SharedZones, ZoneDetector};
