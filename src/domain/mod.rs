//! Domain models - core data types
//!
//! This module contains the canonical data types used throughout the system:
//! - `TrackedDevice` - a device polled on its own cadence
//! - `Zone` - a named circular geofence
//! - `EntityState` - raw entity state from the state source
//! - `LocationSample` / `LocationRecord` - classified samples written and read back

pub mod types;
