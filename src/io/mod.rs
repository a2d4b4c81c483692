//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `collaborators` - Traits the core polls and writes through
//! - `ha_client` - Home Assistant REST client (device trackers, zones)
//! - `influx` - InfluxDB client (sample writes, history queries)
//! - `control_api` - HTTP control surface
//! - `prometheus` - Prometheus text formatting for `/metrics`

pub mod collaborators;
pub mod control_api;
pub mod ha_client;
pub mod influx;
pub mod prometheus;

// Re-export commonly used types
pub use collaborators::{LocationHistory, SampleSink, StateSource};
pub use control_api::{start_api_server, ApiContext};
pub use ha_client::HaClient;
pub use influx::InfluxClient;
