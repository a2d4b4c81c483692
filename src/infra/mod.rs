//! Infrastructure - configuration, metrics, and logging
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, env overrides)
//! - `metrics` - Lock-free metrics collection
//! - `logging` - Tracing subscriber setup and redaction helpers

pub mod config;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, DeviceConfig, LogFormat};
pub use metrics::Metrics;
