//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! The state-source token may also come from the environment:
//! `SUPERVISOR_TOKEN` wins over `HA_TOKEN`, which wins over the file.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_ha_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self { url: default_ha_url(), token: String::new(), timeout_secs: default_timeout_secs() }
    }
}

fn default_ha_url() -> String {
    "http://supervisor/core".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default = "default_influx_database")]
    pub database: String,
    #[serde(default = "default_influx_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// API token; when set it replaces username/password auth
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            database: default_influx_database(),
            username: default_influx_username(),
            password: String::new(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_influx_url() -> String {
    "http://a0d7b954-influxdb:8086".to_string()
}

fn default_influx_database() -> String {
    "find_my_history".to_string()
}

fn default_influx_username() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Fixed wake-up cadence, independent of device intervals
    #[serde(default = "default_base_tick_secs")]
    pub base_tick_secs: u64,
    /// Zones are re-fetched every N ticks
    #[serde(default = "default_zone_refresh_ticks")]
    pub zone_refresh_ticks: u32,
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u32,
    /// Reachability attempts per collaborator before startup fails
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_tick_secs: default_base_tick_secs(),
            zone_refresh_ticks: default_zone_refresh_ticks(),
            default_interval_minutes: default_interval_minutes(),
            startup_retries: default_startup_retries(),
        }
    }
}

fn default_base_tick_secs() -> u64 {
    60
}

fn default_zone_refresh_ticks() -> u32 {
    10
}

fn default_interval_minutes() -> u32 {
    5
}

fn default_startup_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferencesConfig {
    #[serde(default = "default_prefs_path")]
    pub path: String,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self { path: default_prefs_path() }
    }
}

fn default_prefs_path() -> String {
    "/data/tracked_devices.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Control API HTTP port (0 to disable)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: default_api_port() }
    }
}

fn default_api_port() -> u16 {
    8090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Mask coordinates in log lines
    #[serde(default)]
    pub mask_sensitive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

/// A device listed in the configuration file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub entity_id: String,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default = "default_device_enabled")]
    pub enabled: bool,
}

fn default_device_enabled() -> bool {
    true
}

impl DeviceConfig {
    /// True for template entries shipped in sample configs
    /// (`device_tracker.example_phone`, `device_tracker.your_device`, blank ids)
    pub fn is_placeholder(&self) -> bool {
        let id = self.entity_id.trim();
        let Some((_, object_id)) = id.split_once('.') else {
            return true;
        };
        let object_id = object_id.to_ascii_lowercase();
        object_id.is_empty() || object_id.starts_with("example") || object_id.starts_with("your_")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,
    #[serde(default)]
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    ha_url: String,
    ha_token: String,
    ha_timeout_secs: u64,
    influx_url: String,
    influx_database: String,
    influx_username: String,
    influx_password: String,
    influx_token: Option<String>,
    influx_timeout_secs: u64,
    base_tick_secs: u64,
    zone_refresh_ticks: u32,
    default_interval_minutes: u32,
    startup_retries: u32,
    prefs_path: String,
    api_port: u16,
    log_format: LogFormat,
    mask_sensitive_logs: bool,
    metrics_interval_secs: u64,
    devices: Vec<DeviceConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            ha_url: toml_config.home_assistant.url.trim_end_matches('/').to_string(),
            ha_token: toml_config.home_assistant.token,
            ha_timeout_secs: toml_config.home_assistant.timeout_secs,
            influx_url: toml_config.influxdb.url.trim_end_matches('/').to_string(),
            influx_database: toml_config.influxdb.database,
            influx_username: toml_config.influxdb.username,
            influx_password: toml_config.influxdb.password,
            influx_token: toml_config.influxdb.token.filter(|t| !t.is_empty()),
            influx_timeout_secs: toml_config.influxdb.timeout_secs,
            base_tick_secs: toml_config.scheduler.base_tick_secs.max(1),
            zone_refresh_ticks: toml_config.scheduler.zone_refresh_ticks.max(1),
            default_interval_minutes: toml_config.scheduler.default_interval_minutes.max(1),
            startup_retries: toml_config.scheduler.startup_retries.max(1),
            prefs_path: toml_config.preferences.path,
            api_port: toml_config.api.port,
            log_format: toml_config.logging.format,
            mask_sensitive_logs: toml_config.logging.mask_sensitive,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            devices: toml_config.devices,
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, &path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, source))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Apply environment overrides (tokens, log masking)
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_token = ["SUPERVISOR_TOKEN", "HA_TOKEN"]
            .into_iter()
            .filter_map(|key| lookup(key))
            .find(|t| !t.trim().is_empty());
        if let Some(token) = env_token {
            self.ha_token = token;
        }

        if let Some(mask) = lookup("MASK_SENSITIVE_LOGS") {
            self.mask_sensitive_logs = matches!(mask.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        self
    }

    pub fn ha_url(&self) -> &str {
        &self.ha_url
    }

    pub fn ha_token(&self) -> &str {
        &self.ha_token
    }

    pub fn ha_timeout_secs(&self) -> u64 {
        self.ha_timeout_secs
    }

    pub fn influx_url(&self) -> &str {
        &self.influx_url
    }

    pub fn influx_database(&self) -> &str {
        &self.influx_database
    }

    pub fn influx_username(&self) -> &str {
        &self.influx_username
    }

    pub fn influx_password(&self) -> &str {
        &self.influx_password
    }

    pub fn influx_token(&self) -> Option<&str> {
        self.influx_token.as_deref()
    }

    pub fn influx_timeout_secs(&self) -> u64 {
        self.influx_timeout_secs
    }

    pub fn base_tick_secs(&self) -> u64 {
        self.base_tick_secs
    }

    pub fn zone_refresh_ticks(&self) -> u32 {
        self.zone_refresh_ticks
    }

    pub fn default_interval_minutes(&self) -> u32 {
        self.default_interval_minutes
    }

    pub fn startup_retries(&self) -> u32 {
        self.startup_retries
    }

    pub fn prefs_path(&self) -> &str {
        &self.prefs_path
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn log_format(&self) -> &LogFormat {
        &self.log_format
    }

    pub fn mask_sensitive_logs(&self) -> bool {
        self.mask_sensitive_logs
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the state-source token
    #[cfg(test)]
    pub fn with_ha_token(mut self, token: &str) -> Self {
        self.ha_token = token.to_string();
        self
    }
}
