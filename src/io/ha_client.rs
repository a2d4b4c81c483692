//! Home Assistant REST client for device trackers and zones

use crate::domain::types::{is_valid_entity_id, EntityState, Zone, TRACKER_PREFIX};
use crate::infra::config::Config;
use crate::io::collaborators::StateSource;
use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct HaClient {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl HaClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_base_url(config.ha_url(), config.ha_token(), config.ha_timeout_secs())
    }

    pub fn with_base_url(base_url: &str, token: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Home Assistant HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http_client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.http_client
            .get(self.url(endpoint))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
    }

    /// Check that the API answers and accepts the token
    pub async fn ping(&self) -> anyhow::Result<()> {
        let response = self.get("/").send().await.context("Home Assistant unreachable")?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("Home Assistant rejected the token ({})", response.status())
            }
            s => bail!("Home Assistant returned {s}"),
        }
    }

    /// State of one entity; Ok(None) when the entity does not exist
    pub async fn get_state(&self, entity_id: &str) -> anyhow::Result<Option<EntityState>> {
        if !is_valid_entity_id(entity_id) {
            bail!("invalid entity id {entity_id:?}");
        }
        let response = self.get(&state_endpoint(entity_id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json::<EntityState>().await?))
    }

    /// All entity states; malformed entries are skipped
    pub async fn get_states(&self) -> anyhow::Result<Vec<EntityState>> {
        let body: Value = self.get("/states").send().await?.error_for_status()?.json().await?;
        let Value::Array(items) = body else {
            bail!("unexpected /api/states response shape");
        };
        Ok(items.into_iter().filter_map(|item| serde_json::from_value(item).ok()).collect())
    }
}

/// `/states/{id}` with the id escaped as a single path segment
fn state_endpoint(entity_id: &str) -> String {
    format!("/states/{}", urlencoding::encode(entity_id))
}

/// Zones among a list of entity states
pub fn zones_from_states(states: &[EntityState]) -> Vec<Zone> {
    states.iter().filter_map(Zone::from_entity).collect()
}

#[async_trait]
impl StateSource for HaClient {
    async fn fetch_device_state(&self, entity_id: &str) -> Option<EntityState> {
        match self.get_state(entity_id).await {
            Ok(Some(state)) => Some(state),
            Ok(None) => {
                warn!(entity_id = %entity_id, "ha_entity_not_found");
                None
            }
            Err(e) => {
                error!(entity_id = %entity_id, error = %e, "ha_state_request_failed");
                None
            }
        }
    }

    async fn fetch_all_trackers(&self) -> Vec<EntityState> {
        match self.get_states().await {
            Ok(states) => {
                let trackers: Vec<EntityState> = states
                    .into_iter()
                    .filter(|s| s.entity_id.starts_with(TRACKER_PREFIX))
                    .collect();
                debug!(trackers = %trackers.len(), "ha_trackers_fetched");
                trackers
            }
            Err(e) => {
                warn!(error = %e, "ha_trackers_request_failed");
                Vec::new()
            }
        }
    }

    async fn fetch_zones(&self) -> anyhow::Result<Vec<Zone>> {
        let states = self.get_states().await.context("zone refresh failed")?;
        let zones = zones_from_states(&states);
        info!(zones = %zones.len(), "ha_zones_fetched");
        Ok(zones)
    }
}
