//! InfluxDB client: line-protocol writes and InfluxQL reads
//!
//! Uses the v1-compatible `/write`, `/query` and `/ping` endpoints, which
//! both 1.x and 2.x servers expose. With a token configured requests carry
//! `Authorization: Token …`, otherwise HTTP Basic with username/password.

use crate::domain::types::{LocationRecord, LocationSample, UNKNOWN_ZONE};
use crate::infra::config::Config;
use crate::io::collaborators::{LocationHistory, SampleSink};
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const MEASUREMENT: &str = "device_location";

pub struct InfluxClient {
    base_url: String,
    database: String,
    auth_header: Option<String>,
    http_client: reqwest::Client,
}

impl InfluxClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let auth_header = match config.influx_token() {
            Some(token) => Some(format!("Token {token}")),
            None if !config.influx_username().is_empty() => {
                let credentials = format!("{}:{}", config.influx_username(), config.influx_password());
                Some(format!("Basic {}", STANDARD.encode(credentials.as_bytes())))
            }
            None => None,
        };

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.influx_timeout_secs()))
            .build()
            .context("Failed to build InfluxDB HTTP client")?;

        Ok(Self {
            base_url: config.influx_url().trim_end_matches('/').to_string(),
            database: config.influx_database().to_string(),
            auth_header,
            http_client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(header) => request.header("Authorization", header),
            None => request,
        }
    }

    fn write_url(&self) -> String {
        format!("{}/write?db={}&precision=s", self.base_url, urlencoding::encode(&self.database))
    }

    fn query_url(&self, query: &str) -> String {
        format!(
            "{}/query?db={}&q={}",
            self.base_url,
            urlencoding::encode(&self.database),
            urlencoding::encode(query)
        )
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let url = format!("{}/ping", self.base_url);
        let response = self.authorize(self.http_client.get(url)).send().await.context("InfluxDB unreachable")?;
        if !response.status().is_success() {
            bail!("InfluxDB ping returned {}", response.status());
        }
        Ok(())
    }

    /// Write one line of line protocol
    pub async fn write_line(&self, line: String) -> anyhow::Result<()> {
        let response = self
            .authorize(self.http_client.post(self.write_url()))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("InfluxDB write returned {status}: {}", body.trim());
        }
        Ok(())
    }

    /// Run an InfluxQL statement and return the rows of every series
    pub async fn query(&self, query: &str) -> anyhow::Result<Vec<Row>> {
        let response = self.authorize(self.http_client.get(self.query_url(query))).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("InfluxDB query returned {status}: {}", body.trim());
        }
        parse_query_response(&body)
    }
}

/// Escape a tag key or value (commas, equals signs, spaces)
fn escape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a string field value (double quotes, backslashes)
fn escape_field_str(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render a sample as one line of line protocol with second precision
pub fn to_line_protocol(sample: &LocationSample) -> String {
    let zone_name = if sample.zone_name.is_empty() { UNKNOWN_ZONE } else { &sample.zone_name };
    let device_name = if sample.device_name.is_empty() { &sample.device_id } else { &sample.device_name };

    let mut line = format!(
        "{MEASUREMENT},device_id={},device_name={},in_zone={},zone_name={} latitude={},longitude={}",
        escape_tag(&sample.device_id),
        escape_tag(device_name),
        sample.in_zone,
        escape_tag(zone_name),
        sample.latitude,
        sample.longitude,
    );

    for (key, value) in [
        ("accuracy", sample.accuracy),
        ("altitude", sample.altitude),
        ("battery_level", sample.battery_level),
    ] {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            let _ = write!(line, ",{key}={v}");
        }
    }
    if let Some(state) = &sample.battery_state {
        let _ = write!(line, ",battery_state=\"{}\"", escape_field_str(state));
    }

    let _ = write!(line, " {}", sample.timestamp.timestamp());
    line
}

/// Quote a string literal for InfluxQL
fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// InfluxQL for a time-ordered location query
pub fn locations_query(
    device_id: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> String {
    let mut query = format!(
        "SELECT * FROM \"{MEASUREMENT}\" WHERE time >= {} AND time <= {}",
        quote_literal(&rfc3339(start)),
        quote_literal(&rfc3339(end)),
    );
    if let Some(id) = device_id {
        let _ = write!(query, " AND \"device_id\" = {}", quote_literal(id));
    }
    let _ = write!(query, " ORDER BY time ASC LIMIT {}", limit.max(1));
    query
}

/// One result row keyed by column name
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn parse_query_response(body: &str) -> anyhow::Result<Vec<Row>> {
    let response: QueryResponse = serde_json::from_str(body).context("malformed InfluxDB query response")?;
    if let Some(e) = response.error {
        bail!("InfluxDB query failed: {e}");
    }

    let mut rows = Vec::new();
    for result in response.results {
        if let Some(e) = result.error {
            bail!("InfluxDB statement failed: {e}");
        }
        for series in result.series {
            for values in series.values {
                rows.push(series.columns.iter().cloned().zip(values).collect());
            }
        }
    }
    Ok(rows)
}

fn row_f64(row: &Row, key: &str) -> Option<f64> {
    row.get(key).and_then(Value::as_f64)
}

fn row_str<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

/// Convert a query row; None when time or coordinates are missing
pub fn record_from_row(row: &Row) -> Option<LocationRecord> {
    let time = DateTime::parse_from_rfc3339(row_str(row, "time")?).ok()?.with_timezone(&Utc);
    let device_id = row_str(row, "device_id").unwrap_or_default().to_string();

    Some(LocationRecord {
        time,
        device_name: row_str(row, "device_name").unwrap_or(&device_id).to_string(),
        device_id,
        in_zone: row_str(row, "in_zone").is_some_and(|v| v.eq_ignore_ascii_case("true")),
        zone_name: row_str(row, "zone_name").unwrap_or(UNKNOWN_ZONE).to_string(),
        latitude: row_f64(row, "latitude")?,
        longitude: row_f64(row, "longitude")?,
        accuracy: row_f64(row, "accuracy"),
        altitude: row_f64(row, "altitude"),
        battery_level: row_f64(row, "battery_level"),
    })
}

#[async_trait]
impl SampleSink for InfluxClient {
    async fn write_sample(&self, sample: &LocationSample) -> bool {
        match self.write_line(to_line_protocol(sample)).await {
            Ok(()) => {
                debug!(device_id = %sample.device_id, zone = %sample.zone_name, "influx_sample_written");
                true
            }
            Err(e) => {
                error!(device_id = %sample.device_id, error = %e, "influx_write_failed");
                false
            }
        }
    }
}

#[async_trait]
impl LocationHistory for InfluxClient {
    async fn query_locations(
        &self,
        device_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<LocationRecord> {
        let query = locations_query(device_id, start, end, limit);
        match self.query(&query).await {
            Ok(rows) => {
                let mut records: Vec<LocationRecord> = rows.iter().filter_map(record_from_row).collect();
                records.sort_by_key(|r| r.time);
                records
            }
            Err(e) => {
                error!(error = %e, "influx_query_failed");
                Vec::new()
            }
        }
    }

    async fn unique_devices(&self) -> Vec<String> {
        let query = format!("SHOW TAG VALUES FROM \"{MEASUREMENT}\" WITH KEY = \"device_id\"");
        match self.query(&query).await {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row_str(row, "value"))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!(error = %e, "influx_devices_query_failed");
                Vec::new()
            }
        }
    }
}
