//! HTTP control API
//!
//! JSON endpoints for listing and toggling tracked devices, forcing a
//! location refresh, and reading stored history and stats. Also serves
//! `/health` and Prometheus `/metrics`. Uses hyper for the HTTP server.
//!
//! Handlers only touch the preference store through its own methods, so no
//! lock is held while a collaborator call is in flight.

use crate::domain::types::{is_valid_entity_id, TRACKER_PREFIX};
use crate::infra::metrics::Metrics;
use crate::io::collaborators::{LocationHistory, SampleSink, StateSource};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::history::{compute_stats, Period, STATS_QUERY_LIMIT};
use crate::services::prefs::PreferenceStore;
use crate::services::scheduler::{poll_device, PollError};
use crate::services::zone_detector::SharedZones;
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default `/api/locations` window
const DEFAULT_LOCATIONS_WINDOW_DAYS: i64 = 30;
const DEFAULT_LOCATIONS_LIMIT: usize = 1000;

/// Everything the handlers need, shared across connections
pub struct ApiContext {
    pub prefs: Arc<PreferenceStore>,
    pub zones: SharedZones,
    pub source: Arc<dyn StateSource>,
    pub sink: Arc<dyn SampleSink>,
    pub history: Arc<dyn LocationHistory>,
    pub metrics: Arc<Metrics>,
}

/// Handler result before it becomes an HTTP response
#[derive(Debug)]
pub enum Reply {
    Json(StatusCode, Value),
    Text(StatusCode, &'static str, String),
    Preflight,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Reply::Json(StatusCode::OK, body)
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Reply::Json(status, json!({ "error": message.into() }))
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let builder = Response::builder().header("Access-Control-Allow-Origin", "*");
        match self {
            Reply::Json(status, body) => builder
                .status(status)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body.to_string())))
                .expect("static response should not fail"),
            Reply::Text(status, content_type, body) => builder
                .status(status)
                .header("Content-Type", content_type)
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"),
            Reply::Preflight => builder
                .status(StatusCode::OK)
                .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .header("Access-Control-Allow-Headers", "Content-Type")
                .body(Full::new(Bytes::new()))
                .expect("static response should not fail"),
        }
    }
}

/// Decoded query string; later duplicates win
fn parse_query(raw: Option<&str>) -> FxHashMap<String, String> {
    let mut params = FxHashMap::default();
    for pair in raw.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if let (Ok(key), Ok(value)) = (urlencoding::decode(key), urlencoding::decode(value)) {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
    params
}

/// Parse an ISO-8601 timestamp; offset-less values are taken as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0).map(|t| t.and_utc())
}

/// Optional timestamp parameter; Err carries the 400 reply
fn time_param(params: &FxHashMap<String, String>, key: &str) -> Result<Option<DateTime<Utc>>, Reply> {
    match params.get(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| Reply::error(StatusCode::BAD_REQUEST, format!("Invalid {key} timestamp format"))),
    }
}

fn json_body(body: &[u8]) -> Result<serde_json::Map<String, Value>, Reply> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(Reply::error(StatusCode::BAD_REQUEST, "Invalid JSON body")),
    }
}

fn required_str<'a>(body: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a str, Reply> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Reply::error(StatusCode::BAD_REQUEST, format!("{key} is required")))
}

/// Entity id from a JSON body; must have the `domain.object_id` form
fn entity_id_field<'a>(body: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a str, Reply> {
    let entity_id = required_str(body, key)?;
    if !is_valid_entity_id(entity_id) {
        return Err(Reply::error(
            StatusCode::BAD_REQUEST,
            format!("{key} must have the form domain.object_id"),
        ));
    }
    Ok(entity_id)
}

/// Interval from a JSON body; None when absent, Err when present but not a positive integer
fn interval_field(body: &serde_json::Map<String, Value>) -> Result<Option<u32>, Reply> {
    match body.get("interval_minutes") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|&n| n >= 1)
            .map(Some)
            .ok_or_else(|| {
                Reply::error(StatusCode::BAD_REQUEST, "interval_minutes must be a positive integer")
            }),
    }
}

/// Title-cased display name from an entity id (`device_tracker.my_phone` -> `My Phone`)
fn display_name(entity_id: &str) -> String {
    let object_id = entity_id.strip_prefix(TRACKER_PREFIX).unwrap_or(entity_id);
    object_id
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug, Serialize)]
struct DeviceView {
    entity_id: String,
    name: String,
    state: Value,
    is_tracked: bool,
    interval_minutes: u32,
}

impl ApiContext {
    async fn list_devices(&self) -> Reply {
        let default_interval = self.prefs.default_interval();
        let view = |entity_id: String, name: String, state: Value| DeviceView {
            is_tracked: self.prefs.is_tracked(&entity_id),
            interval_minutes: self.prefs.get_interval(&entity_id, default_interval),
            entity_id,
            name,
            state,
        };

        let mut devices: Vec<DeviceView> = self
            .source
            .fetch_all_trackers()
            .await
            .into_iter()
            .filter(|t| t.entity_id.starts_with(TRACKER_PREFIX))
            .map(|t| {
                let name = t.friendly_name().to_string();
                view(t.entity_id, name, t.state)
            })
            .collect();

        if devices.is_empty() {
            debug!("devices_fallback_to_history");
            devices = self
                .history
                .unique_devices()
                .await
                .into_iter()
                .map(|id| {
                    let name = display_name(&id);
                    view(id, name, Value::from("unknown"))
                })
                .collect();
        }

        devices.sort_by(|a, b| {
            (!a.is_tracked, a.name.to_lowercase()).cmp(&(!b.is_tracked, b.name.to_lowercase()))
        });
        Reply::ok(json!({ "devices": devices }))
    }

    fn toggle_device(&self, body: &[u8]) -> Result<Reply, Reply> {
        let body = json_body(body)?;
        let entity_id = entity_id_field(&body, "entity_id")?;
        let interval = interval_field(&body)?.unwrap_or(self.prefs.default_interval());

        let is_tracked = self.prefs.toggle_device(entity_id, interval);
        info!(entity_id = %entity_id, tracked = %is_tracked, "api_device_toggled");
        Ok(Reply::ok(json!({
            "entity_id": entity_id,
            "is_tracked": is_tracked,
            "message": format!("Device tracking {}", if is_tracked { "enabled" } else { "disabled" }),
        })))
    }

    fn set_interval(&self, body: &[u8]) -> Result<Reply, Reply> {
        let body = json_body(body)?;
        let entity_id = entity_id_field(&body, "entity_id")?;
        let interval = interval_field(&body)?.ok_or_else(|| {
            Reply::error(StatusCode::BAD_REQUEST, "interval_minutes is required")
        })?;

        self.prefs.set_interval(entity_id, interval);
        Ok(Reply::ok(json!({
            "entity_id": entity_id,
            "interval_minutes": interval,
            "is_tracked": self.prefs.is_tracked(entity_id),
        })))
    }

    async fn force_update(&self, body: &[u8]) -> Result<Reply, Reply> {
        let body = json_body(body)?;
        let device_id = entity_id_field(&body, "device_id")?;

        let result =
            poll_device(self.source.as_ref(), self.sink.as_ref(), &self.zones, device_id, Utc::now()).await;
        match result {
            Ok(sample) => {
                self.metrics.record_sample_written(sample.in_zone);
                info!(device_id = %device_id, zone = %sample.zone_name, "api_location_updated");
                Ok(Reply::ok(json!({ "success": true, "location": sample })))
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "api_location_update_failed");
                let (status, message) = match e {
                    PollError::StateUnavailable(_) => (StatusCode::NOT_FOUND, "Device not found"),
                    PollError::NoLocation(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "No location data available")
                    }
                    PollError::SinkRejected(_) => (StatusCode::BAD_GATEWAY, "Failed to store location"),
                };
                Err(Reply::error(status, message))
            }
        }
    }

    fn reload_preferences(&self) -> Reply {
        self.prefs.reload();
        Reply::ok(json!({ "tracked": self.prefs.tracked_devices().len() }))
    }

    async fn list_zones(&self) -> Reply {
        let zones = match self.source.fetch_zones().await {
            Ok(zones) => zones,
            Err(e) => {
                warn!(error = %e, "api_zones_fetch_failed");
                Vec::new()
            }
        };
        Reply::ok(json!({ "zones": zones }))
    }

    async fn locations(&self, query: Option<&str>) -> Result<Reply, Reply> {
        let params = parse_query(query);
        let end = time_param(&params, "end")?.unwrap_or_else(Utc::now);
        let start = time_param(&params, "start")?
            .unwrap_or(end - Duration::days(DEFAULT_LOCATIONS_WINDOW_DAYS));
        let limit = match params.get("limit") {
            None => DEFAULT_LOCATIONS_LIMIT,
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| Reply::error(StatusCode::BAD_REQUEST, "Invalid limit"))?,
        };
        let device_id = params.get("device_id").map(String::as_str).filter(|s| !s.is_empty());

        let locations = self.history.query_locations(device_id, start, end, limit).await;
        Ok(Reply::ok(json!({ "locations": locations })))
    }

    async fn stats(&self, query: Option<&str>) -> Result<Reply, Reply> {
        let params = parse_query(query);
        let device_id = params
            .get("device_id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Reply::error(StatusCode::BAD_REQUEST, "device_id parameter required"))?;
        let period = Period::resolve(time_param(&params, "start")?, time_param(&params, "end")?, Utc::now());

        let records = self
            .history
            .query_locations(Some(device_id), period.start, period.end, STATS_QUERY_LIMIT)
            .await;
        let stats = compute_stats(device_id, period, &records);
        Ok(Reply::ok(json!(stats)))
    }

    /// Route one request
    pub async fn dispatch(&self, method: &Method, path: &str, query: Option<&str>, body: &[u8]) -> Reply {
        let result = match (method, path) {
            (&Method::OPTIONS, _) => Ok(Reply::Preflight),
            (&Method::GET, "/health") => Ok(Reply::ok(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "git_hash": env!("GIT_HASH"),
            }))),
            (&Method::GET, "/metrics") => Ok(Reply::Text(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&self.metrics.report()),
            )),
            (&Method::GET, "/api/devices") => Ok(self.list_devices().await),
            (&Method::POST, "/api/devices/toggle") => self.toggle_device(body),
            (&Method::POST, "/api/devices/interval") => self.set_interval(body),
            (&Method::POST, "/api/devices/update") => self.force_update(body).await,
            (&Method::POST, "/api/preferences/reload") => Ok(self.reload_preferences()),
            (&Method::GET, "/api/zones") => Ok(self.list_zones().await),
            (&Method::GET, "/api/locations") => self.locations(query).await,
            (&Method::GET, "/api/stats") => self.stats(query).await,
            _ => Err(Reply::error(StatusCode::NOT_FOUND, "Not Found")),
        };
        result.unwrap_or_else(|reply| reply)
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "api_body_read_failed");
            return Ok(Reply::error(StatusCode::BAD_REQUEST, "Unreadable body").into_response());
        }
    };

    let reply = ctx.dispatch(&parts.method, parts.uri.path(), parts.uri.query(), &body).await;
    Ok(reply.into_response())
}

/// Start the control API HTTP server
pub async fn start_api_server(
    port: u16,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "control_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "control_api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "control_api_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("control_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
