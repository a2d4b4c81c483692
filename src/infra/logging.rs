//! Tracing setup and log redaction helpers

use crate::infra::config::LogFormat;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging; level via RUST_LOG (default: info)
pub fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Show only the first 4 characters of a credential
pub fn mask_token(token: &str) -> String {
    const VISIBLE: usize = 4;
    if token.chars().count() <= VISIBLE {
        return "***".to_string();
    }
    let head: String = token.chars().take(VISIBLE).collect();
    format!("{head}...")
}

/// Render coordinates for a log line
///
/// Five decimals (~1 m) normally; two decimals (~1 km) followed by `**`
/// when masking is on.
pub fn fmt_coords(latitude: f64, longitude: f64, mask: bool) -> String {
    if mask {
        format!("({latitude:.2}**, {longitude:.2}**)")
    } else {
        format!("({latitude:.5}, {longitude:.5})")
    }
}
