//! Prometheus text exposition of poller metrics
//!
//! Served at `/metrics` by the control API.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge)
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Format a metrics summary in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "findmy_uptime_seconds",
        "Seconds since process start",
        MetricType::Gauge,
        summary.uptime_secs,
    );
    write_metric(
        &mut output,
        "findmy_ticks_total",
        "Scheduler base ticks",
        MetricType::Counter,
        summary.ticks_total,
    );

    write_poll_metrics(&mut output, summary);
    write_zone_metrics(&mut output, summary);

    output
}

fn write_poll_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "findmy_polls_total",
        "Device polls attempted",
        MetricType::Counter,
        summary.polls_total,
    );
    write_metric(
        output,
        "findmy_poll_failures_total",
        "Polls with no state or no usable location",
        MetricType::Counter,
        summary.poll_failures_total,
    );
    write_metric(
        output,
        "findmy_samples_written_total",
        "Samples accepted by the sink",
        MetricType::Counter,
        summary.samples_written_total,
    );
    write_metric(
        output,
        "findmy_sink_failures_total",
        "Samples rejected by the sink",
        MetricType::Counter,
        summary.sink_failures_total,
    );
    write_metric(
        output,
        "findmy_in_zone_samples_total",
        "Samples recorded inside a zone",
        MetricType::Counter,
        summary.in_zone_total,
    );
    write_metric(
        output,
        "findmy_tracked_devices",
        "Tracked devices on the last tick",
        MetricType::Gauge,
        summary.tracked_devices,
    );

    write_histogram(
        output,
        "findmy_poll_duration_ms",
        "Single-device poll duration in milliseconds",
        &summary.poll_duration_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.poll_duration_sum_ms,
    );
    write_metric(
        output,
        "findmy_poll_duration_p95_ms",
        "95th percentile poll duration",
        MetricType::Gauge,
        summary.poll_duration_p95_ms,
    );
    write_metric(
        output,
        "findmy_poll_duration_max_ms",
        "Max poll duration since last report",
        MetricType::Gauge,
        summary.poll_duration_max_ms,
    );
}

fn write_zone_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(output, "findmy_zones", "Zones in the current snapshot", MetricType::Gauge, summary.zones);
    write_metric(
        output,
        "findmy_zone_refresh_total",
        "Successful zone refreshes",
        MetricType::Counter,
        summary.zone_refresh_total,
    );
    write_metric(
        output,
        "findmy_zone_refresh_failures_total",
        "Failed zone refreshes (previous snapshot kept)",
        MetricType::Counter,
        summary.zone_refresh_failures_total,
    );
}
