//! Prometheus metrics for the gateway.
//!
//! Every series is recorded through the `metrics` facade. [`install`] puts the
//! Prometheus recorder in place once per process and hands back the handle
//! that renders `GET /metrics`.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{CallerId, Window};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const REQUEST_SIZE_BYTES: &str = "gateway_request_size_bytes";
pub const RESPONSE_SIZE_BYTES: &str = "gateway_response_size_bytes";
pub const RATE_LIMIT_EXCEEDED_TOTAL: &str = "gateway_rate_limit_exceeded_total";
pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const SIZE_BUCKETS: &[f64] = &[1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9];

static RECORDER: OnceLock<std::result::Result<PrometheusHandle, String>> = OnceLock::new();

/// Install the Prometheus recorder, or return the one already installed.
pub fn install() -> Result<PrometheusHandle> {
    RECORDER
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
                    DURATION_BUCKETS,
                )
                .and_then(|b| {
                    b.set_buckets_for_metric(Matcher::Full(REQUEST_SIZE_BYTES.to_string()), SIZE_BUCKETS)
                })
                .and_then(|b| {
                    b.set_buckets_for_metric(Matcher::Full(RESPONSE_SIZE_BYTES.to_string()), SIZE_BUCKETS)
                })
                .and_then(|b| b.install_recorder())
                .map_err(|e| e.to_string())?;

            describe();
            info!("Prometheus metrics recorder installed");
            Ok(handle)
        })
        .clone()
        .map_err(GatewayError::Metrics)
}

/// Drain histogram buckets in the background so they do not grow unbounded
/// between scrapes.
pub fn spawn_upkeep(handle: PrometheusHandle, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            handle.run_upkeep();
        }
    })
}

fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Total number of HTTP requests served");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "HTTP request duration in seconds"
    );
    describe_histogram!(REQUEST_SIZE_BYTES, Unit::Bytes, "HTTP request size in bytes");
    describe_histogram!(RESPONSE_SIZE_BYTES, Unit::Bytes, "HTTP response size in bytes");
    describe_counter!(
        RATE_LIMIT_EXCEEDED_TOTAL,
        "Requests refused by a rate limit or the monthly quota"
    );
    describe_counter!(
        UPSTREAM_ERRORS_TOTAL,
        "Upstream responses that failed behind the enforcement middleware"
    );
}

/// Record one served HTTP request. Sizes are observed only when known and
/// non-zero.
pub fn record_request(
    method: &str,
    path: &str,
    status: u16,
    elapsed: Duration,
    request_bytes: Option<u64>,
    response_bytes: Option<u64>,
) {
    let status = status.to_string();

    counter!(
        REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status_code" => status.clone()
    )
    .increment(1);

    histogram!(
        REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status_code" => status.clone()
    )
    .record(elapsed.as_secs_f64());

    if let Some(bytes) = request_bytes.filter(|b| *b > 0) {
        histogram!(
            REQUEST_SIZE_BYTES,
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .record(bytes as f64);
    }

    if let Some(bytes) = response_bytes.filter(|b| *b > 0) {
        histogram!(
            RESPONSE_SIZE_BYTES,
            "method" => method.to_string(),
            "path" => path.to_string(),
            "status_code" => status
        )
        .record(bytes as f64);
    }
}

/// Count a refusal against the window (or monthly quota) that caused it.
pub fn record_rate_limited(caller: &CallerId, window: Window) {
    counter!(
        RATE_LIMIT_EXCEEDED_TOTAL,
        "api_key" => caller.masked(),
        "window" => window.name()
    )
    .increment(1);
}

/// Count a failed upstream response seen by the enforcement middleware.
pub fn record_upstream_error(caller: &CallerId, error_type: &'static str) {
    counter!(
        UPSTREAM_ERRORS_TOTAL,
        "api_key" => caller.masked(),
        "error_type" => error_type
    )
    .increment(1);
}
