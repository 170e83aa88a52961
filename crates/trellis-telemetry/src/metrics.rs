//! Prometheus metrics for Trellis connectors.
//!
//! The recording helpers are thin wrappers over the `metrics` facade; when no
//! recorder is installed they are no-ops, so connectors can call them
//! unconditionally.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `trellis_connections_accepted_total` | Counter | `connector` | Accepted connections |
//! | `trellis_connections_negotiated_total` | Counter | `connector`, `protocol` | Dispatched connections |
//! | `trellis_connections_rejected_total` | Counter | `connector`, `reason` | Rejected connections |
//! | `trellis_connections_active` | Gauge | `connector` | Open connections |
//! | `trellis_negotiation_duration_seconds` | Histogram | `connector` | Time to negotiate |

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Accepted connections counter.
pub const CONNECTIONS_ACCEPTED: &str = "trellis_connections_accepted_total";
/// Negotiated connections counter.
pub const CONNECTIONS_NEGOTIATED: &str = "trellis_connections_negotiated_total";
/// Rejected connections counter.
pub const CONNECTIONS_REJECTED: &str = "trellis_connections_rejected_total";
/// Open connections gauge.
pub const CONNECTIONS_ACTIVE: &str = "trellis_connections_active";
/// Negotiation latency histogram.
pub const NEGOTIATION_DURATION: &str = "trellis_negotiation_duration_seconds";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address of the scrape endpoint (e.g. `"0.0.0.0:9090"`). Empty installs
    /// the recorder without an endpoint, to be read through [`render_metrics`].
    pub addr: String,

    /// Histogram buckets for the negotiation duration, in seconds.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "0.0.0.0:9090".to_string(),
            duration_buckets: vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        }
    }
}

/// Installs the Prometheus recorder.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidAddress`] for an unparseable endpoint
/// address and [`TelemetryError::MetricsInit`] if a recorder is already
/// installed or the endpoint cannot be set up.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let mut builder = PrometheusBuilder::new();
    if !config.duration_buckets.is_empty() {
        builder = builder
            .set_buckets_for_metric(
                Matcher::Full(NEGOTIATION_DURATION.to_string()),
                &config.duration_buckets,
            )
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    if config.addr.is_empty() {
        let handle = builder
            .install_recorder()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        let _ = METRICS_HANDLE.set(handle);
    } else {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;
        builder
            .with_http_listener(addr)
            .install()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    describe_metrics();
    Ok(())
}

/// Renders metrics in Prometheus text format.
///
/// Returns `None` unless [`init_metrics`] installed a recorder without a
/// scrape endpoint.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!(CONNECTIONS_ACCEPTED, "Connections accepted by a connector");
    describe_counter!(
        CONNECTIONS_NEGOTIATED,
        "Connections dispatched to a protocol factory"
    );
    describe_counter!(
        CONNECTIONS_REJECTED,
        "Connections closed before dispatch, by reason"
    );
    describe_gauge!(CONNECTIONS_ACTIVE, "Connections currently open on a connector");
    describe_histogram!(
        NEGOTIATION_DURATION,
        "Time from accept until a protocol was selected, in seconds"
    );
}

/// Records an accepted connection.
pub fn record_connection_accepted(connector: &str) {
    counter!(CONNECTIONS_ACCEPTED, "connector" => connector.to_string()).increment(1);
}

/// Records a successful negotiation and how long it took.
pub fn record_connection_negotiated(connector: &str, protocol: &str, elapsed: Duration) {
    counter!(
        CONNECTIONS_NEGOTIATED,
        "connector" => connector.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
    histogram!(NEGOTIATION_DURATION, "connector" => connector.to_string())
        .record(elapsed.as_secs_f64());
}

/// Records a connection closed before dispatch.
pub fn record_connection_rejected(connector: &str, reason: &'static str) {
    counter!(
        CONNECTIONS_REJECTED,
        "connector" => connector.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Keeps the active-connections gauge of one connector up to date.
///
/// Increments on creation and decrements on drop, so the gauge stays right
/// when a connection task is aborted.
#[derive(Debug)]
pub struct ActiveConnectionGuard {
    connector: String,
}

impl ActiveConnectionGuard {
    /// Increments the gauge for `connector`.
    #[must_use]
    pub fn new(connector: &str) -> Self {
        gauge!(CONNECTIONS_ACTIVE, "connector" => connector.to_string()).increment(1.0);
        Self {
            connector: connector.to_string(),
        }
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        gauge!(CONNECTIONS_ACTIVE, "connector" => self.connector.clone()).decrement(1.0);
    }
}
