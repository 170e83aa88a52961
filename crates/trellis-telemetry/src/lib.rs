//! Logging and metrics for Trellis.
//!
//! - **Logging**: structured JSON or pretty output through `tracing-subscriber`
//! - **Metrics**: Prometheus-format connection metrics via the `metrics` crate
//!
//! Connectors record their metrics through the helpers in [`metrics`]
//! whether or not a recorder is installed; installing one is the
//! application's decision.
//!
//! # Standard Metrics
//!
//! ```text
//! # TYPE trellis_connections_negotiated_total counter
//! trellis_connections_negotiated_total{connector="https",protocol="h2"} 118
//! trellis_connections_negotiated_total{connector="https",protocol="http/1.1"} 7
//! # TYPE trellis_connections_rejected_total counter
//! trellis_connections_rejected_total{connector="https",reason="no_mutual_protocol"} 2
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_telemetry::{init_telemetry, LogConfig, TelemetryConfig};
//!
//! let config = TelemetryConfig::builder()
//!     .logging(LogConfig::production())
//!     .metrics_addr("0.0.0.0:9090")
//!     .build();
//!
//! init_telemetry(&config)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{TelemetryConfig, TelemetryConfigBuilder};
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{init_metrics, render_metrics, ActiveConnectionGuard, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs logging, then metrics.
///
/// # Errors
///
/// Returns the first [`TelemetryError`] raised by either subsystem.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_everything_disabled() {
        let config = TelemetryConfig::builder()
            .logging(LogConfig {
                enabled: false,
                ..LogConfig::default()
            })
            .without_metrics()
            .build();

        assert!(init_telemetry(&config).is_ok());
    }
}
