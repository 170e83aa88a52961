//! Configuration sections.
//!
//! Every section rejects unknown fields and fills missing ones from the
//! defaults below, so a file only needs to name what it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_server::ConnectorConfig;
use trellis_telemetry::{LogConfig, LogFormat, MetricsConfig, TelemetryConfig};

/// Name of the built-in TLS/ALPN negotiator.
pub const ALPN_NEGOTIATOR: &str = "alpn";

// ============================================================================
// Server
// ============================================================================

/// Server-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Server name, used in logs and the container dump.
    #[serde(default = "default_server_name")]
    pub name: String,
}

fn default_server_name() -> String {
    "trellis".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
        }
    }
}

// ============================================================================
// Connectors
// ============================================================================

/// One listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorSettings {
    /// Connector name, unique within the server.
    pub name: String,

    /// Bind host (IP address or host name).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port; `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Grace period for in-flight connections on stop, in milliseconds.
    /// `0` closes them immediately.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Upper bound for negotiating one connection, in milliseconds.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// Concurrent connection limit. Unset means unlimited.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Negotiator name. Unset means plain: the first protocol serves every
    /// connection.
    #[serde(default)]
    pub negotiator: Option<String>,

    /// Protocols in preference order. The server's order wins.
    #[serde(default)]
    pub protocols: Vec<String>,

    /// Protocol used when the client offers nothing we speak.
    #[serde(default)]
    pub default_protocol: Option<String>,

    /// Certificate and key for the `alpn` negotiator.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_host() -> String {
    trellis_server::config::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    trellis_server::config::DEFAULT_PORT
}

fn default_backlog() -> u32 {
    trellis_server::config::DEFAULT_BACKLOG
}

fn default_grace_period_ms() -> u64 {
    trellis_server::config::DEFAULT_GRACE_PERIOD_SECS * 1000
}

fn default_negotiation_timeout_ms() -> u64 {
    trellis_server::config::DEFAULT_NEGOTIATION_TIMEOUT_SECS * 1000
}

impl ConnectorSettings {
    /// Settings for a connector called `name` with every other field at its
    /// default.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            grace_period_ms: default_grace_period_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            max_connections: None,
            negotiator: None,
            protocols: Vec::new(),
            default_protocol: None,
            tls: None,
        }
    }

    /// Whether this connector terminates TLS.
    #[must_use]
    pub fn uses_alpn(&self) -> bool {
        self.negotiator.as_deref() == Some(ALPN_NEGOTIATOR)
    }

    /// Listener settings for the server crate.
    #[must_use]
    pub fn to_connector_config(&self) -> ConnectorConfig {
        ConnectorConfig::builder(&self.name)
            .host(&self.host)
            .port(self.port)
            .backlog(self.backlog)
            .grace_period(Duration::from_millis(self.grace_period_ms))
            .negotiation_timeout(Duration::from_millis(self.negotiation_timeout_ms))
            .max_connections(self.max_connections)
            .build()
    }
}

/// PEM files for a TLS connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// Certificate chain.
    pub cert_path: PathBuf,
    /// Private key.
    pub key_path: PathBuf,
}

// ============================================================================
// Telemetry
// ============================================================================

/// Logging and metrics settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySettings {
    /// Logging.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics.
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl TelemetrySettings {
    /// Telemetry configuration for [`trellis_telemetry::init_telemetry`].
    #[must_use]
    pub fn to_telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig::builder()
            .logging(self.logging.to_log_config())
            .metrics(self.metrics.to_metrics_config())
            .build()
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// Whether logging is installed at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include file and line in events.
    #[serde(default)]
    pub file_line_info: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            file_line_info: false,
        }
    }
}

impl LoggingSettings {
    /// Converts to the telemetry crate's [`LogConfig`].
    #[must_use]
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            enabled: self.enabled,
            level: self.level.clone(),
            format: self.format,
            file_line_info: self.file_line_info,
            ..LogConfig::default()
        }
    }
}

/// Metrics settings. Off by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    /// Whether the Prometheus recorder is installed.
    #[serde(default)]
    pub enabled: bool,

    /// Scrape endpoint address. Empty installs the recorder only.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,

    /// Negotiation duration buckets, in seconds.
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

fn default_metrics_addr() -> String {
    MetricsConfig::default().addr
}

fn default_duration_buckets() -> Vec<f64> {
    MetricsConfig::default().duration_buckets
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

impl MetricsSettings {
    /// Converts to the telemetry crate's [`MetricsConfig`].
    #[must_use]
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            enabled: self.enabled,
            addr: self.addr.clone(),
            duration_buckets: self.duration_buckets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_defaults() {
        let settings: ConnectorSettings = toml::from_str(r#"name = "http""#).unwrap();

        assert_eq!(settings, ConnectorSettings::new("http"));
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.grace_period_ms, 30_000);
        assert!(!settings.uses_alpn());
    }

    #[test]
    fn test_connector_requires_name() {
        let result: Result<ConnectorSettings, _> = toml::from_str("port = 80");
        assert!(result.is_err());
    }

    #[test]
    fn test_to_connector_config() {
        let mut settings = ConnectorSettings::new("tls");
        settings.host = "127.0.0.1".into();
        settings.port = 0;
        settings.grace_period_ms = 0;
        settings.negotiation_timeout_ms = 250;
        settings.max_connections = Some(8);

        let config = settings.to_connector_config();
        assert_eq!(config.name(), "tls");
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.grace_period(), Duration::ZERO);
        assert_eq!(config.negotiation_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_connections(), Some(8));
    }

    #[test]
    fn test_tls_section() {
        let settings: ConnectorSettings = toml::from_str(
            r#"
            name = "secure"
            negotiator = "alpn"
            protocols = ["h2", "http/1.1"]

            [tls]
            cert_path = "/etc/trellis/cert.pem"
            key_path = "/etc/trellis/key.pem"
            "#,
        )
        .unwrap();

        assert!(settings.uses_alpn());
        let tls = settings.tls.unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("/etc/trellis/cert.pem"));
    }

    #[test]
    fn test_telemetry_conversion() {
        let settings = TelemetrySettings {
            logging: LoggingSettings {
                level: "debug".into(),
                format: LogFormat::Pretty,
                ..LoggingSettings::default()
            },
            metrics: MetricsSettings {
                enabled: true,
                addr: String::new(),
                ..MetricsSettings::default()
            },
        };

        let config = settings.to_telemetry_config();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.metrics.enabled);
        assert!(config.metrics.addr.is_empty());
    }

    #[test]
    fn test_metrics_off_by_default() {
        assert!(!MetricsSettings::default().enabled);
        assert!(!TelemetrySettings::default().to_telemetry_config().metrics.enabled);
    }
}
