//! Root configuration type.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use trellis_server::hosts_overlap;
use trellis_telemetry::LogFormat;

use crate::schema::{ConnectorSettings, ServerSettings, TelemetrySettings};
use crate::ConfigError;

/// Complete Trellis configuration.
///
/// # Example
///
/// ```rust
/// use trellis_config::TrellisConfig;
///
/// let config: TrellisConfig = toml::from_str(r#"
///     [server]
///     name = "edge"
///
///     [[connectors]]
///     name = "plain"
///     port = 8080
///     protocols = ["echo"]
/// "#).unwrap();
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.connectors[0].protocols, ["echo"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrellisConfig {
    /// Server-wide settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Listening endpoints.
    #[serde(default)]
    pub connectors: Vec<ConnectorSettings>,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl TrellisConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> TrellisConfigBuilder {
        TrellisConfigBuilder::new()
    }

    /// Human-readable logs at `debug`.
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.level = "debug".to_string();
        config.telemetry.logging.format = LogFormat::Pretty;
        config.telemetry.logging.file_line_info = true;
        config
    }

    /// JSON logs at `info` with metrics enabled.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.format = LogFormat::Json;
        config.telemetry.metrics.enabled = true;
        config
    }

    /// Looks up a connector by name.
    #[must_use]
    pub fn connector(&self, name: &str) -> Option<&ConnectorSettings> {
        self.connectors.iter().find(|c| c.name == name)
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::invalid_value("server.name", "must not be empty"));
        }

        let mut names = HashSet::new();
        for (index, connector) in self.connectors.iter().enumerate() {
            validate_connector(index, connector)?;
            if !names.insert(connector.name.as_str()) {
                return Err(ConfigError::validation_error(format!(
                    "duplicate connector name '{}'",
                    connector.name
                )));
            }
        }

        for (i, a) in self.connectors.iter().enumerate() {
            for b in &self.connectors[i + 1..] {
                if a.port != 0 && a.port == b.port && hosts_overlap(&a.host, &b.host) {
                    return Err(ConfigError::validation_error(format!(
                        "connectors '{}' and '{}' both bind port {}",
                        a.name, b.name, a.port
                    )));
                }
            }
        }

        if self.telemetry.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "telemetry.logging.level",
                "must not be empty",
            ));
        }

        let metrics = &self.telemetry.metrics;
        if metrics.enabled && !metrics.addr.is_empty() && metrics.addr.parse::<SocketAddr>().is_err()
        {
            return Err(ConfigError::invalid_value(
                "telemetry.metrics.addr",
                format!("'{}' is not a socket address", metrics.addr),
            ));
        }

        Ok(())
    }
}

fn validate_connector(index: usize, connector: &ConnectorSettings) -> Result<(), ConfigError> {
    let field = |name: &str| format!("connectors[{index}].{name}");

    if connector.name.trim().is_empty() {
        return Err(ConfigError::invalid_value(field("name"), "must not be empty"));
    }

    if !is_valid_host(&connector.host) {
        return Err(ConfigError::invalid_value(
            field("host"),
            format!("'{}' is neither an IP address nor a host name", connector.host),
        ));
    }

    if connector.negotiation_timeout_ms == 0 {
        return Err(ConfigError::invalid_value(
            field("negotiation_timeout_ms"),
            "must be greater than zero",
        ));
    }

    if connector.max_connections == Some(0) {
        return Err(ConfigError::invalid_value(
            field("max_connections"),
            "must be greater than zero",
        ));
    }

    if connector.protocols.is_empty() {
        return Err(ConfigError::missing_field(field("protocols")));
    }

    let mut seen = HashSet::new();
    for protocol in &connector.protocols {
        if protocol.is_empty() {
            return Err(ConfigError::invalid_value(
                field("protocols"),
                "protocol names must not be empty",
            ));
        }
        if !seen.insert(protocol.as_str()) {
            return Err(ConfigError::invalid_value(
                field("protocols"),
                format!("duplicate protocol '{protocol}'"),
            ));
        }
    }

    if let Some(default) = &connector.default_protocol {
        if !seen.contains(default.as_str()) {
            return Err(ConfigError::invalid_value(
                field("default_protocol"),
                format!("'{default}' is not in the protocol list"),
            ));
        }
    }

    if let Some(negotiator) = &connector.negotiator {
        if negotiator.is_empty() {
            return Err(ConfigError::invalid_value(field("negotiator"), "must not be empty"));
        }
    }

    match (&connector.tls, connector.uses_alpn()) {
        (None, true) => Err(ConfigError::missing_field(field("tls"))),
        (Some(_), false) => Err(ConfigError::invalid_value(
            field("tls"),
            "only the 'alpn' negotiator uses TLS settings",
        )),
        (Some(tls), true) => {
            if tls.cert_path.as_os_str().is_empty() {
                return Err(ConfigError::missing_field(field("tls.cert_path")));
            }
            if tls.key_path.as_os_str().is_empty() {
                return Err(ConfigError::missing_field(field("tls.key_path")));
            }
            Ok(())
        }
        (None, false) => Ok(()),
    }
}

fn parse_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn is_valid_host(host: &str) -> bool {
    if parse_ip(host).is_some() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Builder for [`TrellisConfig`].
#[derive(Debug, Default)]
pub struct TrellisConfigBuilder {
    server: Option<ServerSettings>,
    connectors: Vec<ConnectorSettings>,
    telemetry: Option<TelemetrySettings>,
}

impl TrellisConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server settings.
    #[must_use]
    pub fn server(mut self, server: ServerSettings) -> Self {
        self.server = Some(server);
        self
    }

    /// Appends a connector.
    #[must_use]
    pub fn connector(mut self, connector: ConnectorSettings) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Sets the telemetry settings.
    #[must_use]
    pub fn telemetry(mut self, telemetry: TelemetrySettings) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the configuration. Unset sections use their defaults.
    #[must_use]
    pub fn build(self) -> TrellisConfig {
        TrellisConfig {
            server: self.server.unwrap_or_default(),
            connectors: self.connectors,
            telemetry: self.telemetry.unwrap_or_default(),
        }
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails.
    pub fn build_validated(self) -> Result<TrellisConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
