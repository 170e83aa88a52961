//! Connector configuration types.
//!
//! Configuration uses the builder pattern:
//!
//! ```rust
//! use trellis_server::ConnectorConfig;
//! use std::time::Duration;
//!
//! let config = ConnectorConfig::builder("http")
//!     .host("127.0.0.1")
//!     .port(0)
//!     .grace_period(Duration::from_secs(5))
//!     .build();
//!
//! assert_eq!(config.bind_addr(), "127.0.0.1:0");
//! ```

use std::time::Duration;

/// Default bind host (all interfaces).
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default grace period for in-flight connections, in seconds.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

/// Default negotiation timeout, in seconds.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 10;

/// Listener settings of one connector.
///
/// Use [`ConnectorConfig::builder()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    name: String,
    host: String,
    port: u16,
    backlog: u32,
    grace_period: Duration,
    negotiation_timeout: Duration,
    max_connections: Option<usize>,
}

impl ConnectorConfig {
    /// Creates a builder for a connector called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ConnectorConfigBuilder {
        ConnectorConfigBuilder::new(name)
    }

    /// Connector name, unique within a server.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port. `0` asks the OS for an ephemeral port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 hosts bracketed.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Listen backlog.
    #[must_use]
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// How long in-flight connections may run on after the connector stops.
    /// Zero closes them immediately.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Upper bound for protocol negotiation of one connection.
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }

    /// Maximum concurrent connections (`None` = unlimited).
    #[must_use]
    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::builder("default").build()
    }
}

/// Builder for [`ConnectorConfig`].
#[derive(Debug, Clone)]
pub struct ConnectorConfigBuilder {
    config: ConnectorConfig,
}

impl ConnectorConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ConnectorConfig {
                name: name.into(),
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                backlog: DEFAULT_BACKLOG,
                grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
                negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
                max_connections: None,
            },
        }
    }

    /// Sets the bind host (IP address or resolvable name).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Sets the grace period.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.grace_period = grace_period;
        self
    }

    /// Sets the negotiation timeout.
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Limits concurrent connections. The accept loop waits for a free slot.
    /// A limit of zero would never accept and is raised to one.
    #[must_use]
    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.config.max_connections = max.map(|max| max.max(1));
        self
    }

    /// Builds the [`ConnectorConfig`].
    #[must_use]
    pub fn build(self) -> ConnectorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectorConfig::default();

        assert_eq!(config.host(), DEFAULT_HOST);
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.backlog(), DEFAULT_BACKLOG);
        assert_eq!(
            config.grace_period(),
            Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)
        );
        assert_eq!(
            config.negotiation_timeout(),
            Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS)
        );
        assert!(config.max_connections().is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let config = ConnectorConfig::builder("tls")
            .host("127.0.0.1")
            .port(8443)
            .backlog(64)
            .grace_period(Duration::ZERO)
            .negotiation_timeout(Duration::from_millis(500))
            .max_connections(Some(100))
            .build();

        assert_eq!(config.name(), "tls");
        assert_eq!(config.bind_addr(), "127.0.0.1:8443");
        assert_eq!(config.backlog(), 64);
        assert_eq!(config.grace_period(), Duration::ZERO);
        assert_eq!(config.negotiation_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_connections(), Some(100));
    }

    #[test]
    fn test_zero_max_connections_is_raised() {
        let config = ConnectorConfig::builder("tight").max_connections(Some(0)).build();
        assert_eq!(config.max_connections(), Some(1));

        let config = ConnectorConfig::builder("open").max_connections(None).build();
        assert!(config.max_connections().is_none());
    }

    #[test]
    fn test_ipv6_bind_addr() {
        let config = ConnectorConfig::builder("v6").host("::1").port(0).build();
        assert_eq!(config.bind_addr(), "[::1]:0");
    }
}
