//! Typed configuration for Trellis servers.
//!
//! - TOML and JSON configuration files
//! - `.env` files and environment variable overrides
//! - Strict parsing (unknown fields are errors)
//! - Validation of connector and protocol settings
//!
//! [`TrellisConfig`] holds a [`ServerSettings`] section, a list of
//! [`ConnectorSettings`] and a [`TelemetrySettings`] section.
//!
//! # Example
//!
//! ```no_run
//! use trellis_config::ConfigLoader;
//!
//! # fn main() -> Result<(), trellis_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_file("trellis.toml")?
//!     .with_dotenv()?
//!     .with_env_prefix("TRELLIS")
//!     .load()?;
//!
//! for connector in &config.connectors {
//!     println!("{} listens on {}:{}", connector.name, connector.host, connector.port);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # File format
//!
//! ```toml
//! [server]
//! name = "edge"
//!
//! [[connectors]]
//! name = "plain"
//! host = "0.0.0.0"
//! port = 8080
//! protocols = ["http/1.1"]
//!
//! [[connectors]]
//! name = "secure"
//! port = 8443
//! grace_period_ms = 5000
//! negotiator = "alpn"
//! protocols = ["h2", "http/1.1"]
//! default_protocol = "http/1.1"
//!
//! [connectors.tls]
//! cert_path = "/etc/trellis/cert.pem"
//! key_path = "/etc/trellis/key.pem"
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//! ```
//!
//! # Environment overrides
//!
//! Keys take the form `PREFIX__SECTION__KEY`, with connectors addressed by
//! index:
//!
//! - `TRELLIS__SERVER__NAME=edge`
//! - `TRELLIS__CONNECTORS__0__PORT=9000`
//! - `TRELLIS__TELEMETRY__LOGGING__LEVEL=debug`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use trellis_telemetry::LogFormat;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrellisConfig::default();
        assert_eq!(config.server.name, "trellis");
        assert!(config.connectors.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = TrellisConfig::builder()
            .connector(ConnectorSettings::new("plain"))
            .build();

        assert_eq!(config.connectors[0].name, "plain");
        assert_eq!(config.connectors[0].host, "0.0.0.0");
    }
}
