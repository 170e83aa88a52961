//! Assembling a [`Server`] from configuration.
//!
//! [`ServerBootstrap`] turns a [`TrellisConfig`] into a server with one
//! [`Connector`] per configured endpoint. Protocols map to connection
//! factories: a factory registered with
//! [`protocol`](ServerBootstrap::protocol) wins, and any other protocol
//! forwards to the server's [`Handler`] through a [`HandlerFactory`].
//! Negotiators are looked up by name; `alpn` is built in and loads the
//! connector's PEM files unless a TLS factory was supplied.
//!
//! ```rust,no_run
//! use trellis::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, mut connection: Connection) -> Result<(), ConnectionError> {
//!         let (mut reader, mut writer) = tokio::io::split(&mut connection);
//!         tokio::io::copy(&mut reader, &mut writer).await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new()
//!     .with_file("trellis.toml")?
//!     .with_env_prefix("TRELLIS")
//!     .load()?;
//!
//! let server = ServerBootstrap::new(config).handler(Echo).build()?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use trellis_config::{ConfigError, ConnectorSettings, TlsSettings, TrellisConfig, ALPN_NEGOTIATOR};
use trellis_server::tls::ring_provider;
use trellis_server::{
    ConnectionFactory, Connector, Handler, HandlerFactory, Negotiator, ProtocolChain, Server,
    ServerError, TlsError, TlsNegotiator,
};
use trellis_telemetry::TelemetryError;

/// Errors raised while assembling a server.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A connector or chain could not be built.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// TLS material could not be loaded.
    #[error("connector '{connector}': {source}")]
    Tls {
        /// Connector being built.
        connector: String,
        /// Underlying error.
        #[source]
        source: TlsError,
    },

    /// A connector names a negotiator nobody registered.
    #[error("connector '{connector}' uses unknown negotiator '{negotiator}'")]
    UnknownNegotiator {
        /// Connector being built.
        connector: String,
        /// The missing negotiator.
        negotiator: String,
    },

    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

/// Builds the negotiator of a TLS connector from its settings.
pub type TlsNegotiatorFactory =
    Arc<dyn Fn(&TlsSettings) -> Result<Arc<dyn Negotiator>, TlsError> + Send + Sync>;

/// Builds a [`Server`] from a [`TrellisConfig`].
pub struct ServerBootstrap {
    config: TrellisConfig,
    handler: Option<Arc<dyn Handler>>,
    factories: HashMap<String, Arc<dyn ConnectionFactory>>,
    negotiators: HashMap<String, Arc<dyn Negotiator>>,
    tls: Option<TlsNegotiatorFactory>,
}

impl ServerBootstrap {
    /// Starts from `config`.
    #[must_use]
    pub fn new(config: TrellisConfig) -> Self {
        Self {
            config,
            handler: None,
            factories: HashMap::new(),
            negotiators: HashMap::new(),
            tls: None,
        }
    }

    /// The configuration being assembled.
    #[must_use]
    pub fn config(&self) -> &TrellisConfig {
        &self.config
    }

    /// Installs the server's handler.
    #[must_use]
    pub fn handler(self, handler: impl Handler) -> Self {
        self.shared_handler(Arc::new(handler))
    }

    /// Installs a shared handler.
    #[must_use]
    pub fn shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Serves [`ConnectionFactory::protocol`] with `factory` on every
    /// connector that lists it.
    #[must_use]
    pub fn protocol(self, factory: impl ConnectionFactory) -> Self {
        self.shared_protocol(Arc::new(factory))
    }

    /// Registers a shared connection factory.
    #[must_use]
    pub fn shared_protocol(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.insert(factory.protocol().to_string(), factory);
        self
    }

    /// Makes `negotiator` available under [`Negotiator::name`].
    #[must_use]
    pub fn negotiator(self, negotiator: impl Negotiator) -> Self {
        self.shared_negotiator(Arc::new(negotiator))
    }

    /// Registers a shared negotiator.
    #[must_use]
    pub fn shared_negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiators.insert(negotiator.name().to_string(), negotiator);
        self
    }

    /// Replaces how `alpn` connectors build their negotiator.
    #[must_use]
    pub fn tls_negotiator_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&TlsSettings) -> Result<Arc<dyn Negotiator>, TlsError> + Send + Sync + 'static,
    {
        self.tls = Some(Arc::new(factory));
        self
    }

    /// Installs logging and metrics from the telemetry section.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Telemetry`] if a subscriber or recorder is
    /// already installed.
    pub fn init_telemetry(&self) -> Result<(), BootstrapError> {
        trellis_telemetry::init_telemetry(&self.config.telemetry.to_telemetry_config())?;
        Ok(())
    }

    /// Validates the configuration and assembles a stopped server.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, TLS or chain error.
    pub fn build(self) -> Result<Server, BootstrapError> {
        self.config.validate()?;

        let server = Server::new(&self.config.server.name);
        if let Some(handler) = &self.handler {
            server.set_shared_handler(handler.clone());
        }

        for settings in &self.config.connectors {
            let chain = self.chain_for(settings)?;
            let connector = Connector::new(settings.to_connector_config(), chain);
            server.add_connector(Arc::new(connector))?;
            tracing::debug!(
                server = %server.name(),
                connector = %settings.name,
                negotiator = settings.negotiator.as_deref().unwrap_or("none"),
                protocols = ?settings.protocols,
                "connector configured"
            );
        }

        Ok(server)
    }

    fn chain_for(&self, settings: &ConnectorSettings) -> Result<ProtocolChain, BootstrapError> {
        let mut chain = ProtocolChain::builder();

        if let Some(name) = &settings.negotiator {
            chain = chain.shared_negotiator(self.negotiator_for(settings, name)?);
        }

        for protocol in &settings.protocols {
            chain = match self.factories.get(protocol) {
                Some(factory) => chain.shared_factory(factory.clone()),
                None => chain.factory(HandlerFactory::new(protocol)),
            };
        }

        if let Some(default) = &settings.default_protocol {
            chain = chain.default_protocol(default);
        }

        Ok(chain.build()?)
    }

    fn negotiator_for(
        &self,
        settings: &ConnectorSettings,
        name: &str,
    ) -> Result<Arc<dyn Negotiator>, BootstrapError> {
        if let Some(negotiator) = self.negotiators.get(name) {
            return Ok(negotiator.clone());
        }

        if name != ALPN_NEGOTIATOR {
            return Err(BootstrapError::UnknownNegotiator {
                connector: settings.name.clone(),
                negotiator: name.to_string(),
            });
        }

        let tls_error = |source| BootstrapError::Tls {
            connector: settings.name.clone(),
            source,
        };
        let tls = settings
            .tls
            .as_ref()
            .ok_or_else(|| ConfigError::missing_field(format!("{}.tls", settings.name)))?;

        match &self.tls {
            Some(factory) => factory(tls).map_err(tls_error),
            None => {
                let negotiator =
                    TlsNegotiator::from_pem_files(ring_provider(), &tls.cert_path, &tls.key_path)
                        .map_err(tls_error)?;
                Ok(Arc::new(negotiator))
            }
        }
    }
}

impl fmt::Debug for ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.factories.keys().collect();
        protocols.sort();
        let mut negotiators: Vec<_> = self.negotiators.keys().collect();
        negotiators.sort();

        f.debug_struct("ServerBootstrap")
            .field("server", &self.config.server.name)
            .field("connectors", &self.config.connectors.len())
            .field("has_handler", &self.handler.is_some())
            .field("protocols", &protocols)
            .field("negotiators", &negotiators)
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use trellis_server::{Connection, ConnectionError, Negotiated, NegotiationError, ProtocolSelector};

    struct Named(&'static str);

    #[async_trait]
    impl Negotiator for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn negotiate(
            &self,
            _connection: Connection,
            _selector: &ProtocolSelector,
        ) -> Result<Negotiated, NegotiationError> {
            Err(NegotiationError::handshake("not used"))
        }
    }

    struct Custom;

    #[async_trait]
    impl ConnectionFactory for Custom {
        fn protocol(&self) -> &str {
            "custom"
        }

        async fn serve(&self, _connection: Connection) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn settings(name: &str, protocols: &[&str]) -> ConnectorSettings {
        let mut settings = ConnectorSettings::new(name);
        settings.host = "127.0.0.1".into();
        settings.port = 0;
        settings.protocols = protocols.iter().map(|p| (*p).to_string()).collect();
        settings
    }

    #[test]
    fn test_builds_one_connector_per_entry() {
        let config = TrellisConfig::builder()
            .connector(settings("a", &["echo"]))
            .connector(settings("b", &["custom", "echo"]))
            .build();

        let server = ServerBootstrap::new(config).protocol(Custom).build().unwrap();
        let names: Vec<_> = server
            .connectors()
            .iter()
            .map(|c| c.config().name().to_string())
            .collect();
        assert_eq!(names, ["a", "b"]);

        let b = server.connector("b").unwrap();
        assert_eq!(b.chain().protocols(), ["custom", "echo"]);
        assert!(b.chain().negotiator_name().is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TrellisConfig::builder().connector(settings("a", &[])).build();
        let result = ServerBootstrap::new(config).build();
        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }

    #[test]
    fn test_unknown_negotiator() {
        let mut entry = settings("a", &["echo"]);
        entry.negotiator = Some("carrier-pigeon".into());
        let config = TrellisConfig::builder().connector(entry).build();

        let result = ServerBootstrap::new(config).build();
        assert!(matches!(
            result,
            Err(BootstrapError::UnknownNegotiator { ref negotiator, .. }) if negotiator == "carrier-pigeon"
        ));
    }

    #[test]
    fn test_registered_negotiator() {
        let mut entry = settings("a", &["h2", "http/1.1"]);
        entry.negotiator = Some("named".into());
        entry.default_protocol = Some("http/1.1".into());
        let config = TrellisConfig::builder().connector(entry).build();

        let server = ServerBootstrap::new(config)
            .negotiator(Named("named"))
            .build()
            .unwrap();
        let chain = server.connector("a").unwrap().chain().clone();
        assert_eq!(chain.negotiator_name(), Some("named"));
        assert_eq!(chain.selector().default_protocol(), Some("http/1.1"));
    }

    #[test]
    fn test_alpn_with_missing_pem_files() {
        let mut entry = settings("secure", &["h2"]);
        entry.negotiator = Some("alpn".into());
        entry.tls = Some(TlsSettings {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        });
        let config = TrellisConfig::builder().connector(entry).build();

        let result = ServerBootstrap::new(config).build();
        assert!(matches!(result, Err(BootstrapError::Tls { ref connector, .. }) if connector == "secure"));
    }

    #[test]
    fn test_custom_tls_factory() {
        let mut entry = settings("secure", &["h2"]);
        entry.negotiator = Some("alpn".into());
        entry.tls = Some(TlsSettings {
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        });
        let config = TrellisConfig::builder().connector(entry).build();

        let server = ServerBootstrap::new(config)
            .tls_negotiator_factory(|tls| {
                assert_eq!(tls.cert_path, std::path::PathBuf::from("cert.pem"));
                Ok(Arc::new(Named("alpn")) as Arc<dyn Negotiator>)
            })
            .build()
            .unwrap();
        assert_eq!(
            server.connector("secure").unwrap().chain().negotiator_name(),
            Some("alpn")
        );
    }

    #[test]
    fn test_server_name_and_handler() {
        struct Nothing;

        #[async_trait]
        impl Handler for Nothing {
            async fn handle(&self, _connection: Connection) -> Result<(), ConnectionError> {
                Ok(())
            }
        }

        let mut config = TrellisConfig::default();
        config.server.name = "edge".into();

        let server = ServerBootstrap::new(config).handler(Nothing).build().unwrap();
        assert_eq!(server.name(), "edge");
        assert!(server.handler().is_some());
    }
}
