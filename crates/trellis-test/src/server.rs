//! A loopback server wired to a [`RecordingHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use trellis_core::Lifecycle;
use trellis_server::{
    Connector, ConnectorConfig, HandlerFactory, Negotiator, ProtocolChain, Server,
};

use crate::error::TestError;
use crate::preface::{PrefaceClient, PrefaceNegotiator};
use crate::recording::RecordingHandler;

/// A started server with one connector on `127.0.0.1` and an ephemeral port.
///
/// ```rust
/// use trellis_test::TestServer;
///
/// # tokio_test::block_on(async {
/// let server = TestServer::builder()
///     .protocols(["h2", "http/1.1"])
///     .preface()
///     .start()
///     .await
///     .unwrap();
///
/// let (stream, protocol) = server.connect_preface(["http/1.1", "h2"]).await.unwrap();
/// assert_eq!(protocol, "h2");
/// drop(stream);
///
/// server.stop().await.unwrap();
/// # });
/// ```
pub struct TestServer {
    server: Server,
    connector: Arc<Connector>,
    handler: Arc<RecordingHandler>,
    addr: SocketAddr,
}

impl TestServer {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Starts a plain server speaking `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Server`] if the server fails to start.
    pub async fn plain(protocol: &str) -> Result<Self, TestError> {
        Self::builder().protocols([protocol]).start().await
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server.
    #[must_use]
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The connector.
    #[must_use]
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// The handler every connection reaches.
    #[must_use]
    pub fn handler(&self) -> &Arc<RecordingHandler> {
        &self.handler
    }

    /// Opens a raw TCP connection.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Io`] if the connection fails.
    pub async fn connect(&self) -> Result<TcpStream, TestError> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Connects and runs the preface handshake offering `protocols`.
    ///
    /// # Errors
    ///
    /// See [`PrefaceClient::connect`].
    pub async fn connect_preface<I, S>(&self, protocols: I) -> Result<(TcpStream, String), TestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PrefaceClient::new(protocols).connect(self.addr).await
    }

    /// Stops the server.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Server`] if a component fails to stop.
    pub async fn stop(&self) -> Result<(), TestError> {
        Ok(self.server.stop().await?)
    }
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("name", &self.server.name())
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TestServer`].
pub struct TestServerBuilder {
    name: String,
    protocols: Vec<String>,
    default_protocol: Option<String>,
    negotiator: Option<Arc<dyn Negotiator>>,
    grace_period: Duration,
    negotiation_timeout: Duration,
    max_connections: Option<usize>,
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self {
            name: "test".to_string(),
            protocols: vec!["echo".to_string()],
            default_protocol: None,
            negotiator: None,
            grace_period: Duration::from_secs(1),
            negotiation_timeout: Duration::from_secs(2),
            max_connections: None,
        }
    }
}

impl TestServerBuilder {
    /// Sets the server name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the served protocols, in server preference order.
    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the fallback protocol.
    #[must_use]
    pub fn default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = Some(protocol.into());
        self
    }

    /// Negotiates with [`PrefaceNegotiator`].
    #[must_use]
    pub fn preface(self) -> Self {
        self.negotiator(Arc::new(PrefaceNegotiator::new()))
    }

    /// Negotiates with `negotiator`.
    #[must_use]
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Sets the connector's grace period.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets the negotiation timeout.
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Limits concurrent connections.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Builds and starts the server.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Server`] if the chain is invalid or the server
    /// fails to start.
    pub async fn start(self) -> Result<TestServer, TestError> {
        let mut chain = ProtocolChain::builder();
        if let Some(negotiator) = self.negotiator {
            chain = chain.shared_negotiator(negotiator);
        }
        for protocol in &self.protocols {
            chain = chain.factory(HandlerFactory::new(protocol));
        }
        if let Some(default) = self.default_protocol {
            chain = chain.default_protocol(default);
        }

        let config = ConnectorConfig::builder(format!("{}-connector", self.name))
            .host("127.0.0.1")
            .port(0)
            .grace_period(self.grace_period)
            .negotiation_timeout(self.negotiation_timeout)
            .max_connections(self.max_connections)
            .build();
        let connector = Arc::new(Connector::new(config, chain.build()?));

        let handler = Arc::new(RecordingHandler::new());
        let server = Server::new(self.name);
        server.set_shared_handler(handler.clone());
        server.add_connector(connector.clone())?;
        server.start().await?;

        let addr = connector
            .local_addr()
            .ok_or_else(|| TestError::NotListening(connector.name().to_string()))?;

        Ok(TestServer {
            server,
            connector,
            handler,
            addr,
        })
    }
}
