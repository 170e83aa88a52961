//! The server: root container of connectors and beans.
//!
//! A [`Server`] owns a [`Container`] holding its connectors (managed beans),
//! any application beans, and a [`ShutdownBridge`] through which resources
//! created while serving connections attach themselves. Starting the server
//! starts every managed bean in registration order; stopping it stops them in
//! reverse, then stops everything attached through the [`Scope`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_server::{
//!     Connection, ConnectionError, Connector, ConnectorConfig, Handler, HandlerFactory,
//!     ProtocolChain, Server,
//! };
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Handler for Hello {
//!     async fn handle(&self, _connection: Connection) -> Result<(), ConnectionError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new("example");
//! server.set_handler(Hello);
//! server.add_connector(Arc::new(Connector::new(
//!     ConnectorConfig::builder("http").port(8080).build(),
//!     ProtocolChain::plain(HandlerFactory::new("http/1.1")),
//! )))?;
//!
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use trellis_core::{
    Bean, Container, Lifecycle, LifecycleError, LifecycleListener, LifecycleState, Scope,
    ShutdownBridge,
};

use crate::connector::Connector;
use crate::error::{ServerError, ServerResult};
use crate::factory::{Handler, ServerContext};
use crate::shutdown::ShutdownSignal;

/// Root of a component tree with its connectors.
pub struct Server {
    container: Container,
    bridge: Arc<ShutdownBridge>,
    context: Arc<ServerContext>,
}

impl Server {
    /// Creates a stopped server with no connectors.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let container = Container::new(name);
        let bridge = ShutdownBridge::install(&container);
        let context = Arc::new(ServerContext::new(container.name(), bridge.scope()));
        Self {
            container,
            bridge,
            context,
        }
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.container.name()
    }

    /// Installs the request-handling entry point, replacing any previous one.
    pub fn set_handler(&self, handler: impl Handler) {
        self.set_shared_handler(Arc::new(handler));
    }

    /// Installs a shared handler.
    pub fn set_shared_handler(&self, handler: Arc<dyn Handler>) {
        self.context.set_handler(handler);
    }

    /// The installed handler.
    #[must_use]
    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.context.handler()
    }

    /// Registers a connector as a managed bean.
    ///
    /// A connector added while the server runs is started by the next
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::DuplicateConnector`] if the name is taken and
    /// [`ServerError::ConnectorOwned`] if the connector belongs to another
    /// server.
    pub fn add_connector(&self, connector: Arc<Connector>) -> ServerResult {
        if self.connector(connector.name()).is_some() {
            return Err(ServerError::DuplicateConnector(connector.name().to_string()));
        }
        connector.bind_server(self.context.clone())?;
        self.container.add_bean(Bean::component(connector), true);
        Ok(())
    }

    /// Connectors in registration order.
    #[must_use]
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.container.get_beans::<Connector>()
    }

    /// Looks up a connector by name.
    #[must_use]
    pub fn connector(&self, name: &str) -> Option<Arc<Connector>> {
        self.connectors().into_iter().find(|c| c.name() == name)
    }

    /// Bound addresses of the open connectors, in registration order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.connectors()
            .iter()
            .filter_map(|c| c.local_addr())
            .collect()
    }

    /// Registers an application bean. See [`Container::add_bean`].
    pub fn add_bean(&self, bean: Bean, managed: bool) -> bool {
        self.container.add_bean(bean, managed)
    }

    /// Registers a managed lifecycle component.
    pub fn add_component<T: Lifecycle + 'static>(&self, component: Arc<T>) -> bool {
        self.container.add_component(component)
    }

    /// Registers a listener on the server's lifecycle.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.container.add_lifecycle_listener(listener);
    }

    /// Handle for attaching resources that must stop with the server.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.bridge.scope()
    }

    /// What connections see of this server.
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// The underlying container.
    #[must_use]
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.container.state()
    }

    /// Returns `true` while starting or started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.container.is_running()
    }

    /// Textual tree of beans and their states.
    #[must_use]
    pub fn dump(&self) -> String {
        self.container.dump()
    }

    /// Starts every connector and managed bean.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PortConflict`] before anything starts if two
    /// connectors claim the same port, or the lifecycle error of the first
    /// bean that failed; beans started before it are stopped again.
    pub async fn start(&self) -> ServerResult {
        self.check_port_conflicts()?;
        if let Some(stale) = self.bridge.take_close_error() {
            tracing::debug!(server = %self.name(), error = %stale, "discarding earlier resource stop failure");
        }
        self.container.start().await?;
        tracing::info!(server = %self.name(), addrs = ?self.local_addrs(), "server started");
        Ok(())
    }

    /// Stops everything in reverse registration order, then attached resources.
    /// Stopping a stopped server is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the collected stop failures, including those of resources
    /// attached through the [`Scope`].
    pub async fn stop(&self) -> ServerResult {
        let stopped = self.container.stop().await;
        let resources = self.bridge.take_close_error();
        match (stopped, resources) {
            (Ok(()), None) => {
                tracing::info!(server = %self.name(), "server stopped");
                Ok(())
            }
            (Ok(()), Some(e)) | (Err(e), None) => Err(e.into()),
            (Err(e), Some(resources)) => Err(LifecycleError::CascadeFailed {
                component: self.name().to_string(),
                failures: vec![e, resources],
            }
            .into()),
        }
    }

    /// Starts, waits for `shutdown`, then stops.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start) and [`stop`](Self::stop).
    pub async fn run_with_shutdown(&self, shutdown: ShutdownSignal) -> ServerResult {
        self.start().await?;
        shutdown.recv().await;
        self.stop().await
    }

    /// Starts and runs until SIGTERM or SIGINT.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start) and [`stop`](Self::stop).
    pub async fn run(&self) -> ServerResult {
        self.run_with_shutdown(ShutdownSignal::with_os_signals()).await
    }

    fn check_port_conflicts(&self) -> ServerResult {
        let connectors = self.connectors();
        for (i, first) in connectors.iter().enumerate() {
            for second in &connectors[i + 1..] {
                let port = first.config().port();
                if port != 0
                    && port == second.config().port()
                    && hosts_overlap(first.config().host(), second.config().host())
                {
                    return Err(ServerError::PortConflict {
                        port,
                        first: first.name().to_string(),
                        second: second.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Two hosts overlap unless both are distinct, specific IP addresses.
///
/// Brackets around IPv6 literals are ignored; host names always overlap.
#[must_use]
pub fn hosts_overlap(a: &str, b: &str) -> bool {
    let parse = |host: &str| host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().ok();
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.is_unspecified() || b.is_unspecified() || a == b,
        _ => true,
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("connectors", &self.connectors().len())
            .field("scope", &self.scope())
            .finish()
    }
}
