//! Connection factories and the server-level handler.
//!
//! A [`ConnectionFactory`] is the end of a protocol chain: it is named after
//! the application protocol it speaks and receives every connection that
//! negotiated that protocol. Trellis does not parse application protocols;
//! factories are supplied by the embedding application.
//!
//! [`HandlerFactory`] is the bridge to the server's single [`Handler`]: it
//! labels the connection with its protocol and forwards it to whatever
//! handler is installed on the owning [`Server`](crate::Server).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use trellis_core::Scope;

use crate::connection::Connection;
use crate::error::ConnectionError;

/// Serves connections of one application protocol.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Protocol name, matched against the negotiated protocol (e.g. `"h2"`).
    fn protocol(&self) -> &str;

    /// Serves one connection until it is done.
    async fn serve(&self, connection: Connection) -> Result<(), ConnectionError>;
}

/// Request-handling entry point of a server.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one negotiated connection. [`Connection::protocol`] is set.
    async fn handle(&self, connection: Connection) -> Result<(), ConnectionError>;
}

/// Forwards connections of one protocol to the server's [`Handler`].
#[derive(Debug, Clone)]
pub struct HandlerFactory {
    protocol: String,
}

impl HandlerFactory {
    /// Creates a factory for `protocol`.
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for HandlerFactory {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn serve(&self, connection: Connection) -> Result<(), ConnectionError> {
        let handler = connection
            .server()
            .and_then(|server| server.handler())
            .ok_or(ConnectionError::NoHandler)?;
        handler.handle(connection).await
    }
}

/// What a connection can see of the server that accepted it.
pub struct ServerContext {
    name: String,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    scope: Scope,
}

impl ServerContext {
    pub(crate) fn new(name: impl Into<String>, scope: Scope) -> Self {
        Self {
            name: name.into(),
            handler: RwLock::new(None),
            scope,
        }
    }

    /// Name of the server.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The installed handler, if any.
    #[must_use]
    pub fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.read().clone()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.handler.write() = Some(handler);
    }

    /// Scope for attaching resources that must stop with the server.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("name", &self.name)
            .field("has_handler", &self.handler.read().is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_info;
    use parking_lot::Mutex;
    use trellis_core::{Container, ShutdownBridge};

    #[derive(Default)]
    struct Recorder {
        protocols: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, connection: Connection) -> Result<(), ConnectionError> {
            self.protocols
                .lock()
                .push(connection.protocol().unwrap_or_default().to_string());
            Ok(())
        }
    }

    fn context() -> Arc<ServerContext> {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);
        Arc::new(ServerContext::new("server", bridge.scope()))
    }

    #[tokio::test]
    async fn test_handler_factory_forwards_to_handler() {
        let server = context();
        let recorder = Arc::new(Recorder::default());
        server.set_handler(recorder.clone());

        let (_client, io) = tokio::io::duplex(16);
        let mut connection = Connection::new(io, test_info()).with_server(Some(server));
        connection.set_protocol("h2");

        HandlerFactory::new("h2").serve(connection).await.unwrap();
        assert_eq!(*recorder.protocols.lock(), vec!["h2"]);
    }

    #[tokio::test]
    async fn test_handler_factory_without_handler() {
        let (_client, io) = tokio::io::duplex(16);
        let connection = Connection::new(io, test_info()).with_server(Some(context()));

        let err = HandlerFactory::new("h2").serve(connection).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoHandler));
    }

    #[tokio::test]
    async fn test_handler_factory_without_server() {
        let (_client, io) = tokio::io::duplex(16);
        let connection = Connection::new(io, test_info());

        let err = HandlerFactory::new("h2").serve(connection).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoHandler));
    }
}
