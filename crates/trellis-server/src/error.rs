//! Error types for connectors, negotiation and connection handling.
//!
//! Errors are split by blast radius:
//!
//! - [`BindError`] is fatal to the connector that raised it and fails the
//!   server start.
//! - [`NegotiationError`] and [`ConnectionError`] affect one connection and
//!   are only logged and counted by the connector.
//! - [`ServerError`] is what the server's own operations return.

use std::io;
use std::time::Duration;

use thiserror::Error;
use trellis_core::{BoxError, LifecycleError};

use crate::tls::TlsError;

/// Result type alias for server operations.
pub type ServerResult<T = ()> = Result<T, ServerError>;

/// A listener could not be opened.
#[derive(Error, Debug)]
pub enum BindError {
    /// The configured host did not resolve to any address.
    #[error("cannot resolve '{host}': {reason}")]
    Resolve {
        /// Configured host.
        host: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The socket could not be bound or put into listening mode.
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        /// Address that was being bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl BindError {
    /// Returns the I/O error kind for [`BindError::Listen`] errors.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Listen { source, .. } => Some(source.kind()),
            Self::Resolve { .. } => None,
        }
    }
}

/// Protocol negotiation failed for one connection.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The client offered nothing the server supports and no default is set.
    #[error("no mutual protocol (client offered [{}])", .offered.join(", "))]
    NoMutualProtocol {
        /// Protocols the client offered, in client order.
        offered: Vec<String>,
    },

    /// A protocol was negotiated but no factory is registered for it.
    #[error("negotiated protocol '{protocol}' has no connection factory")]
    UnknownProtocol {
        /// The negotiated protocol name.
        protocol: String,
    },

    /// The handshake did not complete in time.
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// The handshake itself failed (malformed preface, TLS alert, ...).
    #[error("handshake failed: {0}")]
    Handshake(#[source] BoxError),

    /// I/O error while negotiating.
    #[error("I/O error during negotiation: {0}")]
    Io(#[from] io::Error),
}

impl NegotiationError {
    /// Wraps a handshake failure.
    pub fn handshake(source: impl Into<BoxError>) -> Self {
        Self::Handshake(source.into())
    }

    /// Short label used as the `reason` of the rejection metric.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoMutualProtocol { .. } => "no_mutual_protocol",
            Self::UnknownProtocol { .. } => "unknown_protocol",
            Self::Timeout(_) => "timeout",
            Self::Handshake(_) => "handshake",
            Self::Io(_) => "io",
        }
    }
}

/// A dispatched connection ended abnormally.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Transport-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection was force-closed when its connector stopped.
    #[error("connection cancelled by connector shutdown")]
    Cancelled,

    /// The connection reached a handler-backed factory but the server has no handler.
    #[error("no handler installed")]
    NoHandler,

    /// The handler or factory reported a failure.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),
}

impl ConnectionError {
    /// Wraps a handler failure.
    pub fn handler(source: impl Into<BoxError>) -> Self {
        Self::Handler(source.into())
    }
}

/// Errors returned by [`Server`](crate::Server) operations.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A listener could not be opened.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Two connectors claim the same fixed port on overlapping addresses.
    #[error("connectors '{first}' and '{second}' both bind port {port}")]
    PortConflict {
        /// The contested port.
        port: u16,
        /// Name of the first connector.
        first: String,
        /// Name of the second connector.
        second: String,
    },

    /// The connector already belongs to a server.
    #[error("connector '{0}' is already attached to a server")]
    ConnectorOwned(String),

    /// A connector with the same name is already registered.
    #[error("a connector named '{0}' is already registered")]
    DuplicateConnector(String),

    /// Invalid connector or chain configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// TLS setup failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// A lifecycle transition failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ServerError {
    /// Returns the [`BindError`] behind this error, if a listener failed to open.
    ///
    /// Looks through lifecycle wrapping, so a bind failure surfacing from a
    /// server start cascade is found as well.
    #[must_use]
    pub fn bind_error(&self) -> Option<&BindError> {
        match self {
            Self::Bind(e) => Some(e),
            Self::Lifecycle(e) => e.find_cause::<BindError>(),
            _ => None,
        }
    }

    /// Returns `true` for [`ServerError::PortConflict`].
    #[must_use]
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, Self::PortConflict { .. })
    }
}
