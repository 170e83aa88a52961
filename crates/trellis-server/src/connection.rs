//! Accepted connections and their transports.
//!
//! A [`Connection`] is a boxed byte stream plus what is known about it:
//! peer and local addresses, the connector that accepted it, the protocol
//! negotiated for it and the server it belongs to. Negotiators may replace
//! the transport (a TLS negotiator wraps the TCP stream in a TLS stream)
//! while keeping the rest.
//!
//! `Connection` implements [`AsyncRead`] and [`AsyncWrite`] itself, so
//! factories can use it directly with `tokio::io` utilities.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::factory::ServerContext;

/// A bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Addresses and origin of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Local address the peer connected to.
    pub local_addr: SocketAddr,
    /// Name of the accepting connector.
    pub connector: Arc<str>,
}

/// Where a connection is in its negotiation.
///
/// ```text
/// Accepted ──▶ Negotiating ──▶ Dispatched(protocol)
///                   │
///                   └────────▶ Rejected
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, nothing read yet.
    Accepted,
    /// The protocol chain is negotiating.
    Negotiating,
    /// Handed to the factory for the contained protocol. Final.
    Dispatched(String),
    /// Closed without dispatch. Final.
    Rejected,
}

impl ConnectionState {
    /// Returns `true` if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::Negotiating)
                | (Self::Negotiating, Self::Dispatched(_) | Self::Rejected)
        )
    }

    /// Returns `true` for `Dispatched` and `Rejected`.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Dispatched(_) | Self::Rejected)
    }

    /// Moves to `next`. Illegal transitions are ignored and logged.
    pub fn advance(&mut self, next: Self) {
        if self.can_transition_to(&next) {
            *self = next;
        } else {
            tracing::error!(from = ?self, to = ?next, "illegal connection state transition");
        }
    }
}

/// An accepted connection.
pub struct Connection {
    io: Box<dyn Transport>,
    info: ConnectionInfo,
    protocol: Option<String>,
    server: Option<Arc<ServerContext>>,
}

impl Connection {
    /// Wraps a transport.
    pub fn new(io: impl Transport, info: ConnectionInfo) -> Self {
        Self {
            io: Box::new(io),
            info,
            protocol: None,
            server: None,
        }
    }

    /// Attaches the owning server's context.
    #[must_use]
    pub fn with_server(mut self, server: Option<Arc<ServerContext>>) -> Self {
        self.server = server;
        self
    }

    /// Replaces the transport, keeping everything else.
    #[must_use]
    pub fn with_transport(mut self, io: impl Transport) -> Self {
        self.io = Box::new(io);
        self
    }

    /// Splits off the transport so a negotiator can wrap it.
    ///
    /// Put it back with [`ConnectionParts::reassemble`].
    pub fn into_parts(self) -> (Box<dyn Transport>, ConnectionParts) {
        (
            self.io,
            ConnectionParts {
                info: self.info,
                protocol: self.protocol,
                server: self.server,
            },
        )
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    /// Local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    /// Name of the accepting connector.
    #[must_use]
    pub fn connector(&self) -> &str {
        &self.info.connector
    }

    /// Addresses and origin.
    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Negotiated protocol, once dispatched.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub(crate) fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    /// Context of the owning server, if the connector belongs to one.
    #[must_use]
    pub fn server(&self) -> Option<&Arc<ServerContext>> {
        self.server.as_ref()
    }
}

/// Everything about a connection except its transport.
pub struct ConnectionParts {
    info: ConnectionInfo,
    protocol: Option<String>,
    server: Option<Arc<ServerContext>>,
}

impl ConnectionParts {
    /// Addresses and origin.
    #[must_use]
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Rebuilds a connection around a (possibly wrapped) transport.
    pub fn reassemble(self, io: impl Transport) -> Connection {
        Connection {
            io: Box::new(io),
            info: self.info,
            protocol: self.protocol,
            server: self.server,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.info.remote_addr)
            .field("local_addr", &self.info.local_addr)
            .field("connector", &self.info.connector)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(test)]
pub(crate) fn test_info() -> ConnectionInfo {
    ConnectionInfo {
        remote_addr: "127.0.0.1:50000".parse().unwrap_or_else(|_| unreachable!()),
        local_addr: "127.0.0.1:8080".parse().unwrap_or_else(|_| unreachable!()),
        connector: Arc::from("test"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;

        assert!(Accepted.can_transition_to(&Negotiating));
        assert!(Negotiating.can_transition_to(&Dispatched("h2".into())));
        assert!(Negotiating.can_transition_to(&Rejected));
        assert!(!Accepted.can_transition_to(&Dispatched("h2".into())));
        assert!(!Dispatched("h2".into()).can_transition_to(&Dispatched("http/1.1".into())));
        assert!(!Rejected.can_transition_to(&Negotiating));
    }

    #[test]
    fn test_no_switch_after_dispatch() {
        let mut state = ConnectionState::Accepted;
        state.advance(ConnectionState::Negotiating);
        state.advance(ConnectionState::Dispatched("h2".into()));
        state.advance(ConnectionState::Dispatched("http/1.1".into()));

        assert_eq!(state, ConnectionState::Dispatched("h2".into()));
        assert!(state.is_final());
    }

    #[tokio::test]
    async fn test_connection_reads_and_writes_through_transport() {
        let (client, server) = tokio::io::duplex(64);
        let mut connection = Connection::new(server, test_info());
        let mut client = client;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0_u8; 4];
        connection.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        connection.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_parts_round_trip_keeps_metadata() {
        let (_client, server) = tokio::io::duplex(64);
        let mut connection = Connection::new(server, test_info());
        connection.set_protocol("h2");

        let (io, parts) = connection.into_parts();
        assert_eq!(&*parts.info().connector, "test");
        let connection = parts.reassemble(io);

        assert_eq!(connection.protocol(), Some("h2"));
        assert_eq!(connection.connector(), "test");
        assert_eq!(connection.local_addr().port(), 8080);
    }
}
