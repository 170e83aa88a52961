//! # Trellis Server
//!
//! Connectors, protocol negotiation and the server component tree.
//!
//! - [`Connector`]: a TCP listener bound to a [`ProtocolChain`]
//! - [`ProtocolChain`]: an optional [`Negotiator`] followed by
//!   [`ConnectionFactory`]s, selecting in server order
//! - [`TlsNegotiator`]: rustls-based ALPN negotiation
//! - [`Server`]: root container of connectors, beans and attached resources
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis_server::{Connector, ConnectorConfig, HandlerFactory, ProtocolChain, Server};
//!
//! # tokio_test::block_on(async {
//! let server = Server::new("example");
//! server
//!     .add_connector(Arc::new(Connector::new(
//!         ConnectorConfig::builder("http").host("127.0.0.1").port(0).build(),
//!         ProtocolChain::plain(HandlerFactory::new("http/1.1")),
//!     )))
//!     .unwrap();
//!
//! server.start().await.unwrap();
//! assert_ne!(server.local_addrs()[0].port(), 0);
//! server.stop().await.unwrap();
//! # });
//! ```

#![doc(html_root_url = "https://docs.rs/trellis-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod factory;
pub mod negotiation;
pub mod server;
pub mod shutdown;
pub mod tls;

pub use config::{ConnectorConfig, ConnectorConfigBuilder};
pub use connection::{Connection, ConnectionInfo, ConnectionParts, ConnectionState, Transport};
pub use connector::{Connector, ConnectorStats};
pub use error::{BindError, ConnectionError, NegotiationError, ServerError, ServerResult};
pub use factory::{ConnectionFactory, Handler, HandlerFactory, ServerContext};
pub use negotiation::{Negotiated, Negotiator, ProtocolChain, ProtocolChainBuilder, ProtocolSelector};
pub use server::{hosts_overlap, Server};
pub use shutdown::{ConnectionToken, ConnectionTracker, ShutdownReceiver, ShutdownSignal};
pub use tls::{TlsError, TlsNegotiator};
