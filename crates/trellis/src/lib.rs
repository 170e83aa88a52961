//! # Trellis
//!
//! **An embeddable network server core.**
//!
//! - **Protocol negotiation** – each connector runs a negotiator (TLS/ALPN
//!   or your own) and dispatches connections to per-protocol factories; the
//!   server's protocol order wins over the client's
//! - **Lifecycle-managed components** – the server is a container of beans
//!   started in registration order and stopped in reverse
//! - **Runtime-attached resources** – anything created while serving can
//!   attach itself to the server's scope and is stopped with it
//! - **Graceful shutdown** – in-flight connections get a grace period, then
//!   are closed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis::prelude::*;
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Handler for Hello {
//!     async fn handle(&self, mut connection: Connection) -> Result<(), ConnectionError> {
//!         use tokio::io::AsyncWriteExt;
//!         let greeting = format!("hello over {}\n", connection.protocol().unwrap_or("?"));
//!         connection.write_all(greeting.as_bytes()).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new("hello");
//!     server.set_handler(Hello);
//!     server.add_connector(Arc::new(Connector::new(
//!         ConnectorConfig::builder("plain").port(7000).build(),
//!         ProtocolChain::plain(HandlerFactory::new("hello/1")),
//!     )))?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Server (Container)
//!  ├── Connector "plain"  ── accept ─▶ ProtocolChain ─▶ ConnectionFactory ─▶ Handler
//!  ├── Connector "secure" ── accept ─▶ TlsNegotiator ─▶ ConnectionFactory ─▶ Handler
//!  ├── application beans
//!  └── ShutdownBridge ── Scope ── resources attached at runtime
//! ```
//!
//! Configuration-driven assembly goes through [`ServerBootstrap`].

#![doc(html_root_url = "https://docs.rs/trellis/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bootstrap;

pub use bootstrap::{BootstrapError, ServerBootstrap, TlsNegotiatorFactory};

// Re-export lifecycle and container types
pub use trellis_core as core;

// Re-export connectors, negotiation and the server
pub use trellis_server as server;

// Re-export configuration
pub use trellis_config as config;

// Re-export logging and metrics
pub use trellis_telemetry as telemetry;

/// Prelude module for convenient imports.
///
/// ```rust
/// use trellis::prelude::*;
///
/// let server = Server::new("example");
/// assert_eq!(server.state(), LifecycleState::Stopped);
/// ```
pub mod prelude {
    pub use trellis_core::{
        Bean, Container, Lifecycle, LifecycleError, LifecycleHooks, LifecycleListener,
        LifecycleResult, LifecycleState, LifecycleSupport, Scope, ShutdownBridge,
    };

    pub use trellis_server::{
        Connection, ConnectionError, ConnectionFactory, Connector, ConnectorConfig, Handler,
        HandlerFactory, Negotiated, NegotiationError, Negotiator, ProtocolChain,
        ProtocolSelector, Server, ServerError, ShutdownSignal, TlsNegotiator,
    };

    pub use trellis_config::{ConfigLoader, ConnectorSettings, TrellisConfig};

    pub use crate::bootstrap::{BootstrapError, ServerBootstrap};
}
