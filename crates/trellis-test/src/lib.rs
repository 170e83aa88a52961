//! # Trellis Test
//!
//! Test doubles for Trellis servers.
//!
//! - [`PrefaceNegotiator`] and [`PrefaceClient`]: a plaintext handshake that
//!   carries the client's protocol list, standing in for TLS/ALPN where
//!   certificates would only get in the way
//! - [`RecordingComponent`]: a lifecycle component that logs its starts and
//!   stops to a shared [`EventLog`]
//! - [`RecordingHandler`]: a connection handler that records what it was
//!   given and echoes bytes
//! - [`TestServer`]: a started loopback server wiring the pieces together
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use trellis_test::TestServer;
//!
//! # tokio_test::block_on(async {
//! let server = TestServer::builder()
//!     .protocols(["h2", "http/1.1"])
//!     .default_protocol("http/1.1")
//!     .preface()
//!     .start()
//!     .await
//!     .unwrap();
//!
//! let (stream, protocol) = server.connect_preface(Vec::<String>::new()).await.unwrap();
//! assert_eq!(protocol, "http/1.1");
//!
//! server.handler().wait_for(1, Duration::from_secs(1)).await.unwrap();
//! drop(stream);
//! server.stop().await.unwrap();
//! # });
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod preface;
mod recording;
mod server;

pub use error::TestError;
pub use preface::{PrefaceClient, PrefaceNegotiator, PREFACE};
pub use recording::{EventLog, HandledConnection, RecordingComponent, RecordingHandler};
pub use server::{TestServer, TestServerBuilder};
