//! Test error types.

use thiserror::Error;
use trellis_core::LifecycleError;
use trellis_server::ServerError;

/// Errors raised by the test helpers.
#[derive(Error, Debug)]
pub enum TestError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered the preface with `REJECTED`.
    #[error("server rejected offered protocols [{}]", .offered.join(", "))]
    Rejected {
        /// What the client offered.
        offered: Vec<String>,
    },

    /// The server's reply did not follow the preface protocol.
    #[error("unexpected negotiation reply: {0:?}")]
    UnexpectedReply(String),

    /// The server started but its connector has no bound address.
    #[error("connector '{0}' is not listening")]
    NotListening(String),

    /// A wait ran out of time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Building or running the server failed.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A lifecycle operation failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
