//! A plaintext negotiator for tests.
//!
//! The client opens with one line naming the protocols it speaks, in its
//! own preference order:
//!
//! ```text
//! TRELLIS-PREFACE http/1.1,h2
//! ```
//!
//! The server answers `SELECTED <protocol>` or `REJECTED`, each on its own
//! line, and in the first case the connection continues in the selected
//! protocol. An empty list (`TRELLIS-PREFACE` alone) offers nothing.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use trellis_server::{Connection, Negotiated, NegotiationError, Negotiator, ProtocolSelector};

use crate::error::TestError;

/// First word of a preface line.
pub const PREFACE: &str = "TRELLIS-PREFACE";

const MAX_LINE: usize = 1024;

/// Server side of the preface handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefaceNegotiator;

impl PrefaceNegotiator {
    /// Creates the negotiator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Negotiator for PrefaceNegotiator {
    fn name(&self) -> &str {
        "preface"
    }

    async fn negotiate(
        &self,
        connection: Connection,
        selector: &ProtocolSelector,
    ) -> Result<Negotiated, NegotiationError> {
        let mut connection = connection;
        let line = read_line(&mut connection).await?;
        let offered = parse_preface(&line)
            .ok_or_else(|| NegotiationError::handshake(format!("malformed preface {line:?}")))?;

        match selector.select(&offered) {
            Ok(protocol) => {
                let protocol = protocol.to_string();
                connection
                    .write_all(format!("SELECTED {protocol}\n").as_bytes())
                    .await?;
                connection.flush().await?;
                Ok(Negotiated {
                    connection,
                    protocol,
                })
            }
            Err(e) => {
                // Best effort; the connector closes the socket either way.
                let _ = connection.write_all(b"REJECTED\n").await;
                let _ = connection.shutdown().await;
                Err(e)
            }
        }
    }
}

/// Parses `TRELLIS-PREFACE a,b,c` into its protocol list.
fn parse_preface(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix(PREFACE)?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    let list = rest.strip_prefix(' ')?;
    Some(
        list.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToString::to_string)
            .collect(),
    )
}

/// Reads one `\n`-terminated line without consuming anything after it.
async fn read_line<R: AsyncRead + Unpin>(io: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = io.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Client side of the preface handshake.
///
/// ```rust,no_run
/// use trellis_test::PrefaceClient;
///
/// # async fn demo(addr: std::net::SocketAddr) -> Result<(), trellis_test::TestError> {
/// let (stream, protocol) = PrefaceClient::new(["http/1.1", "h2"]).connect(addr).await?;
/// println!("server picked {protocol}");
/// # drop(stream);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PrefaceClient {
    offered: Vec<String>,
}

impl PrefaceClient {
    /// A client offering `protocols` in this order.
    #[must_use]
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            offered: protocols.into_iter().map(Into::into).collect(),
        }
    }

    /// The offered protocols.
    #[must_use]
    pub fn offered(&self) -> &[String] {
        &self.offered
    }

    /// Connects to `addr` and negotiates. Returns the stream, positioned
    /// after the server's reply, and the selected protocol.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Rejected`] if the server found no mutual
    /// protocol.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(TcpStream, String), TestError> {
        let mut stream = TcpStream::connect(addr).await?;
        let protocol = self.handshake(&mut stream).await?;
        Ok((stream, protocol))
    }

    /// Runs the handshake over an established stream.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<String, TestError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let preface = if self.offered.is_empty() {
            format!("{PREFACE}\n")
        } else {
            format!("{PREFACE} {}\n", self.offered.join(","))
        };
        stream.write_all(preface.as_bytes()).await?;
        stream.flush().await?;

        let reply = match read_line(stream).await {
            Ok(reply) => reply,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TestError::Rejected {
                    offered: self.offered.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if reply == "REJECTED" {
            return Err(TestError::Rejected {
                offered: self.offered.clone(),
            });
        }
        reply
            .strip_prefix("SELECTED ")
            .map(ToString::to_string)
            .ok_or(TestError::UnexpectedReply(reply))
    }
}
