//! Protocol negotiation.
//!
//! A [`ProtocolChain`] is what a connector runs over every accepted
//! connection: an optional [`Negotiator`] (TLS with ALPN, a plaintext
//! preface, ...) followed by the application [`ConnectionFactory`]s it can
//! hand the connection to.
//!
//! Selection always follows the server's order: the first configured
//! protocol the client also offered wins, whatever order the client listed
//! them in. Without a match the chain falls back to its default protocol,
//! if it has one.
//!
//! ```rust
//! use trellis_server::ProtocolSelector;
//!
//! let selector = ProtocolSelector::new(["h2", "http/1.1"], None);
//! assert_eq!(selector.select(["http/1.1", "h2"]).unwrap(), "h2");
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{NegotiationError, ServerError, ServerResult};
use crate::factory::ConnectionFactory;

/// Chooses a protocol from a client's offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSelector {
    protocols: Vec<String>,
    default: Option<String>,
}

impl ProtocolSelector {
    /// Creates a selector over `protocols`, in server preference order.
    pub fn new<I, S>(protocols: I, default: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            default,
        }
    }

    /// Server protocols in preference order.
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Fallback protocol.
    #[must_use]
    pub fn default_protocol(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Returns the first server protocol present in `offered`.
    ///
    /// An empty or disjoint offer selects the default protocol.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NoMutualProtocol`] when nothing matches
    /// and there is no default.
    pub fn select<I, P>(&self, offered: I) -> Result<&str, NegotiationError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let offered: Vec<P> = offered.into_iter().collect();

        let chosen = self
            .protocols
            .iter()
            .find(|ours| offered.iter().any(|theirs| theirs.as_ref() == ours.as_bytes()));

        match chosen.or(self.default.as_ref()) {
            Some(protocol) => Ok(protocol),
            None => Err(NegotiationError::NoMutualProtocol {
                offered: offered
                    .iter()
                    .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned())
                    .collect(),
            }),
        }
    }
}

/// Outcome of a successful handshake.
#[derive(Debug)]
pub struct Negotiated {
    /// The connection, possibly over a new transport.
    pub connection: Connection,
    /// The selected protocol.
    pub protocol: String,
}

/// Handshake that learns which protocols a client speaks.
///
/// Implementations read the client's offer, let the selector pick, tell the
/// client and return the connection ready for the chosen protocol.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    /// Short name, e.g. `"alpn"`.
    fn name(&self) -> &str;

    /// Runs the handshake on `connection`.
    async fn negotiate(
        &self,
        connection: Connection,
        selector: &ProtocolSelector,
    ) -> Result<Negotiated, NegotiationError>;
}

/// A negotiator followed by the factories it dispatches to.
#[derive(Clone)]
pub struct ProtocolChain {
    negotiator: Option<Arc<dyn Negotiator>>,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    selector: ProtocolSelector,
}

impl ProtocolChain {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ProtocolChainBuilder {
        ProtocolChainBuilder::default()
    }

    /// A chain without negotiation that hands every connection to `factory`.
    pub fn plain(factory: impl ConnectionFactory) -> Self {
        let factory: Arc<dyn ConnectionFactory> = Arc::new(factory);
        let selector = ProtocolSelector::new([factory.protocol()], None);
        Self {
            negotiator: None,
            factories: vec![factory],
            selector,
        }
    }

    /// The selector built from the factory names.
    #[must_use]
    pub fn selector(&self) -> &ProtocolSelector {
        &self.selector
    }

    /// Name of the negotiator, if any.
    #[must_use]
    pub fn negotiator_name(&self) -> Option<&str> {
        self.negotiator.as_deref().map(Negotiator::name)
    }

    /// Protocol names in server order.
    #[must_use]
    pub fn protocols(&self) -> &[String] {
        self.selector.protocols()
    }

    /// Looks up the factory for `protocol`.
    #[must_use]
    pub fn factory(&self, protocol: &str) -> Option<&Arc<dyn ConnectionFactory>> {
        self.factories.iter().find(|f| f.protocol() == protocol)
    }

    /// Negotiates a protocol for `connection` and returns the factory that
    /// must serve it. The returned connection carries the protocol label.
    ///
    /// # Errors
    ///
    /// Returns the negotiator's error, or
    /// [`NegotiationError::UnknownProtocol`] if it picked a protocol with no
    /// factory.
    pub async fn negotiate(
        &self,
        connection: Connection,
    ) -> Result<(Connection, Arc<dyn ConnectionFactory>), NegotiationError> {
        let Some(negotiator) = &self.negotiator else {
            let factory = self.factories.first().cloned().ok_or_else(|| {
                NegotiationError::UnknownProtocol {
                    protocol: String::new(),
                }
            })?;
            let mut connection = connection;
            connection.set_protocol(factory.protocol());
            return Ok((connection, factory));
        };

        let Negotiated {
            mut connection,
            protocol,
        } = negotiator.negotiate(connection, &self.selector).await?;

        let factory = self
            .factory(&protocol)
            .cloned()
            .ok_or_else(|| NegotiationError::UnknownProtocol {
                protocol: protocol.clone(),
            })?;
        connection.set_protocol(protocol);
        Ok((connection, factory))
    }
}

impl fmt::Debug for ProtocolChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolChain")
            .field("negotiator", &self.negotiator_name())
            .field("protocols", &self.selector.protocols)
            .field("default", &self.selector.default)
            .finish()
    }
}

/// Builder for [`ProtocolChain`].
#[derive(Default)]
pub struct ProtocolChainBuilder {
    negotiator: Option<Arc<dyn Negotiator>>,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    default_protocol: Option<String>,
}

impl ProtocolChainBuilder {
    /// Sets the entry negotiator.
    #[must_use]
    pub fn negotiator(mut self, negotiator: impl Negotiator) -> Self {
        self.negotiator = Some(Arc::new(negotiator));
        self
    }

    /// Sets a shared entry negotiator.
    #[must_use]
    pub fn shared_negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Appends a factory. Order is server preference order.
    #[must_use]
    pub fn factory(mut self, factory: impl ConnectionFactory) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    /// Appends a shared factory.
    #[must_use]
    pub fn shared_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Sets the protocol used when the client offers nothing we support.
    #[must_use]
    pub fn default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = Some(protocol.into());
        self
    }

    /// Validates and builds the chain.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidConfig`] if there is no factory, two
    /// factories share a protocol name, or the default protocol has no
    /// factory.
    pub fn build(self) -> ServerResult<ProtocolChain> {
        if self.factories.is_empty() {
            return Err(ServerError::InvalidConfig(
                "protocol chain needs at least one connection factory".into(),
            ));
        }

        let mut seen = HashSet::new();
        for factory in &self.factories {
            if !seen.insert(factory.protocol()) {
                return Err(ServerError::InvalidConfig(format!(
                    "protocol '{}' is registered twice",
                    factory.protocol()
                )));
            }
        }

        if let Some(default) = &self.default_protocol {
            if !seen.contains(default.as_str()) {
                return Err(ServerError::InvalidConfig(format!(
                    "default protocol '{default}' has no connection factory"
                )));
            }
        }

        let selector = ProtocolSelector::new(
            self.factories.iter().map(|f| f.protocol().to_string()),
            self.default_protocol,
        );

        Ok(ProtocolChain {
            negotiator: self.negotiator,
            factories: self.factories,
            selector,
        })
    }
}
