//! Network connectors.
//!
//! A [`Connector`] binds one TCP listener to one [`ProtocolChain`]. It is a
//! lifecycle component, normally a managed bean of a [`Server`](crate::Server):
//!
//! - **start** opens the listener (if [`Connector::open`] was not called
//!   already) and spawns the accept loop on its own task.
//! - Every accepted connection runs on its own task: negotiation under the
//!   negotiation timeout, then the selected factory.
//! - **stop** stops accepting, drops the listener, gives in-flight
//!   connections the grace period to finish and then aborts the rest, which
//!   closes their sockets.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use trellis_core::{Lifecycle, LifecycleError, LifecycleResult, LifecycleSupport};
use trellis_telemetry::metrics::{
    record_connection_accepted, record_connection_negotiated, record_connection_rejected,
    ActiveConnectionGuard,
};

use crate::config::ConnectorConfig;
use crate::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::error::{BindError, ConnectionError, NegotiationError, ServerError, ServerResult};
use crate::factory::ServerContext;
use crate::negotiation::ProtocolChain;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Connection counters of one connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    /// Connections accepted.
    pub accepted: u64,
    /// Connections handed to a factory.
    pub dispatched: u64,
    /// Connections closed during negotiation.
    pub rejected: u64,
    /// Connections force-closed by a stop.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectorStats {
        ConnectorStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the accept loop and connection tasks.
struct Shared {
    name: Arc<str>,
    chain: ProtocolChain,
    negotiation_timeout: Duration,
    grace_period: Duration,
    server: OnceLock<Arc<ServerContext>>,
    counters: Counters,
    tracker: ConnectionTracker,
}

struct Running {
    shutdown: ShutdownSignal,
    accept_task: JoinHandle<()>,
}

/// A listener bound to a protocol chain.
pub struct Connector {
    config: ConnectorConfig,
    lifecycle: LifecycleSupport,
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
}

impl Connector {
    /// Creates a connector. Nothing is bound until [`open`](Self::open) or start.
    #[must_use]
    pub fn new(config: ConnectorConfig, chain: ProtocolChain) -> Self {
        let shared = Arc::new(Shared {
            name: Arc::from(config.name()),
            chain,
            negotiation_timeout: config.negotiation_timeout(),
            grace_period: config.grace_period(),
            server: OnceLock::new(),
            counters: Counters::default(),
            tracker: ConnectionTracker::new(),
        });

        Self {
            config,
            lifecycle: LifecycleSupport::new(),
            shared,
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Listener settings.
    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// The protocol chain.
    #[must_use]
    pub fn chain(&self) -> &ProtocolChain {
        &self.shared.chain
    }

    /// Binds the listener and returns the bound address.
    ///
    /// Port `0` resolves to the OS-assigned port. Calling `open` on an open
    /// connector returns the existing address.
    ///
    /// # Errors
    ///
    /// Returns [`BindError`] if the host does not resolve or no resolved
    /// address can be bound.
    pub async fn open(&self) -> Result<SocketAddr, BindError> {
        if let Some(addr) = *self.local_addr.read() {
            return Ok(addr);
        }

        let bind_addr = self.config.bind_addr();
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(bind_addr.as_str())
            .await
            .map_err(|e| BindError::Resolve {
                host: self.config.host().to_string(),
                reason: e.to_string(),
            })?
            .collect();

        let mut last_error = None;
        for addr in candidates {
            match listen(addr, self.config.backlog()) {
                Ok(listener) => {
                    let local = listener.local_addr().map_err(|source| BindError::Listen {
                        addr: addr.to_string(),
                        source,
                    })?;
                    return Ok(self.install_listener(listener, local));
                }
                Err(source) => {
                    tracing::debug!(connector = %self.name(), %addr, error = %source, "bind attempt failed");
                    last_error = Some(BindError::Listen {
                        addr: addr.to_string(),
                        source,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BindError::Resolve {
            host: self.config.host().to_string(),
            reason: "no addresses".to_string(),
        }))
    }

    fn install_listener(&self, listener: TcpListener, local: SocketAddr) -> SocketAddr {
        let mut addr = self.local_addr.write();
        if let Some(existing) = *addr {
            // A concurrent open won; this listener is dropped.
            return existing;
        }
        *self.listener.lock() = Some(listener);
        *addr = Some(local);
        tracing::debug!(connector = %self.name(), addr = %local, "listener bound");
        local
    }

    /// Bound address while open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bound port while open.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Connections currently being negotiated or served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.shared.tracker.active_connections()
    }

    /// Connection counters since creation.
    #[must_use]
    pub fn stats(&self) -> ConnectorStats {
        self.shared.counters.snapshot()
    }

    /// Attaches the connector to a server. A connector belongs to one server.
    pub(crate) fn bind_server(&self, server: Arc<ServerContext>) -> ServerResult {
        self.shared
            .server
            .set(server)
            .map_err(|_| ServerError::ConnectorOwned(self.name().to_string()))
    }

    /// Returns `true` if the connector already belongs to a server.
    #[must_use]
    pub fn has_server(&self) -> bool {
        self.shared.server.get().is_some()
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

#[async_trait]
impl Lifecycle for Connector {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }

    async fn do_start(&self) -> LifecycleResult {
        let local = self
            .open()
            .await
            .map_err(|e| LifecycleError::start_failed(self.name(), e))?;

        let Some(listener) = self.listener.lock().take() else {
            return Err(LifecycleError::start_failed(
                self.name(),
                "listener was closed before the accept loop started",
            ));
        };

        let shutdown = ShutdownSignal::new();
        let limit = self.config.max_connections().map(|max| Arc::new(Semaphore::new(max)));
        let accept_task = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            shutdown.clone(),
            limit,
        ));
        *self.running.lock() = Some(Running {
            shutdown,
            accept_task,
        });

        tracing::info!(
            connector = %self.name(),
            addr = %local,
            negotiator = self.shared.chain.negotiator_name().unwrap_or("none"),
            protocols = ?self.shared.chain.protocols(),
            "connector listening"
        );
        Ok(())
    }

    async fn do_stop(&self) -> LifecycleResult {
        let running = self.running.lock().take();
        self.listener.lock().take();
        *self.local_addr.write() = None;

        if let Some(Running {
            shutdown,
            accept_task,
        }) = running
        {
            shutdown.trigger();
            if let Err(e) = accept_task.await {
                return Err(LifecycleError::stop_failed(self.name(), e));
            }
        }

        tracing::info!(connector = %self.name(), stats = ?self.stats(), "connector stopped");
        Ok(())
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.shared.name)
            .field("bind_addr", &self.config.bind_addr())
            .field("local_addr", &self.local_addr())
            .field("chain", &self.shared.chain)
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    shutdown: ShutdownSignal,
    limit: Option<Arc<Semaphore>>,
) {
    let mut stop = shutdown.recv();
    let mut connections = JoinSet::new();

    loop {
        let permit = match &limit {
            None => None,
            Some(semaphore) => tokio::select! {
                biased;
                () = &mut stop => break,
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            },
        };

        tokio::select! {
            biased;
            () = &mut stop => break,
            Some(joined) = connections.join_next() => report(&shared, joined),
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    let token = shared.tracker.acquire();
                    let task_shared = shared.clone();
                    connections.spawn(async move {
                        let _permit = permit;
                        let _token = token;
                        serve_connection(task_shared, stream, remote_addr).await
                    });
                }
                Err(e) => {
                    tracing::warn!(connector = %shared.name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    drain(&shared, &mut connections).await;
}

/// Waits up to the grace period for in-flight connections, then aborts the rest.
async fn drain(shared: &Shared, connections: &mut JoinSet<Result<(), ConnectionError>>) {
    if !connections.is_empty() {
        tracing::info!(
            connector = %shared.name,
            active = connections.len(),
            grace_period = ?shared.grace_period,
            "draining connections"
        );
    }

    let graceful = tokio::time::timeout(shared.grace_period, async {
        while let Some(joined) = connections.join_next().await {
            report(shared, joined);
        }
    })
    .await;

    if graceful.is_err() {
        tracing::warn!(
            connector = %shared.name,
            remaining = connections.len(),
            "grace period elapsed, closing connections"
        );
        connections.abort_all();
        while let Some(joined) = connections.join_next().await {
            report(shared, joined);
        }
    }
}

fn report(shared: &Shared, joined: Result<Result<(), ConnectionError>, JoinError>) {
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Err(ConnectionError::Cancelled),
        Err(e) => {
            tracing::error!(connector = %shared.name, error = %e, "connection task panicked");
            return;
        }
    };

    match outcome {
        Ok(()) => {}
        Err(ConnectionError::Cancelled) => {
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(connector = %shared.name, "connection force-closed");
        }
        Err(e) => tracing::debug!(connector = %shared.name, error = %e, "connection ended with error"),
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    remote_addr: SocketAddr,
) -> Result<(), ConnectionError> {
    let _active = ActiveConnectionGuard::new(&shared.name);
    shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
    record_connection_accepted(&shared.name);

    let local_addr = stream.local_addr()?;
    // Best effort; some transports do not support it.
    let _ = stream.set_nodelay(true);

    let connection = Connection::new(
        stream,
        ConnectionInfo {
            remote_addr,
            local_addr,
            connector: shared.name.clone(),
        },
    )
    .with_server(shared.server.get().cloned());

    let mut state = ConnectionState::Accepted;
    state.advance(ConnectionState::Negotiating);
    let started = Instant::now();

    let negotiated = tokio::time::timeout(shared.negotiation_timeout, shared.chain.negotiate(connection))
        .await
        .unwrap_or_else(|_| Err(NegotiationError::Timeout(shared.negotiation_timeout)));

    let (connection, factory) = match negotiated {
        Ok(dispatch) => dispatch,
        Err(e) => {
            state.advance(ConnectionState::Rejected);
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            record_connection_rejected(&shared.name, e.reason());
            match e {
                NegotiationError::NoMutualProtocol { .. } | NegotiationError::Io(_) => {
                    tracing::debug!(connector = %shared.name, %remote_addr, error = %e, "connection rejected");
                }
                _ => tracing::warn!(connector = %shared.name, %remote_addr, error = %e, "connection rejected"),
            }
            return Ok(());
        }
    };

    let protocol = factory.protocol().to_string();
    state.advance(ConnectionState::Dispatched(protocol.clone()));
    shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    record_connection_negotiated(&shared.name, &protocol, started.elapsed());
    tracing::debug!(connector = %shared.name, %remote_addr, protocol = %protocol, "connection dispatched");

    factory.serve(connection).await
}
