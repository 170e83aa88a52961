//! Components and handlers that record what happens to them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use trellis_core::{Lifecycle, LifecycleError, LifecycleResult, LifecycleSupport};
use trellis_server::{Connection, ConnectionError, Handler};

use crate::error::TestError;

/// Ordered log shared between recorders.
///
/// ```rust
/// use trellis_test::EventLog;
///
/// let log = EventLog::new();
/// log.push("a:start");
/// assert_eq!(log.entries(), ["a:start"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries that start with `prefix`.
    #[must_use]
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// A lifecycle component that logs `<name>:start` and `<name>:stop`.
///
/// Starting or stopping can be made to fail, and either can be slowed down
/// to widen race windows.
pub struct RecordingComponent {
    name: String,
    lifecycle: LifecycleSupport,
    log: EventLog,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    delay: Mutex<Duration>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingComponent {
    /// A component writing to its own log.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_log(name, EventLog::new())
    }

    /// A component writing to a shared log.
    #[must_use]
    pub fn with_log(name: impl Into<String>, log: EventLog) -> Self {
        Self {
            name: name.into(),
            lifecycle: LifecycleSupport::new(),
            log,
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Makes the next starts fail.
    #[must_use]
    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    /// Makes the next stops fail.
    #[must_use]
    pub fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    /// Sleeps this long inside every start and stop.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Toggles start failures at runtime.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// The shared log.
    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Number of start attempts.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of stop attempts.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Lifecycle for RecordingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }

    async fn do_start(&self) -> LifecycleResult {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_start.load(Ordering::SeqCst) {
            self.log.push(format!("{}:start-failed", self.name));
            return Err(LifecycleError::start_failed(&self.name, "configured to fail"));
        }
        self.log.push(format!("{}:start", self.name));
        Ok(())
    }

    async fn do_stop(&self) -> LifecycleResult {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_stop.load(Ordering::SeqCst) {
            self.log.push(format!("{}:stop-failed", self.name));
            return Err(LifecycleError::stop_failed(&self.name, "configured to fail"));
        }
        self.log.push(format!("{}:stop", self.name));
        Ok(())
    }
}

impl fmt::Debug for RecordingComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingComponent")
            .field("name", &self.name)
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

/// One connection seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledConnection {
    /// Accepting connector.
    pub connector: String,
    /// Negotiated protocol.
    pub protocol: Option<String>,
    /// Peer address.
    pub remote_addr: SocketAddr,
}

/// A handler that records every connection and echoes its bytes back.
///
/// Each connection is first greeted with `PROTOCOL <name>\n`, then
/// everything the peer sends is echoed until it closes its side.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<HandledConnection>>,
    completed: AtomicUsize,
    notify: Notify,
}

impl RecordingHandler {
    /// Creates a handler with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections handed to the handler so far.
    #[must_use]
    pub fn connections(&self) -> Vec<HandledConnection> {
        self.seen.lock().clone()
    }

    /// Number of connections handed to the handler.
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Number of connections whose echo loop finished normally.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` connections have been handed over.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Timeout`] if that takes longer than `timeout`.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Result<(), TestError> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TestError::Timeout(format!("{n} connections")))
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, connection: Connection) -> Result<(), ConnectionError> {
        let record = HandledConnection {
            connector: connection.connector().to_string(),
            protocol: connection.protocol().map(ToString::to_string),
            remote_addr: connection.remote_addr(),
        };
        let greeting = format!(
            "PROTOCOL {}\n",
            record.protocol.as_deref().unwrap_or("-")
        );
        self.seen.lock().push(record);
        self.notify.notify_waiters();

        let mut connection = connection;
        connection.write_all(greeting.as_bytes()).await?;
        connection.flush().await?;

        let mut buf = [0u8; 4096];
        loop {
            let n = connection.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            connection.write_all(&buf[..n]).await?;
            connection.flush().await?;
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
