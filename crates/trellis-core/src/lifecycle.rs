//! Component lifecycle: states, transitions and listeners.
//!
//! Every long-lived Trellis component (servers, connectors, containers,
//! auxiliary resources created while serving requests) implements the
//! [`Lifecycle`] trait. The trait supplies `start`/`stop` as provided
//! methods that drive a [`LifecycleSupport`] state machine around the
//! component's own `do_start`/`do_stop` actions.
//!
//! # State machine
//!
//! ```text
//! STOPPED ──start──▶ STARTING ──ok──▶ STARTED ──stop──▶ STOPPING ──ok──▶ STOPPED
//!                       │                                   │
//!                       └──────────err──────▶ FAILED ◀──err─┘
//! ```
//!
//! - `start` is only valid from `STOPPED`; anything else is an
//!   [`IllegalState`](crate::LifecycleError::IllegalState) error.
//! - `stop` on a `STOPPED` or `FAILED` component is a no-op, so a component
//!   can be stopped both by its owner and by its own error handling.
//! - Transitions of one component are serialized by an async mutex; distinct
//!   components transition concurrently.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Lifecycle, LifecycleResult, LifecycleState, LifecycleSupport};
//!
//! struct Pool {
//!     lifecycle: LifecycleSupport,
//! }
//!
//! #[async_trait::async_trait]
//! impl Lifecycle for Pool {
//!     fn name(&self) -> &str {
//!         "pool"
//!     }
//!
//!     fn lifecycle(&self) -> &LifecycleSupport {
//!         &self.lifecycle
//!     }
//!
//!     async fn do_start(&self) -> LifecycleResult {
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = Pool { lifecycle: LifecycleSupport::new() };
//! pool.start().await.unwrap();
//! assert_eq!(pool.state(), LifecycleState::Started);
//!
//! pool.stop().await.unwrap();
//! pool.stop().await.unwrap(); // idempotent
//! assert_eq!(pool.state(), LifecycleState::Stopped);
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};

/// The state of a lifecycle-managed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Not running. Initial state, and the state after a clean stop.
    #[default]
    Stopped,
    /// A start transition is in progress.
    Starting,
    /// Running.
    Started,
    /// A stop transition is in progress.
    Stopping,
    /// A transition failed. Only `stop` (a no-op) is accepted.
    Failed,
}

impl LifecycleState {
    /// Returns `true` if the component is starting or started.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started)
    }

    /// Returns `true` if a stop would be a no-op.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns `true` if `self → target` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Started, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Starting | Self::Started | Self::Stopping, Self::Failed)
        )
    }

    /// Returns the upper-case name used in logs and diagnostics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of lifecycle transitions.
///
/// All methods have empty defaults. `on_starting` may veto a start by
/// returning an error; the component then ends in `FAILED` and the error is
/// returned to whoever called `start`.
///
/// Listeners are invoked on a snapshot of the listener set, so adding or
/// removing listeners from inside a notification is allowed and takes effect
/// from the next transition.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// Called after the component entered `STARTING`, before its start action.
    async fn on_starting(&self, _component: &str) -> LifecycleResult {
        Ok(())
    }

    /// Called after the component entered `STARTED`.
    async fn on_started(&self, _component: &str) {}

    /// Called after the component entered `FAILED`.
    async fn on_failure(&self, _component: &str, _error: &LifecycleError) {}

    /// Called after the component entered `STOPPING`, before its stop action.
    async fn on_stopping(&self, _component: &str) {}

    /// Called after the component entered `STOPPED`.
    async fn on_stopped(&self, _component: &str) {}
}

/// State holder and transition driver embedded in every [`Lifecycle`] component.
///
/// The current state is readable without waiting; transitions take an async
/// mutex so that at most one start or stop runs per component at a time.
pub struct LifecycleSupport {
    state: RwLock<LifecycleState>,
    transition: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    owner: Mutex<Option<usize>>,
}

impl Default for LifecycleSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LifecycleSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleSupport")
            .field("state", &self.state())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl LifecycleSupport {
    /// Creates a new support object in the `STOPPED` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Stopped),
            transition: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.lock().push(listener);
    }

    /// Removes a previously registered listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) -> bool {
        let target = Arc::as_ptr(listener).cast::<()>();
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l).cast::<()>() != target);
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Runs a start transition around `action`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::IllegalState`] unless the component is
    /// `STOPPED`, a listener veto, or the error returned by `action`.
    pub async fn start_with<F>(&self, component: &str, action: F) -> LifecycleResult
    where
        F: Future<Output = LifecycleResult> + Send,
    {
        let _guard = self.transition.lock().await;

        let current = self.state();
        if current != LifecycleState::Stopped {
            return Err(LifecycleError::illegal_state(component, "start", current));
        }

        self.set_state(component, LifecycleState::Starting);
        for listener in self.snapshot_listeners() {
            if let Err(e) = listener.on_starting(component).await {
                self.fail(component, &e).await;
                return Err(e);
            }
        }

        match action.await {
            Ok(()) => {
                self.set_state(component, LifecycleState::Started);
                for listener in self.snapshot_listeners() {
                    listener.on_started(component).await;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(component, &e).await;
                Err(e)
            }
        }
    }

    /// Runs a stop transition around `action`.
    ///
    /// A component that is already `STOPPED` or `FAILED` is left untouched
    /// and `Ok(())` is returned without running `action`. A component left in
    /// `STARTING`/`STOPPING` by an abandoned transition is stopped normally.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `action`; the component is then `FAILED`.
    pub async fn stop_with<F>(&self, component: &str, action: F) -> LifecycleResult
    where
        F: Future<Output = LifecycleResult> + Send,
    {
        let _guard = self.transition.lock().await;

        if self.state().is_stopped() {
            tracing::trace!(component, "stop ignored, already stopped");
            return Ok(());
        }

        self.set_state(component, LifecycleState::Stopping);
        for listener in self.snapshot_listeners() {
            listener.on_stopping(component).await;
        }

        match action.await {
            Ok(()) => {
                self.set_state(component, LifecycleState::Stopped);
                for listener in self.snapshot_listeners() {
                    listener.on_stopped(component).await;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(component, &e).await;
                Err(e)
            }
        }
    }

    /// Records `owner` as the managing container. Returns `false` if another
    /// container already manages this component.
    pub(crate) fn claim_owner(&self, owner: usize) -> bool {
        let mut slot = self.owner.lock();
        match *slot {
            Some(existing) => existing == owner,
            None => {
                *slot = Some(owner);
                true
            }
        }
    }

    /// Clears the owner if it is `owner`.
    pub(crate) fn release_owner(&self, owner: usize) {
        let mut slot = self.owner.lock();
        if *slot == Some(owner) {
            *slot = None;
        }
    }

    fn set_state(&self, component: &str, next: LifecycleState) {
        let mut state = self.state.write();
        let previous = *state;
        tracing::debug!(component, from = %previous, to = %next, "lifecycle transition");
        *state = next;
    }

    async fn fail(&self, component: &str, error: &LifecycleError) {
        self.set_state(component, LifecycleState::Failed);
        tracing::warn!(component, error = %error, "lifecycle transition failed");
        for listener in self.snapshot_listeners() {
            listener.on_failure(component, error).await;
        }
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners.lock().clone()
    }
}

/// A component with a managed start/stop lifecycle.
///
/// Implementors provide [`name`](Self::name), [`lifecycle`](Self::lifecycle)
/// and optionally `do_start`/`do_stop`; the provided `start`/`stop` methods
/// enforce the state machine. Override `start`/`stop` only to delegate to
/// another component's state machine.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Human-readable component name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// The embedded state machine.
    fn lifecycle(&self) -> &LifecycleSupport;

    /// The component's own start action.
    async fn do_start(&self) -> LifecycleResult {
        Ok(())
    }

    /// The component's own stop action.
    async fn do_stop(&self) -> LifecycleResult {
        Ok(())
    }

    /// Starts the component.
    async fn start(&self) -> LifecycleResult {
        self.lifecycle().start_with(self.name(), self.do_start()).await
    }

    /// Stops the component. Idempotent.
    async fn stop(&self) -> LifecycleResult {
        self.lifecycle().stop_with(self.name(), self.do_stop()).await
    }

    /// Returns the current state.
    fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    /// Returns `true` if the component is starting or started.
    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Registers a lifecycle listener on this component.
    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.lifecycle().add_listener(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Worker {
        lifecycle: LifecycleSupport,
        fail_start: bool,
        fail_stop: bool,
        stops: AtomicUsize,
    }

    impl Worker {
        fn new() -> Self {
            Self {
                lifecycle: LifecycleSupport::new(),
                fail_start: false,
                fail_stop: false,
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Lifecycle for Worker {
        fn name(&self) -> &str {
            "worker"
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }

        async fn do_start(&self) -> LifecycleResult {
            if self.fail_start {
                return Err(LifecycleError::start_failed("worker", "refused"));
            }
            Ok(())
        }

        async fn do_stop(&self) -> LifecycleResult {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(LifecycleError::stop_failed("worker", "stuck"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        veto: bool,
    }

    #[async_trait]
    impl LifecycleListener for Recorder {
        async fn on_starting(&self, component: &str) -> LifecycleResult {
            self.events.lock().push(format!("starting:{component}"));
            if self.veto {
                return Err(LifecycleError::vetoed(component, "not today"));
            }
            Ok(())
        }

        async fn on_started(&self, component: &str) {
            self.events.lock().push(format!("started:{component}"));
        }

        async fn on_failure(&self, component: &str, _error: &LifecycleError) {
            self.events.lock().push(format!("failure:{component}"));
        }

        async fn on_stopping(&self, component: &str) {
            self.events.lock().push(format!("stopping:{component}"));
        }

        async fn on_stopped(&self, component: &str) {
            self.events.lock().push(format!("stopped:{component}"));
        }
    }

    #[test]
    fn test_state_transitions_table() {
        use LifecycleState::*;

        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Started));
        assert!(Started.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Started));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Failed));
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(LifecycleState::Started.to_string(), "STARTED");
        let json = serde_json::to_string(&LifecycleState::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
    }

    #[tokio::test]
    async fn test_start_stop() {
        let worker = Worker::new();
        assert_eq!(worker.state(), LifecycleState::Stopped);

        worker.start().await.unwrap();
        assert_eq!(worker.state(), LifecycleState::Started);
        assert!(worker.is_running());

        worker.stop().await.unwrap();
        assert_eq!(worker.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_is_illegal() {
        let worker = Worker::new();
        worker.start().await.unwrap();

        let err = worker.start().await.unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(worker.state(), LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_double_stop_is_noop() {
        let worker = Worker::new();
        worker.start().await.unwrap();

        worker.stop().await.unwrap();
        worker.stop().await.unwrap();

        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let worker = Worker::new();
        worker.stop().await.unwrap();
        assert_eq!(worker.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_start() {
        let mut worker = Worker::new();
        worker.fail_start = true;

        assert!(worker.start().await.is_err());
        assert_eq!(worker.state(), LifecycleState::Failed);

        // Failed components ignore stop and refuse start.
        worker.stop().await.unwrap();
        assert!(worker.start().await.unwrap_err().is_illegal_state());
    }

    #[tokio::test]
    async fn test_failed_stop() {
        let mut worker = Worker::new();
        worker.fail_stop = true;
        worker.start().await.unwrap();

        assert!(worker.stop().await.is_err());
        assert_eq!(worker.state(), LifecycleState::Failed);
        worker.stop().await.unwrap();
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_notifications() {
        let worker = Worker::new();
        let recorder = Arc::new(Recorder::default());
        worker.add_lifecycle_listener(recorder.clone());

        worker.start().await.unwrap();
        worker.stop().await.unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "starting:worker",
                "started:worker",
                "stopping:worker",
                "stopped:worker"
            ]
        );
    }

    #[tokio::test]
    async fn test_listener_veto_fails_start() {
        let worker = Worker::new();
        let recorder = Arc::new(Recorder {
            veto: true,
            ..Recorder::default()
        });
        worker.add_lifecycle_listener(recorder.clone());

        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Vetoed { .. }));
        assert_eq!(worker.state(), LifecycleState::Failed);
        assert_eq!(
            *recorder.events.lock(),
            vec!["starting:worker", "failure:worker"]
        );
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let support = LifecycleSupport::new();
        let listener: Arc<dyn LifecycleListener> = Arc::new(Recorder::default());

        support.add_listener(listener.clone());
        assert_eq!(support.listener_count(), 1);
        assert!(support.remove_listener(&listener));
        assert!(!support.remove_listener(&listener));
        assert_eq!(support.listener_count(), 0);
    }

    struct SelfRemoving {
        support: Arc<LifecycleSupport>,
        me: Mutex<Option<Arc<dyn LifecycleListener>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LifecycleListener for SelfRemoving {
        async fn on_started(&self, _component: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let me = self.me.lock().clone();
            if let Some(me) = me {
                self.support.remove_listener(&me);
            }
        }
    }

    #[tokio::test]
    async fn test_listener_mutation_during_notification_is_deferred() {
        let support = Arc::new(LifecycleSupport::new());
        let listener = Arc::new(SelfRemoving {
            support: support.clone(),
            me: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn LifecycleListener> = listener.clone();
        *listener.me.lock() = Some(as_dyn.clone());
        support.add_listener(as_dyn);

        support.start_with("x", async { Ok(()) }).await.unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(support.listener_count(), 0);

        support.stop_with("x", async { Ok(()) }).await.unwrap();
        support.start_with("x", async { Ok(()) }).await.unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_are_serialized() {
        let worker = Arc::new(Worker::new());

        let a = tokio::spawn({
            let worker = worker.clone();
            async move { worker.start().await }
        });
        let b = tokio::spawn({
            let worker = worker.clone();
            async move { worker.start().await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(worker.state(), LifecycleState::Started);
    }

    #[test]
    fn test_owner_claim() {
        let support = LifecycleSupport::new();
        assert!(support.claim_owner(1));
        assert!(support.claim_owner(1));
        assert!(!support.claim_owner(2));
        support.release_owner(2);
        assert!(!support.claim_owner(2));
        support.release_owner(1);
        assert!(support.claim_owner(2));
    }
}
