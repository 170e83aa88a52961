//! Error types for lifecycle and container operations.
//!
//! [`LifecycleError`] is the single error type surfaced by every start/stop
//! transition in Trellis. Component-specific failures (a listener that cannot
//! bind, a resource that refuses to close) travel inside it as boxed sources,
//! so callers can still reach the root cause through
//! [`std::error::Error::source`] or [`LifecycleError::find_cause`].
//!
//! # Benign errors
//!
//! Some errors describe shutdown races rather than failures. A bean that
//! detached itself while its container was stopping is reported as
//! [`LifecycleError::DetachedDuringStop`]; the container cascade logs it and
//! moves on. Use [`LifecycleError::is_benign`] to make the same decision.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Boxed error type used for heterogeneous component failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias using [`LifecycleError`].
pub type LifecycleResult<T = ()> = Result<T, LifecycleError>;

/// Errors raised by lifecycle transitions and container operations.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The requested operation is not valid in the component's current state.
    #[error("cannot {operation} '{component}' while it is {state}")]
    IllegalState {
        /// Name of the component.
        component: String,
        /// The attempted operation (`start`, `stop`, ...).
        operation: &'static str,
        /// The state the component was in.
        state: LifecycleState,
    },

    /// A component's start action failed.
    #[error("'{component}' failed to start: {source}")]
    StartFailed {
        /// Name of the component.
        component: String,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// A component's stop action failed.
    #[error("'{component}' failed to stop: {source}")]
    StopFailed {
        /// Name of the component.
        component: String,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// A lifecycle listener vetoed a start.
    #[error("start of '{component}' vetoed by listener: {reason}")]
    Vetoed {
        /// Name of the component.
        component: String,
        /// Reason given by the listener.
        reason: String,
    },

    /// One or more beans failed while a container was stopping.
    #[error("'{component}' stopped with {} failure(s): {}", .failures.len(), summarize(.failures))]
    CascadeFailed {
        /// Name of the container.
        component: String,
        /// The individual failures, in the order they occurred.
        failures: Vec<LifecycleError>,
    },

    /// An attach was attempted on a scope whose owner has finished stopping.
    #[error("scope '{scope}' is closed; '{bean}' was stopped instead of attached")]
    ScopeClosed {
        /// Name of the closed scope.
        scope: String,
        /// Name of the bean that could not be attached.
        bean: String,
    },

    /// A bean detached itself between the stop snapshot and its stop call.
    #[error("'{bean}' detached from '{component}' during stop")]
    DetachedDuringStop {
        /// Name of the container that was stopping.
        component: String,
        /// Name of the bean that went away.
        bean: String,
    },
}

impl LifecycleError {
    /// Creates an [`IllegalState`](Self::IllegalState) error.
    pub fn illegal_state(
        component: impl Into<String>,
        operation: &'static str,
        state: LifecycleState,
    ) -> Self {
        Self::IllegalState {
            component: component.into(),
            operation,
            state,
        }
    }

    /// Creates a [`StartFailed`](Self::StartFailed) error from any error type.
    pub fn start_failed(component: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StartFailed {
            component: component.into(),
            source: source.into(),
        }
    }

    /// Creates a [`StopFailed`](Self::StopFailed) error from any error type.
    pub fn stop_failed(component: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StopFailed {
            component: component.into(),
            source: source.into(),
        }
    }

    /// Creates a [`Vetoed`](Self::Vetoed) error.
    pub fn vetoed(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Vetoed {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that describe a tolerated shutdown race.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::DetachedDuringStop { .. })
    }

    /// Returns `true` if this is an [`IllegalState`](Self::IllegalState) error.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }

    /// Walks the source chain (including nested cascade failures) looking for
    /// an error of type `E`.
    ///
    /// # Example
    ///
    /// ```
    /// use trellis_core::LifecycleError;
    ///
    /// let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken");
    /// let err = LifecycleError::start_failed("http", io);
    ///
    /// let cause = err.find_cause::<std::io::Error>().unwrap();
    /// assert_eq!(cause.kind(), std::io::ErrorKind::AddrInUse);
    /// ```
    #[must_use]
    pub fn find_cause<E: std::error::Error + 'static>(&self) -> Option<&E> {
        if let Self::CascadeFailed { failures, .. } = self {
            return failures.iter().find_map(LifecycleError::find_cause::<E>);
        }

        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            if let Some(nested) = err.downcast_ref::<LifecycleError>() {
                if !std::ptr::eq(nested, self) {
                    return nested.find_cause::<E>();
                }
            }
            current = err.source();
        }
        None
    }
}

fn summarize(failures: &[LifecycleError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
