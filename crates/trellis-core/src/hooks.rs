//! Startup and shutdown hooks.
//!
//! [`LifecycleHooks`] collects async callbacks and runs them around a
//! component's transitions. Register it on a component with
//! [`Lifecycle::add_lifecycle_listener`](crate::Lifecycle::add_lifecycle_listener):
//!
//! - **Startup hooks** run in registration order while the component is
//!   `STARTING`. The first failure aborts the start.
//! - **Shutdown hooks** run in reverse registration order after the
//!   component reached `STOPPED`. Every hook runs; failures are collected.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis_core::{Container, Lifecycle, LifecycleHooks};
//!
//! let hooks = LifecycleHooks::new()
//!     .on_startup(|| async { Ok(()) })
//!     .on_shutdown_named("flush", || async { Ok(()) });
//!
//! let server = Container::new("server");
//! server.add_lifecycle_listener(Arc::new(hooks));
//! # tokio_test::block_on(async {
//! server.start().await.unwrap();
//! server.stop().await.unwrap();
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BoxError, LifecycleError, LifecycleResult};
use crate::lifecycle::LifecycleListener;

/// Result type returned by hooks.
pub type HookResult = Result<(), BoxError>;

/// A registered hook callback.
pub type Hook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = HookResult> + Send>> + Send + Sync>;

/// Ordered startup and shutdown callbacks for a component.
#[must_use]
#[derive(Default)]
pub struct LifecycleHooks {
    startup: Vec<(String, Hook)>,
    shutdown: Vec<(String, Hook)>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("startup", &self.startup.len())
            .field("shutdown", &self.shutdown.len())
            .finish()
    }
}

impl LifecycleHooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a startup hook.
    pub fn on_startup<F, Fut>(self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        let name = format!("startup_{}", self.startup.len());
        self.on_startup_named(name, hook)
    }

    /// Registers a named startup hook.
    pub fn on_startup_named<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.startup.push((name.into(), boxed(hook)));
        self
    }

    /// Registers a shutdown hook.
    pub fn on_shutdown<F, Fut>(self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        let name = format!("shutdown_{}", self.shutdown.len());
        self.on_shutdown_named(name, hook)
    }

    /// Registers a named shutdown hook.
    pub fn on_shutdown_named<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.shutdown.push((name.into(), boxed(hook)));
        self
    }

    /// Returns the number of startup hooks.
    pub fn startup_hook_count(&self) -> usize {
        self.startup.len()
    }

    /// Returns the number of shutdown hooks.
    pub fn shutdown_hook_count(&self) -> usize {
        self.shutdown.len()
    }

    /// Appends the hooks of `other`.
    pub fn merge(mut self, other: Self) -> Self {
        self.startup.extend(other.startup);
        self.shutdown.extend(other.shutdown);
        self
    }

    /// Runs the startup hooks in registration order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StartFailed`] naming the failing hook.
    pub async fn run_startup(&self, component: &str) -> LifecycleResult {
        for (name, hook) in &self.startup {
            tracing::debug!(component, hook = %name, "running startup hook");
            if let Err(e) = hook().await {
                tracing::error!(component, hook = %name, error = %e, "startup hook failed");
                return Err(LifecycleError::start_failed(
                    format!("{component}/{name}"),
                    e,
                ));
            }
        }
        Ok(())
    }

    /// Runs every shutdown hook in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::CascadeFailed`] listing each failed hook.
    pub async fn run_shutdown(&self, component: &str) -> LifecycleResult {
        let mut failures = Vec::new();
        for (name, hook) in self.shutdown.iter().rev() {
            tracing::debug!(component, hook = %name, "running shutdown hook");
            if let Err(e) = hook().await {
                tracing::error!(component, hook = %name, error = %e, "shutdown hook failed");
                failures.push(LifecycleError::stop_failed(format!("{component}/{name}"), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::CascadeFailed {
                component: component.to_string(),
                failures,
            })
        }
    }
}

fn boxed<F, Fut>(hook: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move || Box::pin(hook()))
}

#[async_trait]
impl LifecycleListener for LifecycleHooks {
    async fn on_starting(&self, component: &str) -> LifecycleResult {
        self.run_startup(component).await
    }

    async fn on_stopped(&self, component: &str) {
        // Already logged per hook.
        let _ = self.run_shutdown(component).await;
    }
}
