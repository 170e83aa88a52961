//! Request-scoped resources that must stop with their owner.
//!
//! Handlers sometimes create long-lived resources while serving a request:
//! an outbound client, a background poller, a pooled session. Those
//! resources are not known when the server is assembled, but they must still
//! be stopped when the server stops.
//!
//! A [`ShutdownBridge`] is registered as a lifecycle listener on the owning
//! component. It keeps its own [`Container`] of attached resources, starts it
//! when the owner starts and stops it once the owner has stopped. Handlers
//! reach it through a cloneable [`Scope`] handle.
//!
//! A listener cannot fail the owner's stop, so a failure while stopping the
//! resources is kept until the owner collects it with
//! [`ShutdownBridge::take_close_error`].
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis_core::{Container, Lifecycle, LifecycleState, LifecycleSupport, ShutdownBridge};
//!
//! struct Client {
//!     lifecycle: LifecycleSupport,
//! }
//!
//! impl Lifecycle for Client {
//!     fn lifecycle(&self) -> &LifecycleSupport {
//!         &self.lifecycle
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let server = Container::new("server");
//! let bridge = ShutdownBridge::install(&server);
//! server.start().await.unwrap();
//!
//! // Later, while serving a request:
//! let client = Arc::new(Client { lifecycle: LifecycleSupport::new() });
//! client.start().await.unwrap();
//! bridge.scope().attach(client.clone()).await.unwrap();
//!
//! server.stop().await.unwrap();
//! assert_eq!(client.state(), LifecycleState::Stopped);
//! # });
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bean::Bean;
use crate::container::Container;
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{Lifecycle, LifecycleListener, LifecycleState};

/// Ties dynamically attached resources to the lifecycle of an owner.
pub struct ShutdownBridge {
    resources: Container,
    close_error: Mutex<Option<LifecycleError>>,
}

impl ShutdownBridge {
    /// Creates a bridge whose resource container is named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            resources: Container::new(name),
            close_error: Mutex::new(None),
        }
    }

    /// Creates a bridge and registers it on `owner`, both as a lifecycle
    /// listener and as an unmanaged bean so it shows up in dumps and lookups.
    pub fn install(owner: &Container) -> Arc<Self> {
        let bridge = Arc::new(Self::new(format!("{}-resources", owner.name())));
        owner.add_lifecycle_listener(bridge.clone());
        owner.add_bean(Bean::new(bridge.clone()).named(bridge.resources.name()), false);
        bridge
    }

    /// Returns a handle for attaching resources.
    #[must_use]
    pub fn scope(self: &Arc<Self>) -> Scope {
        Scope {
            bridge: self.clone(),
        }
    }

    /// Returns the container holding the attached resources.
    #[must_use]
    pub fn resources(&self) -> &Container {
        &self.resources
    }

    /// Takes the error of the last failed resource stop, if any.
    ///
    /// Owners call this after their own stop so that a resource that failed
    /// to stop is reported like any other bean.
    pub fn take_close_error(&self) -> Option<LifecycleError> {
        self.close_error.lock().take()
    }
}

#[async_trait]
impl LifecycleListener for ShutdownBridge {
    async fn on_starting(&self, _component: &str) -> LifecycleResult {
        match self.resources.state() {
            LifecycleState::Stopped => self.resources.start().await,
            LifecycleState::Failed => {
                tracing::warn!(
                    scope = %self.resources.name(),
                    "attached resources failed to stop earlier, scope stays closed"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_failure(&self, component: &str, _error: &LifecycleError) {
        self.close(component).await;
    }

    async fn on_stopped(&self, component: &str) {
        self.close(component).await;
    }
}

impl ShutdownBridge {
    async fn close(&self, owner: &str) {
        let count = self.resources.len();
        if let Err(e) = self.resources.stop().await {
            tracing::warn!(owner, error = %e, "attached resources did not stop cleanly");
            *self.close_error.lock() = Some(e);
        } else if count > 0 {
            tracing::debug!(owner, count, "attached resources stopped");
        }
    }
}

impl fmt::Debug for ShutdownBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownBridge")
            .field("resources", &self.resources)
            .finish()
    }
}

/// Handle for attaching resources to a [`ShutdownBridge`].
#[derive(Clone)]
pub struct Scope {
    bridge: Arc<ShutdownBridge>,
}

impl Scope {
    /// Attaches a lifecycle component. It is stopped when the owner stops.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ScopeClosed`](crate::LifecycleError::ScopeClosed)
    /// if the owner has already finished stopping; the component has then been
    /// stopped in place of being attached.
    pub async fn attach<T: Lifecycle + 'static>(&self, component: Arc<T>) -> LifecycleResult {
        self.bridge.resources.attach(Bean::component(component)).await
    }

    /// Attaches a prepared bean.
    ///
    /// # Errors
    ///
    /// See [`Scope::attach`].
    pub async fn attach_bean(&self, bean: Bean) -> LifecycleResult {
        self.bridge.resources.attach(bean).await
    }

    /// Detaches a resource without stopping it. Returns `false` if it was not attached.
    pub fn detach<T: ?Sized>(&self, resource: &Arc<T>) -> bool {
        self.bridge.resources.remove_bean(resource)
    }

    /// Returns `true` while attaching is possible.
    pub fn is_open(&self) -> bool {
        !self.bridge.resources.is_sealed()
    }

    /// Returns the number of attached resources.
    pub fn len(&self) -> usize {
        self.bridge.resources.len()
    }

    /// Returns `true` if nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.bridge.resources.is_empty()
    }

    /// Returns the attached resources exposing view `T`.
    pub fn get_beans<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.bridge.resources.get_beans()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.bridge.resources.name())
            .field("attached", &self.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSupport;

    struct Resource {
        lifecycle: LifecycleSupport,
    }

    impl Resource {
        async fn started() -> Arc<Self> {
            let resource = Arc::new(Self {
                lifecycle: LifecycleSupport::new(),
            });
            resource.start().await.unwrap();
            resource
        }
    }

    impl Lifecycle for Resource {
        fn name(&self) -> &str {
            "resource"
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }
    }

    #[tokio::test]
    async fn test_attached_resource_stops_with_owner() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);
        owner.start().await.unwrap();

        let resource = Resource::started().await;
        let scope = bridge.scope();
        scope.attach(resource.clone()).await.unwrap();
        assert_eq!(scope.len(), 1);

        owner.stop().await.unwrap();
        assert_eq!(resource.state(), LifecycleState::Stopped);
        assert!(scope.is_empty());
        assert!(!scope.is_open());
    }

    #[tokio::test]
    async fn test_attach_after_owner_stopped() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);
        owner.start().await.unwrap();
        owner.stop().await.unwrap();

        let resource = Resource::started().await;
        let err = bridge.scope().attach(resource.clone()).await.unwrap_err();

        assert!(matches!(err, LifecycleError::ScopeClosed { .. }));
        assert_eq!(resource.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_reopens_scope() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);

        owner.start().await.unwrap();
        owner.stop().await.unwrap();
        owner.start().await.unwrap();

        let scope = bridge.scope();
        assert!(scope.is_open());
        scope.attach(Resource::started().await).await.unwrap();
        owner.stop().await.unwrap();
        assert!(scope.is_empty());
    }

    struct Stuck {
        lifecycle: LifecycleSupport,
    }

    #[async_trait]
    impl Lifecycle for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }

        async fn do_stop(&self) -> LifecycleResult {
            Err(LifecycleError::stop_failed("stuck", "still busy"))
        }
    }

    #[tokio::test]
    async fn test_resource_stop_failure_is_kept_for_owner() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);
        owner.start().await.unwrap();

        let stuck = Arc::new(Stuck {
            lifecycle: LifecycleSupport::new(),
        });
        stuck.start().await.unwrap();
        bridge.scope().attach(stuck.clone()).await.unwrap();

        owner.stop().await.unwrap();
        assert_eq!(stuck.state(), LifecycleState::Failed);
        assert!(!bridge.scope().is_open());

        let err = bridge.take_close_error().unwrap();
        assert!(matches!(err, LifecycleError::CascadeFailed { ref component, .. } if component == "server-resources"));
        assert!(bridge.take_close_error().is_none());
    }

    #[tokio::test]
    async fn test_detach_leaves_resource_running() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);
        owner.start().await.unwrap();

        let resource = Resource::started().await;
        let scope = bridge.scope();
        scope.attach(resource.clone()).await.unwrap();
        assert!(scope.detach(&resource));

        owner.stop().await.unwrap();
        assert_eq!(resource.state(), LifecycleState::Started);
    }

    #[test]
    fn test_install_registers_bridge_bean() {
        let owner = Container::new("server");
        let bridge = ShutdownBridge::install(&owner);

        assert!(owner.contains(&bridge));
        assert_eq!(owner.is_managed(&bridge), Some(false));
        assert_eq!(owner.lifecycle().listener_count(), 1);
        assert!(owner.get_bean::<ShutdownBridge>().is_some());
    }
}
