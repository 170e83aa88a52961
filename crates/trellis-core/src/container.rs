//! Lifecycle-aware bean container.
//!
//! A [`Container`] holds an ordered list of [`Bean`]s. Beans registered as
//! *managed* take part in the container's own lifecycle: they are started in
//! registration order when the container starts, and stopped in reverse
//! registration order when it stops. Unmanaged beans are only tracked, so
//! they can be looked up by type and show up in [`Container::dump`].
//!
//! Containers nest: a container is itself a [`Lifecycle`] component and can
//! be registered as a managed bean of another container, forming the
//! component tree rooted at the server.
//!
//! # Stopping while beans are being attached
//!
//! The stop cascade works on snapshots of the bean list. After each pass it
//! takes a fresh snapshot and stops whatever managed beans appeared in the
//! meantime, until a pass finds nothing new. The container is then *sealed*:
//! [`Container::attach`] refuses further beans (stopping them instead) until
//! the container is started again. Beans added through `attach` are
//! transient and are removed once the container has stopped.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis_core::{Bean, Container, Lifecycle, LifecycleState};
//!
//! # tokio_test::block_on(async {
//! let root = Container::new("root");
//! let child = Arc::new(Container::new("child"));
//! root.add_bean(Bean::component(child.clone()), true);
//!
//! root.start().await.unwrap();
//! assert_eq!(child.state(), LifecycleState::Started);
//!
//! root.stop().await.unwrap();
//! assert_eq!(child.state(), LifecycleState::Stopped);
//! # });
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::bean::{Bean, BeanId};
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{Lifecycle, LifecycleState, LifecycleSupport};

static NEXT_CONTAINER_ID: AtomicUsize = AtomicUsize::new(1);

struct BeanEntry {
    bean: Bean,
    managed: bool,
    persistent: bool,
}

#[derive(Default)]
struct Registry {
    entries: Vec<BeanEntry>,
    sealed: bool,
}

/// An ordered, lifecycle-aware collection of beans.
pub struct Container {
    id: usize,
    name: String,
    registry: RwLock<Registry>,
    lifecycle: LifecycleSupport,
}

impl Container {
    /// Creates an empty, stopped container.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            registry: RwLock::new(Registry::default()),
            lifecycle: LifecycleSupport::new(),
        }
    }

    /// Registers a bean.
    ///
    /// With `managed = true` a lifecycle bean is started and stopped together
    /// with this container. A component already managed by another container
    /// is registered unmanaged instead, so it is never stopped twice. Beans
    /// without a lifecycle are always unmanaged.
    ///
    /// Adding a bean does not start it, even if the container is running.
    ///
    /// Returns `false` if the same instance is already registered.
    pub fn add_bean(&self, bean: Bean, managed: bool) -> bool {
        let mut registry = self.registry.write();
        self.insert(&mut registry, bean, managed, true)
    }

    /// Registers a lifecycle component as a managed bean.
    pub fn add_component<T: Lifecycle + 'static>(&self, component: Arc<T>) -> bool {
        self.add_bean(Bean::component(component), true)
    }

    /// Registers a transient managed bean while the container is live.
    ///
    /// Transient beans are stopped with the container and then forgotten.
    /// Attaching to a container that has finished stopping stops the bean
    /// right away.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ScopeClosed`] if the container is sealed or
    /// failed, or the bean's own stop error if stopping the rejected bean
    /// failed.
    pub async fn attach(&self, bean: Bean) -> LifecycleResult {
        let rejected = {
            let mut registry = self.registry.write();
            if registry.sealed || self.state() == LifecycleState::Failed {
                Some(bean)
            } else {
                self.insert(&mut registry, bean, true, false);
                None
            }
        };

        let Some(bean) = rejected else {
            return Ok(());
        };

        tracing::debug!(
            container = %self.name,
            bean = %bean.name(),
            "container sealed, stopping bean instead of attaching"
        );
        if let Some(lifecycle) = bean.lifecycle() {
            lifecycle.stop().await?;
        }
        Err(LifecycleError::ScopeClosed {
            scope: self.name.clone(),
            bean: bean.name().to_string(),
        })
    }

    /// Unregisters the bean backed by `value`. Does not stop it.
    ///
    /// Returns `false` if it was not registered.
    pub fn remove_bean<T: ?Sized>(&self, value: &Arc<T>) -> bool {
        self.remove_id(BeanId::of(value)).is_some()
    }

    /// Stops the bean backed by `value` if it is running, then unregisters it.
    ///
    /// Returns `Ok(false)` if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns the bean's stop error. The bean is unregistered regardless.
    pub async fn remove_and_stop_bean<T: ?Sized>(&self, value: &Arc<T>) -> LifecycleResult<bool> {
        let id = BeanId::of(value);
        let lifecycle = {
            let registry = self.registry.read();
            match registry.entries.iter().find(|e| e.bean.id() == id) {
                Some(entry) => entry.bean.lifecycle().cloned(),
                None => return Ok(false),
            }
        };

        let stopped = match lifecycle {
            Some(lifecycle) => lifecycle.stop().await,
            None => Ok(()),
        };
        self.remove_id(id);
        stopped.map(|()| true)
    }

    /// Returns every registered bean exposing view `T`, in registration order.
    pub fn get_beans<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.registry
            .read()
            .entries
            .iter()
            .filter_map(|e| e.bean.view::<T>())
            .collect()
    }

    /// Returns the first registered bean exposing view `T`.
    pub fn get_bean<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.registry
            .read()
            .entries
            .iter()
            .find_map(|e| e.bean.view::<T>())
    }

    /// Returns `true` if the bean backed by `value` is registered.
    pub fn contains<T: ?Sized>(&self, value: &Arc<T>) -> bool {
        self.contains_id(BeanId::of(value))
    }

    /// Returns `Some(true)` if the bean backed by `value` is managed,
    /// `Some(false)` if it is unmanaged, and `None` if it is not registered.
    pub fn is_managed<T: ?Sized>(&self, value: &Arc<T>) -> Option<bool> {
        let id = BeanId::of(value);
        self.registry
            .read()
            .entries
            .iter()
            .find(|e| e.bean.id() == id)
            .map(|e| e.managed)
    }

    /// Returns the bean names in registration order.
    pub fn bean_names(&self) -> Vec<String> {
        self.registry
            .read()
            .entries
            .iter()
            .map(|e| e.bean.name().to_string())
            .collect()
    }

    /// Returns the number of registered beans.
    pub fn len(&self) -> usize {
        self.registry.read().entries.len()
    }

    /// Returns `true` if no beans are registered.
    pub fn is_empty(&self) -> bool {
        self.registry.read().entries.is_empty()
    }

    /// Returns `true` once a stop has completed and until the next start.
    pub fn is_sealed(&self) -> bool {
        self.registry.read().sealed
    }

    /// Renders the component tree below this container.
    ///
    /// ```text
    /// server [STARTED]
    ///  +- http (managed) [STARTED]
    ///  +- resources (managed) [STARTED]
    ///  |   +- pool (managed) [STARTED]
    ///  +- Settings (unmanaged)
    /// ```
    pub fn dump(&self) -> String {
        let mut out = format!("{} [{}]\n", self.name, self.state());
        self.dump_into(&mut out, "");
        out
    }

    fn dump_into(&self, out: &mut String, indent: &str) {
        let entries: Vec<(Bean, bool)> = self
            .registry
            .read()
            .entries
            .iter()
            .map(|e| (e.bean.clone(), e.managed))
            .collect();

        for (bean, managed) in entries {
            let kind = if managed { "managed" } else { "unmanaged" };
            let _ = match bean.lifecycle() {
                Some(lifecycle) => writeln!(
                    out,
                    "{indent} +- {} ({kind}) [{}]",
                    bean.name(),
                    lifecycle.state()
                ),
                None => writeln!(out, "{indent} +- {} ({kind})", bean.name()),
            };
            if let Some(nested) = bean.view::<Container>() {
                nested.dump_into(out, &format!("{indent} |  "));
            }
        }
    }

    fn insert(&self, registry: &mut Registry, bean: Bean, managed: bool, persistent: bool) -> bool {
        if registry.entries.iter().any(|e| e.bean.id() == bean.id()) {
            tracing::trace!(container = %self.name, bean = %bean.name(), "bean already registered");
            return false;
        }

        let managed = managed
            && bean.lifecycle().is_some_and(|lifecycle| {
                let claimed = lifecycle.lifecycle().claim_owner(self.id);
                if !claimed {
                    tracing::warn!(
                        container = %self.name,
                        bean = %bean.name(),
                        "bean is managed by another container, registering it unmanaged"
                    );
                }
                claimed
            });

        tracing::debug!(container = %self.name, bean = %bean.name(), managed, persistent, "bean added");
        registry.entries.push(BeanEntry {
            bean,
            managed,
            persistent,
        });
        true
    }

    fn remove_id(&self, id: BeanId) -> Option<Bean> {
        let entry = {
            let mut registry = self.registry.write();
            let index = registry.entries.iter().position(|e| e.bean.id() == id)?;
            registry.entries.remove(index)
        };
        self.release(&entry);
        tracing::debug!(container = %self.name, bean = %entry.bean.name(), "bean removed");
        Some(entry.bean)
    }

    fn release(&self, entry: &BeanEntry) {
        if entry.managed {
            if let Some(lifecycle) = entry.bean.lifecycle() {
                lifecycle.lifecycle().release_owner(self.id);
            }
        }
    }

    fn contains_id(&self, id: BeanId) -> bool {
        self.registry.read().entries.iter().any(|e| e.bean.id() == id)
    }

    fn managed_beans(&self) -> Vec<(BeanId, String, Arc<dyn Lifecycle>)> {
        self.registry
            .read()
            .entries
            .iter()
            .filter(|e| e.managed)
            .filter_map(|e| {
                e.bean
                    .lifecycle()
                    .map(|l| (e.bean.id(), e.bean.name().to_string(), l.clone()))
            })
            .collect()
    }

    /// Takes the next stop pass: managed beans not yet visited, newest first.
    /// An empty pass seals the container and drops its transient beans.
    fn next_stop_pass(
        &self,
        visited: &HashSet<BeanId>,
    ) -> Vec<(BeanId, String, Arc<dyn Lifecycle>)> {
        let mut registry = self.registry.write();
        let pass: Vec<_> = registry
            .entries
            .iter()
            .rev()
            .filter(|e| e.managed && !visited.contains(&e.bean.id()))
            .filter_map(|e| {
                e.bean
                    .lifecycle()
                    .map(|l| (e.bean.id(), e.bean.name().to_string(), l.clone()))
            })
            .collect();

        if pass.is_empty() {
            drop(registry);
            for entry in &self.seal() {
                self.release(entry);
            }
        }
        pass
    }

    /// Closes the container to new attachments and takes its transient beans.
    fn seal(&self) -> Vec<BeanEntry> {
        let mut registry = self.registry.write();
        registry.sealed = true;
        let (transient, persistent): (Vec<_>, Vec<_>) = std::mem::take(&mut registry.entries)
            .into_iter()
            .partition(|e| !e.persistent);
        registry.entries = persistent;
        if !transient.is_empty() {
            tracing::debug!(container = %self.name, count = transient.len(), "transient beans released");
        }
        transient
    }

    /// Seals after a failed start, stopping beans attached in the meantime.
    async fn close_after_failed_start(&self) {
        for entry in self.seal() {
            if entry.managed {
                if let Some(lifecycle) = entry.bean.lifecycle() {
                    if let Err(e) = lifecycle.stop().await {
                        tracing::warn!(
                            container = %self.name,
                            bean = %entry.bean.name(),
                            error = %e,
                            "attached bean failed to stop after a failed start"
                        );
                    }
                }
            }
            self.release(&entry);
        }
    }
}

#[async_trait]
impl Lifecycle for Container {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }

    async fn do_start(&self) -> LifecycleResult {
        self.registry.write().sealed = false;

        let mut started: Vec<Arc<dyn Lifecycle>> = Vec::new();
        for (_, name, bean) in self.managed_beans() {
            if matches!(bean.state(), LifecycleState::Starting | LifecycleState::Started) {
                tracing::trace!(container = %self.name, bean = %name, state = %bean.state(), "bean already running");
                continue;
            }

            if let Err(e) = bean.start().await {
                tracing::error!(container = %self.name, bean = %name, error = %e, "bean failed to start");
                for done in started.iter().rev() {
                    if let Err(stop_err) = done.stop().await {
                        tracing::warn!(
                            container = %self.name,
                            bean = %done.name(),
                            error = %stop_err,
                            "bean failed to stop while unwinding a failed start"
                        );
                    }
                }
                self.close_after_failed_start().await;
                return Err(LifecycleError::start_failed(self.name.clone(), e));
            }
            started.push(bean);
        }
        Ok(())
    }

    async fn do_stop(&self) -> LifecycleResult {
        let mut visited = HashSet::new();
        let mut failures = Vec::new();

        loop {
            let pass = self.next_stop_pass(&visited);
            if pass.is_empty() {
                break;
            }

            for (id, name, bean) in pass {
                visited.insert(id);
                if !self.contains_id(id) {
                    let race = LifecycleError::DetachedDuringStop {
                        component: self.name.clone(),
                        bean: name,
                    };
                    tracing::debug!(error = %race, "skipping bean");
                    continue;
                }

                if let Err(e) = bean.stop().await {
                    if e.is_benign() {
                        tracing::debug!(container = %self.name, bean = %name, error = %e, "ignored stop race");
                    } else {
                        tracing::warn!(container = %self.name, bean = %name, error = %e, "bean failed to stop");
                        failures.push(e);
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::CascadeFailed {
                component: self.name.clone(),
                failures,
            })
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("beans", &self.bean_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Part {
        name: String,
        log: Log,
        fail_start: bool,
        fail_stop: bool,
        lifecycle: LifecycleSupport,
    }

    impl Part {
        fn new(name: &str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log: log.clone(),
                fail_start: false,
                fail_stop: false,
                lifecycle: LifecycleSupport::new(),
            })
        }

        fn failing(name: &str, log: &Log, fail_start: bool, fail_stop: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log: log.clone(),
                fail_start,
                fail_stop,
                lifecycle: LifecycleSupport::new(),
            })
        }
    }

    #[async_trait]
    impl Lifecycle for Part {
        fn name(&self) -> &str {
            &self.name
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }

        async fn do_start(&self) -> LifecycleResult {
            self.log.lock().push(format!("start {}", self.name));
            if self.fail_start {
                return Err(LifecycleError::start_failed(self.name.clone(), "refused"));
            }
            Ok(())
        }

        async fn do_stop(&self) -> LifecycleResult {
            self.log.lock().push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err(LifecycleError::stop_failed(self.name.clone(), "stuck"));
            }
            Ok(())
        }
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_start_and_stop_order() {
        let log = log();
        let container = Container::new("root");
        for name in ["a", "b", "c"] {
            container.add_component(Part::new(name, &log));
        }

        container.start().await.unwrap();
        container.stop().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let log = log();
        let container = Container::new("root");
        container.add_component(Part::new("a", &log));

        container.start().await.unwrap();
        container.stop().await.unwrap();
        container.stop().await.unwrap();

        assert_eq!(*log.lock(), vec!["start a", "stop a"]);
    }

    #[tokio::test]
    async fn test_unmanaged_beans_are_not_cascaded() {
        let log = log();
        let container = Container::new("root");
        let part = Part::new("loose", &log);
        container.add_bean(Bean::component(part.clone()), false);

        container.start().await.unwrap();
        container.stop().await.unwrap();

        assert!(log.lock().is_empty());
        assert_eq!(container.is_managed(&part), Some(false));
    }

    #[tokio::test]
    async fn test_already_started_bean_is_skipped() {
        let log = log();
        let container = Container::new("root");
        let part = Part::new("a", &log);
        part.start().await.unwrap();
        container.add_component(part.clone());

        container.start().await.unwrap();
        assert_eq!(*log.lock(), vec!["start a"]);
        container.stop().await.unwrap();
        assert_eq!(part.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_bean_fails_container_start() {
        let log = log();
        let container = Container::new("root");
        let broken = Part::failing("broken", &log, true, false);
        assert!(broken.start().await.is_err());
        assert_eq!(broken.state(), LifecycleState::Failed);

        let first = Part::new("first", &log);
        container.add_component(first.clone());
        container.add_component(broken);

        let err = container.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartFailed { ref component, .. } if component == "root"));
        let cause = std::error::Error::source(&err)
            .and_then(|cause| cause.downcast_ref::<LifecycleError>())
            .unwrap();
        assert!(cause.is_illegal_state());
        assert_eq!(container.state(), LifecycleState::Failed);
        assert_eq!(first.state(), LifecycleState::Stopped);
        assert_eq!(*log.lock(), vec!["start broken", "start first", "stop first"]);
    }

    #[tokio::test]
    async fn test_failed_start_unwinds_started_beans() {
        let log = log();
        let container = Container::new("root");
        container.add_component(Part::new("a", &log));
        container.add_component(Part::failing("b", &log, true, false));
        container.add_component(Part::new("c", &log));

        let err = container.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartFailed { .. }));
        assert_eq!(container.state(), LifecycleState::Failed);
        assert_eq!(*log.lock(), vec!["start a", "start b", "stop a"]);
    }

    #[tokio::test]
    async fn test_stop_collects_failures_and_continues() {
        let log = log();
        let container = Container::new("root");
        container.add_component(Part::new("a", &log));
        container.add_component(Part::failing("b", &log, false, true));
        container.add_component(Part::new("c", &log));

        container.start().await.unwrap();
        let err = container.stop().await.unwrap_err();

        match err {
            LifecycleError::CascadeFailed { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().ends_with(&[
            "stop c".to_string(),
            "stop b".to_string(),
            "stop a".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let log = log();
        let container = Container::new("root");
        let part = Part::new("a", &log);

        assert!(container.add_component(part.clone()));
        assert!(!container.add_component(part.clone()));
        assert_eq!(container.len(), 1);
    }

    #[tokio::test]
    async fn test_component_owned_elsewhere_is_downgraded() {
        let log = log();
        let first = Container::new("first");
        let second = Container::new("second");
        let part = Part::new("shared", &log);

        first.add_component(part.clone());
        second.add_component(part.clone());

        assert_eq!(first.is_managed(&part), Some(true));
        assert_eq!(second.is_managed(&part), Some(false));

        // Once released by the first owner, the second may claim it.
        first.remove_bean(&part);
        second.remove_bean(&part);
        second.add_component(part.clone());
        assert_eq!(second.is_managed(&part), Some(true));
    }

    #[tokio::test]
    async fn test_remove_and_stop_bean() {
        let log = log();
        let container = Container::new("root");
        let part = Part::new("a", &log);
        container.add_component(part.clone());
        container.start().await.unwrap();

        assert!(container.remove_and_stop_bean(&part).await.unwrap());
        assert_eq!(part.state(), LifecycleState::Stopped);
        assert!(!container.contains(&part));
        assert!(!container.remove_and_stop_bean(&part).await.unwrap());
    }

    trait Named: Send + Sync {
        fn label(&self) -> String;
    }

    impl Named for Part {
        fn label(&self) -> String {
            self.name.clone()
        }
    }

    #[tokio::test]
    async fn test_get_beans_by_view() {
        let log = log();
        let container = Container::new("root");
        for name in ["x", "y"] {
            let part = Part::new(name, &log);
            let named: Arc<dyn Named> = part.clone();
            container.add_bean(Bean::component(part).with_view(named), true);
        }
        container.add_bean(Bean::new(Arc::new(7_u32)), false);

        let labels: Vec<String> = container
            .get_beans::<dyn Named>()
            .iter()
            .map(|n| n.label())
            .collect();
        assert_eq!(labels, vec!["x", "y"]);
        assert_eq!(container.get_beans::<dyn Lifecycle>().len(), 2);
        assert_eq!(*container.get_bean::<u32>().unwrap(), 7);
        assert!(container.get_bean::<String>().is_none());
    }

    #[tokio::test]
    async fn test_attach_after_stop_is_refused() {
        let log = log();
        let container = Container::new("scope");
        container.start().await.unwrap();

        let early = Part::new("early", &log);
        early.start().await.unwrap();
        container.attach(Bean::component(early.clone())).await.unwrap();

        container.stop().await.unwrap();
        assert_eq!(early.state(), LifecycleState::Stopped);
        assert!(container.is_empty());
        assert!(container.is_sealed());

        let late = Part::new("late", &log);
        late.start().await.unwrap();
        let err = container.attach(Bean::component(late.clone())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ScopeClosed { .. }));
        assert_eq!(late.state(), LifecycleState::Stopped);

        // A restart reopens the container.
        container.start().await.unwrap();
        assert!(!container.is_sealed());
    }

    #[tokio::test]
    async fn test_attach_after_failed_start_is_refused() {
        let log = log();
        let container = Container::new("scope");
        container.add_component(Part::failing("broken", &log, true, false));
        assert!(container.start().await.is_err());
        assert_eq!(container.state(), LifecycleState::Failed);
        assert!(container.is_sealed());

        let late = Part::new("late", &log);
        late.start().await.unwrap();
        let err = container.attach(Bean::component(late.clone())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ScopeClosed { ref bean, .. } if bean == "late"));
        assert_eq!(late.state(), LifecycleState::Stopped);
        assert!(!container.contains(&late));

        // Stopping a failed container leaves nothing running.
        container.stop().await.unwrap();
        assert_eq!(*log.lock(), vec!["start broken", "start late", "stop late"]);
    }

    /// Attaches a new bean from inside its own stop, as a resource would that
    /// spawns a follow-up resource while closing.
    struct Spawner {
        container: Arc<Container>,
        child: Arc<Part>,
        lifecycle: LifecycleSupport,
    }

    #[async_trait]
    impl Lifecycle for Spawner {
        fn name(&self) -> &str {
            "spawner"
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }

        async fn do_stop(&self) -> LifecycleResult {
            self.child.start().await?;
            self.container
                .attach(Bean::component(self.child.clone()))
                .await
        }
    }

    #[tokio::test]
    async fn test_beans_attached_during_stop_are_stopped() {
        let log = log();
        let container = Arc::new(Container::new("scope"));
        let child = Part::new("child", &log);
        let spawner = Arc::new(Spawner {
            container: container.clone(),
            child: child.clone(),
            lifecycle: LifecycleSupport::new(),
        });

        container.start().await.unwrap();
        spawner.start().await.unwrap();
        container.attach(Bean::component(spawner.clone())).await.unwrap();

        container.stop().await.unwrap();
        assert_eq!(spawner.state(), LifecycleState::Stopped);
        assert_eq!(child.state(), LifecycleState::Stopped);
        assert!(container.is_empty());
    }

    #[tokio::test]
    async fn test_dump_renders_tree() {
        let log = log();
        let root = Container::new("root");
        let nested = Arc::new(Container::new("nested"));
        nested.add_component(Part::new("inner", &log));
        root.add_component(nested.clone());
        root.add_bean(Bean::new(Arc::new(1_u8)).named("settings"), false);

        root.start().await.unwrap();
        let dump = root.dump();

        assert!(dump.starts_with("root [STARTED]"));
        assert!(dump.contains("+- nested (managed) [STARTED]"));
        assert!(dump.contains("|   +- inner (managed) [STARTED]"));
        assert!(dump.contains("+- settings (unmanaged)"));
    }

    #[tokio::test]
    async fn test_concurrent_attach_during_stop() {
        let log = log();
        let container = Arc::new(Container::new("scope"));
        container.start().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let container = container.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let part = Part::new(&format!("p{i}"), &log);
                part.start().await.unwrap();
                let _ = container.attach(Bean::component(part.clone())).await;
                part
            }));
        }
        let stopper = {
            let container = container.clone();
            tokio::spawn(async move { container.stop().await })
        };

        let mut parts = Vec::new();
        for task in tasks {
            parts.push(task.await.unwrap());
        }
        stopper.await.unwrap().unwrap();
        container.stop().await.unwrap();

        // Every part is either stopped by the cascade or refused and stopped.
        for part in parts {
            assert_eq!(part.state(), LifecycleState::Stopped, "{}", part.name);
        }
    }
}
