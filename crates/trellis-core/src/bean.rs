//! Beans: identity-tracked objects registered in a [`Container`](crate::Container).
//!
//! A [`Bean`] wraps a shared (`Arc`) instance together with the capability
//! views it can be looked up by. Every bean is visible under its concrete
//! type; components built with [`Bean::component`] are additionally visible
//! as `dyn Lifecycle`, and further trait-object views can be added with
//! [`Bean::with_view`].
//!
//! Identity is the address of the shared allocation, so the same `Arc`
//! (or any clone of it, or any trait-object coercion of it) always maps to
//! the same [`BeanId`].

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::lifecycle::Lifecycle;

/// Identity of a bean: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BeanId(usize);

impl BeanId {
    /// Returns the identity of `value`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use trellis_core::BeanId;
    ///
    /// let a = Arc::new(42_u32);
    /// let b = a.clone();
    /// assert_eq!(BeanId::of(&a), BeanId::of(&b));
    /// assert_ne!(BeanId::of(&a), BeanId::of(&Arc::new(42_u32)));
    /// ```
    #[must_use]
    pub fn of<T: ?Sized>(value: &Arc<T>) -> Self {
        Self(Arc::as_ptr(value).cast::<()>() as usize)
    }
}

/// An object registered (or about to be registered) in a container.
#[derive(Clone)]
pub struct Bean {
    id: BeanId,
    name: String,
    type_name: &'static str,
    views: Vec<(TypeId, Arc<dyn Any + Send + Sync>)>,
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

impl Bean {
    /// Wraps a plain object. It is visible under its concrete type only and
    /// never takes part in lifecycle cascades.
    pub fn new<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        let type_name = std::any::type_name::<T>();
        Self {
            id: BeanId::of(&value),
            name: short_type_name(type_name).to_string(),
            type_name,
            views: vec![(TypeId::of::<T>(), Arc::new(value) as Arc<dyn Any + Send + Sync>)],
            lifecycle: None,
        }
    }

    /// Wraps a lifecycle component. It is visible under its concrete type and
    /// as `dyn Lifecycle`, and is named after [`Lifecycle::name`].
    pub fn component<T: Lifecycle + 'static>(value: Arc<T>) -> Self {
        let lifecycle: Arc<dyn Lifecycle> = value.clone();
        let name = value.name().to_string();
        let mut bean = Self::new(value).with_view::<dyn Lifecycle>(lifecycle.clone());
        bean.name = name;
        bean.lifecycle = Some(lifecycle);
        bean
    }

    /// Adds a capability view, typically a trait object of the same instance.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use trellis_core::{Bean, Container};
    ///
    /// trait Greeter: Send + Sync {
    ///     fn greet(&self) -> String;
    /// }
    ///
    /// struct English;
    /// impl Greeter for English {
    ///     fn greet(&self) -> String {
    ///         "hello".into()
    ///     }
    /// }
    ///
    /// let english = Arc::new(English);
    /// let container = Container::new("app");
    /// container.add_bean(
    ///     Bean::new(english.clone()).with_view::<dyn Greeter>(english),
    ///     false,
    /// );
    ///
    /// let greeters = container.get_beans::<dyn Greeter>();
    /// assert_eq!(greeters[0].greet(), "hello");
    /// ```
    pub fn with_view<V: ?Sized + Send + Sync + 'static>(mut self, view: Arc<V>) -> Self {
        debug_assert_eq!(
            BeanId::of(&view),
            self.id,
            "a view must refer to the same instance as the bean"
        );
        let key = TypeId::of::<V>();
        self.views.retain(|(existing, _)| *existing != key);
        self.views
            .push((key, Arc::new(view) as Arc<dyn Any + Send + Sync>));
        self
    }

    /// Overrides the bean name used in logs and diagnostics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the bean identity.
    #[must_use]
    pub fn id(&self) -> BeanId {
        self.id
    }

    /// Returns the bean name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the concrete type name of the wrapped instance.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the lifecycle view, if the bean is a component.
    #[must_use]
    pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
        self.lifecycle.as_ref()
    }

    /// Returns the instance as `V` if the bean exposes that view.
    #[must_use]
    pub fn view<V: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        let key = TypeId::of::<V>();
        self.views
            .iter()
            .find(|(id, _)| *id == key)
            .and_then(|(_, any)| any.downcast_ref::<Arc<V>>())
            .cloned()
    }

    /// Returns `true` if the bean exposes view `V`.
    #[must_use]
    pub fn has_view<V: ?Sized + 'static>(&self) -> bool {
        let key = TypeId::of::<V>();
        self.views.iter().any(|(id, _)| *id == key)
    }
}

impl fmt::Debug for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bean")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("views", &self.views.len())
            .field("lifecycle", &self.lifecycle.as_ref().map(|l| l.state()))
            .finish()
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSupport;

    struct Plain;

    struct Worker {
        lifecycle: LifecycleSupport,
    }

    #[async_trait::async_trait]
    impl Lifecycle for Worker {
        fn name(&self) -> &str {
            "worker"
        }

        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lifecycle
        }
    }

    trait Marker: Send + Sync {}
    impl Marker for Plain {}

    #[test]
    fn test_plain_bean() {
        let bean = Bean::new(Arc::new(Plain));
        assert_eq!(bean.name(), "Plain");
        assert!(bean.lifecycle().is_none());
        assert!(bean.view::<Plain>().is_some());
        assert!(bean.view::<dyn Lifecycle>().is_none());
    }

    #[test]
    fn test_component_bean() {
        let worker = Arc::new(Worker {
            lifecycle: LifecycleSupport::new(),
        });
        let bean = Bean::component(worker.clone());

        assert_eq!(bean.name(), "worker");
        assert_eq!(bean.id(), BeanId::of(&worker));
        assert!(bean.lifecycle().is_some());
        assert!(bean.has_view::<dyn Lifecycle>());
        assert!(bean.has_view::<Worker>());
    }

    #[test]
    fn test_trait_view_shares_identity() {
        let plain = Arc::new(Plain);
        let as_marker: Arc<dyn Marker> = plain.clone();
        let bean = Bean::new(plain.clone()).with_view::<dyn Marker>(as_marker.clone());

        assert_eq!(BeanId::of(&as_marker), BeanId::of(&plain));
        let marker = bean.view::<dyn Marker>().unwrap();
        assert_eq!(BeanId::of(&marker), bean.id());
    }

    #[test]
    fn test_named() {
        let bean = Bean::new(Arc::new(Plain)).named("custom");
        assert_eq!(bean.name(), "custom");
        assert!(bean.type_name().ends_with("Plain"));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("a::b::Thing"), "Thing");
        assert_eq!(short_type_name("a::Wrap<b::Inner>"), "Wrap");
        assert_eq!(short_type_name("u32"), "u32");
    }
}
