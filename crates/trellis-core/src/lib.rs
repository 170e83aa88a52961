//! # Trellis Core
//!
//! Lifecycle and component-tree primitives for the Trellis server core.
//!
//! - [`Lifecycle`] / [`LifecycleSupport`] - the start/stop state machine every
//!   component embeds, with [`LifecycleListener`] observers
//! - [`Container`] / [`Bean`] - an ordered, lifecycle-aware bean registry;
//!   containers nest to form the component tree
//! - [`ShutdownBridge`] / [`Scope`] - resources attached while serving
//!   requests, stopped together with their owner
//! - [`LifecycleHooks`] - startup and shutdown callbacks
//! - [`LifecycleError`] - the error type of every transition

#![doc(html_root_url = "https://docs.rs/trellis-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bean;
mod container;
mod error;
mod hooks;
mod lifecycle;
mod scope;

pub use bean::{Bean, BeanId};
pub use container::Container;
pub use error::{BoxError, LifecycleError, LifecycleResult};
pub use hooks::{Hook, HookResult, LifecycleHooks};
pub use lifecycle::{Lifecycle, LifecycleListener, LifecycleState, LifecycleSupport};
pub use scope::{Scope, ShutdownBridge};
