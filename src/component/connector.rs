//! Wiring of a child component into its parent.
//!
//! A [`Connector`] says how a child's state is derived when it installs:
//!
//! - **parent bindings** alias child props to props of the parent state
//! - a **projection** computes further bindings or initial values from a
//!   snapshot of the parent state (it may run on a detection worker)
//! - **global bindings** alias child props to props of a [`GlobalStore`]
//! - **interceptors** handle public actions sent by other components
//!
//! A [`Dependant`] pairs the child component with its connector.
//!
//! # Example
//!
//! ```rust
//! use canopy::component::Connector;
//!
//! let connector = Connector::new()
//!     .bind_parent("count", "count")
//!     .project(|parent, binder| {
//!         let title: String = parent.get("title")?;
//!         binder.assign("caption", format!("{title}!"));
//!         Ok(())
//!     });
//! assert_eq!(connector.parent_bindings().len(), 1);
//! ```

use super::Component;
use crate::domain::{Action, Payload, Result};
use crate::effect::InterceptorCollector;
use crate::store::{GlobalStore, StateApplier};
use crate::state::State;
use crate::component::ComponentContext;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Parent-state projection, run with a snapshot of the parent state.
pub type Projection = Arc<dyn Fn(&State, &mut ProjectionBinder) -> Result<()> + Send + Sync>;

/// Collects what a [`Projection`] derives from the parent state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProjectionBinder {
    aliases: Vec<(String, String)>,
    values: Vec<(String, Value)>,
}

impl ProjectionBinder {
    /// Aliases the child prop `child_key` to the parent prop `parent_key`.
    pub fn bind(&mut self, child_key: impl Into<String>, parent_key: impl Into<String>) -> &mut Self {
        self.aliases.push((child_key.into(), parent_key.into()));
        self
    }

    /// Sets the initial value of the child prop `child_key`.
    pub fn assign(&mut self, child_key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.push((child_key.into(), value.into()));
        self
    }

    /// Returns the `(child, parent)` aliases.
    #[must_use]
    pub fn aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    /// Returns the assigned initial values.
    #[must_use]
    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }
}

/// Alias of a child prop to a global store prop.
#[derive(Clone)]
pub struct GlobalBinding {
    pub(crate) store: Rc<GlobalStore>,
    pub(crate) child_key: String,
    pub(crate) global_key: String,
}

impl fmt::Debug for GlobalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalBinding")
            .field("store", &self.store.name())
            .field("child_key", &self.child_key)
            .field("global_key", &self.global_key)
            .finish()
    }
}

/// How a child's state and event scope derive from its parent.
#[derive(Default, Clone)]
pub struct Connector {
    parent_bindings: Vec<(String, String)>,
    projection: Option<Projection>,
    globals: Vec<GlobalBinding>,
    interceptors: InterceptorCollector,
}

impl Connector {
    /// Creates a connector that derives nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aliases the child prop `child_key` to the parent prop `parent_key`.
    #[must_use]
    pub fn bind_parent(mut self, child_key: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.parent_bindings.push((child_key.into(), parent_key.into()));
        self
    }

    /// Aliases the child prop `child_key` to the prop `global_key` of
    /// `store`. The child can read the prop but never write it.
    #[must_use]
    pub fn bind_global(
        mut self,
        store: &Rc<GlobalStore>,
        child_key: impl Into<String>,
        global_key: impl Into<String>,
    ) -> Self {
        self.globals.push(GlobalBinding {
            store: Rc::clone(store),
            child_key: child_key.into(),
            global_key: global_key.into(),
        });
        self
    }

    /// Sets the parent-state projection.
    #[must_use]
    pub fn project<F>(mut self, projection: F) -> Self
    where
        F: Fn(&State, &mut ProjectionBinder) -> Result<()> + Send + Sync + 'static,
    {
        self.projection = Some(Arc::new(projection));
        self
    }

    /// Intercepts a public action on behalf of the child.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`](crate::domain::CanopyError::ActionScope)
    /// for a private action.
    pub fn intercept<F>(mut self, action: &Action, handler: F) -> Result<Self>
    where
        F: Fn(&Action, &ComponentContext, &Payload) -> Result<()> + 'static,
    {
        self.interceptors.on(action, handler)?;
        Ok(self)
    }

    /// Returns the `(child, parent)` bindings.
    #[must_use]
    pub fn parent_bindings(&self) -> &[(String, String)] {
        &self.parent_bindings
    }

    /// Returns the global bindings.
    #[must_use]
    pub fn global_bindings(&self) -> &[GlobalBinding] {
        &self.globals
    }

    pub(crate) fn projection(&self) -> Option<Projection> {
        self.projection.clone()
    }

    pub(crate) fn take_interceptors(&mut self) -> InterceptorCollector {
        std::mem::take(&mut self.interceptors)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("parent_bindings", &self.parent_bindings)
            .field("projection", &self.projection.is_some())
            .field("globals", &self.globals)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// How a dependant's state detection is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Asynchronous when the runtime allows it and the component kind
    /// supports it.
    #[default]
    Auto,
    /// Detect inline, on the main context.
    Sync,
    /// Detect on a worker when the component kind supports it.
    Async,
}

/// A child component paired with its connector.
#[derive(Clone)]
pub struct Dependant {
    pub(crate) component: Rc<dyn Component>,
    pub(crate) connector: Connector,
    pub(crate) applier: Option<Rc<dyn StateApplier>>,
    pub(crate) mode: InstallMode,
}

impl Dependant {
    /// Pairs `component` with `connector`.
    pub fn new(component: impl Component + 'static, connector: Connector) -> Self {
        Self::shared(Rc::new(component), connector)
    }

    /// Pairs a shared component with `connector`.
    #[must_use]
    pub fn shared(component: Rc<dyn Component>, connector: Connector) -> Self {
        Self {
            component,
            connector,
            applier: None,
            mode: InstallMode::Auto,
        }
    }

    /// Sets the applier receiving this child's batches, overriding
    /// [`Component::applier`].
    #[must_use]
    pub fn with_applier(mut self, applier: impl StateApplier + 'static) -> Self {
        self.applier = Some(Rc::new(applier));
        self
    }

    /// Forces an install mode.
    #[must_use]
    pub const fn install_mode(mut self, mode: InstallMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the child component.
    #[must_use]
    pub fn component(&self) -> &Rc<dyn Component> {
        &self.component
    }

    /// Returns the connector.
    #[must_use]
    pub const fn connector(&self) -> &Connector {
        &self.connector
    }
}

impl fmt::Debug for Dependant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependant")
            .field("component", &self.component.name())
            .field("connector", &self.connector)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// A component's dependants, keyed by a name unique among siblings.
#[derive(Debug, Default)]
pub struct DependantCollector {
    entries: IndexMap<String, Dependant>,
}

impl DependantCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dependant. A key that is already taken keeps its first
    /// dependant.
    pub fn add(&mut self, key: impl Into<String>, dependant: Dependant) -> &mut Self {
        let key = key.into();
        if self.entries.contains_key(&key) {
            tracing::debug!(key = %key, "duplicate dependant key ignored");
        } else {
            self.entries.insert(key, dependant);
        }
        self
    }

    /// Returns the number of dependants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no dependants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (String, Dependant)> {
        self.entries.into_iter()
    }
}
