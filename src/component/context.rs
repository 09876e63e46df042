//! Handles into a page's component arena.
//!
//! - [`ComponentContext`] is what effects and interceptors receive: it reads
//!   the component's state and sends actions on its behalf.
//! - [`ComponentHandle`] is the outside view of a component: its install
//!   state, and the show/hide/attach/detach/destroy operations.
//!
//! Both hold a weak pointer to their page. Once the page or the component is
//! gone, reads return `None` and operations do nothing.

use super::lifecycle::InstallState;
use super::page::{NodeId, PageShared};
use crate::domain::{Action, CanopyError, Payload, Result};
use crate::effect::EffectReport;
use crate::infrastructure::Platform;
use crate::reducer::Reduction;
use crate::state::{State, StateToken};
use crate::store::{ObservedChange, ObserverId};
use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use std::fmt;
use std::rc::{Rc, Weak};

/// The view of one component handed to its effects and interceptors.
#[derive(Clone)]
pub struct ComponentContext {
    page: Weak<PageShared>,
    node: NodeId,
    token: StateToken,
    name: Rc<str>,
}

impl ComponentContext {
    pub(crate) fn new(page: Weak<PageShared>, node: NodeId, token: StateToken, name: Rc<str>) -> Self {
        Self {
            page,
            node,
            token,
            name,
        }
    }

    /// Returns the component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the token of the component state.
    #[must_use]
    pub const fn token(&self) -> StateToken {
        self.token
    }

    /// Returns the arena slot of the component.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node
    }

    /// Returns `true` once the component or its page is gone.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.page
            .upgrade()
            .map_or(true, |page| page.install_state(self.node) == InstallState::Destroyed)
    }

    fn page(&self) -> Result<Rc<PageShared>> {
        self.page
            .upgrade()
            .filter(|page| !page.is_destroyed())
            .ok_or_else(|| CanopyError::Detection(format!("page of `{}` is destroyed", self.name)))
    }

    /// Returns a snapshot of the component state.
    #[must_use]
    pub fn state(&self) -> Option<State> {
        self.page.upgrade()?.store().copy_state(self.token)
    }

    /// Reads one prop of the component state.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] if the key or the state does not
    /// exist, or [`CanopyError::PropType`] if the value does not convert.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let page = self.page()?;
        page.store()
            .store()
            .with_state(self.token, |state| state.get(key))
            .unwrap_or_else(|| {
                Err(CanopyError::UnknownProp {
                    key: key.to_string(),
                    state: self.name.to_string(),
                })
            })
    }

    /// Runs the component's reducers for `action`.
    ///
    /// Called from inside another dispatch, the action is queued and runs
    /// once the outer dispatch finished.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ReducerInvariant`] when a reducer fails.
    pub fn dispatch_reducer(&self, action: &Action, payload: &Payload) -> Result<()> {
        self.page()?.store().dispatch(self.token, action, payload)
    }

    /// Updates the component state without an action.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ReducerInvariant`] when `update` fails.
    pub fn update_state<F>(&self, label: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut State) -> Result<Reduction> + 'static,
    {
        self.page()?.store().update_state(self.token, label, update)
    }

    /// Runs the component's own effect for `action`. A public action is then
    /// offered to the page's interceptors, this component excluded.
    ///
    /// # Errors
    ///
    /// Fails only when the page is gone. Handler failures are collected in
    /// the returned report.
    pub fn dispatch_effect(&self, action: &Action, payload: &Payload) -> Result<EffectReport> {
        self.page()?.dispatch_effect(self.node, action, payload)
    }

    /// Delivers `action` to the parent's effects. Private actions allowed.
    ///
    /// # Errors
    ///
    /// Fails only when the page is gone.
    pub fn dispatch_to_parent(&self, action: &Action, payload: &Payload) -> Result<EffectReport> {
        Ok(self.page()?.dispatch_to_parent(self.node, action, payload))
    }

    /// Delivers `action` to the effects of every direct child. Children
    /// still detecting their state receive it once ready.
    ///
    /// # Errors
    ///
    /// Fails only when the page is gone.
    pub fn dispatch_to_children(&self, action: &Action, payload: &Payload) -> Result<EffectReport> {
        Ok(self.page()?.dispatch_to_children(self.node, action, payload))
    }

    /// Offers a public action to the page's interceptors only.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`] for a private action.
    pub fn dispatch_to_interceptor(&self, action: &Action, payload: &Payload) -> Result<EffectReport> {
        self.page()?.dispatch_to_interceptor(self.node, action, payload)
    }

    /// Broadcasts a public action to the interceptors of every page.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`] for a private action.
    pub fn broadcast(&self, action: &Action, payload: &Payload) -> Result<()> {
        self.page()?.broadcast(action, payload)
    }

    /// Delivers a public action to every other component of the page.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`] for a private action.
    pub fn dispatch_to_page(&self, action: &Action, payload: &Payload) -> Result<()> {
        self.page()?.dispatch_to_page(self.node, action, payload)
    }

    /// Returns the platform handle of the runtime.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.page
            .upgrade()
            .map(|page| page.platform().clone())
            .unwrap_or_default()
    }

    /// Calls `callback` whenever one of `keys` of this component's state
    /// changes.
    ///
    /// Watchers run right after the dispatch that made the change, not on
    /// the frame tick. They are dropped with the component.
    ///
    /// # Errors
    ///
    /// Fails when the page or the component is gone.
    pub fn watch<I, S, F>(&self, keys: I, callback: F) -> Result<ObserverId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ComponentContext, &[ObservedChange]) + 'static,
    {
        let page = self.page()?;
        let keys: IndexSet<String> = keys.into_iter().map(Into::into).collect();
        let ctx = self.clone();
        let observer = page.store().observe(self.token, move |changes| {
            let watched: Vec<ObservedChange> = changes
                .iter()
                .filter(|change| keys.contains(&change.key))
                .cloned()
                .collect();
            if !watched.is_empty() {
                callback(&ctx, &watched);
            }
        });
        if page.add_watcher(self.node, observer) {
            Ok(observer)
        } else {
            Err(CanopyError::Detection(format!("component `{}` is destroyed", self.name)))
        }
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("token", &self.token)
            .finish()
    }
}

/// Outside handle to one installed component.
#[derive(Clone)]
pub struct ComponentHandle {
    page: Weak<PageShared>,
    node: NodeId,
}

impl ComponentHandle {
    pub(crate) fn new(page: Weak<PageShared>, node: NodeId) -> Self {
        Self { page, node }
    }

    pub(crate) const fn node_id(&self) -> NodeId {
        self.node
    }

    /// Returns the install state. A component whose page is gone reads as
    /// destroyed.
    #[must_use]
    pub fn install_state(&self) -> InstallState {
        self.page
            .upgrade()
            .map_or(InstallState::Destroyed, |page| page.install_state(self.node))
    }

    /// Returns `true` once the state is live.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.install_state().is_ready()
    }

    /// Returns why the last detection failed, if it did.
    #[must_use]
    pub fn detection_error(&self) -> Option<String> {
        self.page.upgrade()?.detection_error(self.node)
    }

    /// Returns the number of operations queued while the state detects.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.page.upgrade().map_or(0, |page| page.pending_ops(self.node))
    }

    /// Returns the component's context.
    #[must_use]
    pub fn context(&self) -> Option<ComponentContext> {
        self.page.upgrade()?.context(self.node)
    }

    /// Returns the token of the component state.
    #[must_use]
    pub fn token(&self) -> Option<StateToken> {
        self.page.upgrade()?.node_token(self.node)
    }

    /// Returns the component name.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.page.upgrade()?.node_name(self.node).map(|name| name.to_string())
    }

    /// Returns the key under which the component was installed.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        self.page.upgrade()?.node_key(self.node)
    }

    /// Returns a snapshot of the component state, `None` until ready.
    #[must_use]
    pub fn state(&self) -> Option<State> {
        let page = self.page.upgrade()?;
        let token = page.node_token(self.node)?;
        page.store().copy_state(token)
    }

    /// Enables the component's applier. Idempotent.
    pub fn show(&self) {
        if let Some(page) = self.page.upgrade() {
            page.show(self.node);
        }
    }

    /// Disables the component's applier without dropping it. Idempotent.
    pub fn hide(&self) {
        if let Some(page) = self.page.upgrade() {
            page.hide(self.node);
        }
    }

    /// Registers the component's applier with the page store. Idempotent.
    pub fn attach(&self) {
        if let Some(page) = self.page.upgrade() {
            page.attach(self.node);
        }
    }

    /// Drops the component's applier registration. Idempotent.
    pub fn detach(&self) {
        if let Some(page) = self.page.upgrade() {
            page.detach(self.node);
        }
    }

    /// Destroys the component and its subtree. Terminal.
    pub fn destroy(&self) {
        if let Some(page) = self.page.upgrade() {
            page.destroy_node(self.node);
        }
    }

    /// Returns the child installed under `key`.
    #[must_use]
    pub fn child(&self, key: &str) -> Option<Self> {
        let page = self.page.upgrade()?;
        page.child(self.node, key).map(|node| page.handle(node))
    }

    /// Returns the direct children, in install order.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        self.page.upgrade().map_or_else(Vec::new, |page| {
            page.children(self.node)
                .into_iter()
                .map(|node| page.handle(node))
                .collect()
        })
    }
}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("node", &self.node)
            .field("state", &self.install_state())
            .finish()
    }
}
