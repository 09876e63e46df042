//! The page: an arena of installed components around one page store.
//!
//! A [`Page`] owns every [`ComponentNode`] of its tree, keyed by [`NodeId`].
//! Contexts and handles refer to nodes by id through a weak page pointer, so
//! nothing outside the page keeps a component alive.
//!
//! # Install protocol
//!
//! ```text
//!  install ──► node inserted (StateDetecting) ──► detect (inline | worker)
//!                    │                                      │
//!     lifecycle, show/hide, parent messages                 ▼
//!                    └──► pending queue ──flush──► finalize: link roots,
//!                                                  register state, reducers,
//!                                                  effects, bus, interceptors
//! ```
//!
//! A component installs its own children when it receives the create
//! lifecycle event. Children installed after the page already went further
//! replay the events they missed, see [`LifecycleEvent::catch_up`].

use super::connector::{Dependant, InstallMode};
use super::context::{ComponentContext, ComponentHandle};
use super::lifecycle::{Attachment, InstallState, LifecycleEvent, LifecycleSource, PendingOp, Visibility};
use super::{Component, Connector, DependantCollector};
use crate::bus::{DispatchBus, ReceiverHandle};
use crate::domain::{Action, CanopyError, Payload, Result};
use crate::effect::{isolate, EffectCollector, EffectReport, InterceptorCollector, InterceptorId, InterceptorManager};
use crate::infrastructure::{Platform, Runtime};
use crate::reducer::{ReducerCollector, SubReducer};
use crate::state::{DependantSlot, PropOrigin, PropRef, State, StateKind, StateToken};
use crate::store::{ApplierId, FrameTicker, GlobalStore, Middleware, ObserverId, PageStore, StateApplier, StoreId};
use crate::worker::{detect, DetectionJob, GlobalSnapshot, MainTask, TraceContext};
use crossbeam_channel::Sender;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PAGE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PAGE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Slot of a component inside its page's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A subscription of one component to one global store.
struct GlobalSubscription {
    store: Rc<GlobalStore>,
    observer: ObserverId,
    roots: Vec<PropRef>,
}

/// One installed component.
pub(crate) struct ComponentNode {
    key: String,
    parent: Option<NodeId>,
    children: IndexMap<String, NodeId>,
    component: Rc<dyn Component>,
    connector: Connector,
    applier: Option<Rc<dyn StateApplier>>,
    token: StateToken,
    name: Rc<str>,
    state: InstallState,
    pending: VecDeque<PendingOp>,
    effects: EffectCollector,
    applier_id: Option<ApplierId>,
    bus_handle: Option<ReceiverHandle>,
    globals: Vec<GlobalSubscription>,
    watchers: Vec<ObserverId>,
    cancel: Arc<AtomicBool>,
    detection_error: Option<String>,
    first_update_done: bool,
    was_showing: bool,
    children_installed: bool,
}

/// What a page borrows from the runtime that created it.
pub(crate) struct PageEnv {
    platform: Platform,
    detector: RefCell<Option<Sender<DetectionJob>>>,
    async_install: bool,
}

/// State shared between a [`Page`], its contexts and its handles.
pub(crate) struct PageShared {
    id: PageId,
    name: String,
    store: Rc<PageStore>,
    bus: DispatchBus,
    interceptors: InterceptorManager,
    owner: StateToken,
    nodes: RefCell<IndexMap<NodeId, ComponentNode>>,
    root: Cell<Option<NodeId>>,
    phase: Cell<Option<LifecycleEvent>>,
    env: PageEnv,
    destroyed: Cell<bool>,
    next_node: Cell<u64>,
    self_ref: Weak<PageShared>,
}

impl PageShared {
    pub(crate) const fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn store(&self) -> &Rc<PageStore> {
        &self.store
    }

    pub(crate) const fn platform(&self) -> &Platform {
        &self.env.platform
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn weak(&self) -> Weak<Self> {
        self.self_ref.clone()
    }

    // ---------------------------------------------------------------------
    // arena queries
    // ---------------------------------------------------------------------

    fn with_node<R>(&self, id: NodeId, read: impl FnOnce(&ComponentNode) -> R) -> Option<R> {
        self.nodes.borrow().get(&id).map(read)
    }

    fn with_node_mut<R>(&self, id: NodeId, write: impl FnOnce(&mut ComponentNode) -> R) -> Option<R> {
        self.nodes.borrow_mut().get_mut(&id).map(write)
    }

    pub(crate) fn install_state(&self, id: NodeId) -> InstallState {
        self.with_node(id, |node| node.state)
            .unwrap_or(InstallState::Destroyed)
    }

    pub(crate) fn node_token(&self, id: NodeId) -> Option<StateToken> {
        self.with_node(id, |node| node.token)
    }

    pub(crate) fn node_name(&self, id: NodeId) -> Option<Rc<str>> {
        self.with_node(id, |node| Rc::clone(&node.name))
    }

    pub(crate) fn node_key(&self, id: NodeId) -> Option<String> {
        self.with_node(id, |node| node.key.clone())
    }

    pub(crate) fn detection_error(&self, id: NodeId) -> Option<String> {
        self.with_node(id, |node| node.detection_error.clone()).flatten()
    }

    pub(crate) fn pending_ops(&self, id: NodeId) -> usize {
        self.with_node(id, |node| node.pending.len()).unwrap_or(0)
    }

    pub(crate) fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.with_node(id, |node| node.parent).flatten()
    }

    pub(crate) fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.with_node(id, |node| node.children.get(key).copied()).flatten()
    }

    pub(crate) fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.with_node(id, |node| node.children.values().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn context(&self, id: NodeId) -> Option<ComponentContext> {
        self.with_node(id, |node| {
            ComponentContext::new(self.weak(), id, node.token, Rc::clone(&node.name))
        })
    }

    pub(crate) fn handle(&self, id: NodeId) -> ComponentHandle {
        ComponentHandle::new(self.weak(), id)
    }

    // ---------------------------------------------------------------------
    // install
    // ---------------------------------------------------------------------

    /// Installs `dependant` as the child `key` of `parent`, or as the page
    /// root when `parent` is `None`.
    ///
    /// A key already taken under `parent` returns the existing child.
    pub(crate) fn install(&self, parent: Option<NodeId>, key: String, dependant: Dependant) -> Result<NodeId> {
        if self.destroyed.get() {
            return Err(CanopyError::Detection(format!(
                "page `{}` is destroyed",
                self.name
            )));
        }
        if let Some(parent_id) = parent {
            if let Some(existing) = self.child(parent_id, &key) {
                tracing::debug!(key = %key, node = %existing, "dependant already installed");
                return Ok(existing);
            }
        }

        let parent_state = match parent {
            Some(parent_id) => {
                let token = self.node_token(parent_id).ok_or_else(|| {
                    CanopyError::Detection(format!("parent {parent_id} of `{key}` is gone"))
                })?;
                let snapshot = self.store.copy_state(token).ok_or_else(|| {
                    CanopyError::Detection(format!("parent {parent_id} of `{key}` is not ready"))
                })?;
                Some(snapshot)
            }
            None => None,
        };

        let Dependant {
            component,
            connector,
            applier,
            mode,
        } = dependant;
        let id = NodeId(self.next_node.get());
        self.next_node.set(id.0 + 1);
        let token = StateToken::next();
        let name: Rc<str> = Rc::from(component.name());
        let capabilities = component.kind().capabilities();
        let detect_async = match mode {
            InstallMode::Sync => false,
            InstallMode::Auto => self.env.async_install && capabilities.async_detection,
            InstallMode::Async => capabilities.async_detection,
        } && parent.is_some();

        let _span = tracing::debug_span!(
            "install",
            page = %self.name,
            component = %name,
            node = %id,
            asynchronous = detect_async
        )
        .entered();

        let pending: VecDeque<PendingOp> = self
            .phase
            .get()
            .map(|phase| phase.catch_up().iter().copied().map(PendingOp::Lifecycle).collect())
            .unwrap_or_default();
        let cancel = Arc::new(AtomicBool::new(false));

        let job = DetectionJob {
            page: self.id,
            node: id,
            token,
            name: name.to_string(),
            kind: if parent.is_some() {
                StateKind::Component
            } else {
                StateKind::Page
            },
            decl: component.state(),
            parent: parent_state,
            parent_bindings: connector.parent_bindings().to_vec(),
            projection: connector.projection(),
            globals: connector
                .global_bindings()
                .iter()
                .map(|binding| GlobalSnapshot {
                    store: binding.store.id(),
                    child_key: binding.child_key.clone(),
                    global_key: binding.global_key.clone(),
                    state: binding.store.copy_state(),
                })
                .collect(),
            cancel: Arc::clone(&cancel),
            trace_context: TraceContext::from_current(),
        };

        let applier = applier.or_else(|| component.applier());
        self.nodes.borrow_mut().insert(
            id,
            ComponentNode {
                key: key.clone(),
                parent,
                children: IndexMap::new(),
                component,
                connector,
                applier,
                token,
                name,
                state: InstallState::StateDetecting,
                pending,
                effects: EffectCollector::new(),
                applier_id: None,
                bus_handle: None,
                globals: Vec::new(),
                watchers: Vec::new(),
                cancel,
                detection_error: None,
                first_update_done: false,
                was_showing: false,
                children_installed: false,
            },
        );
        match parent {
            Some(parent_id) => {
                self.with_node_mut(parent_id, |node| node.children.insert(key, id));
            }
            None => self.root.set(Some(id)),
        }

        let job = if detect_async {
            let sender = self.env.detector.borrow().clone();
            match sender {
                Some(sender) => match sender.send(job) {
                    Ok(()) => {
                        tracing::debug!("detection scheduled on worker");
                        return Ok(id);
                    }
                    Err(failed) => {
                        tracing::warn!("detection workers gone, detecting inline");
                        failed.into_inner()
                    }
                },
                None => job,
            }
        } else {
            job
        };

        let outcome = detect(&job);
        self.complete_detection(id, outcome);
        Ok(id)
    }

    /// Applies the outcome of a detection to node `id`.
    ///
    /// Results for nodes that are gone, destroyed or cancelled are dropped.
    pub(crate) fn complete_detection(&self, id: NodeId, outcome: Result<State>) {
        let accepted = self.with_node(id, |node| {
            node.state == InstallState::StateDetecting && !node.cancel.load(Ordering::Acquire)
        });
        if accepted != Some(true) {
            tracing::debug!(page = %self.name, node = %id, "late detection result discarded");
            return;
        }

        let result = outcome.and_then(|state| self.finalize(id, state));
        if let Err(err) = result {
            tracing::warn!(page = %self.name, node = %id, error = %err, "state detection failed");
            self.with_node_mut(id, |node| node.detection_error = Some(err.to_string()));
        }
    }

    /// Finds the global store `store_id` bound by node `id` or, for a prop
    /// aliased through a global-bound parent prop, by one of its ancestors.
    fn resolve_global(&self, id: NodeId, store_id: StoreId) -> Option<Rc<GlobalStore>> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let found = self
                .with_node(node_id, |node| {
                    node.connector
                        .global_bindings()
                        .iter()
                        .map(|binding| &binding.store)
                        .chain(node.globals.iter().map(|subscription| &subscription.store))
                        .find(|store| store.id() == store_id)
                        .map(Rc::clone)
                })
                .flatten();
            if found.is_some() {
                return found;
            }
            current = self.parent_of(node_id);
        }
        None
    }

    /// Links a detected state into the page and makes the node ready.
    fn finalize(&self, id: NodeId, mut state: State) -> Result<()> {
        let Some((component, token, name)) = self.with_node(id, |node| {
            (Rc::clone(&node.component), node.token, Rc::clone(&node.name))
        }) else {
            return Ok(());
        };
        let _span = tracing::debug_span!("finalize", page = %self.name, component = %name).entered();

        let links = state.root_links();
        let mut stores: IndexMap<StoreId, Rc<GlobalStore>> = IndexMap::new();
        for (_, link) in &links {
            let PropOrigin::Global(store_id) = link.origin else {
                continue;
            };
            if !stores.contains_key(&store_id) {
                let store = self.resolve_global(id, store_id).ok_or_else(|| {
                    CanopyError::Detection(format!("`{name}` aliases {store_id}, which nothing above it binds"))
                })?;
                stores.insert(store_id, store);
            }
        }

        let mut by_store: IndexMap<StoreId, (Rc<GlobalStore>, Vec<PropRef>)> = IndexMap::new();
        for (index, link) in links {
            let key = state
                .prop_at(index)
                .map(|prop| prop.key().to_string())
                .unwrap_or_default();
            let slot = DependantSlot { index, key };
            match link.origin {
                PropOrigin::Upper => {
                    if let Some(value) = self.store.store().add_dependant(link.prop, token, slot) {
                        state.inner_set(index, value);
                    } else {
                        tracing::warn!(root = ?link.prop, "root state gone, alias left detached");
                    }
                }
                PropOrigin::Global(store_id) => {
                    let Some(store) = stores.get(&store_id) else {
                        continue;
                    };
                    let value = store.bind(link.prop, token, slot)?;
                    state.inner_set(index, value);
                    by_store
                        .entry(store_id)
                        .or_insert_with(|| (Rc::clone(store), Vec::new()))
                        .1
                        .push(link.prop);
                }
            }
        }

        let mut globals = Vec::with_capacity(by_store.len());
        for (_, (store, roots)) in by_store {
            let page_store = Rc::downgrade(&self.store);
            let observer = store.observe(token, move |changes| {
                if let Some(page_store) = page_store.upgrade() {
                    page_store.absorb_external(token, changes);
                }
            });
            globals.push(GlobalSubscription {
                store,
                observer,
                roots,
            });
        }

        self.store.store().register_state(state);

        let mut reducers = ReducerCollector::new();
        component.reducers(&mut reducers);
        if !reducers.is_empty() {
            self.store
                .add_sub_reducer(SubReducer::new(token, &*name, reducers.into_reducer()));
        }
        let mut effects = EffectCollector::new();
        component.effects(&mut effects);

        let page = self.weak();
        let bus_handle = self.bus.register_receiver(move |action, payload| {
            if let Some(page) = page.upgrade() {
                page.deliver_to(id, action, payload);
            }
        });

        let ctx = ComponentContext::new(self.weak(), id, token, Rc::clone(&name));
        let interceptors = self
            .with_node_mut(id, |node| node.connector.take_interceptors())
            .unwrap_or_default();
        if !interceptors.is_empty() {
            self.interceptors.register(&ctx, interceptors);
        }

        self.with_node_mut(id, |node| {
            node.effects = effects;
            node.bus_handle = bus_handle;
            node.globals = globals;
            node.detection_error = None;
            node.state = InstallState::READY;
        });
        tracing::debug!(token = %token, "component ready");

        component.on_state_ready(&ctx);
        self.flush_pending(id);
        Ok(())
    }

    fn flush_pending(&self, id: NodeId) {
        loop {
            let op = self.with_node_mut(id, |node| {
                if node.state.is_ready() {
                    node.pending.pop_front()
                } else {
                    None
                }
            });
            let Some(Some(op)) = op else {
                break;
            };
            tracing::trace!(node = %id, op = ?op, "flushing queued operation");
            self.apply(id, op);
        }
    }

    fn install_children(&self, id: NodeId) {
        let Some(Some(component)) = self.with_node_mut(id, |node| {
            if node.children_installed {
                None
            } else {
                node.children_installed = true;
                Some(Rc::clone(&node.component))
            }
        }) else {
            return;
        };

        let mut dependants = DependantCollector::new();
        component.dependencies(&mut dependants);
        for (key, dependant) in dependants.into_entries() {
            if let Err(err) = self.install(Some(id), key.clone(), dependant) {
                tracing::warn!(parent = %id, key = %key, error = %err, "dependant install failed");
            }
        }
    }

    // ---------------------------------------------------------------------
    // operations routed through the install state machine
    // ---------------------------------------------------------------------

    /// Applies `op` to node `id` now, or queues it while the node detects.
    ///
    /// A node whose detection failed keeps what it queued so far and drops
    /// everything after.
    pub(crate) fn request(&self, id: NodeId, op: PendingOp) -> EffectReport {
        match self.install_state(id) {
            InstallState::Uninstalled | InstallState::StateDetecting => {
                self.with_node_mut(id, |node| {
                    if let Some(err) = &node.detection_error {
                        tracing::debug!(node = %id, op = ?op, error = %err, "detection failed, operation dropped");
                    } else {
                        tracing::debug!(node = %id, op = ?op, "operation queued until ready");
                        node.pending.push_back(op);
                    }
                });
                EffectReport::default()
            }
            InstallState::Ready { .. } => self.apply(id, op),
            InstallState::Destroyed => EffectReport::default(),
        }
    }

    fn apply(&self, id: NodeId, op: PendingOp) -> EffectReport {
        match op {
            PendingOp::Lifecycle(event) => return self.deliver_lifecycle(id, event),
            PendingOp::Show => self.set_visibility(id, Visibility::Visible),
            PendingOp::Hide => self.set_visibility(id, Visibility::Hidden),
            PendingOp::Attach => self.set_attachment(id, Attachment::Attached),
            PendingOp::Detach => self.set_attachment(id, Attachment::Detached),
            PendingOp::Deliver { action, payload } => return self.run_effect(id, &action, &payload),
        }
        EffectReport::default()
    }

    fn deliver_lifecycle(&self, id: NodeId, event: LifecycleEvent) -> EffectReport {
        let report = self.run_effect(id, &event.action(), &Payload::Null);
        match event {
            LifecycleEvent::Create => self.install_children(id),
            LifecycleEvent::Resume => {
                self.set_visibility(id, Visibility::Visible);
                self.set_attachment(id, Attachment::Attached);
            }
            LifecycleEvent::Stop => self.set_visibility(id, Visibility::Hidden),
            LifecycleEvent::Start | LifecycleEvent::Pause | LifecycleEvent::Destroy => {}
        }
        report
    }

    fn set_visibility(&self, id: NodeId, visibility: Visibility) {
        let changed = self.with_node_mut(id, |node| match node.state {
            InstallState::Ready {
                visibility: current,
                attachment,
            } if current != visibility => {
                node.state = InstallState::Ready {
                    visibility,
                    attachment,
                };
                true
            }
            _ => false,
        });
        if changed == Some(true) {
            self.refresh_view(id);
        }
    }

    fn set_attachment(&self, id: NodeId, attachment: Attachment) {
        let changed = self.with_node_mut(id, |node| match node.state {
            InstallState::Ready {
                visibility,
                attachment: current,
            } if current != attachment => {
                node.state = InstallState::Ready {
                    visibility,
                    attachment,
                };
                true
            }
            _ => false,
        });
        if changed == Some(true) {
            self.refresh_view(id);
        }
    }

    /// Brings the applier registration in line with the install state and
    /// queues the first or full update when the node starts showing.
    fn refresh_view(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(&id) else {
            return;
        };
        let InstallState::Ready {
            visibility,
            attachment,
        } = node.state
        else {
            return;
        };

        let renders_view = node.component.kind().capabilities().renders_view;
        if let (true, Some(applier)) = (renders_view, node.applier.as_ref()) {
            match (attachment, node.applier_id) {
                (Attachment::Attached, None) => {
                    node.applier_id = Some(self.store.add_state_applier(node.token, Rc::clone(applier)));
                }
                (Attachment::Detached, Some(applier_id)) => {
                    self.store.remove_state_applier(applier_id);
                    node.applier_id = None;
                }
                _ => {}
            }
            if let Some(applier_id) = node.applier_id {
                self.store
                    .set_applier_enabled(applier_id, visibility == Visibility::Visible);
            }
        }

        let showing = node.state.is_showing();
        let starts_showing = showing && !node.was_showing;
        node.was_showing = showing;
        if !starts_showing {
            return;
        }
        let first = !node.first_update_done;
        node.first_update_done = true;
        let token = node.token;
        drop(nodes);

        let keys = self
            .store
            .store()
            .with_state(token, |state| {
                state
                    .props()
                    .filter(|prop| !first || prop.update_with_initial_value())
                    .map(|prop| prop.key().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        tracing::debug!(node = %id, first, keys = keys.len(), "view update queued");
        self.store.mark_changed(token, keys);
    }

    pub(crate) fn show(&self, id: NodeId) {
        self.request(id, PendingOp::Show);
    }

    pub(crate) fn hide(&self, id: NodeId) {
        self.request(id, PendingOp::Hide);
    }

    pub(crate) fn attach(&self, id: NodeId) {
        self.request(id, PendingOp::Attach);
    }

    pub(crate) fn detach(&self, id: NodeId) {
        self.request(id, PendingOp::Detach);
    }

    // ---------------------------------------------------------------------
    // effects and messaging
    // ---------------------------------------------------------------------

    /// Runs the effect handler of node `id` for `action`, isolated.
    pub(crate) fn run_effect(&self, id: NodeId, action: &Action, payload: &Payload) -> EffectReport {
        let mut report = EffectReport::default();
        let Some(Some(handler)) = self.with_node(id, |node| {
            if node.state.is_ready() {
                node.effects.get(action)
            } else {
                None
            }
        }) else {
            return report;
        };
        let Some(ctx) = self.context(id) else {
            return report;
        };
        report.record(isolate(action, ctx.name(), || handler.run(action, &ctx, payload)));
        report
    }

    /// Delivers `action` to node `id`, queued while it detects.
    pub(crate) fn deliver_to(&self, id: NodeId, action: &Action, payload: &Payload) -> EffectReport {
        self.request(
            id,
            PendingOp::Deliver {
                action: action.clone(),
                payload: payload.clone(),
            },
        )
    }

    /// Runs the own effect of node `id`, then lets the page intercept a
    /// public action with the sender excluded.
    pub(crate) fn dispatch_effect(&self, id: NodeId, action: &Action, payload: &Payload) -> Result<EffectReport> {
        let mut report = self.run_effect(id, action, payload);
        if action.is_public() {
            let sender = self.node_token(id);
            report.merge(self.interceptors.intercept(action, payload, sender)?);
        }
        Ok(report)
    }

    pub(crate) fn dispatch_to_parent(&self, id: NodeId, action: &Action, payload: &Payload) -> EffectReport {
        match self.parent_of(id) {
            Some(parent) => self.deliver_to(parent, action, payload),
            None => {
                tracing::trace!(node = %id, action = %action, "root has no parent, dropped");
                EffectReport::default()
            }
        }
    }

    pub(crate) fn dispatch_to_children(&self, id: NodeId, action: &Action, payload: &Payload) -> EffectReport {
        let mut report = EffectReport::default();
        for child in self.children(id) {
            report.merge(self.deliver_to(child, action, payload));
        }
        report
    }

    pub(crate) fn dispatch_to_interceptor(&self, id: NodeId, action: &Action, payload: &Payload) -> Result<EffectReport> {
        if action.is_private() {
            return Err(CanopyError::private_action("dispatch_to_interceptor", action.name()));
        }
        self.interceptors.intercept(action, payload, self.node_token(id))
    }

    pub(crate) fn broadcast(&self, action: &Action, payload: &Payload) -> Result<()> {
        if action.is_private() {
            return Err(CanopyError::private_action("broadcast", action.name()));
        }
        self.bus.broadcast(action, payload);
        Ok(())
    }

    pub(crate) fn dispatch_to_page(&self, id: NodeId, action: &Action, payload: &Payload) -> Result<()> {
        if action.is_private() {
            return Err(CanopyError::private_action("dispatch_to_page", action.name()));
        }
        let own = self
            .with_node(id, |node| node.bus_handle.as_ref().map(ReceiverHandle::id))
            .flatten();
        self.bus.dispatch(action, payload, own);
        Ok(())
    }

    fn on_broadcast(&self, action: &Action, payload: &Payload) {
        match self.interceptors.intercept(action, payload, None) {
            Ok(report) => tracing::debug!(
                page = %self.name,
                action = %action,
                handled = report.handled,
                "broadcast intercepted"
            ),
            Err(err) => tracing::debug!(page = %self.name, error = %err, "broadcast rejected"),
        }
    }

    pub(crate) fn add_watcher(&self, id: NodeId, observer: ObserverId) -> bool {
        let added = self.with_node_mut(id, |node| {
            if node.state == InstallState::Destroyed {
                false
            } else {
                node.watchers.push(observer);
                true
            }
        });
        if added != Some(true) {
            self.store.store().remove_observer(observer);
            return false;
        }
        true
    }

    /// Registers page-level interceptors, run with the context of node `id`
    /// but owned by the page, so no component dispatch excludes them.
    pub(crate) fn register_page_interceptors(&self, id: NodeId, collector: InterceptorCollector) -> Result<Vec<InterceptorId>> {
        let ctx = self
            .context(id)
            .ok_or_else(|| CanopyError::Detection(format!("component {id} is gone")))?;
        Ok(self.interceptors.register_as(self.owner, &ctx, collector))
    }

    // ---------------------------------------------------------------------
    // lifecycle and teardown
    // ---------------------------------------------------------------------

    pub(crate) fn on_lifecycle(&self, event: LifecycleEvent) -> EffectReport {
        let mut report = EffectReport::default();
        if self.destroyed.get() {
            return report;
        }
        let _span = tracing::debug_span!("lifecycle", page = %self.name, event = %event).entered();
        self.phase.set(Some(event));
        match event {
            LifecycleEvent::Resume => self.store.on_page_visible(),
            LifecycleEvent::Stop => self.store.on_page_hidden(),
            _ => {}
        }

        let ids: Vec<NodeId> = self.nodes.borrow().keys().copied().collect();
        for id in ids {
            report.merge(self.request(id, PendingOp::Lifecycle(event)));
        }
        if event == LifecycleEvent::Destroy {
            self.destroy();
        }
        report
    }

    /// Tears node `id` and its subtree down. Terminal and idempotent.
    pub(crate) fn destroy_node(&self, id: NodeId) {
        let Some(Some((token, globals, children))) = self.with_node_mut(id, |node| {
            if node.state == InstallState::Destroyed {
                return None;
            }
            node.state = InstallState::Destroyed;
            node.cancel.store(true, Ordering::Release);
            node.pending.clear();
            let children: Vec<NodeId> = node.children.values().copied().collect();
            Some((node.token, std::mem::take(&mut node.globals), children))
        }) else {
            return;
        };
        let _span = tracing::debug_span!("destroy", page = %self.name, node = %id).entered();

        for subscription in globals {
            subscription.store.remove_observer(subscription.observer);
            for root in subscription.roots {
                subscription.store.unbind(root, token);
            }
        }
        for child in children.into_iter().rev() {
            self.destroy_node(child);
        }

        let resources = self.with_node_mut(id, |node| {
            (
                node.applier_id.take(),
                node.bus_handle.take(),
                std::mem::take(&mut node.watchers),
            )
        });
        if let Some((applier_id, bus_handle, watchers)) = resources {
            if let Some(applier_id) = applier_id {
                self.store.remove_state_applier(applier_id);
            }
            if let Some(handle) = bus_handle {
                handle.dispose();
            }
            for watcher in watchers {
                self.store.store().remove_observer(watcher);
            }
        }
        self.interceptors.remove_owner(token);
        self.store.store().remove_sub_reducer(token);
        self.store.store().remove_state(token);

        let removed = self.nodes.borrow_mut().shift_remove(&id);
        if let Some(node) = removed {
            match node.parent {
                Some(parent) => {
                    self.with_node_mut(parent, |parent| parent.children.shift_remove(&node.key));
                }
                None => self.root.set(None),
            }
        }
        tracing::debug!("component destroyed");
    }

    /// Tears the whole page down. Terminal and idempotent.
    pub(crate) fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        tracing::debug!(page = %self.name, "destroying page");
        if let Some(root) = self.root.get() {
            self.destroy_node(root);
        }
        self.interceptors.clear();
        self.bus.detach();
        self.store.destroy();
        *self.env.detector.borrow_mut() = None;
    }
}

/// One page: a component tree, its store and its bus.
///
/// Dropping the page destroys it.
///
/// # Example
///
/// ```rust,no_run
/// use canopy::component::{Component, Connector, Dependant, LifecycleEvent, Page};
/// use canopy::infrastructure::Runtime;
/// use canopy::state::StateDecl;
/// use canopy::Config;
///
/// struct Home;
///
/// impl Component for Home {
///     fn name(&self) -> &str {
///         "home"
///     }
///
///     fn state(&self) -> StateDecl {
///         StateDecl::new().field("title", "Home")
///     }
/// }
///
/// let runtime = Runtime::new(Config::default())?;
/// let page = Page::new(&runtime, "home", Dependant::new(Home, Connector::new()))?;
/// page.on_lifecycle(LifecycleEvent::Create);
/// page.on_lifecycle(LifecycleEvent::Resume);
/// runtime.pump();
/// # Ok::<(), canopy::CanopyError>(())
/// ```
pub struct Page {
    shared: Rc<PageShared>,
}

impl Page {
    /// Creates a page and installs `root` synchronously.
    ///
    /// The page bus is attached to the runtime's application bus, and a
    /// frame ticker is started when the runtime's configuration asks for
    /// one.
    ///
    /// # Errors
    ///
    /// - [`CanopyError::Detection`] if the root state cannot be detected
    /// - [`CanopyError::Io`] if the frame ticker thread cannot be spawned
    pub fn new(runtime: &Runtime, name: impl Into<String>, root: Dependant) -> Result<Self> {
        let name = name.into();
        let config = runtime.config();
        let id = PageId::next();
        let store = Rc::new(PageStore::new(name.clone(), config.min_frame_spacing));

        if config.frame_ticker {
            let sender: Sender<MainTask> = runtime.main_sender();
            let ticker = FrameTicker::spawn(name.clone(), config.tick_interval, move || {
                sender.send(MainTask::Tick(id)).is_ok()
            })?;
            store.attach_ticker(ticker);
        }

        let bus = DispatchBus::new(name.clone());
        bus.attach(runtime.app_bus());

        let shared = Rc::new_cyclic(|self_ref| PageShared {
            id,
            name: name.clone(),
            store,
            bus,
            interceptors: InterceptorManager::new(),
            owner: StateToken::next(),
            nodes: RefCell::new(IndexMap::new()),
            root: Cell::new(None),
            phase: Cell::new(None),
            env: PageEnv {
                platform: runtime.platform().clone(),
                detector: RefCell::new(runtime.detector_sender()),
                async_install: config.async_install,
            },
            destroyed: Cell::new(false),
            next_node: Cell::new(1),
            self_ref: self_ref.clone(),
        });

        let receiver = Rc::downgrade(&shared);
        shared.bus.set_page_receiver(move |action, payload| {
            if let Some(page) = receiver.upgrade() {
                page.on_broadcast(action, payload);
            }
        });
        runtime.register_page(&shared);

        let page = Self { shared };
        let root_id = page
            .shared
            .install(None, "root".to_string(), root.install_mode(InstallMode::Sync))?;
        if let Some(err) = page.shared.detection_error(root_id) {
            return Err(CanopyError::Detection(err));
        }
        tracing::debug!(page = %name, id = %id, "page created");
        Ok(page)
    }

    /// Returns the page id.
    #[must_use]
    pub fn id(&self) -> PageId {
        self.shared.id
    }

    /// Returns the page name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the page store.
    #[must_use]
    pub fn store(&self) -> &PageStore {
        &self.shared.store
    }

    /// Returns the page bus.
    #[must_use]
    pub fn bus(&self) -> &DispatchBus {
        &self.shared.bus
    }

    /// Returns the root component, `None` once the page is destroyed.
    #[must_use]
    pub fn root(&self) -> Option<ComponentHandle> {
        self.shared.root.get().map(|id| self.shared.handle(id))
    }

    /// Finds a component by its path of dependant keys from the root.
    ///
    /// An empty path names the root.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<ComponentHandle> {
        let mut current = self.shared.root.get()?;
        for key in path {
            current = self.shared.child(current, key)?;
        }
        Some(self.shared.handle(current))
    }

    /// Delivers a lifecycle event to every component, in install order.
    ///
    /// Components still detecting their state queue the event.
    pub fn on_lifecycle(&self, event: LifecycleEvent) -> EffectReport {
        self.shared.on_lifecycle(event)
    }

    /// Subscribes the page to a lifecycle source.
    pub fn bind_lifecycle(&self, source: &dyn LifecycleSource) {
        let page = Rc::downgrade(&self.shared);
        source.subscribe(Rc::new(move |event| {
            if let Some(page) = page.upgrade() {
                page.on_lifecycle(event);
            }
        }));
    }

    /// Installs an extra dependant below `parent` at runtime. An existing
    /// key returns the component already installed there.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Detection`] if `parent` is not ready or the
    /// page is destroyed.
    pub fn install_dependant(&self, parent: &ComponentHandle, key: impl Into<String>, dependant: Dependant) -> Result<ComponentHandle> {
        let id = self.shared.install(Some(parent.node_id()), key.into(), dependant)?;
        Ok(self.shared.handle(id))
    }

    /// Registers page-level interceptors, run with the root's context.
    ///
    /// They belong to the page rather than the root, so public effects
    /// dispatched by the root reach them too.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Detection`] once the root is gone.
    pub fn intercept(&self, collector: InterceptorCollector) -> Result<Vec<InterceptorId>> {
        let root = self
            .shared
            .root
            .get()
            .ok_or_else(|| CanopyError::Detection(format!("page `{}` has no root", self.shared.name)))?;
        self.shared.register_page_interceptors(root, collector)
    }

    /// Appends a reducer middleware to the page store. Every action
    /// dispatched to a reducer of the page passes through it.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.shared.store.add_middleware(middleware);
    }

    /// Returns snapshots of every state of the page.
    #[must_use]
    pub fn all_states(&self) -> Vec<State> {
        self.shared.store.all_states()
    }

    /// Runs one batch pass now, outside the frame ticker.
    pub fn tick(&self) -> bool {
        self.shared.store.on_tick()
    }

    /// Returns the number of installed components, the root included.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.shared.nodes.borrow().len()
    }

    /// Returns `true` once destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Destroys every component, the store and the bus. Terminal.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("components", &self.component_count())
            .field("destroyed", &self.shared.destroyed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::reducer::Reduction;
    use crate::state::StateDecl;
    use crate::Config;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::{Duration, Instant};

    struct Leaf {
        kind: ComponentKind,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Component for Leaf {
        fn name(&self) -> &str {
            "leaf"
        }

        fn kind(&self) -> ComponentKind {
            self.kind
        }

        fn state(&self) -> StateDecl {
            StateDecl::new().field("count", 0).field("local", 0)
        }

        fn effects(&self, effects: &mut EffectCollector) {
            let log = Rc::clone(&self.log);
            effects.on(&LifecycleEvent::Resume.action(), move |_, _, _| {
                log.borrow_mut().push("resume".to_string());
                Ok(())
            });
            let log = Rc::clone(&self.log);
            effects.on(&LifecycleEvent::Pause.action(), move |_, _, _| {
                log.borrow_mut().push("pause".to_string());
                Ok(())
            });
        }
    }

    struct Root {
        log: Rc<RefCell<Vec<String>>>,
        kind: ComponentKind,
    }

    impl Component for Root {
        fn name(&self) -> &str {
            "root"
        }

        fn state(&self) -> StateDecl {
            StateDecl::new().field("count", 1)
        }

        fn reducers(&self, reducers: &mut ReducerCollector) {
            reducers.on(&Action::private("add"), |state, payload| {
                let count: i64 = state.get("count")?;
                state.set("count", count + payload.as_i64().unwrap_or(1))?;
                Ok(Reduction::Updated)
            });
        }

        fn dependencies(&self, dependants: &mut DependantCollector) {
            dependants.add(
                "leaf",
                Dependant::new(
                    Leaf {
                        kind: self.kind,
                        log: Rc::clone(&self.log),
                    },
                    Connector::new().bind_parent("count", "count"),
                ),
            );
        }
    }

    fn runtime(async_install: bool) -> Runtime {
        Runtime::new(Config {
            frame_ticker: false,
            async_install,
            ..Config::default()
        })
        .unwrap()
    }

    fn page(runtime: &Runtime, kind: ComponentKind) -> (Page, Rc<RefCell<Vec<String>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = Root {
            log: Rc::clone(&log),
            kind,
        };
        let page = Page::new(runtime, "test", Dependant::new(root, Connector::new())).unwrap();
        (page, log)
    }

    #[test]
    fn sync_children_install_on_create_and_alias_parent_props() {
        let runtime = runtime(false);
        let (page, _) = page(&runtime, ComponentKind::TestComponent);
        assert_eq!(page.component_count(), 1);

        page.on_lifecycle(LifecycleEvent::Create);
        let leaf = page.find(&["leaf"]).unwrap();
        assert!(leaf.is_ready());
        assert_eq!(leaf.state().unwrap().get::<i64>("count").unwrap(), 1);

        let root = page.root().unwrap();
        root.context()
            .unwrap()
            .dispatch_reducer(&Action::private("add"), &json!(2))
            .unwrap();
        assert_eq!(leaf.state().unwrap().get::<i64>("count").unwrap(), 3);
    }

    #[test]
    fn async_install_queues_lifecycle_until_ready() {
        let runtime = runtime(true);
        let (page, log) = page(&runtime, ComponentKind::Component);

        page.on_lifecycle(LifecycleEvent::Create);
        page.on_lifecycle(LifecycleEvent::Start);
        page.on_lifecycle(LifecycleEvent::Resume);
        let leaf = page.find(&["leaf"]).unwrap();

        let ready = runtime.run_until(Duration::from_secs(5), || leaf.is_ready());
        assert!(ready);
        assert_eq!(leaf.pending_ops(), 0);
        page.on_lifecycle(LifecycleEvent::Pause);

        assert_eq!(*log.borrow(), vec!["resume".to_string(), "pause".to_string()]);
        assert_eq!(leaf.install_state(), InstallState::Ready {
            visibility: Visibility::Visible,
            attachment: Attachment::Attached,
        });
    }

    #[test]
    fn destroy_is_terminal_and_releases_the_tree() {
        let runtime = runtime(false);
        let (page, _) = page(&runtime, ComponentKind::TestComponent);
        page.on_lifecycle(LifecycleEvent::Create);
        let leaf = page.find(&["leaf"]).unwrap();

        page.destroy();
        page.destroy();

        assert!(page.is_destroyed());
        assert_eq!(leaf.install_state(), InstallState::Destroyed);
        assert_eq!(page.component_count(), 0);
        assert!(page.all_states().is_empty());
        assert!(!page.store().on_tick_at(Instant::now()));
    }
}
