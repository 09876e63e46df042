//! The single-writer dispatch loop.
//!
//! A [`Store`] owns canonical states, the sub-reducer table and the
//! observers. It is `!Send`: every mutation happens on the thread owning the
//! runtime, and the dispatch guard turns re-entrant dispatches (from
//! observers or scoped updates) into queued jobs instead of nested reducer
//! runs.

use super::{StoreId, StoreStatus};
use crate::domain::{Action, Payload, Result};
use crate::reducer::sub::run_recorded;
use crate::reducer::{CombinedSubReducers, Reduction, SubReducer};
use crate::state::{ChangeSet, DependantSlot, PropIndex, PropRef, State, StateToken};
use indexmap::IndexMap;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A change as seen by the observers of one state.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedChange {
    /// Key of the prop in the observer's state.
    pub key: String,
    /// Position of the prop in the observer's state.
    pub index: PropIndex,
    /// New value.
    pub value: Value,
}

/// Identity of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub(crate) type ObserverFn = Rc<dyn Fn(&[ObservedChange])>;

/// Scoped update run through the dispatch loop without an action.
pub(crate) type UpdateFn = Box<dyn FnOnce(&mut State) -> Result<Reduction>>;

/// Unit of work for the dispatch loop.
pub(crate) enum DispatchJob {
    Reduce {
        scope: StateToken,
        action: Action,
        payload: Payload,
    },
    Update {
        scope: StateToken,
        label: String,
        update: UpdateFn,
    },
}

impl DispatchJob {
    const fn scope(&self) -> StateToken {
        match self {
            Self::Reduce { scope, .. } | Self::Update { scope, .. } => *scope,
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Reduce { action, .. } => action.name(),
            Self::Update { label, .. } => label,
        }
    }
}

/// Changes of one dispatch, resolved per observing state.
#[derive(Debug, Default)]
pub(crate) struct Propagation {
    pub scope: Option<StateToken>,
    /// Effectively private changes of the dispatching state.
    pub private: Vec<ObservedChange>,
    /// Root and alias changes, keyed by the state that observes them.
    pub public: IndexMap<StateToken, Vec<ObservedChange>>,
}

impl Propagation {
    pub fn is_empty(&self) -> bool {
        self.private.is_empty() && self.public.is_empty()
    }

    /// Changes for `token`, private ones first.
    pub fn changes_for(&self, token: StateToken) -> Vec<ObservedChange> {
        let mut changes = Vec::new();
        if self.scope == Some(token) {
            changes.extend(self.private.iter().cloned());
        }
        if let Some(public) = self.public.get(&token) {
            changes.extend(public.iter().cloned());
        }
        changes
    }

    /// Every state touched, dispatching scope first.
    pub fn tokens(&self) -> Vec<StateToken> {
        let mut tokens: Vec<StateToken> = Vec::with_capacity(self.public.len() + 1);
        if let Some(scope) = self.scope {
            if !self.private.is_empty() || self.public.contains_key(&scope) {
                tokens.push(scope);
            }
        }
        for token in self.public.keys() {
            if !tokens.contains(token) {
                tokens.push(*token);
            }
        }
        tokens
    }
}

struct ObserverEntry {
    id: ObserverId,
    token: StateToken,
    callback: ObserverFn,
}

/// Resets the dispatch flag when a dispatch ends, even by unwinding.
struct DispatchGuard<'a> {
    status: &'a Cell<StoreStatus>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(status: &'a Cell<StoreStatus>) -> Self {
        status.set(StoreStatus::Dispatching);
        Self { status }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.status.get() == StoreStatus::Dispatching {
            self.status.set(StoreStatus::Idle);
        }
    }
}

/// Canonical state owner with a single-writer dispatch loop.
pub struct Store {
    id: StoreId,
    name: String,
    states: RefCell<IndexMap<StateToken, State>>,
    reducers: RefCell<CombinedSubReducers>,
    observers: RefCell<Vec<ObserverEntry>>,
    status: Cell<StoreStatus>,
    queue: RefCell<VecDeque<DispatchJob>>,
    next_observer: Cell<u64>,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: StoreId::next(),
            name: name.into(),
            states: RefCell::new(IndexMap::new()),
            reducers: RefCell::new(CombinedSubReducers::default()),
            observers: RefCell::new(Vec::new()),
            status: Cell::new(StoreStatus::Created),
            queue: RefCell::new(VecDeque::new()),
            next_observer: Cell::new(1),
        }
    }

    /// Returns the store id.
    #[must_use]
    pub const fn id(&self) -> StoreId {
        self.id
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the dispatch status.
    #[must_use]
    pub fn status(&self) -> StoreStatus {
        self.status.get()
    }

    /// Returns `true` while a dispatch is running.
    #[must_use]
    pub fn is_dispatching(&self) -> bool {
        self.status.get() == StoreStatus::Dispatching
    }

    /// Returns `true` once destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.status.get() == StoreStatus::Destroyed
    }

    /// Returns the number of jobs waiting behind the running dispatch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Takes ownership of a state.
    pub fn register_state(&self, state: State) -> StateToken {
        let token = state.token();
        tracing::debug!(store = %self.name, state = %state.name(), token = %token, "state registered");
        self.states.borrow_mut().insert(token, state);
        token
    }

    /// Removes a state, unlinking its aliases from their roots in this store.
    pub fn remove_state(&self, token: StateToken) -> Option<State> {
        let mut states = self.states.borrow_mut();
        let mut state = states.shift_remove(&token)?;
        for (_, link) in state.root_links() {
            if let Some(root) = states.get_mut(&link.prop.token) {
                root.remove_dependant(link.prop.index, token);
            }
        }
        drop(states);
        self.reducers.borrow_mut().remove(token);
        let snapshot = state.copy();
        state.clear();
        tracing::debug!(store = %self.name, token = %token, "state removed");
        Some(snapshot)
    }

    /// Returns `true` if the store owns `token`.
    #[must_use]
    pub fn contains_state(&self, token: StateToken) -> bool {
        self.states.borrow().contains_key(&token)
    }

    /// Returns the number of owned states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.borrow().len()
    }

    /// Reads a state in place.
    pub fn with_state<R>(&self, token: StateToken, read: impl FnOnce(&State) -> R) -> Option<R> {
        self.states.borrow().get(&token).map(read)
    }

    /// Returns a snapshot of one state.
    #[must_use]
    pub fn copy_state(&self, token: StateToken) -> Option<State> {
        self.with_state(token, State::copy)
    }

    /// Returns snapshots of every state, in registration order.
    #[must_use]
    pub fn all_states(&self) -> Vec<State> {
        self.states.borrow().values().map(State::copy).collect()
    }

    /// Installs the sub-reducer of one state.
    pub fn add_sub_reducer(&self, sub: SubReducer) {
        self.reducers.borrow_mut().insert(sub);
    }

    /// Removes the sub-reducer of `token`.
    pub fn remove_sub_reducer(&self, token: StateToken) -> bool {
        self.reducers.borrow_mut().remove(token).is_some()
    }

    /// Registers an observer for changes seen by `token`.
    pub fn observe(&self, token: StateToken, callback: impl Fn(&[ObservedChange]) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer.get());
        self.next_observer.set(id.0 + 1);
        self.observers.borrow_mut().push(ObserverEntry {
            id,
            token,
            callback: Rc::new(callback),
        });
        id
    }

    /// Removes an observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|entry| entry.id != id);
        observers.len() != before
    }

    /// Returns the number of observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    /// Records that `token` aliases the prop `root`, returning the root's
    /// current value.
    pub fn add_dependant(&self, root: PropRef, token: StateToken, slot: DependantSlot) -> Option<Value> {
        let mut states = self.states.borrow_mut();
        let state = states.get_mut(&root.token)?;
        let value = state.prop_at(root.index)?.value().clone();
        state.add_dependant(root.index, token, slot);
        Some(value)
    }

    /// Forgets that `token` aliases `root`.
    pub fn remove_dependant(&self, root: PropRef, token: StateToken) {
        if let Some(state) = self.states.borrow_mut().get_mut(&root.token) {
            state.remove_dependant(root.index, token);
        }
    }

    /// Writes a value without recording, e.g. to mirror a global root.
    pub fn inner_set(&self, token: StateToken, index: PropIndex, value: Value) -> bool {
        self.states
            .borrow_mut()
            .get_mut(&token)
            .is_some_and(|state| state.inner_set(index, value))
    }

    /// Runs `job`, or queues it behind the running dispatch.
    ///
    /// `sink` sees every propagation before the observers do.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ReducerInvariant`] when a reducer fails. Jobs
    /// still queued at that point are dropped.
    ///
    /// [`CanopyError::ReducerInvariant`]: crate::domain::CanopyError::ReducerInvariant
    pub(crate) fn dispatch(&self, job: DispatchJob, sink: &dyn Fn(&Propagation)) -> Result<()> {
        match self.status.get() {
            StoreStatus::Destroyed => {
                tracing::trace!(store = %self.name, action = %job.label(), "dispatch ignored on destroyed store");
                return Ok(());
            }
            StoreStatus::Dispatching => {
                tracing::debug!(store = %self.name, action = %job.label(), "dispatch queued");
                self.queue.borrow_mut().push_back(job);
                return Ok(());
            }
            StoreStatus::Created | StoreStatus::Idle => {}
        }

        let _guard = DispatchGuard::enter(&self.status);
        let mut next = Some(job);
        while let Some(job) = next.take() {
            if let Err(err) = self.run_job(job, sink) {
                let dropped = self.queue.borrow_mut().drain(..).count();
                tracing::error!(store = %self.name, error = %err, dropped, "dispatch aborted");
                return Err(err);
            }
            if self.is_destroyed() {
                self.queue.borrow_mut().clear();
                break;
            }
            next = self.queue.borrow_mut().pop_front();
        }
        Ok(())
    }

    fn run_job(&self, job: DispatchJob, sink: &dyn Fn(&Propagation)) -> Result<()> {
        let scope = job.scope();
        let label = job.label().to_string();
        let _span = tracing::debug_span!("dispatch", store = %self.name, scope = %scope, action = %label).entered();

        let propagation = {
            let mut states = self.states.borrow_mut();
            let Some(state) = states.get_mut(&scope) else {
                tracing::debug!("no state for scope, dispatch dropped");
                return Ok(());
            };

            let changes = match job {
                DispatchJob::Reduce { action, payload, .. } => {
                    let reducers = self.reducers.borrow();
                    let Some(sub) = reducers.get(scope) else {
                        tracing::trace!("scope has no reducer");
                        return Ok(());
                    };
                    sub.reduce(state, &action, &payload)?
                }
                DispatchJob::Update { update, .. } => run_recorded(state, &label, update)?,
            };

            let Some(changes) = changes else {
                tracing::debug!("reducer returned no-op");
                return Ok(());
            };
            Self::propagate(&mut states, scope, changes)
        };

        if propagation.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            private = propagation.private.len(),
            observers = propagation.public.len(),
            "changes propagated"
        );
        sink(&propagation);
        self.notify(&propagation);
        Ok(())
    }

    /// Resolves changes to roots, de-duplicates them and syncs every alias.
    fn propagate(
        states: &mut IndexMap<StateToken, State>,
        scope: StateToken,
        changes: ChangeSet,
    ) -> Propagation {
        let (private, public) = changes.into_parts();
        let private = private
            .into_iter()
            .map(|change| ObservedChange {
                key: change.key,
                index: change.index,
                value: change.value,
            })
            .collect();

        let mut roots: IndexMap<PropRef, Value> = IndexMap::new();
        for change in public {
            let root = match change.root {
                None => PropRef {
                    token: scope,
                    index: change.index,
                },
                Some(link) if !link.is_global() => link.prop,
                Some(_) => continue,
            };
            roots.insert(root, change.value);
        }

        let mut observed: IndexMap<StateToken, Vec<ObservedChange>> = IndexMap::new();
        for (root, value) in roots {
            let Some(root_state) = states.get_mut(&root.token) else {
                continue;
            };
            root_state.inner_set(root.index, value.clone());
            let Some(prop) = root_state.prop_at(root.index) else {
                continue;
            };
            let key = prop.key().to_string();
            let dependants: Vec<(StateToken, DependantSlot)> = prop
                .dependants()
                .map(|(token, slot)| (token, slot.clone()))
                .collect();

            observed.entry(root.token).or_default().push(ObservedChange {
                key,
                index: root.index,
                value: value.clone(),
            });
            for (token, slot) in dependants {
                if let Some(state) = states.get_mut(&token) {
                    state.inner_set(slot.index, value.clone());
                }
                observed.entry(token).or_default().push(ObservedChange {
                    key: slot.key,
                    index: slot.index,
                    value: value.clone(),
                });
            }
        }

        Propagation {
            scope: Some(scope),
            private,
            public: observed,
        }
    }

    /// Notifies observers, the dispatching state's observers first.
    pub(crate) fn notify(&self, propagation: &Propagation) {
        let mut targets: Vec<(StateToken, ObserverFn)> = self
            .observers
            .borrow()
            .iter()
            .map(|entry| (entry.token, Rc::clone(&entry.callback)))
            .collect();
        targets.sort_by_key(|(token, _)| Some(*token) != propagation.scope);

        for (token, callback) in targets {
            let changes = propagation.changes_for(token);
            if !changes.is_empty() {
                callback(&changes);
            }
        }
    }

    /// Tears the store down. Terminal.
    pub fn destroy(&self) {
        if self.status.replace(StoreStatus::Destroyed) == StoreStatus::Destroyed {
            return;
        }
        self.queue.borrow_mut().clear();
        self.observers.borrow_mut().clear();
        *self.reducers.borrow_mut() = CombinedSubReducers::default();
        for state in self.states.borrow_mut().values_mut() {
            state.clear();
        }
        self.states.borrow_mut().clear();
        tracing::debug!(store = %self.name, "store destroyed");
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status.get())
            .field("states", &self.state_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanopyError;
    use crate::reducer::on;
    use crate::state::{RootLink, StateDecl, StateKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn counter(kind: StateKind) -> State {
        let mut state = State::new("counter", kind);
        state
            .detect_fields(&StateDecl::new().field("count", 0).field("draft", ""))
            .unwrap();
        state
    }

    fn increment_reducer(token: StateToken) -> SubReducer {
        SubReducer::new(
            token,
            "counter",
            on(&Action::private("increment"), |state: &mut State, payload: &Payload| {
                let count: i64 = state.get("count")?;
                state.set("count", count + payload.as_i64().unwrap_or(1))?;
                Ok(Reduction::Updated)
            }),
        )
    }

    fn reduce(scope: StateToken, name: &str, payload: Payload) -> DispatchJob {
        DispatchJob::Reduce {
            scope,
            action: Action::private(name),
            payload,
        }
    }

    #[test]
    fn public_change_reaches_root_and_aliases_once() {
        let store = Store::new("page");
        let parent = store.register_state(counter(StateKind::Page));
        let mut child_state = counter(StateKind::Component);
        let root = PropRef {
            token: parent,
            index: PropIndex(0),
        };
        child_state
            .depend_on("count", RootLink::upper(root), json!(0))
            .unwrap();
        let child = child_state.token();
        store.register_state(child_state);
        store.add_dependant(
            root,
            child,
            DependantSlot {
                index: PropIndex(0),
                key: "count".to_string(),
            },
        );
        store.add_sub_reducer(increment_reducer(child));

        let seen = Rc::new(RefCell::new(Vec::new()));
        for token in [parent, child] {
            let seen = Rc::clone(&seen);
            store.observe(token, move |changes| {
                for change in changes {
                    seen.borrow_mut().push((token, change.key.clone(), change.value.clone()));
                }
            });
        }

        store.dispatch(reduce(child, "increment", json!(5)), &|_| {}).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                (child, "count".to_string(), json!(5)),
                (parent, "count".to_string(), json!(5)),
            ]
        );
        assert_eq!(store.with_state(parent, |s| s.get::<i64>("count").unwrap()), Some(5));
    }

    #[test]
    fn nested_dispatch_is_queued_not_inlined() {
        let store = Rc::new(Store::new("page"));
        let token = store.register_state(counter(StateKind::Component));
        store.add_sub_reducer(increment_reducer(token));

        let order = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&store);
        let log = Rc::clone(&order);
        store.observe(token, move |changes| {
            let value = changes[0].value.as_i64().unwrap_or_default();
            log.borrow_mut().push(value);
            if value == 1 {
                if let Some(store) = weak.upgrade() {
                    store.dispatch(reduce(token, "increment", json!(1)), &|_| {}).unwrap();
                    assert_eq!(store.queued(), 1);
                }
            }
        });

        store.dispatch(reduce(token, "increment", json!(1)), &|_| {}).unwrap();

        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(store.status(), StoreStatus::Idle);
    }

    #[test]
    fn reducer_failure_propagates_and_resets_guard() {
        let store = Store::new("page");
        let token = store.register_state(counter(StateKind::Component));
        store.add_sub_reducer(SubReducer::new(
            token,
            "counter",
            |_: &mut State, _: &Action, _: &Payload| -> Result<Reduction> {
                Err(CanopyError::Detection("bad".to_string()))
            },
        ));

        let err = store
            .dispatch(reduce(token, "increment", json!(1)), &|_| {})
            .unwrap_err();

        assert!(matches!(err, CanopyError::ReducerInvariant { .. }));
        assert!(!store.is_dispatching());
    }

    #[test]
    fn private_changes_only_reach_their_own_state() {
        let store = Store::new("page");
        let parent = store.register_state(counter(StateKind::Page));
        let child = store.register_state(counter(StateKind::Component));
        store.add_sub_reducer(increment_reducer(child));

        let parent_calls = Rc::new(Cell::new(0));
        let calls = Rc::clone(&parent_calls);
        store.observe(parent, move |_| calls.set(calls.get() + 1));
        let child_calls = Rc::new(Cell::new(0));
        let calls = Rc::clone(&child_calls);
        store.observe(child, move |_| calls.set(calls.get() + 1));

        store.dispatch(reduce(child, "increment", json!(1)), &|_| {}).unwrap();

        assert_eq!(parent_calls.get(), 0);
        assert_eq!(child_calls.get(), 1);
    }

    #[test]
    fn destroyed_store_ignores_dispatch() {
        let store = Store::new("page");
        let token = store.register_state(counter(StateKind::Component));
        store.add_sub_reducer(increment_reducer(token));
        store.destroy();

        store.dispatch(reduce(token, "increment", json!(1)), &|_| {}).unwrap();
        assert_eq!(store.state_count(), 0);
        assert_eq!(store.status(), StoreStatus::Destroyed);
    }
}
