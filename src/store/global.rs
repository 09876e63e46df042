//! Process-wide stores shared by pages.
//!
//! A [`GlobalStore`] owns one state with its own reducers and effects.
//! Components alias its props through
//! [`Connector::bind_global`](crate::component::Connector::bind_global): the
//! aliases are read-only on the component side, and changes made by the
//! global store's reducers are pushed into every bound page through store
//! observers.

use super::dispatcher::{DispatchJob, ObservedChange, Store};
use super::{ObserverId, StoreId};
use crate::domain::{Action, CanopyError, Payload, Result};
use crate::effect::{isolate, EffectReport};
use crate::reducer::{ReducerCollector, Reduction, SubReducer};
use crate::state::{DependantSlot, PropRef, State, StateDecl, StateKind, StateToken};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Side-effect handler of a global store.
pub type GlobalEffect = Rc<dyn Fn(&Action, &GlobalStore, &Payload) -> Result<()>>;

/// A store living outside any page.
pub struct GlobalStore {
    store: Store,
    token: StateToken,
    effects: RefCell<IndexMap<String, GlobalEffect>>,
}

impl GlobalStore {
    /// Creates a global store and detects its state.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Detection`] if the declaration is invalid.
    pub fn new(name: impl Into<String>, decl: &StateDecl) -> Result<Rc<Self>> {
        let name = name.into();
        let mut state = State::new(name.clone(), StateKind::Global);
        state.detect_fields(decl)?;
        let store = Store::new(name);
        let token = store.register_state(state);
        tracing::debug!(store = %store.name(), token = %token, "global store created");
        Ok(Rc::new(Self {
            store,
            token,
            effects: RefCell::new(IndexMap::new()),
        }))
    }

    /// Returns the store id.
    #[must_use]
    pub const fn id(&self) -> StoreId {
        self.store.id()
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Returns the token of the global state.
    #[must_use]
    pub const fn token(&self) -> StateToken {
        self.token
    }

    /// Installs the reducers of the global state, replacing earlier ones.
    pub fn add_reducers(&self, reducers: ReducerCollector) {
        self.store
            .add_sub_reducer(SubReducer::new(self.token, self.name(), reducers.into_reducer()));
    }

    /// Registers the effect handler for `action`.
    pub fn on_effect<F>(&self, action: &Action, handler: F)
    where
        F: Fn(&Action, &GlobalStore, &Payload) -> Result<()> + 'static,
    {
        self.effects
            .borrow_mut()
            .insert(action.name().to_string(), Rc::new(handler));
    }

    /// Returns a snapshot of the global state.
    #[must_use]
    pub fn copy_state(&self) -> State {
        self.store
            .copy_state(self.token)
            .unwrap_or_else(|| State::new(self.name(), StateKind::Global))
    }

    /// Reads one prop.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] or [`CanopyError::PropType`].
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.store
            .with_state(self.token, |state| state.get(key))
            .unwrap_or_else(|| {
                Err(CanopyError::UnknownProp {
                    key: key.to_string(),
                    state: self.name().to_string(),
                })
            })
    }

    /// Runs the global reducers.
    ///
    /// # Errors
    ///
    /// Propagates reducer failures.
    pub fn dispatch_reducer(&self, action: &Action, payload: &Payload) -> Result<()> {
        self.store.dispatch(
            DispatchJob::Reduce {
                scope: self.token,
                action: action.clone(),
                payload: payload.clone(),
            },
            &|_| {},
        )
    }

    /// Runs a scoped update of the global state.
    ///
    /// # Errors
    ///
    /// Propagates failures of `update`.
    pub fn update_state<F>(&self, label: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut State) -> Result<Reduction> + 'static,
    {
        self.store.dispatch(
            DispatchJob::Update {
                scope: self.token,
                label: label.to_string(),
                update: Box::new(update),
            },
            &|_| {},
        )
    }

    /// Runs the effect handler of `action`, isolated.
    pub fn dispatch_effect(&self, action: &Action, payload: &Payload) -> EffectReport {
        let mut report = EffectReport::default();
        let handler = self.effects.borrow().get(action.name()).cloned();
        if let Some(handler) = handler {
            report.record(isolate(action, self.name(), || handler(action, self, payload)));
        }
        report
    }

    /// Observes changes seen by `token`: the global state itself, or a
    /// component state bound to it.
    pub fn observe(&self, token: StateToken, callback: impl Fn(&[ObservedChange]) + 'static) -> ObserverId {
        self.store.observe(token, callback)
    }

    /// Removes an observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.store.remove_observer(id)
    }

    /// Returns the number of observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.store.observer_count()
    }

    /// Returns the handle of the global prop `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] if the key does not exist.
    pub fn prop_ref(&self, key: &str) -> Result<PropRef> {
        self.store
            .with_state(self.token, |state| state.prop_ref(key))
            .flatten()
            .ok_or_else(|| CanopyError::UnknownProp {
                key: key.to_string(),
                state: self.name().to_string(),
            })
    }

    /// Records that prop `slot` of `token` aliases the global prop `root`,
    /// returning its current value.
    pub(crate) fn bind(&self, root: PropRef, token: StateToken, slot: DependantSlot) -> Result<Value> {
        self.store.add_dependant(root, token, slot).ok_or_else(|| {
            CanopyError::Detection(format!(
                "global store `{}` has no prop at index {}",
                self.name(),
                root.index.get()
            ))
        })
    }

    /// Forgets an alias made with [`bind`](Self::bind).
    pub(crate) fn unbind(&self, root: PropRef, token: StateToken) {
        self.store.remove_dependant(root, token);
    }

    /// Returns the number of component props aliasing `key`.
    #[must_use]
    pub fn dependant_count(&self, key: &str) -> usize {
        self.store
            .with_state(self.token, |state| {
                state.prop(key).map_or(0, |prop| prop.dependants().count())
            })
            .unwrap_or(0)
    }
}

impl fmt::Debug for GlobalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalStore")
            .field("store", &self.store)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PropIndex;
    use serde_json::json;
    use std::cell::Cell;

    fn session() -> Rc<GlobalStore> {
        let store = GlobalStore::new("session", &StateDecl::new().field("user", "guest")).unwrap();
        let mut reducers = ReducerCollector::new();
        reducers.on(&Action::public("login"), |state, payload| {
            state.set_value("user", payload.clone())?;
            Ok(Reduction::Updated)
        });
        store.add_reducers(reducers);
        store
    }

    #[test]
    fn reducer_changes_reach_bound_tokens() {
        let store = session();
        let component = StateToken::next();
        let root = store.prop_ref("user").unwrap();
        let value = store
            .bind(
                root,
                component,
                DependantSlot {
                    index: PropIndex(3),
                    key: "who".to_string(),
                },
            )
            .unwrap();
        assert_eq!(value, json!("guest"));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.observe(component, move |changes| sink.borrow_mut().extend(changes.to_vec()));

        store.dispatch_reducer(&Action::public("login"), &json!("ada")).unwrap();

        assert_eq!(store.get::<String>("user").unwrap(), "ada");
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].key, "who");
        assert_eq!(seen.borrow()[0].index, PropIndex(3));
        assert_eq!(store.dependant_count("user"), 1);
    }

    #[test]
    fn effects_are_isolated() {
        let store = session();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        store.on_effect(&Action::public("refresh"), move |_, store, _| {
            flag.set(true);
            store.dispatch_reducer(&Action::public("login"), &json!("bot"))?;
            Err(CanopyError::Detection("offline".into()))
        });

        let report = store.dispatch_effect(&Action::public("refresh"), &json!(null));

        assert!(ran.get());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.get::<String>("user").unwrap(), "bot");
    }

    #[test]
    fn binding_an_unknown_key_fails() {
        let store = session();
        let err = store.prop_ref("missing").unwrap_err();
        assert!(matches!(err, CanopyError::UnknownProp { .. }));

        let bogus = PropRef {
            token: store.token(),
            index: PropIndex(9),
        };
        let slot = DependantSlot {
            index: PropIndex(0),
            key: "x".to_string(),
        };
        assert!(store.bind(bogus, StateToken::next(), slot).is_err());
    }
}
