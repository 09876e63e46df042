//! The state container: an ordered table of reactive props.
//!
//! A [`State`] is built once per component instance through field discovery
//! ([`State::detect_fields`]); afterwards its key set never changes, which is
//! what keeps [`PropIndex`] handles valid.
//!
//! # Recording
//!
//! Props can only be written while the state is recording. Recording is
//! opened by the store around a reducer run and closed with either
//! [`State::end_recording`], which yields the [`ChangeSet`], or
//! [`State::discard_recording`], which restores every touched prop.
//!
//! ```text
//! begin_recording ──► set / set / set ──► end_recording ──► ChangeSet
//!                          │                                 ├─ private
//!                          └──► discard_recording (undo)     └─ public
//! ```

use super::decl::StateDecl;
use super::prop::{DependantSlot, PropIndex, PropRef, ReactiveProp, RootLink};
use crate::domain::error::{CanopyError, Result};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one state instance.
///
/// Observers, sub-reducers and prop aliases are all keyed by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateToken(u64);

impl StateToken {
    pub(crate) fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Which kind of owner a state belongs to.
///
/// Page and global states expose their props publicly by default; component
/// states keep declared-private props private.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Root state of a page.
    Page,
    /// State of a component installed below a page.
    Component,
    /// State of a global store.
    Global,
}

/// One recorded prop change.
#[derive(Debug, Clone, PartialEq)]
pub struct PropChange {
    /// Key of the changed prop.
    pub key: String,
    /// Position of the changed prop.
    pub index: PropIndex,
    /// Value after the reducer ran.
    pub value: Value,
    /// Root the change is redirected to, if the prop is an alias.
    pub root: Option<RootLink>,
}

/// Changes extracted from one recording, split by visibility.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    private: Vec<PropChange>,
    public: Vec<PropChange>,
}

impl ChangeSet {
    /// Changes to effectively private props, in first-touch order.
    #[must_use]
    pub fn private(&self) -> &[PropChange] {
        &self.private
    }

    /// Changes to public or aliased props, in first-touch order.
    #[must_use]
    pub fn public(&self) -> &[PropChange] {
        &self.public
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.private.is_empty() && self.public.is_empty()
    }

    /// Returns the number of changed props.
    #[must_use]
    pub fn len(&self) -> usize {
        self.private.len() + self.public.len()
    }

    /// Iterates the keys of all changed props, private first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.private
            .iter()
            .chain(self.public.iter())
            .map(|change| change.key.as_str())
    }

    pub(crate) fn into_parts(self) -> (Vec<PropChange>, Vec<PropChange>) {
        (self.private, self.public)
    }
}

/// Marker into the undo log, see [`State::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Default)]
struct Recorder {
    /// Undo log of `(prop, previous value)`, in write order.
    log: Vec<(PropIndex, Value)>,
}

/// Ordered mapping from key to [`ReactiveProp`].
pub struct State {
    token: StateToken,
    name: String,
    kind: StateKind,
    props: IndexMap<String, ReactiveProp>,
    detected: bool,
    recorder: Option<Recorder>,
}

impl State {
    /// Creates an empty, undetected state with a fresh token.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self::with_token(StateToken::next(), name, kind)
    }

    pub(crate) fn with_token(token: StateToken, name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            token,
            name: name.into(),
            kind,
            props: IndexMap::new(),
            detected: false,
            recorder: None,
        }
    }

    /// Builds the prop table from a declaration.
    ///
    /// Runs once: a second call on a detected state is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Detection`] if the declaration repeats a key.
    pub fn detect_fields(&mut self, decl: &StateDecl) -> Result<()> {
        if self.detected {
            tracing::trace!(state = %self.name, token = %self.token, "fields already detected");
            return Ok(());
        }

        let public_by_default = matches!(self.kind, StateKind::Page | StateKind::Global);
        let mut props = IndexMap::with_capacity(decl.len());
        for field in decl.fields() {
            if props.contains_key(field.key()) {
                return Err(CanopyError::Detection(format!(
                    "duplicate prop `{}` in state `{}`",
                    field.key(),
                    self.name
                )));
            }
            let prop = ReactiveProp::new(
                field.key().to_string(),
                field.initial().clone(),
                field.is_private() && !public_by_default,
                field.update_with_initial_value(),
            );
            props.insert(field.key().to_string(), prop);
        }

        tracing::debug!(state = %self.name, token = %self.token, props = props.len(), "fields detected");
        self.props = props;
        self.detected = true;
        Ok(())
    }

    /// Returns `true` once [`detect_fields`](Self::detect_fields) succeeded.
    #[must_use]
    pub const fn is_detected(&self) -> bool {
        self.detected
    }

    /// Returns the state token.
    #[must_use]
    pub const fn token(&self) -> StateToken {
        self.token
    }

    /// Returns the owner name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owner kind.
    #[must_use]
    pub const fn kind(&self) -> StateKind {
        self.kind
    }

    /// Returns the number of props.
    #[must_use]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Returns `true` if the state has no props.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Iterates keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    /// Iterates props in declaration order.
    pub fn props(&self) -> impl Iterator<Item = &ReactiveProp> {
        self.props.values()
    }

    /// Looks up a prop by key.
    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&ReactiveProp> {
        self.props.get(key)
    }

    /// Looks up a prop by position.
    #[must_use]
    pub fn prop_at(&self, index: PropIndex) -> Option<&ReactiveProp> {
        self.props.get_index(index.0).map(|(_, prop)| prop)
    }

    /// Returns the position of `key`.
    #[must_use]
    pub fn index_of(&self, key: &str) -> Option<PropIndex> {
        self.props.get_index_of(key).map(PropIndex)
    }

    /// Returns a handle to the prop named `key`.
    #[must_use]
    pub fn prop_ref(&self, key: &str) -> Option<PropRef> {
        self.index_of(key).map(|index| PropRef {
            token: self.token,
            index,
        })
    }

    /// Returns the raw value of `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.props.get(key).map(ReactiveProp::value)
    }

    /// Reads and converts the value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] if the key does not exist, or
    /// [`CanopyError::PropType`] if the value does not convert into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.props
            .get(key)
            .ok_or_else(|| self.unknown(key))
            .and_then(|prop| prop.get())
    }

    /// Writes a prop. Only valid while recording.
    ///
    /// # Errors
    ///
    /// - [`CanopyError::NotInReducer`] outside a recording scope
    /// - [`CanopyError::UnknownProp`] for an undeclared key
    /// - [`CanopyError::ActionScope`] if the prop is bound to a global store
    /// - [`CanopyError::PropType`] if `value` does not serialize
    pub fn set<V: Serialize>(&mut self, key: &str, value: V) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| CanopyError::PropType {
            key: key.to_string(),
            source,
        })?;
        self.set_value(key, value)
    }

    /// Writes a raw JSON value. Only valid while recording.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set), without the conversion failure.
    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Err(CanopyError::NotInReducer {
                key: key.to_string(),
            });
        };
        let Some((index, _, prop)) = self.props.get_full_mut(key) else {
            return Err(CanopyError::UnknownProp {
                key: key.to_string(),
                state: self.name.clone(),
            });
        };
        if prop.is_bound_to_global() {
            return Err(CanopyError::ActionScope(format!(
                "prop `{key}` of `{}` is owned by a global store",
                self.name
            )));
        }

        let previous = prop.value().clone();
        prop.inner_set(value);
        recorder.log.push((PropIndex(index), previous));
        Ok(())
    }

    /// Opens a recording scope. Re-opening an open scope keeps its log.
    pub fn begin_recording(&mut self) {
        if self.recorder.is_none() {
            self.recorder = Some(Recorder::default());
        }
    }

    /// Returns `true` while a recording scope is open.
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Closes the recording scope and extracts the changes.
    ///
    /// Each touched prop appears once, at the position of its first write,
    /// with its final value.
    pub fn end_recording(&mut self) -> ChangeSet {
        let Some(recorder) = self.recorder.take() else {
            return ChangeSet::default();
        };

        let mut touched: Vec<PropIndex> = Vec::with_capacity(recorder.log.len());
        for (index, _) in recorder.log {
            if !touched.contains(&index) {
                touched.push(index);
            }
        }

        let mut changes = ChangeSet::default();
        for index in touched {
            let Some((key, prop)) = self.props.get_index(index.0) else {
                continue;
            };
            let change = PropChange {
                key: key.clone(),
                index,
                value: prop.value().clone(),
                root: prop.root(),
            };
            if prop.is_private() {
                changes.private.push(change);
            } else {
                changes.public.push(change);
            }
        }
        changes
    }

    /// Closes the recording scope and restores every touched prop.
    pub fn discard_recording(&mut self) {
        if self.recorder.is_some() {
            self.rollback_to(Checkpoint(0));
            self.recorder = None;
        }
    }

    /// Marks the current position of the undo log.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.recorder.as_ref().map_or(0, |r| r.log.len()))
    }

    /// Undoes every write made after `checkpoint`, keeping the scope open.
    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        while recorder.log.len() > checkpoint.0 {
            let Some((index, previous)) = recorder.log.pop() else {
                break;
            };
            if let Some((_, prop)) = self.props.get_index_mut(index.0) {
                prop.inner_set(previous);
            }
        }
    }

    /// Aliases the prop `key` to a root prop of another state.
    ///
    /// `value` is the root's current value. A prop that already has a root
    /// keeps it.
    ///
    /// # Errors
    ///
    /// - [`CanopyError::UnknownProp`] for an undeclared key
    /// - [`CanopyError::DependencyCycle`] if the root is in this state
    pub fn depend_on(&mut self, key: &str, root: RootLink, value: Value) -> Result<()> {
        let index = self.index_of(key).ok_or_else(|| self.unknown(key))?;
        if root.prop.token == self.token {
            return Err(CanopyError::DependencyCycle {
                key: key.to_string(),
            });
        }

        let Some((_, prop)) = self.props.get_index_mut(index.0) else {
            return Err(self.unknown(key));
        };
        if prop.root().is_some() {
            return Ok(());
        }
        prop.link_root(root);
        prop.inner_set(value);
        Ok(())
    }

    /// Marks a prop private. Aliased props stay effectively public.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] for an undeclared key.
    pub fn mark_private(&mut self, key: &str) -> Result<()> {
        self.set_private(key, true)
    }

    /// Marks a prop public.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] for an undeclared key.
    pub fn mark_public(&mut self, key: &str) -> Result<()> {
        self.set_private(key, false)
    }

    fn set_private(&mut self, key: &str, private: bool) -> Result<()> {
        match self.props.get_mut(key) {
            Some(prop) => {
                prop.set_private(private);
                Ok(())
            }
            None => Err(self.unknown(key)),
        }
    }

    /// Returns every `(prop, root)` alias of this state.
    #[must_use]
    pub fn root_links(&self) -> Vec<(PropIndex, RootLink)> {
        self.props
            .values()
            .enumerate()
            .filter_map(|(i, prop)| prop.root().map(|link| (PropIndex(i), link)))
            .collect()
    }

    /// Produces an independent snapshot: same token, values and links, no
    /// recording scope.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            token: self.token,
            name: self.name.clone(),
            kind: self.kind,
            props: self.props.clone(),
            detected: self.detected,
            recorder: None,
        }
    }

    /// Releases every prop. Used at teardown.
    pub fn clear(&mut self) {
        self.props.clear();
        self.recorder = None;
    }

    /// Renders the values as a JSON object, in declaration order.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .props
            .iter()
            .map(|(key, prop)| (key.clone(), prop.value().clone()))
            .collect();
        Value::Object(map)
    }

    /// Replaces a value without recording. Used to sync aliases.
    pub(crate) fn inner_set(&mut self, index: PropIndex, value: Value) -> bool {
        match self.props.get_index_mut(index.0) {
            Some((_, prop)) => {
                prop.inner_set(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn add_dependant(&mut self, index: PropIndex, token: StateToken, slot: DependantSlot) {
        if let Some((_, prop)) = self.props.get_index_mut(index.0) {
            prop.add_dependant(token, slot);
        }
    }

    pub(crate) fn remove_dependant(&mut self, index: PropIndex, token: StateToken) {
        if let Some((_, prop)) = self.props.get_index_mut(index.0) {
            prop.remove_dependant(token);
        }
    }

    fn unknown(&self, key: &str) -> CanopyError {
        CanopyError::UnknownProp {
            key: key.to_string(),
            state: self.name.clone(),
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token && self.props == other.props
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("values", &self.to_json())
            .field("recording", &self.recorder.is_some())
            .finish()
    }
}
