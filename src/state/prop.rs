//! Dependency-tracked value cells.
//!
//! A [`ReactiveProp`] is one field of a [`State`]. It holds a JSON value and
//! may alias a prop of another state, its *root*. Aliasing is expressed with
//! index handles ([`PropRef`]) into the owning state's prop table instead of
//! pointers, so a root link never keeps anything alive.
//!
//! # Root resolution
//!
//! ```text
//!   page state            child state           grandchild state
//!   ┌──────────┐          ┌──────────┐          ┌──────────┐
//!   │ count ●──┼──────────┼─ count   │          │          │
//!   │          │◄─────────┼──────────┼──────────┼─ total   │
//!   └──────────┘  root    └──────────┘  root    └──────────┘
//! ```
//!
//! Links are flattened when they are formed: binding `total` to the child's
//! `count` stores the page's `count` as root, so a prop is never more than
//! one hop away from the prop that is recorded as changed.

use super::container::{State, StateToken};
use crate::domain::error::{CanopyError, Result};
use crate::store::StoreId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Position of a prop inside its state's prop table.
///
/// Stable for the life of the state: key sets never change after detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropIndex(pub(crate) usize);

impl PropIndex {
    /// Returns the raw table position.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Handle to one prop of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropRef {
    /// State owning the prop.
    pub token: StateToken,
    /// Position inside that state.
    pub index: PropIndex,
}

/// Where the root of an aliased prop lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropOrigin {
    /// A state of an ancestor component on the same page.
    Upper,
    /// The state of a global store. Components can read but never write it.
    Global(StoreId),
}

/// Non-owning link from an aliased prop to its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootLink {
    /// The root prop.
    pub prop: PropRef,
    /// Store family owning the root.
    pub origin: PropOrigin,
}

impl RootLink {
    /// Link to a prop of an ancestor component.
    #[must_use]
    pub const fn upper(prop: PropRef) -> Self {
        Self {
            prop,
            origin: PropOrigin::Upper,
        }
    }

    /// Link to a prop of a global store.
    #[must_use]
    pub const fn global(store: StoreId, prop: PropRef) -> Self {
        Self {
            prop,
            origin: PropOrigin::Global(store),
        }
    }

    /// Returns `true` when the root is owned by a global store.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        matches!(self.origin, PropOrigin::Global(_))
    }
}

/// A prop of another state aliasing this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependantSlot {
    /// Position of the aliasing prop in its own state.
    pub index: PropIndex,
    /// Key of the aliasing prop in its own state.
    pub key: String,
}

/// One dependency-tracked field of a state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactiveProp {
    key: String,
    value: Value,
    private: bool,
    update_with_initial_value: bool,
    root: Option<RootLink>,
    dependants: BTreeMap<StateToken, DependantSlot>,
}

impl ReactiveProp {
    pub(crate) fn new(
        key: String,
        value: Value,
        private: bool,
        update_with_initial_value: bool,
    ) -> Self {
        Self {
            key,
            value,
            private,
            update_with_initial_value,
            root: None,
            dependants: BTreeMap::new(),
        }
    }

    /// Returns the prop key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Converts the value to `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::PropType`] if the stored value does not
    /// deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(|source| CanopyError::PropType {
            key: self.key.clone(),
            source,
        })
    }

    /// Returns `true` when changes to this prop stay within its component.
    ///
    /// A prop is only effectively private while it is marked private, is its
    /// own root and has no other state aliasing it.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private && self.root.is_none() && self.dependants.is_empty()
    }

    /// Returns `true` when the prop was declared or marked private,
    /// regardless of its links.
    #[must_use]
    pub const fn is_marked_private(&self) -> bool {
        self.private
    }

    /// Returns `true` when the first view update should include this prop.
    #[must_use]
    pub const fn update_with_initial_value(&self) -> bool {
        self.update_with_initial_value
    }

    /// Returns the root link, or `None` when the prop is its own root.
    #[must_use]
    pub const fn root(&self) -> Option<RootLink> {
        self.root
    }

    /// Returns `true` when the root lives in a global store.
    #[must_use]
    pub fn is_bound_to_global(&self) -> bool {
        self.root.is_some_and(|link| link.is_global())
    }

    /// Iterates the states aliasing this prop.
    pub fn dependants(&self) -> impl Iterator<Item = (StateToken, &DependantSlot)> {
        self.dependants.iter().map(|(token, slot)| (*token, slot))
    }

    /// Returns the alias held by `token`, if any.
    #[must_use]
    pub fn dependant_of(&self, token: StateToken) -> Option<&DependantSlot> {
        self.dependants.get(&token)
    }

    pub(crate) fn set_private(&mut self, private: bool) {
        self.private = private;
    }

    /// Replaces the value without touching any recording.
    pub(crate) fn inner_set(&mut self, value: Value) {
        self.value = value;
    }

    pub(crate) fn link_root(&mut self, link: RootLink) {
        self.root = Some(link);
    }

    pub(crate) fn add_dependant(&mut self, token: StateToken, slot: DependantSlot) {
        self.dependants.insert(token, slot);
    }

    pub(crate) fn remove_dependant(&mut self, token: StateToken) -> Option<DependantSlot> {
        self.dependants.remove(&token)
    }
}

/// Typed, statically keyed accessor for a prop.
///
/// # Example
///
/// ```rust
/// use canopy::state::{Field, State, StateDecl, StateKind};
///
/// const COUNT: Field<i64> = Field::new("count");
///
/// let mut state = State::new("counter", StateKind::Component);
/// state.detect_fields(&StateDecl::new().field("count", 0))?;
///
/// state.begin_recording();
/// COUNT.set(&mut state, 3)?;
/// state.end_recording();
///
/// assert_eq!(COUNT.get(&state)?, 3);
/// # Ok::<(), canopy::CanopyError>(())
/// ```
pub struct Field<T> {
    key: &'static str,
    marker: PhantomData<fn() -> T>,
}

impl<T> Field<T> {
    /// Creates an accessor for the prop named `key`.
    #[must_use]
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            marker: PhantomData,
        }
    }

    /// Returns the prop key.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        self.key
    }
}

impl<T: Serialize + DeserializeOwned> Field<T> {
    /// Reads and converts the prop value.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::UnknownProp`] or [`CanopyError::PropType`].
    pub fn get(&self, state: &State) -> Result<T> {
        state.get(self.key)
    }

    /// Writes the prop. Only valid while the state is recording.
    ///
    /// # Errors
    ///
    /// See [`State::set`].
    pub fn set(&self, state: &mut State, value: T) -> Result<()> {
        state.set(self.key, value)
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("key", &self.key).finish()
    }
}
