//! Declarations of a state's fields.
//!
//! A [`StateDecl`] lists the props a component's state owns, in order, with
//! their initial values. It is plain data (`Send`), so it can be handed to a
//! detection worker and turned into a [`State`](super::State) off the main
//! context.

use serde_json::Value;

/// Declaration of one prop.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    key: String,
    initial: Value,
    private: bool,
    update_with_initial_value: bool,
}

impl FieldDecl {
    /// Declares a private prop that takes part in the first view update.
    #[must_use]
    pub fn new(key: impl Into<String>, initial: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            initial: initial.into(),
            private: true,
            update_with_initial_value: true,
        }
    }

    /// Marks the prop public: its changes are visible to other states.
    #[must_use]
    pub const fn public(mut self) -> Self {
        self.private = false;
        self
    }

    /// Leaves the prop out of the first view update.
    #[must_use]
    pub const fn skip_initial_update(mut self) -> Self {
        self.update_with_initial_value = false;
        self
    }

    /// Returns the prop key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the initial value.
    #[must_use]
    pub const fn initial(&self) -> &Value {
        &self.initial
    }

    /// Returns `true` if the prop is declared private.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.private
    }

    /// Returns `true` if the prop takes part in the first view update.
    #[must_use]
    pub const fn update_with_initial_value(&self) -> bool {
        self.update_with_initial_value
    }
}

/// Ordered list of field declarations for one state.
///
/// # Example
///
/// ```rust
/// use canopy::state::{FieldDecl, StateDecl};
/// use serde_json::json;
///
/// let decl = StateDecl::new()
///     .field("count", 0)
///     .field("labels", json!(["a", "b"]))
///     .with(FieldDecl::new("title", "counter").public());
///
/// assert_eq!(decl.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDecl {
    fields: Vec<FieldDecl>,
}

impl StateDecl {
    /// Creates an empty declaration.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Adds a private prop with default flags.
    #[must_use]
    pub fn field(self, key: impl Into<String>, initial: impl Into<Value>) -> Self {
        self.with(FieldDecl::new(key, initial))
    }

    /// Adds a public prop with default flags.
    #[must_use]
    pub fn public_field(self, key: impl Into<String>, initial: impl Into<Value>) -> Self {
        self.with(FieldDecl::new(key, initial).public())
    }

    /// Adds a fully specified prop.
    #[must_use]
    pub fn with(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    /// Returns the declared fields in order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    /// Returns the number of declared fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
