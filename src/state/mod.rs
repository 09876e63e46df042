//! Dependency-tracked state.
//!
//! # Organization
//!
//! - [`prop`]: [`ReactiveProp`] cells, index handles and typed [`Field`] accessors
//! - [`decl`]: [`StateDecl`] field declarations used for discovery
//! - [`container`]: the [`State`] table with change recording and snapshots

pub mod container;
pub mod decl;
pub mod prop;

pub use container::{ChangeSet, Checkpoint, PropChange, State, StateKind, StateToken};
pub use decl::{FieldDecl, StateDecl};
pub use prop::{DependantSlot, Field, PropIndex, PropOrigin, PropRef, ReactiveProp, RootLink};
