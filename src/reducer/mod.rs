//! Reducers: state transitions keyed by action.
//!
//! A [`Reducer`] mutates a recording [`State`] and reports whether it handled
//! the action. [`Reduction::NoOp`] means "not mine": the store rolls back any
//! write the reducer made and notifies nobody.
//!
//! # Composition
//!
//! ```text
//!  component reducers ──combine──► Combined ──SubReducer(token)──┐
//!                                                               ├─► CombinedSubReducers
//!  other components  ──combine──► Combined ──SubReducer(token)──┘      (keyed by token)
//! ```
//!
//! - [`combine`] folds one component's reducers: the first one returning
//!   [`Reduction::Updated`] wins and later ones are not tried.
//! - [`SubReducer`] scopes a combined reducer to one component state and
//!   attributes the recorded changes to it.
//! - [`combine_sub_reducers`] builds the per-page table; dispatch looks up the
//!   scope token directly instead of probing every component.
//!
//! # Example
//!
//! ```rust
//! use canopy::domain::{Action, Payload};
//! use canopy::reducer::{Reduction, ReducerCollector};
//!
//! let mut reducers = ReducerCollector::new();
//! reducers.on(&Action::private("increment"), |state, payload: &Payload| {
//!     let step = payload.as_i64().unwrap_or(1);
//!     let count: i64 = state.get("count")?;
//!     state.set("count", count + step)?;
//!     Ok(Reduction::Updated)
//! });
//! assert_eq!(reducers.len(), 1);
//! ```

pub mod sub;

pub use sub::{combine_sub_reducers, CombinedSubReducers, SubReducer};

use crate::domain::{Action, Payload, Result};
use crate::state::State;

/// Outcome of a reducer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// The reducer handled the action; recorded changes are kept.
    Updated,
    /// The reducer ignored the action; recorded changes are rolled back.
    NoOp,
}

/// A state transition function.
///
/// Returning an error is a broken invariant: the dispatch is rolled back and
/// the error reaches the dispatcher as
/// [`CanopyError::ReducerInvariant`](crate::domain::CanopyError::ReducerInvariant).
pub trait Reducer {
    /// Applies `action` to `state`.
    ///
    /// # Errors
    ///
    /// Any error aborts the dispatch.
    fn reduce(&self, state: &mut State, action: &Action, payload: &Payload) -> Result<Reduction>;
}

impl<F> Reducer for F
where
    F: Fn(&mut State, &Action, &Payload) -> Result<Reduction>,
{
    fn reduce(&self, state: &mut State, action: &Action, payload: &Payload) -> Result<Reduction> {
        self(state, action, payload)
    }
}

/// Reducer bound to a single action name; other actions are a no-op.
pub struct ActionReducer<F> {
    action: String,
    handler: F,
}

impl<F> Reducer for ActionReducer<F>
where
    F: Fn(&mut State, &Payload) -> Result<Reduction>,
{
    fn reduce(&self, state: &mut State, action: &Action, payload: &Payload) -> Result<Reduction> {
        if action.name() != self.action {
            return Ok(Reduction::NoOp);
        }
        (self.handler)(state, payload)
    }
}

/// Builds a reducer that only handles `action`.
#[must_use]
pub fn on<F>(action: &Action, handler: F) -> ActionReducer<F>
where
    F: Fn(&mut State, &Payload) -> Result<Reduction>,
{
    ActionReducer {
        action: action.name().to_string(),
        handler,
    }
}

/// Ordered fold of reducers, see [`combine`].
pub struct Combined {
    reducers: Vec<Box<dyn Reducer>>,
}

impl Combined {
    /// Returns the number of folded reducers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Returns `true` if nothing was folded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl Reducer for Combined {
    fn reduce(&self, state: &mut State, action: &Action, payload: &Payload) -> Result<Reduction> {
        for reducer in &self.reducers {
            let mark = state.checkpoint();
            match reducer.reduce(state, action, payload)? {
                Reduction::Updated => return Ok(Reduction::Updated),
                Reduction::NoOp => state.rollback_to(mark),
            }
        }
        Ok(Reduction::NoOp)
    }
}

/// Folds reducers into one that tries each in order.
///
/// The first reducer returning [`Reduction::Updated`] wins. Writes made by a
/// reducer that returned [`Reduction::NoOp`] are undone before the next one
/// runs.
#[must_use]
pub fn combine(reducers: Vec<Box<dyn Reducer>>) -> Combined {
    Combined { reducers }
}

/// Collects a component's reducers in declaration order.
#[derive(Default)]
pub struct ReducerCollector {
    reducers: Vec<Box<dyn Reducer>>,
}

impl ReducerCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reducer handling any action.
    pub fn add(&mut self, reducer: impl Reducer + 'static) -> &mut Self {
        self.reducers.push(Box::new(reducer));
        self
    }

    /// Adds a reducer for one action.
    pub fn on<F>(&mut self, action: &Action, handler: F) -> &mut Self
    where
        F: Fn(&mut State, &Payload) -> Result<Reduction> + 'static,
    {
        self.add(on(action, handler))
    }

    /// Returns the number of collected reducers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    /// Folds the collected reducers with [`combine`].
    #[must_use]
    pub fn into_reducer(self) -> Combined {
        combine(self.reducers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateDecl, StateKind};
    use serde_json::json;

    fn state() -> State {
        let mut state = State::new("test", StateKind::Component);
        state
            .detect_fields(&StateDecl::new().field("count", 0).field("log", ""))
            .unwrap();
        state
    }

    #[test]
    fn combine_stops_at_first_update() {
        let first = on(&Action::private("go"), |state: &mut State, _: &Payload| {
            state.set("log", "first")?;
            Ok(Reduction::Updated)
        });
        let second = on(&Action::private("go"), |state: &mut State, _: &Payload| {
            state.set("log", "second")?;
            Ok(Reduction::Updated)
        });
        let combined = combine(vec![Box::new(first), Box::new(second)]);

        let mut state = state();
        state.begin_recording();
        let outcome = combined
            .reduce(&mut state, &Action::private("go"), &json!(null))
            .unwrap();
        state.end_recording();

        assert_eq!(outcome, Reduction::Updated);
        assert_eq!(state.get::<String>("log").unwrap(), "first");
    }

    #[test]
    fn skipped_reducer_writes_are_rolled_back() {
        let sloppy = |state: &mut State, _: &Action, _: &Payload| -> Result<Reduction> {
            state.set("count", 99)?;
            Ok(Reduction::NoOp)
        };
        let real = on(&Action::private("go"), |state: &mut State, _: &Payload| {
            state.set("log", "real")?;
            Ok(Reduction::Updated)
        });
        let combined = combine(vec![Box::new(sloppy), Box::new(real)]);

        let mut state = state();
        state.begin_recording();
        combined
            .reduce(&mut state, &Action::private("go"), &json!(null))
            .unwrap();
        let changes = state.end_recording();

        assert_eq!(state.get::<i64>("count").unwrap(), 0);
        assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["log"]);
    }

    #[test]
    fn unmatched_action_is_a_no_op() {
        let mut reducers = ReducerCollector::new();
        reducers.on(&Action::private("increment"), |state, _| {
            state.set("count", 1)?;
            Ok(Reduction::Updated)
        });
        let combined = reducers.into_reducer();

        let mut state = state();
        state.begin_recording();
        let outcome = combined
            .reduce(&mut state, &Action::private("decrement"), &json!(null))
            .unwrap();

        assert_eq!(outcome, Reduction::NoOp);
        assert!(state.end_recording().is_empty());
    }
}
