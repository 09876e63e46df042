//! Reducer middleware of a page store.
//!
//! Middleware wraps every action dispatched to the page's reducers. Each one
//! receives the action and a [`Next`] that runs the rest of the chain and
//! finally the reducer. A middleware that returns without calling
//! [`Next::run`] swallows the action.
//!
//! ```text
//!  dispatch ──► mw[0] ──► mw[1] ──► … ──► reducer of `scope`
//!                 └────── next.states(): every state of the page
//! ```
//!
//! Middleware runs in registration order, the first registered sees the
//! action first. Scoped updates without an action bypass the chain.

use super::page::PageStore;
use crate::domain::{Action, Payload, Result};
use crate::state::{State, StateToken};
use std::rc::Rc;

/// Intercepts reducer dispatches of one page.
pub trait Middleware {
    /// Handles one dispatch of `action` to the reducer of `scope`.
    ///
    /// # Errors
    ///
    /// Whatever the middleware or the rest of the chain returns.
    fn dispatch(&self, scope: StateToken, action: &Action, payload: &Payload, next: Next<'_>) -> Result<()>;
}

impl<F> Middleware for F
where
    F: Fn(StateToken, &Action, &Payload, Next<'_>) -> Result<()>,
{
    fn dispatch(&self, scope: StateToken, action: &Action, payload: &Payload, next: Next<'_>) -> Result<()> {
        self(scope, action, payload, next)
    }
}

/// The rest of a middleware chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Rc<dyn Middleware>],
    store: &'a PageStore,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Rc<dyn Middleware>], store: &'a PageStore) -> Self {
        Self { chain, store }
    }

    /// Passes the dispatch on, possibly with another scope, action or
    /// payload.
    ///
    /// # Errors
    ///
    /// Propagates failures of later middleware and of the reducer.
    pub fn run(self, scope: StateToken, action: &Action, payload: &Payload) -> Result<()> {
        match self.chain.split_first() {
            Some((first, rest)) => first.dispatch(scope, action, payload, Next::new(rest, self.store)),
            None => self.store.reduce(scope, action, payload),
        }
    }

    /// Returns snapshots of every state of the page.
    #[must_use]
    pub fn states(&self) -> Vec<State> {
        self.store.all_states()
    }

    /// Returns the number of middleware left before the reducer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}
