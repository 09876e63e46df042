//! Effects: side-effect handlers keyed by action.
//!
//! Effects run on the main context after a component dispatches an action
//! with [`ComponentContext::dispatch_effect`]. They may read state, dispatch
//! reducers and send further effects, but they never write state directly.
//!
//! # Isolation
//!
//! Every handler runs isolated. An `Err` or a panic is turned into
//! [`CanopyError::EffectExecution`], logged, and collected into the
//! [`EffectReport`] of the dispatch; sibling handlers still run.
//!
//! # Interception
//!
//! Public actions are re-routed to the page's [`InterceptorManager`] after the
//! sender's own handler ran, with the sender excluded:
//!
//! ```text
//!  dispatch_effect(public) ──► own Effect ──► InterceptorManager ──► other components
//!  dispatch_effect(private) ─► own Effect
//! ```

pub mod interceptor;

pub use interceptor::{InterceptorCollector, InterceptorId, InterceptorManager};

use crate::component::ComponentContext;
use crate::domain::{Action, CanopyError, Payload, Result};
use indexmap::IndexMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// A side-effect handler.
pub trait Effect {
    /// Handles `action` for the component behind `ctx`.
    ///
    /// # Errors
    ///
    /// Errors are reported, never propagated into the dispatch loop.
    fn run(&self, action: &Action, ctx: &ComponentContext, payload: &Payload) -> Result<()>;
}

impl<F> Effect for F
where
    F: Fn(&Action, &ComponentContext, &Payload) -> Result<()>,
{
    fn run(&self, action: &Action, ctx: &ComponentContext, payload: &Payload) -> Result<()> {
        self(action, ctx, payload)
    }
}

/// Outcome of one effect delivery.
#[derive(Debug, Default)]
pub struct EffectReport {
    /// Number of handlers that ran.
    pub handled: usize,
    /// Failures of the handlers that ran, in delivery order.
    pub failures: Vec<CanopyError>,
}

impl EffectReport {
    /// Returns `true` if no handler failed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.handled += other.handled;
        self.failures.extend(other.failures);
    }

    pub(crate) fn record(&mut self, outcome: std::result::Result<(), CanopyError>) {
        self.handled += 1;
        if let Err(err) = outcome {
            self.failures.push(err);
        }
    }
}

/// Collects a component's effect handlers, one per action name.
#[derive(Default, Clone)]
pub struct EffectCollector {
    handlers: IndexMap<String, Rc<dyn Effect>>,
}

impl EffectCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `action`, replacing an earlier one.
    pub fn on<F>(&mut self, action: &Action, handler: F) -> &mut Self
    where
        F: Fn(&Action, &ComponentContext, &Payload) -> Result<()> + 'static,
    {
        self.add(action, Rc::new(handler))
    }

    /// Registers a shared handler for `action`.
    pub fn add(&mut self, action: &Action, handler: Rc<dyn Effect>) -> &mut Self {
        if self.handlers.insert(action.name().to_string(), handler).is_some() {
            tracing::debug!(action = %action, "effect handler replaced");
        }
        self
    }

    /// Returns the handler for `action`.
    #[must_use]
    pub fn get(&self, action: &Action) -> Option<Rc<dyn Effect>> {
        self.handlers.get(action.name()).cloned()
    }

    /// Returns `true` if `action` has a handler.
    #[must_use]
    pub fn contains(&self, action: &Action) -> bool {
        self.handlers.contains_key(action.name())
    }

    /// Returns the number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs one handler, turning errors and panics into
/// [`CanopyError::EffectExecution`].
pub(crate) fn isolate<F>(action: &Action, owner: &str, run: F) -> std::result::Result<(), CanopyError>
where
    F: FnOnce() -> Result<()>,
{
    let reason = match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string()),
    };
    tracing::warn!(action = %action, owner = %owner, reason = %reason, "effect failed");
    Err(CanopyError::EffectExecution {
        action: action.name().to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_turns_errors_and_panics_into_reports() {
        let action = Action::public("load");
        let mut report = EffectReport::default();

        report.record(isolate(&action, "a", || Ok(())));
        report.record(isolate(&action, "b", || Err(CanopyError::Detection("nope".into()))));
        report.record(isolate(&action, "c", || panic!("boom")));

        assert_eq!(report.handled, 3);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(
            &report.failures[1],
            CanopyError::EffectExecution { reason, .. } if reason == "boom"
        ));
    }

    #[test]
    fn collector_keeps_one_handler_per_action() {
        let mut effects = EffectCollector::new();
        let load = Action::private("load");
        effects.on(&load, |_, _, _| Ok(()));
        effects.on(&load, |_, _, _| Ok(()));
        assert_eq!(effects.len(), 1);
        assert!(effects.contains(&load));
        assert!(!effects.contains(&Action::private("save")));
    }
}
