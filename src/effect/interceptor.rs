//! Page-scoped interception of public actions.

use super::{isolate, Effect, EffectReport};
use crate::component::ComponentContext;
use crate::domain::{Action, CanopyError, Payload, Result};
use crate::state::StateToken;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identity of one registered interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// Interceptors declared by a connector or a page, public actions only.
#[derive(Default, Clone)]
pub struct InterceptorCollector {
    handlers: Vec<(Action, Rc<dyn Effect>)>,
}

impl InterceptorCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intercepts `action`.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`] for a private action.
    pub fn on<F>(&mut self, action: &Action, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Action, &ComponentContext, &Payload) -> Result<()> + 'static,
    {
        if action.is_private() {
            return Err(CanopyError::private_action("an interceptor", action.name()));
        }
        self.handlers.push((action.clone(), Rc::new(handler)));
        Ok(self)
    }

    /// Returns the number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if nothing is intercepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct Entry {
    id: InterceptorId,
    owner: StateToken,
    ctx: ComponentContext,
    handler: Rc<dyn Effect>,
}

/// The interceptor table of one page: action name to handlers, each run
/// with the context of the component that declared it.
#[derive(Default)]
pub struct InterceptorManager {
    entries: RefCell<IndexMap<String, Vec<Entry>>>,
    next_id: Cell<u64>,
}

impl InterceptorManager {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every interceptor of `collector` on behalf of `ctx`.
    pub fn register(&self, ctx: &ComponentContext, collector: InterceptorCollector) -> Vec<InterceptorId> {
        self.register_as(ctx.token(), ctx, collector)
    }

    /// Registers every interceptor of `collector` under `owner`, run with
    /// `ctx`. Interception skips entries by owner, not by context.
    pub fn register_as(
        &self,
        owner: StateToken,
        ctx: &ComponentContext,
        collector: InterceptorCollector,
    ) -> Vec<InterceptorId> {
        let mut entries = self.entries.borrow_mut();
        let mut ids = Vec::with_capacity(collector.len());
        for (action, handler) in collector.handlers {
            let id = InterceptorId(self.next_id.get() + 1);
            self.next_id.set(id.0);
            entries.entry(action.name().to_string()).or_default().push(Entry {
                id,
                owner,
                ctx: ctx.clone(),
                handler,
            });
            ids.push(id);
        }
        if !ids.is_empty() {
            tracing::debug!(owner = %ctx.name(), count = ids.len(), "interceptors registered");
        }
        ids
    }

    /// Drops every interceptor declared on behalf of `owner`.
    pub fn remove_owner(&self, owner: StateToken) -> usize {
        let mut removed = 0;
        let mut entries = self.entries.borrow_mut();
        for handlers in entries.values_mut() {
            let before = handlers.len();
            handlers.retain(|entry| entry.owner != owner);
            removed += before - handlers.len();
        }
        entries.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Drops one interceptor.
    pub fn remove(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let mut found = false;
        for handlers in entries.values_mut() {
            let before = handlers.len();
            handlers.retain(|entry| entry.id != id);
            found |= handlers.len() != before;
        }
        entries.retain(|_, handlers| !handlers.is_empty());
        found
    }

    /// Returns the number of registered interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().values().map(Vec::len).sum()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Returns `true` if some component intercepts `action`.
    #[must_use]
    pub fn intercepts(&self, action: &Action) -> bool {
        self.entries.borrow().contains_key(action.name())
    }

    /// Delivers a public action to its interceptors, skipping `exclude`.
    ///
    /// Handlers run over a snapshot, so they may register or remove
    /// interceptors while the action is delivered.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ActionScope`] for a private action.
    pub fn intercept(
        &self,
        action: &Action,
        payload: &Payload,
        exclude: Option<StateToken>,
    ) -> Result<EffectReport> {
        if action.is_private() {
            return Err(CanopyError::private_action("interception", action.name()));
        }

        let targets: Vec<(ComponentContext, Rc<dyn Effect>)> = self
            .entries
            .borrow()
            .get(action.name())
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|entry| Some(entry.owner) != exclude)
                    .map(|entry| (entry.ctx.clone(), Rc::clone(&entry.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = EffectReport::default();
        if targets.is_empty() {
            return Ok(report);
        }
        let _span = tracing::debug_span!("intercept", action = %action, targets = targets.len()).entered();
        for (ctx, handler) in targets {
            if ctx.is_destroyed() {
                continue;
            }
            report.record(isolate(action, ctx.name(), || handler.run(action, &ctx, payload)));
        }
        Ok(report)
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}
