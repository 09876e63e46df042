//! Page store: frame-aligned batching on top of the dispatch loop.
//!
//! Every propagation is merged into a pending map keyed by state and prop
//! key (last write wins) and raises the need-update flag. A tick drains the
//! map into one [`StateApplier::on_batch`] call per enabled applier, and only
//! when every gate holds:
//!
//! 1. the store is not destroyed
//! 2. the page is visible
//! 3. an update is pending
//! 4. no dispatch is running
//! 5. the minimum spacing since the previous batch has elapsed
//!
//! A tick that fails a gate leaves the pending map alone, so the next tick
//! fires the union of everything that changed in between.

use super::dispatcher::{DispatchJob, ObservedChange, Propagation, Store};
use super::frame::FrameTicker;
use super::middleware::{Middleware, Next};
use super::{ObserverId, StoreId};
use crate::domain::{Action, Payload, Result};
use crate::reducer::{Reduction, SubReducer};
use crate::state::{State, StateToken};
use indexmap::{IndexMap, IndexSet};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Receives one batch of changed keys per tick.
///
/// This is the seam to the view layer. Implementations get a snapshot of the
/// component state and the de-duplicated keys that changed since the last
/// batch.
pub trait StateApplier {
    /// Applies a batch of changes.
    fn on_batch(&self, state: &State, changed_keys: &[String]);
}

impl<F> StateApplier for F
where
    F: Fn(&State, &[String]),
{
    fn on_batch(&self, state: &State, changed_keys: &[String]) {
        self(state, changed_keys);
    }
}

/// Identity of a registered applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplierId(u64);

struct ApplierEntry {
    id: ApplierId,
    token: StateToken,
    applier: Rc<dyn StateApplier>,
    enabled: bool,
}

/// Store of one page, with the frame guard and state appliers.
pub struct PageStore {
    store: Store,
    pending: RefCell<IndexMap<StateToken, IndexSet<String>>>,
    need_update: Cell<bool>,
    appliers: RefCell<Vec<ApplierEntry>>,
    next_applier: Cell<u64>,
    visible: Cell<bool>,
    last_fire: Cell<Option<Instant>>,
    min_spacing: Duration,
    ticker: RefCell<Option<FrameTicker>>,
    batches: Cell<u64>,
    middleware: RefCell<Vec<Rc<dyn Middleware>>>,
}

impl PageStore {
    /// Creates a hidden page store without a ticker.
    #[must_use]
    pub fn new(name: impl Into<String>, min_spacing: Duration) -> Self {
        Self {
            store: Store::new(name),
            pending: RefCell::new(IndexMap::new()),
            need_update: Cell::new(false),
            appliers: RefCell::new(Vec::new()),
            next_applier: Cell::new(1),
            visible: Cell::new(false),
            last_fire: Cell::new(None),
            min_spacing,
            ticker: RefCell::new(None),
            batches: Cell::new(0),
            middleware: RefCell::new(Vec::new()),
        }
    }

    /// Hands the page its frame ticker. Armed right away if visible.
    pub fn attach_ticker(&self, ticker: FrameTicker) {
        if self.visible.get() {
            ticker.arm();
        }
        if let Some(previous) = self.ticker.borrow_mut().replace(ticker) {
            previous.shutdown();
        }
    }

    /// Returns `true` if a ticker is attached.
    #[must_use]
    pub fn has_ticker(&self) -> bool {
        self.ticker.borrow().is_some()
    }

    /// Returns the underlying dispatch loop.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the store id.
    #[must_use]
    pub const fn id(&self) -> StoreId {
        self.store.id()
    }

    /// Appends a reducer middleware. Dispatches already running keep the
    /// chain they started with.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.middleware.borrow_mut().push(Rc::new(middleware));
    }

    /// Returns the number of reducer middleware.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware.borrow().len()
    }

    /// Runs the sub-reducer of `scope` behind the middleware chain.
    ///
    /// # Errors
    ///
    /// Propagates middleware and reducer failures.
    pub fn dispatch(&self, scope: StateToken, action: &Action, payload: &Payload) -> Result<()> {
        let chain: Vec<Rc<dyn Middleware>> = self.middleware.borrow().clone();
        if chain.is_empty() {
            return self.reduce(scope, action, payload);
        }
        tracing::trace!(store = %self.store.name(), action = %action, middleware = chain.len(), "dispatch through middleware");
        Next::new(&chain, self).run(scope, action, payload)
    }

    pub(crate) fn reduce(&self, scope: StateToken, action: &Action, payload: &Payload) -> Result<()> {
        self.run(DispatchJob::Reduce {
            scope,
            action: action.clone(),
            payload: payload.clone(),
        })
    }

    /// Runs a scoped update on `scope` without an action.
    ///
    /// # Errors
    ///
    /// Propagates failures of `update` as reducer failures.
    pub fn update_state<F>(&self, scope: StateToken, label: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut State) -> Result<Reduction> + 'static,
    {
        self.run(DispatchJob::Update {
            scope,
            label: label.to_string(),
            update: Box::new(update),
        })
    }

    fn run(&self, job: DispatchJob) -> Result<()> {
        self.store.dispatch(job, &|propagation| self.absorb(propagation))
    }

    fn absorb(&self, propagation: &Propagation) {
        for token in propagation.tokens() {
            let keys = propagation
                .changes_for(token)
                .into_iter()
                .map(|change| change.key);
            self.mark_changed(token, keys);
        }
    }

    /// Mirrors changes made by another store (a global store) into the
    /// aliases of `token` and queues them like local changes.
    pub fn absorb_external(&self, token: StateToken, changes: &[ObservedChange]) {
        if self.store.is_destroyed() || !self.store.contains_state(token) {
            return;
        }
        for change in changes {
            self.store.inner_set(token, change.index, change.value.clone());
        }
        let mut public = IndexMap::new();
        public.insert(token, changes.to_vec());
        let propagation = Propagation {
            scope: None,
            private: Vec::new(),
            public,
        };
        self.absorb(&propagation);
        self.store.notify(&propagation);
    }

    /// Queues `keys` of `token` for the next batch.
    pub fn mark_changed(&self, token: StateToken, keys: impl IntoIterator<Item = String>) {
        let mut pending = self.pending.borrow_mut();
        let entry = pending.entry(token).or_default();
        let before = entry.len();
        entry.extend(keys);
        let added = entry.len() > before;
        if entry.is_empty() {
            pending.shift_remove(&token);
        }
        drop(pending);
        if added {
            self.mark_need_update();
        }
    }

    /// Raises the need-update flag. It stays raised until a batch fires.
    pub fn mark_need_update(&self) {
        self.need_update.set(true);
    }

    /// Returns `true` while a batch is pending.
    #[must_use]
    pub fn needs_update(&self) -> bool {
        self.need_update.get()
    }

    /// Returns the keys pending for `token`.
    #[must_use]
    pub fn pending_keys(&self, token: StateToken) -> Vec<String> {
        self.pending
            .borrow()
            .get(&token)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers an applier for the state `token`, enabled.
    pub fn add_state_applier(&self, token: StateToken, applier: Rc<dyn StateApplier>) -> ApplierId {
        let id = ApplierId(self.next_applier.get());
        self.next_applier.set(id.0 + 1);
        self.appliers.borrow_mut().push(ApplierEntry {
            id,
            token,
            applier,
            enabled: true,
        });
        id
    }

    /// Enables or disables an applier without dropping it.
    pub fn set_applier_enabled(&self, id: ApplierId, enabled: bool) {
        if let Some(entry) = self.appliers.borrow_mut().iter_mut().find(|e| e.id == id) {
            entry.enabled = enabled;
        }
    }

    /// Drops an applier.
    pub fn remove_state_applier(&self, id: ApplierId) -> bool {
        let mut appliers = self.appliers.borrow_mut();
        let before = appliers.len();
        appliers.retain(|entry| entry.id != id);
        appliers.len() != before
    }

    /// Returns the number of registered appliers.
    #[must_use]
    pub fn applier_count(&self) -> usize {
        self.appliers.borrow().len()
    }

    /// Marks the page visible and arms the ticker. Idempotent.
    pub fn on_page_visible(&self) {
        if self.store.is_destroyed() || self.visible.replace(true) {
            return;
        }
        if let Some(ticker) = self.ticker.borrow().as_ref() {
            ticker.arm();
        }
        tracing::debug!(page = %self.store.name(), "page visible");
    }

    /// Marks the page hidden and parks the ticker. Idempotent.
    pub fn on_page_hidden(&self) {
        if !self.visible.replace(false) {
            return;
        }
        if let Some(ticker) = self.ticker.borrow().as_ref() {
            ticker.disarm();
        }
        tracing::debug!(page = %self.store.name(), "page hidden");
    }

    /// Returns `true` while the page is visible.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    /// Runs a batch pass for the current instant, then releases the ticker.
    pub fn on_tick(&self) -> bool {
        let fired = self.on_tick_at(Instant::now());
        self.tick_completed();
        fired
    }

    /// Runs a batch pass as if the clock read `now`.
    ///
    /// Returns `true` if a batch fired.
    pub fn on_tick_at(&self, now: Instant) -> bool {
        if self.store.is_destroyed() || !self.visible.get() || !self.need_update.get() {
            return false;
        }
        if self.store.is_dispatching() {
            tracing::trace!(page = %self.store.name(), "tick skipped mid-dispatch");
            return false;
        }
        if let Some(last) = self.last_fire.get() {
            if now.saturating_duration_since(last) < self.min_spacing {
                tracing::trace!(page = %self.store.name(), "tick skipped, spacing");
                return false;
            }
        }

        let _span = tracing::debug_span!("batch", page = %self.store.name()).entered();
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        self.need_update.set(false);
        self.last_fire.set(Some(now));
        self.batches.set(self.batches.get() + 1);

        let appliers: Vec<(StateToken, Rc<dyn StateApplier>)> = self
            .appliers
            .borrow()
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| (entry.token, Rc::clone(&entry.applier)))
            .collect();

        let mut delivered = 0usize;
        for (token, keys) in pending {
            let targets: Vec<&Rc<dyn StateApplier>> = appliers
                .iter()
                .filter(|(owner, _)| *owner == token)
                .map(|(_, applier)| applier)
                .collect();
            if targets.is_empty() {
                continue;
            }
            let Some(state) = self.store.copy_state(token) else {
                continue;
            };
            let keys: Vec<String> = keys.into_iter().collect();
            for applier in targets {
                applier.on_batch(&state, &keys);
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "batch fired");
        true
    }

    /// Releases the ticker's in-flight slot.
    pub fn tick_completed(&self) {
        if let Some(ticker) = self.ticker.borrow().as_ref() {
            ticker.complete();
        }
    }

    /// Returns the number of batches fired so far.
    #[must_use]
    pub fn batches_fired(&self) -> u64 {
        self.batches.get()
    }

    /// Registers a store observer for `token`.
    pub fn observe(&self, token: StateToken, callback: impl Fn(&[ObservedChange]) + 'static) -> ObserverId {
        self.store.observe(token, callback)
    }

    /// Installs a component sub-reducer.
    pub fn add_sub_reducer(&self, sub: SubReducer) {
        self.store.add_sub_reducer(sub);
    }

    /// Returns a snapshot of one state.
    #[must_use]
    pub fn copy_state(&self, token: StateToken) -> Option<State> {
        self.store.copy_state(token)
    }

    /// Returns snapshots of every state of the page. This is the state
    /// provider handed to middleware through [`Next::states`].
    #[must_use]
    pub fn all_states(&self) -> Vec<State> {
        self.store.all_states()
    }

    /// Returns `true` once destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.store.is_destroyed()
    }

    /// Stops the ticker and tears the store down. Terminal.
    pub fn destroy(&self) {
        if self.store.is_destroyed() {
            return;
        }
        self.visible.set(false);
        if let Some(ticker) = self.ticker.borrow_mut().take() {
            ticker.shutdown();
        }
        self.pending.borrow_mut().clear();
        self.need_update.set(false);
        self.appliers.borrow_mut().clear();
        self.middleware.borrow_mut().clear();
        self.store.destroy();
    }
}

impl fmt::Debug for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("store", &self.store)
            .field("visible", &self.visible.get())
            .field("need_update", &self.need_update.get())
            .field("batches", &self.batches.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::on;
    use crate::state::{StateDecl, StateKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SPACING: Duration = Duration::from_millis(16);

    type Batches = Rc<RefCell<Vec<Vec<String>>>>;

    fn page_with_counter() -> (PageStore, StateToken, Batches) {
        let page = PageStore::new("page", SPACING);
        let mut state = State::new("counter", StateKind::Component);
        state
            .detect_fields(&StateDecl::new().field("count", 0).field("label", ""))
            .unwrap();
        let token = page.store().register_state(state);
        page.add_sub_reducer(SubReducer::new(
            token,
            "counter",
            on(&Action::private("increment"), |state: &mut State, payload: &Payload| {
                let count: i64 = state.get("count")?;
                state.set("count", count + payload.as_i64().unwrap_or(1))?;
                Ok(Reduction::Updated)
            }),
        ));

        let batches: Batches = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&batches);
        page.add_state_applier(
            token,
            Rc::new(move |_: &State, keys: &[String]| sink.borrow_mut().push(keys.to_vec())),
        );
        page.on_page_visible();
        (page, token, batches)
    }

    #[test]
    fn batch_contains_each_key_once() {
        let (page, token, batches) = page_with_counter();
        for _ in 0..3 {
            page.dispatch(token, &Action::private("increment"), &json!(1)).unwrap();
        }

        assert!(page.on_tick_at(Instant::now()));
        assert_eq!(*batches.borrow(), vec![vec!["count".to_string()]]);
        assert_eq!(page.copy_state(token).unwrap().get::<i64>("count").unwrap(), 3);
        assert!(!page.needs_update());
    }

    #[test]
    fn ticks_inside_spacing_are_merged_into_one_batch() {
        let (page, token, batches) = page_with_counter();
        let start = Instant::now();
        page.dispatch(token, &Action::private("increment"), &json!(1)).unwrap();
        assert!(page.on_tick_at(start));

        page.dispatch(token, &Action::private("increment"), &json!(1)).unwrap();
        assert!(!page.on_tick_at(start + Duration::from_millis(4)));
        page.update_state(token, "relabel", |state| {
            state.set("label", "two")?;
            Ok(Reduction::Updated)
        })
        .unwrap();
        assert!(!page.on_tick_at(start + Duration::from_millis(8)));
        assert!(page.on_tick_at(start + SPACING));

        assert_eq!(batches.borrow().len(), 2);
        assert_eq!(batches.borrow()[1], vec!["count".to_string(), "label".to_string()]);
    }

    #[test]
    fn hidden_page_holds_changes_until_visible() {
        let (page, token, batches) = page_with_counter();
        page.on_page_hidden();
        page.on_page_hidden();
        page.dispatch(token, &Action::private("increment"), &json!(1)).unwrap();

        assert!(!page.on_tick_at(Instant::now()));
        assert!(page.needs_update());

        page.on_page_visible();
        assert!(page.on_tick_at(Instant::now()));
        assert_eq!(batches.borrow().len(), 1);
    }

    #[test]
    fn disabled_applier_is_skipped_and_destroy_is_terminal() {
        let page = PageStore::new("page", SPACING);
        let mut state = State::new("c", StateKind::Component);
        state.detect_fields(&StateDecl::new().field("a", 1)).unwrap();
        let token = page.store().register_state(state);
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let id = page.add_state_applier(token, Rc::new(move |_: &State, _: &[String]| seen.set(seen.get() + 1)));
        page.on_page_visible();

        page.set_applier_enabled(id, false);
        page.mark_changed(token, ["a".to_string()]);
        assert!(page.on_tick_at(Instant::now()));
        assert_eq!(calls.get(), 0);

        page.destroy();
        page.mark_changed(token, ["a".to_string()]);
        assert!(!page.on_tick_at(Instant::now() + SPACING));
        assert!(page.all_states().is_empty());
    }
}
