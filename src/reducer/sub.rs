//! Reducers scoped to one component state.

use super::{Reducer, Reduction};
use crate::domain::{Action, CanopyError, Payload, Result};
use crate::state::{ChangeSet, State, StateToken};
use indexmap::IndexMap;

/// A component's combined reducer, bound to the component's state token.
///
/// Running a sub-reducer opens a recording scope on the state, so every
/// change it produces is attributed to its owner.
pub struct SubReducer {
    token: StateToken,
    owner: String,
    reducer: Box<dyn Reducer>,
}

impl SubReducer {
    /// Scopes `reducer` to the state identified by `token`.
    pub fn new(token: StateToken, owner: impl Into<String>, reducer: impl Reducer + 'static) -> Self {
        Self {
            token,
            owner: owner.into(),
            reducer: Box::new(reducer),
        }
    }

    /// Returns the owning state token.
    #[must_use]
    pub const fn token(&self) -> StateToken {
        self.token
    }

    /// Returns the owner name.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs the reducer inside a recording scope.
    ///
    /// Returns the recorded changes, or `None` when the reducer ignored the
    /// action (its writes are rolled back).
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::ReducerInvariant`] if the reducer fails; the
    /// state is restored first.
    pub fn reduce(
        &self,
        state: &mut State,
        action: &Action,
        payload: &Payload,
    ) -> Result<Option<ChangeSet>> {
        run_recorded(state, action.name(), |state| {
            self.reducer.reduce(state, action, payload)
        })
    }
}

/// Open recording scope on a state. Dropped without a commit, even by
/// unwinding, it rolls the writes back.
struct Recording<'a> {
    state: &'a mut State,
    open: bool,
}

impl<'a> Recording<'a> {
    fn begin(state: &'a mut State) -> Self {
        state.begin_recording();
        Self { state, open: true }
    }

    fn commit(mut self) -> ChangeSet {
        self.open = false;
        self.state.end_recording()
    }
}

impl Drop for Recording<'_> {
    fn drop(&mut self) {
        if self.open {
            self.state.discard_recording();
        }
    }
}

/// Runs `reduce` inside a recording scope on `state`.
pub(crate) fn run_recorded<F>(state: &mut State, action: &str, reduce: F) -> Result<Option<ChangeSet>>
where
    F: FnOnce(&mut State) -> Result<Reduction>,
{
    let mut recording = Recording::begin(state);
    match reduce(&mut *recording.state) {
        Ok(Reduction::Updated) => Ok(Some(recording.commit())),
        Ok(Reduction::NoOp) => Ok(None),
        Err(err) => Err(match err {
            err @ CanopyError::ReducerInvariant { .. } => err,
            other => CanopyError::ReducerInvariant {
                action: action.to_string(),
                reason: other.to_string(),
            },
        }),
    }
}

/// Dispatch-by-ownership table of sub-reducers.
#[derive(Default)]
pub struct CombinedSubReducers {
    table: IndexMap<StateToken, SubReducer>,
}

impl CombinedSubReducers {
    /// Adds or replaces the sub-reducer for its token.
    pub fn insert(&mut self, sub: SubReducer) -> Option<SubReducer> {
        self.table.insert(sub.token(), sub)
    }

    /// Removes the sub-reducer of `token`.
    pub fn remove(&mut self, token: StateToken) -> Option<SubReducer> {
        self.table.shift_remove(&token)
    }

    /// Returns the sub-reducer owning `token`.
    #[must_use]
    pub fn get(&self, token: StateToken) -> Option<&SubReducer> {
        self.table.get(&token)
    }

    /// Returns `true` if `token` has a sub-reducer.
    #[must_use]
    pub fn contains(&self, token: StateToken) -> bool {
        self.table.contains_key(&token)
    }

    /// Returns the number of scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Builds the per-page dispatch table from component sub-reducers.
#[must_use]
pub fn combine_sub_reducers(subs: impl IntoIterator<Item = SubReducer>) -> CombinedSubReducers {
    let mut combined = CombinedSubReducers::default();
    for sub in subs {
        combined.insert(sub);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::on;
    use crate::state::{StateDecl, StateKind};
    use serde_json::json;

    fn counter() -> State {
        let mut state = State::new("counter", StateKind::Component);
        state.detect_fields(&StateDecl::new().field("count", 0)).unwrap();
        state
    }

    #[test]
    fn only_the_owning_scope_runs() {
        let mut a = counter();
        let b = counter();
        let increment = Action::private("increment");
        let make = |token| {
            SubReducer::new(
                token,
                "counter",
                on(&increment, |state: &mut State, payload: &Payload| {
                    let count: i64 = state.get("count")?;
                    state.set("count", count + payload.as_i64().unwrap_or(1))?;
                    Ok(Reduction::Updated)
                }),
            )
        };
        let table = combine_sub_reducers([make(a.token()), make(b.token())]);

        let sub = table.get(a.token()).unwrap();
        let changes = sub.reduce(&mut a, &increment, &json!(2)).unwrap().unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(changes.private()[0].value, json!(2));
        assert_eq!(b.get::<i64>("count").unwrap(), 0);
    }

    #[test]
    fn failures_are_reported_as_invariant_errors_and_rolled_back() {
        let mut state = counter();
        let sub = SubReducer::new(
            state.token(),
            "counter",
            |state: &mut State, _: &Action, _: &Payload| -> Result<Reduction> {
                state.set("count", 10)?;
                state.set("missing", 1)?;
                Ok(Reduction::Updated)
            },
        );

        let err = sub
            .reduce(&mut state, &Action::private("boom"), &json!(null))
            .unwrap_err();

        assert!(matches!(err, CanopyError::ReducerInvariant { action, .. } if action == "boom"));
        assert_eq!(state.get::<i64>("count").unwrap(), 0);
        assert!(!state.is_recording());
    }

    #[test]
    fn a_panicking_reducer_leaves_no_open_recording() {
        let mut state = counter();
        let sub = SubReducer::new(
            state.token(),
            "counter",
            |state: &mut State, _: &Action, _: &Payload| -> Result<Reduction> {
                state.set("count", 10)?;
                panic!("reducer blew up");
            },
        );

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sub.reduce(&mut state, &Action::private("boom"), &json!(null))
        }));
        assert!(outcome.is_err());
        assert!(!state.is_recording());
        assert_eq!(state.get::<i64>("count").unwrap(), 0);

        let changes = run_recorded(&mut state, "bump", |state| {
            state.set("count", 1)?;
            Ok(Reduction::Updated)
        })
        .unwrap()
        .unwrap();
        assert_eq!(changes.private().len(), 1);
        assert_eq!(state.get::<i64>("count").unwrap(), 1);
    }
}
