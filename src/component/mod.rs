//! Components and the page tree.
//!
//! A [`Component`] declares a state, its reducers, its effects and its
//! children. A [`Page`] owns the tree of installed components in an arena and
//! drives their install state machine.
//!
//! # Architecture
//!
//! ```text
//!  Page ── PageStore (states, sub-reducers, appliers, frame guard)
//!   │  ── DispatchBus (page bus, attached to the runtime's app bus)
//!   │  ── InterceptorManager
//!   │
//!   └─ arena: NodeId ─► ComponentNode
//!        root (page state)
//!         ├─ child  ◄── Connector: parent bindings, projection, globals
//!         │   └─ grandchild
//!         └─ child
//! ```
//!
//! Installing a child runs detection (field discovery plus state merge)
//! either inline or on a detection worker. While it runs, the child is in
//! [`InstallState::StateDetecting`] and every lifecycle event, visibility
//! change and parent message aimed at it is queued; the queue is flushed in
//! arrival order once the child is ready.
//!
//! # Example
//!
//! ```rust
//! use canopy::component::{Component, ComponentContext};
//! use canopy::domain::{Action, Payload};
//! use canopy::effect::EffectCollector;
//! use canopy::reducer::{ReducerCollector, Reduction};
//! use canopy::state::StateDecl;
//!
//! struct Counter;
//!
//! impl Component for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     fn state(&self) -> StateDecl {
//!         StateDecl::new().field("count", 0)
//!     }
//!
//!     fn reducers(&self, reducers: &mut ReducerCollector) {
//!         reducers.on(&Action::private("increment"), |state, payload: &Payload| {
//!             let count: i64 = state.get("count")?;
//!             state.set("count", count + payload.as_i64().unwrap_or(1))?;
//!             Ok(Reduction::Updated)
//!         });
//!     }
//!
//!     fn effects(&self, effects: &mut EffectCollector) {
//!         effects.on(&Action::private("tap"), |_, ctx: &ComponentContext, _| {
//!             ctx.dispatch_reducer(&Action::private("increment"), &Payload::from(1))
//!         });
//!     }
//! }
//! ```

pub mod connector;
pub mod context;
pub mod lifecycle;
pub mod page;

pub use connector::{
    Connector, Dependant, DependantCollector, GlobalBinding, InstallMode, Projection,
    ProjectionBinder,
};
pub use context::{ComponentContext, ComponentHandle};
pub use lifecycle::{
    Attachment, InstallState, LifecycleEmitter, LifecycleEvent, LifecycleSource, Visibility,
};
pub use page::{NodeId, Page, PageId};

use crate::effect::EffectCollector;
use crate::reducer::ReducerCollector;
use crate::state::StateDecl;
use crate::store::StateApplier;
use std::rc::Rc;

/// What a component kind is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The component has a view and takes a state applier.
    pub renders_view: bool,
    /// State detection may run on a worker.
    pub async_detection: bool,
}

/// Closed set of component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentKind {
    /// A regular view component.
    #[default]
    Component,
    /// A list adapter: renders item views, always installs synchronously.
    Adapter,
    /// A headless component used in tests: no view, synchronous install.
    TestComponent,
}

impl ComponentKind {
    /// Returns the capability set of this kind.
    #[must_use]
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Component => Capabilities {
                renders_view: true,
                async_detection: true,
            },
            Self::Adapter => Capabilities {
                renders_view: true,
                async_detection: false,
            },
            Self::TestComponent => Capabilities {
                renders_view: false,
                async_detection: false,
            },
        }
    }
}

/// A node of the component tree.
///
/// Only [`name`](Self::name) and [`state`](Self::state) are required; every
/// other hook defaults to nothing.
pub trait Component {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Kind of the component.
    fn kind(&self) -> ComponentKind {
        ComponentKind::Component
    }

    /// Declares the fields of the component state.
    fn state(&self) -> StateDecl;

    /// Declares the reducers, tried in order.
    fn reducers(&self, reducers: &mut ReducerCollector) {
        let _ = reducers;
    }

    /// Declares the effect handlers.
    fn effects(&self, effects: &mut EffectCollector) {
        let _ = effects;
    }

    /// Declares the children.
    fn dependencies(&self, dependants: &mut DependantCollector) {
        let _ = dependants;
    }

    /// Returns the default applier of the component's view.
    fn applier(&self) -> Option<Rc<dyn StateApplier>> {
        None
    }

    /// Called once the state is live, before queued operations are flushed.
    fn on_state_ready(&self, ctx: &ComponentContext) {
        let _ = ctx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_regular_components_detect_asynchronously() {
        assert!(ComponentKind::Component.capabilities().async_detection);
        assert!(!ComponentKind::Adapter.capabilities().async_detection);
        assert!(ComponentKind::Adapter.capabilities().renders_view);
        assert!(!ComponentKind::TestComponent.capabilities().renders_view);
    }
}
