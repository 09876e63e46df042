//! Messages crossing the boundary between the main context and its helper
//! threads.
//!
//! Detection jobs travel from the main context to the detection workers;
//! [`MainTask`]s travel back from workers and frame tickers. Everything
//! here is `Send`: a job carries plain snapshots, never live store handles.
//! Jobs also carry the caller's tracing context so a worker span can be
//! linked to the install that scheduled it.

use crate::component::{NodeId, PageId, Projection};
use crate::domain::Result;
use crate::state::{State, StateDecl, StateKind, StateToken};
use crate::store::StoreId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Distributed tracing context for cross-thread span propagation.
///
/// Captures the current trace and span IDs from OpenTelemetry so a worker
/// span can record which install span it follows from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// OpenTelemetry trace ID as a hex string.
    pub trace_id: String,

    /// Parent span ID for linking spans across threads.
    pub parent_span_id: String,
}

impl TraceContext {
    /// Creates a trace context from the current tracing span.
    ///
    /// Returns `None` if the current span context is invalid or not sampled,
    /// which is the case when no OpenTelemetry layer is installed.
    #[must_use]
    pub fn from_current() -> Option<Self> {
        use opentelemetry::trace::TraceContextExt;
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        let span = tracing::Span::current();
        let otel_context = span.context();
        let span_ref = otel_context.span();
        let span_context = span_ref.span_context();

        if span_context.is_valid() {
            Some(Self {
                trace_id: format!("{:032x}", span_context.trace_id()),
                parent_span_id: format!("{:016x}", span_context.span_id()),
            })
        } else {
            tracing::trace!("no valid span context to propagate");
            None
        }
    }
}

/// Snapshot of a global store state a child binds to.
#[derive(Debug)]
pub struct GlobalSnapshot {
    /// Store owning the state.
    pub store: StoreId,
    /// Child prop receiving the alias.
    pub child_key: String,
    /// Global prop being aliased.
    pub global_key: String,
    /// The global state at scheduling time.
    pub state: State,
}

/// Everything needed to detect and merge one component state off the main
/// context.
pub struct DetectionJob {
    /// Page of the component.
    pub page: PageId,
    /// Arena slot of the component.
    pub node: NodeId,
    /// Token the detected state will carry.
    pub token: StateToken,
    /// Component name.
    pub name: String,
    /// Kind of the state to build.
    pub kind: StateKind,
    /// Field declarations.
    pub decl: StateDecl,
    /// Parent state at scheduling time, `None` for a page root.
    pub parent: Option<State>,
    /// `(child, parent)` aliases declared on the connector.
    pub parent_bindings: Vec<(String, String)>,
    /// Parent-state projection declared on the connector.
    pub projection: Option<Projection>,
    /// Global bindings declared on the connector.
    pub globals: Vec<GlobalSnapshot>,
    /// Raised when the component is torn down.
    pub cancel: Arc<AtomicBool>,
    /// Trace context of the scheduling span.
    pub trace_context: Option<TraceContext>,
}

impl DetectionJob {
    /// Returns `true` once the owning component was destroyed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DetectionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionJob")
            .field("page", &self.page)
            .field("node", &self.node)
            .field("token", &self.token)
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(State::name))
            .field("globals", &self.globals.len())
            .field("cancelled", &self.is_cancelled())
            .field("trace_context", &self.trace_context)
            .finish_non_exhaustive()
    }
}

/// Work posted back to the main context.
#[derive(Debug)]
pub enum MainTask {
    /// A page's frame ticker asks for a batch pass.
    Tick(PageId),
    /// A detection job finished.
    Detected {
        /// Page of the component.
        page: PageId,
        /// Arena slot of the component.
        node: NodeId,
        /// The detected state, or why detection failed.
        outcome: Result<State>,
    },
}
