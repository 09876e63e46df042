//! Single-writer stores.
//!
//! # Architecture
//!
//! ```text
//!   dispatch(job) ──► guard set? ──yes──► queue (FIFO)
//!                        │no
//!                        ▼
//!              SubReducer(scope) in recording scope
//!                        │ ChangeSet
//!                        ▼
//!       private changes ──────────────┐
//!       public changes ─► roots ─► de-dup ─► sync aliases
//!                        │                    │
//!                        ▼                    ▼
//!                 PageStore pending map   StoreObservers (per token)
//!                        │
//!          FrameTicker ─► on_tick gates ─► StateAppliers (one batch)
//! ```
//!
//! # Modules
//!
//! - [`dispatcher`]: the [`Store`] dispatch loop shared by page and global stores
//! - [`page`]: [`PageStore`], pending batches and [`StateApplier`]s
//! - [`frame`]: the [`FrameTicker`] thread
//! - [`global`]: process-wide [`GlobalStore`]s
//! - [`middleware`]: [`Middleware`] around a page's reducer dispatch

pub mod dispatcher;
pub mod frame;
pub mod global;
pub mod middleware;
pub mod page;

pub use dispatcher::{ObservedChange, ObserverId, Store};
pub use frame::FrameTicker;
pub use global::GlobalStore;
pub use middleware::{Middleware, Next};
pub use page::{ApplierId, PageStore, StateApplier};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STORE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    pub(crate) fn next() -> Self {
        Self(NEXT_STORE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store#{}", self.0)
    }
}

/// Dispatch status of a store.
///
/// `Created → Dispatching ↔ Idle`, with `Destroyed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// No dispatch has run yet.
    Created,
    /// A dispatch is running; new dispatches are queued.
    Dispatching,
    /// Between dispatches.
    Idle,
    /// Torn down; dispatches are ignored.
    Destroyed,
}
