//! Lifecycle events and the install state machine.
//!
//! ```text
//!  Uninstalled ──install──► StateDetecting ──ready──► Ready{Hidden, Detached}
//!                               │   ▲                   │  show/hide  attach/detach
//!                 queue ops ◄───┘   │ failure: stays    ▼
//!                                   └─────────── Ready{Visible|Hidden, Attached|Detached}
//!                                                        │
//!                  any state ──────── destroy ──────────►  Destroyed (terminal)
//! ```

use crate::domain::{Action, Payload};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Events emitted by the platform's lifecycle source, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleEvent {
    /// The page was created; components install their children.
    Create,
    /// The page is about to become visible.
    Start,
    /// The page is in the foreground; the page store starts ticking.
    Resume,
    /// The page left the foreground.
    Pause,
    /// The page is no longer visible; the page store stops ticking.
    Stop,
    /// The page is being torn down.
    Destroy,
}

impl LifecycleEvent {
    /// Every event, in emission order.
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Start,
        Self::Resume,
        Self::Pause,
        Self::Stop,
        Self::Destroy,
    ];

    /// Returns the name of the private action this event maps to.
    #[must_use]
    pub const fn action_name(self) -> &'static str {
        match self {
            Self::Create => "lifecycle:on_create",
            Self::Start => "lifecycle:on_start",
            Self::Resume => "lifecycle:on_resume",
            Self::Pause => "lifecycle:on_pause",
            Self::Stop => "lifecycle:on_stop",
            Self::Destroy => "lifecycle:on_destroy",
        }
    }

    /// Returns the private action delivered to components for this event.
    #[must_use]
    pub fn action(self) -> Action {
        Action::private(self.action_name())
    }

    /// Maps a lifecycle action back to its event.
    #[must_use]
    pub fn from_action(action: &Action) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event| action.is_private() && event.action_name() == action.name())
    }

    /// Events a component installed late must replay to catch up with a
    /// page whose last event was `self`.
    #[must_use]
    pub fn catch_up(self) -> &'static [Self] {
        match self {
            Self::Create | Self::Stop => &[Self::Create],
            Self::Start => &[Self::Create, Self::Start],
            Self::Resume | Self::Pause => &[Self::Create, Self::Start, Self::Resume],
            Self::Destroy => &[],
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_name())
    }
}

/// Source of lifecycle events, implemented by the platform layer.
pub trait LifecycleSource {
    /// Registers a listener called for every event, in emission order.
    fn subscribe(&self, listener: Rc<dyn Fn(LifecycleEvent)>);
}

/// In-process [`LifecycleSource`] driven by explicit [`emit`](Self::emit)
/// calls.
#[derive(Default)]
pub struct LifecycleEmitter {
    listeners: RefCell<Vec<Rc<dyn Fn(LifecycleEvent)>>>,
    last: Cell<Option<LifecycleEvent>>,
}

impl LifecycleEmitter {
    /// Creates an emitter without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `event` to every listener.
    pub fn emit(&self, event: LifecycleEvent) {
        self.last.set(Some(event));
        let listeners: Vec<_> = self.listeners.borrow().iter().cloned().collect();
        tracing::debug!(event = %event, listeners = listeners.len(), "lifecycle event");
        for listener in listeners {
            listener(event);
        }
    }

    /// Returns the last emitted event.
    #[must_use]
    pub fn last(&self) -> Option<LifecycleEvent> {
        self.last.get()
    }
}

impl LifecycleSource for LifecycleEmitter {
    fn subscribe(&self, listener: Rc<dyn Fn(LifecycleEvent)>) {
        self.listeners.borrow_mut().push(listener);
    }
}

/// Whether a ready component is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Its applier receives batches.
    Visible,
    /// Its applier is disabled.
    Hidden,
}

/// Whether a ready component holds its view resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Its applier is registered with the page store.
    Attached,
    /// Its applier registration was released.
    Detached,
}

/// Install state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Declared but not installed.
    Uninstalled,
    /// Fields are being detected and merged; operations are queued.
    StateDetecting,
    /// State is live.
    Ready {
        /// Current visibility.
        visibility: Visibility,
        /// Current attachment.
        attachment: Attachment,
    },
    /// Torn down. Terminal.
    Destroyed,
}

impl InstallState {
    /// The state a component enters once detection succeeded.
    pub const READY: Self = Self::Ready {
        visibility: Visibility::Hidden,
        attachment: Attachment::Detached,
    };

    /// Returns `true` once the component is ready.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Returns `true` while the component is visible and attached.
    #[must_use]
    pub const fn is_showing(self) -> bool {
        matches!(
            self,
            Self::Ready {
                visibility: Visibility::Visible,
                attachment: Attachment::Attached,
            }
        )
    }
}

/// Operation received while a component was still detecting its state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingOp {
    Lifecycle(LifecycleEvent),
    Show,
    Hide,
    Attach,
    Detach,
    Deliver { action: Action, payload: Payload },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_actions_round_trip_and_are_private() {
        for event in LifecycleEvent::ALL {
            let action = event.action();
            assert!(action.is_private());
            assert_eq!(LifecycleEvent::from_action(&action), Some(event));
        }
        assert_eq!(
            LifecycleEvent::from_action(&Action::public("lifecycle:on_resume")),
            None
        );
    }

    #[test]
    fn emitter_delivers_in_order() {
        let emitter = LifecycleEmitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        emitter.subscribe(Rc::new(move |event| sink.borrow_mut().push(event)));

        emitter.emit(LifecycleEvent::Create);
        emitter.emit(LifecycleEvent::Resume);

        assert_eq!(*seen.borrow(), vec![LifecycleEvent::Create, LifecycleEvent::Resume]);
        assert_eq!(emitter.last(), Some(LifecycleEvent::Resume));
    }
}
