//! Hierarchical dispatch bus.
//!
//! Buses form a tree rooted at the runtime's application bus. Each page owns
//! one bus attached below the root; components of a page register plain
//! receivers on their page bus.
//!
//! ```text
//!                    app bus (root)
//!                 ┌───────┴────────┐
//!            page bus A        page bus B          ◄── page receivers
//!          ┌─────┼─────┐       ┌───┴───┐
//!        recv  recv  recv    recv    recv          ◄── component receivers
//! ```
//!
//! # Delivery rules
//!
//! - [`DispatchBus::broadcast`] walks up to the root and calls the page
//!   receiver of every child bus. Component receivers never see broadcasts.
//! - [`DispatchBus::dispatch`] fans out to the direct children of one bus,
//!   optionally skipping the sender.
//! - [`DispatchBus::detach`] is terminal; every later operation is a silent
//!   no-op.
//!
//! Children are iterated over a snapshot, so receivers may register or
//! dispose receivers while a message is being delivered.

use crate::domain::{Action, Payload};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Callback receiving bus messages.
pub type BusReceiver = Rc<dyn Fn(&Action, &Payload)>;

/// Identity of a registration inside one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

#[derive(Clone)]
enum BusTarget {
    Node(Rc<BusNode>),
    Receiver(BusReceiver),
}

struct BusEntry {
    id: ReceiverId,
    target: BusTarget,
}

struct BusNode {
    name: String,
    parent: RefCell<Option<Weak<BusNode>>>,
    children: RefCell<Vec<BusEntry>>,
    page_receiver: RefCell<Option<BusReceiver>>,
    registration: RefCell<Option<ReceiverHandle>>,
    detached: Cell<bool>,
    next_id: Cell<u64>,
}

impl BusNode {
    fn register(&self, target: BusTarget) -> ReceiverId {
        let id = ReceiverId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.children.borrow_mut().push(BusEntry { id, target });
        id
    }

    fn snapshot(&self) -> Vec<(ReceiverId, BusTarget)> {
        self.children
            .borrow()
            .iter()
            .map(|entry| (entry.id, entry.target.clone()))
            .collect()
    }

    fn page_receiver(&self) -> Option<BusReceiver> {
        self.page_receiver.borrow().clone()
    }
}

/// Handle removing one registration from a bus.
///
/// Disposing is idempotent and does nothing once the bus is gone.
#[derive(Clone)]
pub struct ReceiverHandle {
    bus: Weak<BusNode>,
    id: ReceiverId,
}

impl ReceiverHandle {
    /// Returns the registration id.
    #[must_use]
    pub const fn id(&self) -> ReceiverId {
        self.id
    }

    /// Removes the registration.
    pub fn dispose(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.children.borrow_mut().retain(|entry| entry.id != self.id);
        }
    }
}

impl fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverHandle").field("id", &self.id).finish()
    }
}

/// Shared handle to one bus node.
#[derive(Clone)]
pub struct DispatchBus {
    node: Rc<BusNode>,
}

impl DispatchBus {
    /// Creates a standalone bus.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: Rc::new(BusNode {
                name: name.into(),
                parent: RefCell::new(None),
                children: RefCell::new(Vec::new()),
                page_receiver: RefCell::new(None),
                registration: RefCell::new(None),
                detached: Cell::new(false),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Returns the bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Returns `true` once [`detach`](Self::detach) was called.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.node.detached.get()
    }

    /// Returns the number of direct registrations.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.node.children.borrow().len()
    }

    /// Returns `true` if this bus has a parent.
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.parent_node().is_some()
    }

    /// Installs the distinguished page receiver, which alone gets broadcasts.
    pub fn set_page_receiver(&self, receiver: impl Fn(&Action, &Payload) + 'static) {
        if self.is_detached() {
            tracing::trace!(bus = %self.node.name, "page receiver ignored on detached bus");
            return;
        }
        *self.node.page_receiver.borrow_mut() = Some(Rc::new(receiver));
    }

    /// Returns `true` if a page receiver is installed.
    #[must_use]
    pub fn has_page_receiver(&self) -> bool {
        self.node.page_receiver.borrow().is_some()
    }

    /// Registers a plain receiver for [`dispatch`](Self::dispatch).
    ///
    /// Returns `None` on a detached bus.
    pub fn register_receiver(
        &self,
        receiver: impl Fn(&Action, &Payload) + 'static,
    ) -> Option<ReceiverHandle> {
        if self.is_detached() {
            tracing::trace!(bus = %self.node.name, "register ignored on detached bus");
            return None;
        }
        let id = self.node.register(BusTarget::Receiver(Rc::new(receiver)));
        Some(ReceiverHandle {
            bus: Rc::downgrade(&self.node),
            id,
        })
    }

    /// Registers this bus as a child of `parent`.
    ///
    /// A previous parent link is disposed first.
    pub fn attach(&self, parent: &Self) {
        if self.is_detached() || parent.is_detached() {
            tracing::trace!(bus = %self.node.name, "attach ignored on detached bus");
            return;
        }
        if Rc::ptr_eq(&self.node, &parent.node) {
            return;
        }
        if let Some(old) = self.node.registration.borrow_mut().take() {
            old.dispose();
        }

        let id = parent.node.register(BusTarget::Node(Rc::clone(&self.node)));
        *self.node.registration.borrow_mut() = Some(ReceiverHandle {
            bus: Rc::downgrade(&parent.node),
            id,
        });
        *self.node.parent.borrow_mut() = Some(Rc::downgrade(&parent.node));
        tracing::debug!(bus = %self.node.name, parent = %parent.node.name, "bus attached");
    }

    /// Detaches the bus from its parent. Terminal.
    pub fn detach(&self) {
        if self.node.detached.replace(true) {
            return;
        }
        if let Some(registration) = self.node.registration.borrow_mut().take() {
            registration.dispose();
        }
        *self.node.parent.borrow_mut() = None;
        *self.node.page_receiver.borrow_mut() = None;
        self.node.children.borrow_mut().clear();
        tracing::debug!(bus = %self.node.name, "bus detached");
    }

    /// Delivers to every page receiver under the shared root.
    pub fn broadcast(&self, action: &Action, payload: &Payload) {
        if self.is_detached() {
            tracing::trace!(bus = %self.node.name, action = %action, "broadcast ignored on detached bus");
            return;
        }

        let mut root = Rc::clone(&self.node);
        while let Some(parent) = Self::upgrade_parent(&root) {
            root = parent;
        }

        let _span = tracing::debug_span!("broadcast", action = %action, from = %self.node.name).entered();
        let mut delivered = 0_usize;
        for (_, target) in root.snapshot() {
            if let BusTarget::Node(child) = target {
                if child.detached.get() {
                    continue;
                }
                if let Some(receiver) = child.page_receiver() {
                    receiver(action, payload);
                    delivered += 1;
                }
            }
        }
        tracing::debug!(delivered, "broadcast delivered");
    }

    /// Fans out to the direct children, skipping `excluding`.
    ///
    /// Child buses forward to their own children.
    pub fn dispatch(&self, action: &Action, payload: &Payload, excluding: Option<ReceiverId>) {
        if self.is_detached() {
            tracing::trace!(bus = %self.node.name, action = %action, "dispatch ignored on detached bus");
            return;
        }
        Self::fan_out(&self.node, action, payload, excluding);
    }

    fn fan_out(node: &BusNode, action: &Action, payload: &Payload, excluding: Option<ReceiverId>) {
        for (id, target) in node.snapshot() {
            if Some(id) == excluding {
                continue;
            }
            match target {
                BusTarget::Receiver(receiver) => receiver(action, payload),
                BusTarget::Node(child) => {
                    if !child.detached.get() {
                        Self::fan_out(&child, action, payload, None);
                    }
                }
            }
        }
    }

    fn parent_node(&self) -> Option<Rc<BusNode>> {
        Self::upgrade_parent(&self.node)
    }

    fn upgrade_parent(node: &BusNode) -> Option<Rc<BusNode>> {
        node.parent.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for DispatchBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchBus")
            .field("name", &self.node.name)
            .field("children", &self.child_count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Action, &Payload)>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let make = move |label: &str| -> Box<dyn Fn(&Action, &Payload)> {
            let sink = Rc::clone(&sink);
            let label = label.to_string();
            Box::new(move |action: &Action, _: &Payload| {
                sink.borrow_mut().push(format!("{label}:{}", action.name()));
            })
        };
        (log, make)
    }

    #[test]
    fn broadcast_reaches_page_receivers_only() {
        let (log, make) = recorder();
        let root = DispatchBus::new("app");
        let page_a = DispatchBus::new("a");
        let page_b = DispatchBus::new("b");
        page_a.attach(&root);
        page_b.attach(&root);
        let a = make("page-a");
        let b = make("page-b");
        page_a.set_page_receiver(move |action, payload| a(action, payload));
        page_b.set_page_receiver(move |action, payload| b(action, payload));
        let component = make("component");
        let _handle = page_a.register_receiver(move |action, payload| component(action, payload));

        page_a.broadcast(&Action::public("refresh"), &json!(null));

        assert_eq!(
            *log.borrow(),
            vec!["page-a:refresh".to_string(), "page-b:refresh".to_string()]
        );
    }

    #[test]
    fn dispatch_skips_the_excluded_sender() {
        let (log, make) = recorder();
        let page = DispatchBus::new("page");
        let first = make("first");
        let second = make("second");
        let sender = page
            .register_receiver(move |action, payload| first(action, payload))
            .unwrap();
        let _other = page.register_receiver(move |action, payload| second(action, payload));

        page.dispatch(&Action::public("ping"), &json!(1), Some(sender.id()));

        assert_eq!(*log.borrow(), vec!["second:ping".to_string()]);
    }

    #[test]
    fn reattach_replaces_previous_parent() {
        let old_root = DispatchBus::new("old");
        let new_root = DispatchBus::new("new");
        let page = DispatchBus::new("page");

        page.attach(&old_root);
        page.attach(&new_root);

        assert_eq!(old_root.child_count(), 0);
        assert_eq!(new_root.child_count(), 1);
    }

    #[test]
    fn detached_bus_ignores_everything() {
        let (log, make) = recorder();
        let root = DispatchBus::new("app");
        let page = DispatchBus::new("page");
        page.attach(&root);
        let receiver = make("page");
        page.set_page_receiver(move |action, payload| receiver(action, payload));

        page.detach();
        page.detach();
        page.attach(&root);
        page.broadcast(&Action::public("x"), &json!(null));
        root.broadcast(&Action::public("y"), &json!(null));

        assert!(page.register_receiver(|_, _| {}).is_none());
        assert_eq!(root.child_count(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn receivers_may_dispose_during_delivery() {
        let page = DispatchBus::new("page");
        let slot: Rc<RefCell<Option<ReceiverHandle>>> = Rc::new(RefCell::new(None));
        let inner = Rc::clone(&slot);
        let handle = page
            .register_receiver(move |_, _| {
                if let Some(handle) = inner.borrow_mut().take() {
                    handle.dispose();
                }
            })
            .unwrap();
        *slot.borrow_mut() = Some(handle);

        page.dispatch(&Action::public("once"), &json!(null), None);
        page.dispatch(&Action::public("twice"), &json!(null), None);

        assert_eq!(page.child_count(), 0);
    }
}
