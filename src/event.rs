//! Completion handles for outstanding sends.
//!
//! Two kinds share one id space: *transport events* wrap a single
//! non-blocking send and optionally own a ref on a shared envelope,
//! dropped on completion; *parent events* aggregate child events and
//! fire a continuation once every child has terminated. This mirrors
//! `entity_waitlist.rs`'s handle-store + ready-set pattern
//! (`WaitlistHandle`/`ready_handles`/`collect_ready_items`), adapted
//! from "entity became in scope" to "transport send completed".

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

use crate::envelope::Envelope;
use crate::transport::{RequestHandle, Transport};
use crate::types::KeyGenerator;

/// A shared, ref-counted envelope handle: the managed message a
/// transport event may own.
pub type ManagedMessage = Rc<RefCell<Envelope>>;

/// A continuation run once an event (and everything beneath it, for a
/// parent event) has terminated.
pub type CompletionAction = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl From<u64> for EventId {
    fn from(v: u64) -> Self {
        EventId(v)
    }
}
impl From<EventId> for u64 {
    fn from(v: EventId) -> Self {
        v.0
    }
}

enum EventKind {
    Transport {
        request: RequestHandle,
        managed: Option<ManagedMessage>,
        done: bool,
    },
    Parent {
        children: Vec<EventId>,
        action: Option<CompletionAction>,
        fired: bool,
    },
}

/// Owns every outstanding [`EventId`] on this rank and drives their
/// completion each scheduler turn.
#[derive(Default)]
pub struct EventManager {
    ids: KeyGenerator<EventId>,
    events: HashMap<EventId, EventKind>,
}

impl EventManager {
    pub fn new() -> Self {
        Self { ids: KeyGenerator::new(), events: HashMap::new() }
    }

    /// `createMPIEvent(this_node)`: one per outstanding non-blocking
    /// send. `managed`, if given, is a shared envelope whose ref is
    /// dropped the moment this event completes.
    pub fn create_transport_event(&mut self, request: RequestHandle, managed: Option<ManagedMessage>) -> EventId {
        let id = self.ids.generate();
        self.events.insert(id, EventKind::Transport { request, managed, done: false });
        id
    }

    /// `createParentEvent(this_node)`: completes once every child in
    /// `children` has terminated.
    pub fn create_parent_event(&mut self, children: Vec<EventId>) -> EventId {
        let id = self.ids.generate();
        self.events.insert(id, EventKind::Parent { children, action: None, fired: false });
        id
    }

    /// Adds `child` to an existing parent event's child list. Used to
    /// compose broadcast fan-out and put's two-phase send
    /// incrementally rather than requiring the full child list
    /// up-front.
    pub fn add_event_to_list(&mut self, parent: EventId, child: EventId) {
        if let Some(EventKind::Parent { children, .. }) = self.events.get_mut(&parent) {
            children.push(child);
        }
    }

    /// `attachAction(continuation)`: runs once, when the event (and,
    /// for a parent, every descendant) terminates. If the event has
    /// already terminated, the action fires immediately.
    pub fn attach_action(&mut self, id: EventId, action: CompletionAction) {
        if self.is_terminated(id) {
            action();
            return;
        }
        if let Some(EventKind::Parent { action: slot, .. }) = self.events.get_mut(&id) {
            *slot = Some(action);
        }
    }

    /// Whether `id` (recursively, for a parent) has fully completed.
    /// An unknown id — already reaped after firing — counts as
    /// terminated: a completed event is free to be dropped once observed.
    pub fn is_terminated(&self, id: EventId) -> bool {
        match self.events.get(&id) {
            None => true,
            Some(EventKind::Transport { done, .. }) => *done,
            Some(EventKind::Parent { children, fired, .. }) => {
                *fired || children.iter().all(|c| self.is_terminated(*c))
            }
        }
    }

    /// Polls every outstanding transport event against `transport`,
    /// drops managed refs on completion, then propagates completion
    /// up through parent events, firing attached actions exactly once.
    /// Returns the ids that newly terminated this call.
    pub fn poll(&mut self, transport: &dyn Transport) -> Vec<EventId> {
        let mut newly_terminated = Vec::new();

        let transport_ids: Vec<EventId> = self
            .events
            .iter()
            .filter_map(|(id, k)| matches!(k, EventKind::Transport { done: false, .. }).then_some(*id))
            .collect();
        for id in transport_ids {
            if let Some(EventKind::Transport { request, managed, done }) = self.events.get_mut(&id) {
                if transport.test(*request) {
                    *done = true;
                    if let Some(msg) = managed.take() {
                        msg.borrow_mut().deref();
                    }
                    newly_terminated.push(id);
                }
            }
        }

        // Iterate to a fixed point: a parent of a parent should fire
        // the same turn its grandchildren complete.
        loop {
            let parent_ids: Vec<EventId> = self
                .events
                .iter()
                .filter_map(|(id, k)| matches!(k, EventKind::Parent { fired: false, .. }).then_some(*id))
                .collect();
            let mut progressed = false;
            for id in parent_ids {
                if self.is_terminated_ignoring_fired(id) {
                    if let Some(EventKind::Parent { action, fired, .. }) = self.events.get_mut(&id) {
                        *fired = true;
                        let action = action.take();
                        if let Some(action) = action {
                            action();
                        }
                    }
                    newly_terminated.push(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        newly_terminated
    }

    fn is_terminated_ignoring_fired(&self, id: EventId) -> bool {
        match self.events.get(&id) {
            None => true,
            Some(EventKind::Transport { done, .. }) => *done,
            Some(EventKind::Parent { children, .. }) => children.iter().all(|c| self.is_terminated(*c)),
        }
    }

    /// Reclaims a terminated event's bookkeeping. Callers that only
    /// ever check [`EventManager::is_terminated`] never need this —
    /// it exists so long-running schedulers don't accumulate
    /// completed events forever.
    pub fn reap(&mut self, id: EventId) {
        if self.is_terminated(id) {
            self.events.remove(&id);
            self.ids.recycle_key(&id);
        }
    }
}
