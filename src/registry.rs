//! Handler registry: a process-local mapping from handler id to
//! function pointer used for active-message dispatch.
//!
//! Handler ids are generated deterministically so that a *collective*
//! registration (every rank calling `register_active_handler` with the
//! same call order) produces identical ids everywhere; a *node-local*
//! registration produces an id only valid on the generating rank.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{RankId, Tag};

/// Context handed to a registered handler on message arrival.
pub struct DeliveryContext<'a> {
    pub from: RankId,
    pub epoch: Option<crate::epoch::EpochId>,
    pub tag: Option<Tag>,
    pub payload: &'a [u8],
}

/// A registered active-message handler function.
pub type HandlerFn = Arc<dyn Fn(&DeliveryContext) + Send + Sync>;

/// Distinguishes the calling convention a handler id was generated
/// for, so dispatch can reconstruct it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// A plain free-function-style active-message handler.
    Auto,
    /// A handler capturing state (a "functor").
    Functor,
    /// The fixed virtual-dispatch trampoline used by
    /// `VirtualContextManager`.
    VirtualContext,
}

/// An opaque handler id. The top bit distinguishes collective
/// (globally identical) from node-local ids; the next two bits carry
/// the [`HandlerKind`]; the remainder is a monotonic sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

const LOCAL_BIT: u64 = 1 << 63;
const KIND_SHIFT: u32 = 61;
const KIND_MASK: u64 = 0b11 << KIND_SHIFT;
const SEQ_MASK: u64 = !(LOCAL_BIT | KIND_MASK);

impl HandlerId {
    pub const UNINITIALIZED: HandlerId = HandlerId(u64::MAX);

    fn new(is_local: bool, kind: HandlerKind, seq: u64) -> Self {
        debug_assert!(seq & !SEQ_MASK == 0, "handler sequence counter overflowed its bit field");
        let kind_bits = match kind {
            HandlerKind::Auto => 0u64,
            HandlerKind::Functor => 1u64,
            HandlerKind::VirtualContext => 2u64,
        } << KIND_SHIFT;
        let local_bit = if is_local { LOCAL_BIT } else { 0 };
        HandlerId(local_bit | kind_bits | (seq & SEQ_MASK))
    }

    pub fn is_local(&self) -> bool {
        self.0 & LOCAL_BIT != 0
    }

    pub fn kind(&self) -> HandlerKind {
        match (self.0 & KIND_MASK) >> KIND_SHIFT {
            0 => HandlerKind::Auto,
            1 => HandlerKind::Functor,
            _ => HandlerKind::VirtualContext,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        HandlerId(raw)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({:#x})", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler {0} is not registered")]
    UnknownHandler(HandlerId),
}

/// Process-local handler table.
pub struct Registry {
    collective_seq: u64,
    local_seq: u64,
    handlers: HashMap<HandlerId, (HandlerFn, Option<Tag>)>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            collective_seq: 0,
            local_seq: 0,
            handlers: HashMap::new(),
        }
    }

    /// Collectively-consistent registration: callers on every rank must
    /// invoke this in the same order for the resulting id to match.
    pub fn register_active_handler(&mut self, kind: HandlerKind, f: HandlerFn, tag: Option<Tag>) -> HandlerId {
        let id = HandlerId::new(false, kind, self.collective_seq);
        self.collective_seq += 1;
        log::info!("registered collective handler {id} (kind={kind:?})");
        self.handlers.insert(id, (f, tag));
        id
    }

    /// Node-local registration: the returned id is only meaningful on
    /// this rank.
    pub fn register_new_handler(&mut self, kind: HandlerKind, f: HandlerFn, tag: Option<Tag>) -> HandlerId {
        let id = HandlerId::new(true, kind, self.local_seq);
        self.local_seq += 1;
        log::info!("registered local handler {id} (kind={kind:?})");
        self.handlers.insert(id, (f, tag));
        id
    }

    pub fn get_handler(&self, id: HandlerId) -> Result<(&HandlerFn, Option<Tag>), RegistryError> {
        self.handlers
            .get(&id)
            .map(|(f, t)| (f, *t))
            .ok_or(RegistryError::UnknownHandler(id))
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn swap_handler(&mut self, id: HandlerId, f: HandlerFn, tag: Option<Tag>) -> Result<(), RegistryError> {
        if !self.handlers.contains_key(&id) {
            return Err(RegistryError::UnknownHandler(id));
        }
        self.handlers.insert(id, (f, tag));
        Ok(())
    }

    pub fn unregister(&mut self, id: HandlerId) -> Result<(), RegistryError> {
        self.handlers
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::UnknownHandler(id))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn collective_registration_order_determines_id() {
        let mut a = Registry::new();
        let mut b = Registry::new();
        let noop: HandlerFn = Arc::new(|_| {});
        let id_a1 = a.register_active_handler(HandlerKind::Auto, noop.clone(), None);
        let id_b1 = b.register_active_handler(HandlerKind::Auto, noop.clone(), None);
        assert_eq!(id_a1, id_b1);
        let id_a2 = a.register_active_handler(HandlerKind::Auto, noop.clone(), None);
        let id_b2 = b.register_active_handler(HandlerKind::Auto, noop, None);
        assert_eq!(id_a2, id_b2);
        assert_ne!(id_a1, id_a2);
    }

    #[test]
    fn local_and_collective_ids_never_collide() {
        let mut r = Registry::new();
        let noop: HandlerFn = Arc::new(|_| {});
        let collective = r.register_active_handler(HandlerKind::Auto, noop.clone(), None);
        let local = r.register_new_handler(HandlerKind::Auto, noop, None);
        assert!(!collective.is_local());
        assert!(local.is_local());
        assert_ne!(collective, local);
    }

    #[test]
    fn unknown_handler_is_an_error() {
        let r = Registry::new();
        assert_eq!(
            r.get_handler(HandlerId::from_u64(42)).unwrap_err(),
            RegistryError::UnknownHandler(HandlerId::from_u64(42))
        );
    }

    #[test]
    fn swap_replaces_behavior_in_place() {
        let mut r = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls1 = calls.clone();
        let first: HandlerFn = Arc::new(move |_| {
            calls1.fetch_add(1, Ordering::SeqCst);
        });
        let id = r.register_new_handler(HandlerKind::Auto, first, None);
        let calls2 = calls.clone();
        let second: HandlerFn = Arc::new(move |_| {
            calls2.fetch_add(10, Ordering::SeqCst);
        });
        r.swap_handler(id, second, None).unwrap();
        let (f, _) = r.get_handler(id).unwrap();
        f(&DeliveryContext { from: 0, epoch: None, tag: None, payload: &[] });
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
