//! Active-message dispatch: stamp-then-send pipeline, binomial
//! broadcast fan-out, the eager/RDMA-get put protocol, and the receive
//! loop that drives the transport.
//!
//! Grounded on `message_manager.rs`'s staged send/receive pipeline —
//! collect, stamp, hand to the channel sender, drain on receive — and
//! `base_connection.rs`'s connection-owns-manager-owns-transport
//! layering, generalized from reliable-channel message delivery to
//! active-message handler dispatch.

use std::collections::HashMap;

use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeError, EnvelopeFlags};
use crate::epoch::EpochId;
use crate::event::{EventId, EventManager};
use crate::registry::{DeliveryContext, HandlerId, Registry, RegistryError};
use crate::topology;
use crate::epoch::TerminationDetector;
use crate::transport::{Transport, TransportError};
use crate::types::{RankId, Tag};

/// Reserved transport tag carrying envelope-prefixed active messages;
/// raw `sendData`/`recvDataMsg` traffic uses tags allocated above this
/// range.
pub const ACTIVE_MESSAGE_TAG: Tag = 0;
const FIRST_DATA_TAG: Tag = 1;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Resolved Open Question (DESIGN.md #2): a broadcast of a
    /// pipe-tagged envelope is rejected outright rather than silently
    /// reinterpreting `group_or_pipe_id` down the tree.
    #[error("cannot broadcast a pipe-tagged message: each rank's pipe registry is local")]
    BroadcastOfPipeMessage,
}

/// A continuation posted by `recvDataMsg`, run with the received bytes
/// once a matching tagged payload arrives.
type DataContinuation = Box<dyn FnOnce(Vec<u8>)>;

/// Send/broadcast/raw-payload active-message dispatch for one rank
///. Like every other component here, it borrows
/// `Transport`/`Registry`/`EventManager`/`TerminationDetector` rather
/// than owning them — no component here owns another.
pub struct ActiveMessenger {
    self_rank: RankId,
    size: u32,
    next_data_tag: Tag,
    /// `runInEpoch`'s ambient-parent stack: pushed on
    /// entry, popped on exit, consulted whenever a send omits an
    /// explicit epoch.
    epoch_stack: Vec<EpochId>,
    /// Messages that arrived addressed to a handler id not yet
    /// registered, replayed in FIFO order once it is.
    pending_handler_msgs: HashMap<HandlerId, Vec<(RankId, Envelope, Vec<u8>)>>,
    pending_data_recvs: HashMap<Tag, (Option<RankId>, DataContinuation)>,
    /// Put messages whose small envelope arrived before its payload,
    /// retried every `poll_receive` pass.
    pending_puts: Vec<(RankId, Envelope, Vec<u8>)>,
}

impl ActiveMessenger {
    pub fn new(self_rank: RankId, size: u32) -> Self {
        Self {
            self_rank,
            size,
            next_data_tag: FIRST_DATA_TAG,
            epoch_stack: Vec::new(),
            pending_handler_msgs: HashMap::new(),
            pending_data_recvs: HashMap::new(),
            pending_puts: Vec::new(),
        }
    }

    /// Pushes `epoch` as the ambient ("current") ​epoch; a send that
    /// doesn't specify one explicitly picks this up, the mechanism
    /// `runInEpoch{Rooted,Collective}` uses.
    pub fn push_epoch(&mut self, epoch: EpochId) {
        self.epoch_stack.push(epoch);
    }

    pub fn pop_epoch(&mut self) {
        self.epoch_stack.pop();
    }

    pub fn current_epoch(&self) -> Option<EpochId> {
        self.epoch_stack.last().copied()
    }

    fn resolve_epoch(&self, epoch: Option<EpochId>) -> Option<EpochId> {
        epoch.or_else(|| self.current_epoch())
    }

    /// `sendMsg<Msg, handler>(dest, msg) -> EventId`.
    pub fn send_msg(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        term: &mut TerminationDetector,
        dest: RankId,
        handler: HandlerId,
        payload: Vec<u8>,
        epoch: Option<EpochId>,
    ) -> Result<EventId, MessengerError> {
        let epoch = self.resolve_epoch(epoch);
        let mut env = Envelope::init();
        env.setup(dest, handler.as_u64())?;
        if let Some(epoch) = epoch {
            env.set_epoch(epoch)?;
        }
        env.lock();
        if let Some(epoch) = epoch {
            term.produce(epoch, dest, 1);
        }
        log::trace!("send_msg rank {} -> rank {dest} handler {handler}", self.self_rank);
        let bytes = env.to_wire(&payload);
        let req = transport.send_bytes(dest, ACTIVE_MESSAGE_TAG, bytes)?;
        Ok(events.create_transport_event(req, None))
    }

    /// `broadcastMsg<Msg, handler>(msg) -> EventId`: posts to the sender's direct children in the binomial tree
    /// rooted at `self_rank`; each rank that receives forwards further
    /// before delivering locally. `deliver_to_sender` mirrors
    /// `envelopeGetDeliverBcast`.
    pub fn broadcast_msg(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        term: &mut TerminationDetector,
        registry: &Registry,
        handler: HandlerId,
        payload: Vec<u8>,
        epoch: Option<EpochId>,
        deliver_to_sender: bool,
        pipe_id: Option<u64>,
    ) -> Result<EventId, MessengerError> {
        if pipe_id.is_some() {
            return Err(MessengerError::BroadcastOfPipeMessage);
        }
        let epoch = self.resolve_epoch(epoch);
        let (c1, c2) = topology::children(self.self_rank, self.self_rank, self.size);
        let mut children = Vec::new();

        for child in [c1, c2].into_iter().flatten() {
            let mut env = Envelope::init();
            env.setup(self.self_rank, handler.as_u64())?;
            env.set_type_bit(EnvelopeFlags::BROADCAST)?;
            env.set_deliver_bcast_to_sender(deliver_to_sender)?;
            if let Some(epoch) = epoch {
                env.set_epoch(epoch)?;
            }
            env.lock();
            if let Some(epoch) = epoch {
                term.produce(epoch, child, 1);
            }
            let bytes = env.to_wire(&payload);
            let req = transport.send_bytes(child, ACTIVE_MESSAGE_TAG, bytes)?;
            children.push(events.create_transport_event(req, None));
        }

        if deliver_to_sender {
            if let Some(epoch) = epoch {
                term.produce(epoch, self.self_rank, 1);
            }
            self.invoke_handler(registry, handler, self.self_rank, epoch, None, &payload);
            if let Some(epoch) = epoch {
                term.consume(epoch, self.self_rank, 1);
            }
        }

        if children.is_empty() {
            // Broadcast to an empty group is a no-op that returns no event.
            // A single-rank cluster with deliver_to_sender=false has no
            // recipients at all; model that as an already-terminated
            // parent event instead of a sentinel, since EventManager
            // already treats an empty child list as vacuously complete.
            return Ok(events.create_parent_event(Vec::new()));
        }
        Ok(events.create_parent_event(children))
    }

    /// `sendData(ptr, bytes, dest, tag?) -> (EventId, tag)`: raw
    /// RDMA-style payload send, used as the first phase of a put
    /// message.
    pub fn send_data(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        dest: RankId,
        bytes: Vec<u8>,
        tag: Option<Tag>,
    ) -> Result<(EventId, Tag), MessengerError> {
        let tag = tag.unwrap_or_else(|| {
            let t = self.next_data_tag;
            self.next_data_tag += 1;
            t
        });
        let req = transport.send_bytes(dest, tag, bytes)?;
        Ok((events.create_transport_event(req, None), tag))
    }

    /// `recvDataMsg(tag, src?, continuation)`: posts a continuation to
    /// run once a raw tagged payload arrives. Checked eagerly against
    /// whatever the transport already has buffered, then re-checked on
    /// every `poll_receive`.
    pub fn recv_data_msg(
        &mut self,
        transport: &dyn Transport,
        tag: Tag,
        src: Option<RankId>,
        continuation: DataContinuation,
    ) {
        if let Some((from, _)) = transport.probe(src, tag) {
            if let Some(bytes) = transport.recv_bytes(from, tag) {
                continuation(bytes);
                return;
            }
        }
        self.pending_data_recvs.insert(tag, (src, continuation));
    }

    /// Two-phase put send: ships `bytes` via
    /// `sendData`, stamps the resulting tag into the small message's
    /// put slot, sends that, and composes both completions under one
    /// parent event.
    pub fn send_put_msg(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        term: &mut TerminationDetector,
        dest: RankId,
        handler: HandlerId,
        bytes: Vec<u8>,
        epoch: Option<EpochId>,
    ) -> Result<EventId, MessengerError> {
        let size = bytes.len();
        let (data_event, tag) = self.send_data(transport, events, dest, bytes, None)?;

        let epoch = self.resolve_epoch(epoch);
        let mut env = Envelope::init();
        env.setup(dest, handler.as_u64())?;
        env.set_put(crate::envelope::PutPayload { tag, size, bytes: None })?;
        if let Some(epoch) = epoch {
            env.set_epoch(epoch)?;
        }
        env.lock();
        if let Some(epoch) = epoch {
            term.produce(epoch, dest, 1);
        }
        let wire = env.to_wire(&[]);
        let msg_req = transport.send_bytes(dest, ACTIVE_MESSAGE_TAG, wire)?;
        let msg_event = events.create_transport_event(msg_req, None);

        Ok(events.create_parent_event(vec![data_event, msg_event]))
    }

    fn invoke_handler(
        &mut self,
        registry: &Registry,
        handler: HandlerId,
        from: RankId,
        epoch: Option<EpochId>,
        tag: Option<Tag>,
        payload: &[u8],
    ) {
        match registry.get_handler(handler) {
            Ok((f, handler_tag)) => {
                let ctx = DeliveryContext { from, epoch, tag: tag.or(handler_tag), payload };
                f(&ctx);
            }
            Err(_) => {
                // An unknown handler id here is fatal for a message that should already have been
                // buffered by `poll_receive`. Reaching here means a
                // caller invoked delivery directly, bypassing the
                // pending-message buffer.
                panic!("delivered to unregistered handler {handler}");
            }
        }
    }

    /// Drains any messages that were buffered in
    /// `pending_handler_msgs` waiting on `handler`, delivering them in
    /// FIFO arrival order.
    pub fn on_handler_registered(
        &mut self,
        registry: &Registry,
        term: &mut TerminationDetector,
        handler: HandlerId,
    ) {
        let Some(queued) = self.pending_handler_msgs.remove(&handler) else { return };
        for (from, env, payload) in queued {
            self.deliver(registry, term, from, env, payload);
        }
    }

    /// One pass of the receive path: probes for one active message, forwards broadcasts,
    /// resolves put payloads, and dispatches everything else directly.
    /// Also drains any `recvDataMsg` continuations whose payload has
    /// arrived. Returns `true` if any progress was made, for the
    /// scheduler's "did this poll do anything" bookkeeping.
    pub fn poll_receive(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        term: &mut TerminationDetector,
        registry: &Registry,
    ) -> bool {
        let mut progressed = false;

        let mut still_pending = Vec::new();
        for (from, mut env, small_payload) in self.pending_puts.drain(..) {
            if Self::try_complete_put(transport, &mut env, from) {
                self.deliver(registry, term, from, env, small_payload);
                progressed = true;
            } else {
                still_pending.push((from, env, small_payload));
            }
        }
        self.pending_puts = still_pending;

        let ready_data_tags: Vec<Tag> = self
            .pending_data_recvs
            .iter()
            .filter_map(|(tag, (src, _))| transport.probe(*src, *tag).map(|_| *tag))
            .collect();
        for tag in ready_data_tags {
            let (src, continuation) = self.pending_data_recvs.remove(&tag).expect("just found above");
            if let Some((from, _)) = transport.probe(src, tag) {
                if let Some(bytes) = transport.recv_bytes(from, tag) {
                    continuation(bytes);
                    progressed = true;
                }
            }
        }

        if let Some((from, _size)) = transport.probe(None, ACTIVE_MESSAGE_TAG) {
            if let Some(bytes) = transport.recv_bytes(from, ACTIVE_MESSAGE_TAG) {
                let (mut env, payload) = Envelope::from_wire(&bytes);
                let payload = payload.to_vec();
                env.init_recv();
                progressed = true;

                if env.is_broadcast() && env.dest() != self.self_rank {
                    self.forward_broadcast(transport, events, term, &env, &payload);
                }

                if env.is_put() {
                    let mut env = env;
                    if Self::try_complete_put(transport, &mut env, from) {
                        self.deliver(registry, term, from, env, payload);
                    } else {
                        self.pending_puts.push((from, env, payload));
                    }
                } else {
                    self.deliver(registry, term, from, env, payload);
                }
            }
        }

        progressed
    }

    fn forward_broadcast(
        &mut self,
        transport: &dyn Transport,
        events: &mut EventManager,
        term: &mut TerminationDetector,
        env: &Envelope,
        payload: &[u8],
    ) {
        let root = env.dest();
        let (c1, c2) = topology::children(root, self.self_rank, self.size);
        let epoch = env.epoch().ok().flatten();
        for child in [c1, c2].into_iter().flatten() {
            let mut fwd = Envelope::init();
            let _ = fwd.setup(root, env.handler_id());
            let _ = fwd.set_type_bit(EnvelopeFlags::BROADCAST);
            let _ = fwd.set_deliver_bcast_to_sender(env.deliver_bcast_to_sender());
            if let Some(epoch) = epoch {
                let _ = fwd.set_epoch(epoch);
            }
            fwd.lock();
            if let Some(epoch) = epoch {
                term.produce(epoch, child, 1);
            }
            let bytes = fwd.to_wire(payload);
            if let Ok(req) = transport.send_bytes(child, ACTIVE_MESSAGE_TAG, bytes) {
                events.create_transport_event(req, None);
            }
        }
    }

    /// Attempts to fill in a put message's payload bytes from whatever
    /// the transport has buffered for its tag.
    /// Returns `true` once `env`'s put slot has real bytes.
    fn try_complete_put(transport: &dyn Transport, env: &mut Envelope, from: RankId) -> bool {
        let Ok(Some(put)) = env.put() else { return false };
        if put.bytes.is_some() {
            return true;
        }
        let put_tag = put.tag;
        let Some(bytes) = transport.recv_bytes(from, put_tag) else { return false };
        let Ok(Some(slot)) = env.put_mut() else { return false };
        slot.bytes = Some(bytes);
        true
    }

    /// `deliverActiveMsg`: look up the handler, invoke it, consume the
    /// epoch, and buffer the message instead if the handler isn't
    /// registered yet.
    fn deliver(&mut self, registry: &Registry, term: &mut TerminationDetector, from: RankId, env: Envelope, payload: Vec<u8>) {
        let handler = HandlerId::from_u64(env.handler_id());
        if !registry.is_registered(handler) {
            log::warn!("message for unregistered handler {handler} buffered pending registration");
            self.pending_handler_msgs.entry(handler).or_default().push((from, env, payload));
            return;
        }
        let epoch = env.epoch().ok().flatten();
        let tag = env.tag().ok().flatten();
        self.invoke_handler(registry, handler, from, epoch, tag, &payload);
        if let Some(epoch) = epoch {
            if !env.is_term() {
                term.consume(epoch, from, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerKind;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn ping_delivers_exactly_once() {
        let mut cluster = MemoryTransport::cluster(2);
        let t1 = cluster.remove(1);
        let t0 = cluster.remove(0);

        let mut reg1 = Registry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handler = reg1.register_active_handler(
            HandlerKind::Auto,
            Arc::new(move |ctx: &DeliveryContext| {
                assert_eq!(ctx.payload, b"hello");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        let mut m0 = ActiveMessenger::new(0, 2);
        let mut m1 = ActiveMessenger::new(1, 2);
        let mut events0 = EventManager::new();
        let mut events1 = EventManager::new();
        let mut term0 = TerminationDetector::new(0, 2);
        let mut term1 = TerminationDetector::new(1, 2);

        m0.send_msg(&t0, &mut events0, &mut term0, 1, handler, b"hello".to_vec(), None).unwrap();
        assert!(m1.poll_receive(&t1, &mut events1, &mut term1, &reg1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!m1.poll_receive(&t1, &mut events1, &mut term1, &reg1));
    }

    #[test]
    fn broadcast_reaches_every_non_root_rank_exactly_once() {
        let cluster = MemoryTransport::cluster(4);
        let mut regs: Vec<Registry> = (0..4).map(|_| Registry::new()).collect();
        let counts: Vec<Arc<AtomicU32>> = (0..4).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let mut handlers = Vec::new();
        for (i, reg) in regs.iter_mut().enumerate() {
            let c = counts[i].clone();
            handlers.push(reg.register_active_handler(
                HandlerKind::Auto,
                Arc::new(move |_: &DeliveryContext| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            ));
        }
        // Collective registration order is identical on every rank so
        // the ids line up; use rank 2's as the broadcast target id.
        let handler = handlers[2];

        let mut messengers: Vec<ActiveMessenger> = (0..4).map(|r| ActiveMessenger::new(r, 4)).collect();
        let mut events: Vec<EventManager> = (0..4).map(|_| EventManager::new()).collect();
        let mut terms: Vec<TerminationDetector> = (0..4).map(|r| TerminationDetector::new(r, 4)).collect();

        messengers[2]
            .broadcast_msg(&cluster[2], &mut events[2], &mut terms[2], &regs[2], handler, b"hi".to_vec(), None, true, None)
            .unwrap();

        // Drain the receive loop on every rank until nothing moves.
        for _ in 0..8 {
            for r in 0..4 {
                messengers[r].poll_receive(&cluster[r], &mut events[r], &mut terms[r], &regs[r]);
            }
        }

        for c in &counts {
            assert_eq!(c.load(Ordering::SeqCst), 1, "every rank should be delivered to exactly once");
        }
    }

    #[test]
    fn broadcast_of_pipe_message_is_rejected() {
        let cluster = MemoryTransport::cluster(1);
        let reg = Registry::new();
        let mut m = ActiveMessenger::new(0, 1);
        let mut events = EventManager::new();
        let mut term = TerminationDetector::new(0, 1);
        let err = m
            .broadcast_msg(&cluster[0], &mut events, &mut term, &reg, HandlerId::from_u64(0), vec![], None, true, Some(7))
            .unwrap_err();
        assert!(matches!(err, MessengerError::BroadcastOfPipeMessage));
    }
}
