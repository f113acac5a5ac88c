//! Virtual-entity construction and message dispatch.
//!
//! A virtual context is any `Any + Send` user type; the manager stores
//! it behind a type-erased handle and dispatches incoming messages to
//! it through a *sub-handler*, since the outer active-message handler
//! registered with [`crate::registry::Registry`] is always the same
//! fixed trampoline (`HandlerKind::VirtualContext`) regardless of
//! which concrete type is on the other end.
//!
//! Grounded on `shared/src/world/host/host_world_manager.rs` (entity
//! registry keyed by a generated id) and
//! `shared/src/world/remote/entity_waitlist.rs` (FIFO pending-message
//! buffering keyed on a not-yet-ready dependency, reused here for
//! not-yet-constructed entities); see DESIGN.md.

pub mod collection;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::epoch::EpochId;
use crate::event::EventId;
use crate::location::{EntityId, LocationError, LocationManager};
use crate::messenger::{ActiveMessenger, MessengerError};
use crate::registry::{DeliveryContext, HandlerId, HandlerKind, Registry};
use crate::transport::Transport;
use crate::types::{KeyGenerator, RankId, Tag};

/// A location-independent object addressable by [`VirtualProxy`].
/// Blanket-implemented for any `Any + Send` type; this is a tag, not a
/// capability the type has to implement by hand.
pub trait VirtualContext: Any + Send {}
impl<T: Any + Send> VirtualContext for T {}

const COLLECTION_BIT: u64 = 1 << 63;
const MIGRATABLE_BIT: u64 = 1 << 62;
const REMOTE_BIT: u64 = 1 << 61;
const NODE_SHIFT: u32 = 29;
const NODE_BITS: u64 = 32;
const NODE_MASK: u64 = ((1u64 << NODE_BITS) - 1) << NODE_SHIFT;
const LOCAL_ID_MASK: u64 = (1u64 << NODE_SHIFT) - 1;

/// A 64-bit location-transparent handle for a virtual entity: `{is_collection, is_migratable, is_remote, node (home),
/// local_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualProxy(u64);

impl VirtualProxy {
    fn pack(is_collection: bool, is_migratable: bool, node: RankId, local_id: u64) -> Self {
        debug_assert!(local_id & !LOCAL_ID_MASK == 0, "local id overflowed its bit field");
        let mut bits = (node as u64) << NODE_SHIFT | (local_id & LOCAL_ID_MASK);
        if is_collection {
            bits |= COLLECTION_BIT;
        }
        if is_migratable {
            bits |= MIGRATABLE_BIT;
        }
        VirtualProxy(bits)
    }

    pub fn local(node: RankId, local_id: u64) -> Self {
        Self::pack(false, false, node, local_id)
    }

    pub fn collection_element(node: RankId, local_id: u64) -> Self {
        Self::pack(true, false, node, local_id)
    }

    pub fn is_collection(&self) -> bool {
        self.0 & COLLECTION_BIT != 0
    }

    pub fn is_migratable(&self) -> bool {
        self.0 & MIGRATABLE_BIT != 0
    }

    /// Set once [`VirtualContextManager::migrate_out`] relocates this
    /// proxy's entity; a remote proxy still carries its original home
    /// node so stale references keep routing through
    /// [`LocationManager`]'s cache path.
    pub fn is_remote(&self) -> bool {
        self.0 & REMOTE_BIT != 0
    }

    pub fn home_node(&self) -> RankId {
        ((self.0 & NODE_MASK) >> NODE_SHIFT) as RankId
    }

    /// The id the proxy is registered under in [`LocationManager`].
    pub fn entity_id(&self) -> EntityId {
        self.0 & LOCAL_ID_MASK
    }

    fn mark_remote(&self) -> Self {
        VirtualProxy(self.0 | REMOTE_BIT)
    }
}

impl fmt::Display for VirtualProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualProxy(home={}, id={})", self.home_node(), self.entity_id())
    }
}

/// Identifies a registered sub-handler: the function actually invoked
/// on a virtual context's concrete type, looked up after the fixed
/// VC-dispatch trampoline extracts the target proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandlerId(u64);

impl From<u64> for SubHandlerId {
    fn from(v: u64) -> Self {
        SubHandlerId(v)
    }
}
impl From<SubHandlerId> for u64 {
    fn from(v: SubHandlerId) -> Self {
        v.0
    }
}
impl fmt::Display for SubHandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubHandlerId({})", self.0)
    }
}

type SubHandlerFn = Arc<dyn Fn(&mut (dyn Any + Send), &DeliveryContext) + Send + Sync>;

/// Builds a virtual context's concrete value from constructor argument
/// bytes.
type ConstructFn = Arc<dyn Fn(&[u8]) -> Box<dyn Any + Send> + Send + Sync>;

/// Reserved transport tag for `makeVirtualNode`'s remote construction
/// protocol, kept off the active-message path for the same reason
/// termination gossip is (see DESIGN.md): these request/reply pairs
/// are generated and consumed by `VirtualContextManager` itself, not
/// dispatched to a user sub-handler on an entity that doesn't exist
/// yet.
pub const VC_CONSTRUCT_TAG: Tag = Tag::MAX - 1;

/// Identifies a registered remote-construction factory; must be
/// registered in the same order on every rank, the same way a
/// collective handler id is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryId(u32);

type ConstructContinuation = Box<dyn FnOnce(VirtualProxy) + Send>;

struct PendingMessage {
    from: RankId,
    epoch: Option<EpochId>,
    tag: Option<Tag>,
    sub_handler: SubHandlerId,
    payload: Vec<u8>,
}

struct VirtualInfo {
    context: Box<dyn Any + Send>,
    proxy: VirtualProxy,
    is_constructed: bool,
    pending: VecDeque<PendingMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("virtual entity {0} is not registered on this rank")]
    Unknown(EntityId),
    #[error("sub-handler {0} is not registered")]
    UnknownSubHandler(SubHandlerId),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

/// Local registry of virtual entities plus the fixed VC-dispatch
/// trampoline.
pub struct VirtualContextManager {
    self_rank: RankId,
    ids: KeyGenerator<u64>,
    entities: HashMap<EntityId, VirtualInfo>,
    sub_handlers: HashMap<SubHandlerId, SubHandlerFn>,
    next_sub_handler: u64,
    /// The fixed handler id every rank registers identically for
    /// virtual-context dispatch.
    vc_handler: Option<HandlerId>,
    factories: HashMap<FactoryId, ConstructFn>,
    next_factory: u32,
    pending_construct: HashMap<u64, ConstructContinuation>,
    next_request_id: u64,
}

impl VirtualContextManager {
    pub fn new(self_rank: RankId) -> Self {
        Self {
            self_rank,
            ids: KeyGenerator::new(),
            entities: HashMap::new(),
            sub_handlers: HashMap::new(),
            next_sub_handler: 0,
            vc_handler: None,
            factories: HashMap::new(),
            next_factory: 0,
            pending_construct: HashMap::new(),
            next_request_id: 0,
        }
    }

    /// Registers a collective construction factory for `T`, used by
    /// the remote path of [`Self::make_virtual_node`]. `f` deserializes
    /// whatever byte encoding the caller's constructor-argument tuple
    /// uses; this crate stays encoding-agnostic the same way
    /// `ActiveMessenger`'s payloads do.
    pub fn register_factory<T, F>(&mut self, f: F) -> FactoryId
    where
        T: Any + Send,
        F: Fn(&[u8]) -> T + Send + Sync + 'static,
    {
        let id = FactoryId(self.next_factory);
        self.next_factory += 1;
        let wrapped: ConstructFn = Arc::new(move |args| Box::new(f(args)));
        self.factories.insert(id, wrapped);
        id
    }

    /// `makeVirtualNode<T>(node, args…)`'s remote path:
    /// if `node == self`, constructs immediately and calls
    /// `continuation` in-line; otherwise ships `args` to `node` over
    /// [`VC_CONSTRUCT_TAG`] and defers `continuation` until
    /// [`Self::poll_construct`] observes the reply.
    pub fn request_remote_virtual(
        &mut self,
        transport: &dyn Transport,
        location: &mut LocationManager,
        node: RankId,
        factory: FactoryId,
        args: Vec<u8>,
        continuation: impl FnOnce(VirtualProxy) + Send + 'static,
    ) {
        if node == self.self_rank {
            let value = self.factories.get(&factory).expect("unregistered factory").clone()(&args);
            let local_id = self.ids.generate();
            location.register_entity(local_id).expect("freshly generated local id can't already be registered");
            let proxy = VirtualProxy::local(self.self_rank, local_id);
            self.entities.insert(local_id, VirtualInfo { context: value, proxy, is_constructed: true, pending: VecDeque::new() });
            continuation(proxy);
            return;
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_construct.insert(request_id, Box::new(continuation));

        let mut wire = Vec::new();
        wire.push(0u8); // kind: request
        wire.extend_from_slice(&request_id.to_le_bytes());
        wire.extend_from_slice(&factory.0.to_le_bytes());
        wire.extend_from_slice(&self.self_rank.to_le_bytes());
        wire.extend_from_slice(&args);
        let _ = transport.send_bytes(node, VC_CONSTRUCT_TAG, wire);
    }

    /// Drains pending remote-construction traffic: answers requests
    /// from other ranks by building `T` and registering it locally,
    /// and resolves this rank's own outstanding requests once their
    /// reply arrives.
    pub fn poll_construct(&mut self, transport: &dyn Transport, location: &mut LocationManager) -> bool {
        let mut progressed = false;
        while let Some((from, _size)) = transport.probe(None, VC_CONSTRUCT_TAG) {
            let Some(bytes) = transport.recv_bytes(from, VC_CONSTRUCT_TAG) else { break };
            progressed = true;
            match bytes[0] {
                0 => {
                    let request_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
                    let factory_id = FactoryId(u32::from_le_bytes(bytes[9..13].try_into().unwrap()));
                    let requester = RankId::from_le_bytes(bytes[13..17].try_into().unwrap());
                    let args = &bytes[17..];
                    let value = self.factories.get(&factory_id).expect("unregistered factory").clone()(args);
                    let local_id = self.ids.generate();
                    location.register_entity(local_id).expect("freshly generated local id can't already be registered");
                    let proxy = VirtualProxy::local(self.self_rank, local_id);
                    self.entities.insert(local_id, VirtualInfo { context: value, proxy, is_constructed: true, pending: VecDeque::new() });

                    let mut reply = Vec::new();
                    reply.push(1u8);
                    reply.extend_from_slice(&request_id.to_le_bytes());
                    reply.extend_from_slice(&local_id.to_le_bytes());
                    let _ = transport.send_bytes(requester, VC_CONSTRUCT_TAG, reply);
                }
                1 => {
                    let request_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
                    let entity = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
                    if let Some(continuation) = self.pending_construct.remove(&request_id) {
                        continuation(VirtualProxy::local(from, entity));
                    }
                }
                other => log::warn!("unknown VC-construct wire kind {other}"),
            }
        }
        progressed
    }

    /// Registers the fixed VC-dispatch handler. Must be called
    /// identically (same call order) on every rank, since the
    /// resulting id is collective — runtime startup does this once
    /// before any `make_virtual*` call, during component init.
    pub fn vc_handler(&self) -> Option<HandlerId> {
        self.vc_handler
    }

    pub fn set_vc_handler(&mut self, id: HandlerId) {
        debug_assert_eq!(id.kind(), HandlerKind::VirtualContext);
        self.vc_handler = Some(id);
    }

    /// Registers a typed sub-handler. `f` receives the concrete
    /// context and the delivery metadata; the manager downcasts for
    /// it, panicking only if a caller mismatches `T` against the
    /// proxy's actual stored type (a programmer error, not a runtime
    /// condition, not a recoverable failure mode).
    pub fn register_sub_handler<T, F>(&mut self, f: F) -> SubHandlerId
    where
        T: Any + Send,
        F: Fn(&mut T, &DeliveryContext) + Send + Sync + 'static,
    {
        let id = SubHandlerId(self.next_sub_handler);
        self.next_sub_handler += 1;
        let wrapped: SubHandlerFn = Arc::new(move |any, ctx| {
            let concrete = any
                .downcast_mut::<T>()
                .expect("sub-handler invoked against a mismatched virtual context type");
            f(concrete, ctx);
        });
        self.sub_handlers.insert(id, wrapped);
        id
    }

    /// `makeVirtual<T>(args…) -> proxy`: constructs
    /// locally and registers the new entity with `location`.
    pub fn make_virtual<T: Any + Send>(&mut self, location: &mut LocationManager, value: T) -> VirtualProxy {
        let local_id = self.ids.generate();
        location
            .register_entity(local_id)
            .expect("freshly generated local id can't already be registered");
        let proxy = VirtualProxy::local(self.self_rank, local_id);
        self.entities.insert(
            local_id,
            VirtualInfo { context: Box::new(value), proxy, is_constructed: true, pending: VecDeque::new() },
        );
        proxy
    }

    /// Direct local construction for [`collection::CollectionManager`],
    /// returning the proxy tagged as a collection element.
    pub fn make_virtual_collection_element<T: Any + Send>(
        &mut self,
        location: &mut LocationManager,
        value: T,
    ) -> VirtualProxy {
        let local_id = self.ids.generate();
        location
            .register_entity(local_id)
            .expect("freshly generated local id can't already be registered");
        let proxy = VirtualProxy::collection_element(self.self_rank, local_id);
        self.entities.insert(
            local_id,
            VirtualInfo { context: Box::new(value), proxy, is_constructed: true, pending: VecDeque::new() },
        );
        proxy
    }

    /// `makeVirtualNode<T>(node, args…) -> proxy`: when
    /// `node == self`, equivalent to `make_virtual`. A remote target
    /// is out of scope for this synchronous entry point — callers
    /// that need a cross-rank construction request use
    /// [`Self::request_remote_virtual`], which returns the pending
    /// event the caller waits on instead of a proxy it doesn't have
    /// yet.
    pub fn make_virtual_node<T: Any + Send>(
        &mut self,
        location: &mut LocationManager,
        node: RankId,
        value: Option<T>,
    ) -> Option<VirtualProxy> {
        if node != self.self_rank {
            return None;
        }
        Some(self.make_virtual(location, value.expect("local construction requires a value")))
    }

    /// `makeVirtualMap<T, map_fn>(args…) -> proxy`:
    /// resolves `seed` through `map_fn` to a target rank; if that rank
    /// is `self`, constructs here, otherwise returns `None` (the
    /// caller is expected to have `map_fn` agree collectively on every
    /// rank, so only the owning rank ever sees `Some`).
    pub fn make_virtual_map<T: Any + Send>(
        &mut self,
        location: &mut LocationManager,
        seed: u64,
        size: u32,
        map_fn: impl Fn(u64, u32) -> RankId,
        value: T,
    ) -> Option<VirtualProxy> {
        let target = map_fn(seed, size);
        if target != self.self_rank {
            return None;
        }
        Some(self.make_virtual(location, value))
    }

    /// Sends a sub-handler-addressed message to `proxy`. Routes
    /// through `location` first, using `proxy.home_node()` as the
    /// routing authority: if this rank neither holds the entity
    /// locally nor has a cached hint for it, the message is forwarded
    /// to the home node rather than dropped. Only a `no_node` reply
    /// from the home itself (this rank *is* home and still doesn't
    /// know) fails the send. If routing resolves to `self`, dispatches
    /// in-process without a network round trip.
    pub fn send_msg(
        &mut self,
        transport: &dyn Transport,
        messenger: &mut ActiveMessenger,
        events: &mut crate::event::EventManager,
        term: &mut crate::epoch::TerminationDetector,
        location: &mut LocationManager,
        registry: &Registry,
        proxy: VirtualProxy,
        sub_handler: SubHandlerId,
        payload: Vec<u8>,
        epoch: Option<EpochId>,
    ) -> Result<Option<EventId>, ContextError> {
        let entity = proxy.entity_id();
        match location.route_msg(entity, proxy.home_node(), ()) {
            Ok(rank) if rank == self.self_rank => {
                self.dispatch_local(entity, sub_handler, self.self_rank, epoch, None, &payload);
                location.note_delivered(entity, rank);
                Ok(None)
            }
            Ok(rank) => {
                let vc_handler = self.vc_handler.expect("vc_handler must be registered before send_msg");
                let wire = encode_vc_message(entity, sub_handler, &payload);
                let event = messenger.send_msg(transport, events, term, rank, vc_handler, wire, epoch)?;
                location.note_delivered(entity, rank);
                Ok(Some(event))
            }
            Err(_pending) => Err(ContextError::Unknown(entity)),
        }
    }

    /// The fixed VC-dispatch trampoline: called by the registry handler
    /// registered under `vc_handler`. Decodes the target entity and
    /// sub-handler out of the payload, then applies the same
    /// enqueue-or-run-now semantics as a locally-originated dispatch.
    pub fn on_vc_message(&mut self, from: RankId, epoch: Option<EpochId>, tag: Option<Tag>, payload: &[u8]) {
        let (entity, sub_handler, inner) = decode_vc_message(payload);
        self.dispatch_local(entity, sub_handler, from, epoch, tag, inner);
    }

    /// `tryEnqueueWorkUnit(msg)`: if the entity is
    /// constructed, runs the sub-handler immediately; otherwise
    /// buffers in FIFO order until [`Self::drain_pending`] is called
    /// for it.
    pub fn dispatch_local(
        &mut self,
        entity: EntityId,
        sub_handler: SubHandlerId,
        from: RankId,
        epoch: Option<EpochId>,
        tag: Option<Tag>,
        payload: &[u8],
    ) {
        let Some(info) = self.entities.get_mut(&entity) else {
            log::warn!("VC message for unknown local entity {entity} dropped");
            return;
        };
        if info.is_constructed {
            let Some(f) = self.sub_handlers.get(&sub_handler).cloned() else {
                log::warn!("VC message for unregistered sub-handler {sub_handler} dropped");
                return;
            };
            let ctx = DeliveryContext { from, epoch, tag, payload };
            f(info.context.as_mut(), &ctx);
        } else {
            info.pending.push_back(PendingMessage {
                from,
                epoch,
                tag,
                sub_handler,
                payload: payload.to_vec(),
            });
        }
    }

    /// Marks `entity` constructed and replays any buffered messages in
    /// FIFO arrival order.
    pub fn drain_pending(&mut self, entity: EntityId) {
        if let Some(info) = self.entities.get_mut(&entity) {
            info.is_constructed = true;
        }
        let Some(mut pending) = self.entities.get_mut(&entity).map(|i| std::mem::take(&mut i.pending)) else {
            return;
        };
        while let Some(msg) = pending.pop_front() {
            self.dispatch_local(entity, msg.sub_handler, msg.from, msg.epoch, msg.tag, &msg.payload);
        }
    }

    pub fn context(&self, entity: EntityId) -> Option<&(dyn Any + Send)> {
        self.entities.get(&entity).map(|i| i.context.as_ref())
    }

    pub fn context_mut(&mut self, entity: EntityId) -> Option<&mut (dyn Any + Send)> {
        self.entities.get_mut(&entity).map(|i| i.context.as_mut())
    }

    pub fn proxy_of(&self, entity: EntityId) -> Option<VirtualProxy> {
        self.entities.get(&entity).map(|i| i.proxy)
    }

    /// Migration step 2: unregisters `entity` from
    /// `location` and returns its boxed context for the caller to
    /// serialize and ship to `new_home`. The stale proxy is still
    /// routable: `location`'s cache now points at `new_home`, so any
    /// in-flight message that arrives here after this call is
    /// forwarded via the cache path, not dropped.
    pub fn migrate_out(
        &mut self,
        location: &mut LocationManager,
        entity: EntityId,
        new_home: RankId,
    ) -> Result<(VirtualProxy, Box<dyn Any + Send>), ContextError> {
        let info = self.entities.remove(&entity).ok_or(ContextError::Unknown(entity))?;
        location.entity_emigrated(entity, new_home)?;
        Ok((info.proxy.mark_remote(), info.context))
    }

    /// Migration step 4: the destination rank re-registers `entity`
    /// under its own (same numeric) id with the deserialized context.
    pub fn migrate_in(&mut self, location: &mut LocationManager, entity: EntityId, from: RankId, context: Box<dyn Any + Send>) {
        location.entity_immigrated(entity, from).expect("destination must not already hold this entity");
        let proxy = VirtualProxy::local(self.self_rank, entity);
        self.entities.insert(entity, VirtualInfo { context, proxy, is_constructed: true, pending: VecDeque::new() });
    }
}

/// `VrtConstructMsg`/VC-message wire format: `[entity:u64][sub_handler:u64][payload...]`.
fn encode_vc_message(entity: EntityId, sub_handler: SubHandlerId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&entity.to_le_bytes());
    out.extend_from_slice(&u64::from(sub_handler).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_vc_message(bytes: &[u8]) -> (EntityId, SubHandlerId, &[u8]) {
    let entity = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let sub_handler = SubHandlerId(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));
    (entity, sub_handler, &bytes[16..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::TerminationDetector;
    use crate::event::EventManager;
    use crate::registry::HandlerKind;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc as StdArc;

    struct Counter(i64);

    #[test]
    fn local_send_runs_sub_handler_in_process() {
        let mut loc = LocationManager::new(0);
        let mut vcm = VirtualContextManager::new(0);
        let proxy = vcm.make_virtual(&mut loc, Counter(0));

        let seen = StdArc::new(AtomicI64::new(0));
        let observed = seen.clone();
        let sub = vcm.register_sub_handler::<Counter, _>(move |c, ctx| {
            c.0 += 1;
            observed.store(i64::from_le_bytes(ctx.payload.try_into().unwrap()), Ordering::SeqCst);
        });

        let cluster = MemoryTransport::cluster(1);
        let mut messenger = ActiveMessenger::new(0, 1);
        let mut events = EventManager::new();
        let mut term = TerminationDetector::new(0, 1);
        let registry = Registry::new();

        vcm.send_msg(&cluster[0], &mut messenger, &mut events, &mut term, &mut loc, &registry, proxy, sub, 9i64.to_le_bytes().to_vec(), None)
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(vcm.context(proxy.entity_id()).unwrap().downcast_ref::<Counter>().unwrap().0, 1);
    }

    #[test]
    fn message_to_unconstructed_entity_buffers_then_drains_fifo() {
        let mut loc = LocationManager::new(0);
        let mut vcm = VirtualContextManager::new(0);
        let local_id = {
            let id = 0u64;
            loc.register_entity(id).unwrap();
            vcm.entities.insert(id, VirtualInfo { context: Box::new(Counter(0)), proxy: VirtualProxy::local(0, id), is_constructed: false, pending: VecDeque::new() });
            id
        };

        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let sub = vcm.register_sub_handler::<Counter, _>(move |c, ctx| {
            c.0 += 1;
            o1.lock().unwrap().push(i64::from_le_bytes(ctx.payload.try_into().unwrap()));
        });

        vcm.dispatch_local(local_id, sub, 0, None, None, &1i64.to_le_bytes());
        vcm.dispatch_local(local_id, sub, 0, None, None, &2i64.to_le_bytes());
        assert_eq!(vcm.context(local_id).unwrap().downcast_ref::<Counter>().unwrap().0, 0, "still buffered");

        vcm.drain_pending(local_id);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(vcm.context(local_id).unwrap().downcast_ref::<Counter>().unwrap().0, 2);
    }

    #[test]
    fn proxy_bit_fields_round_trip() {
        let p = VirtualProxy::collection_element(3, 12345);
        assert_eq!(p.home_node(), 3);
        assert_eq!(p.entity_id(), 12345);
        assert!(p.is_collection());
        assert!(!p.is_migratable());
        assert!(!p.is_remote());
        let remote = p.mark_remote();
        assert!(remote.is_remote());
        assert_eq!(remote.entity_id(), 12345);
    }

    #[test]
    fn remote_construct_request_resolves_after_poll() {
        let cluster = MemoryTransport::cluster(2);
        let mut loc0 = LocationManager::new(0);
        let mut loc1 = LocationManager::new(1);
        let mut vcm0 = VirtualContextManager::new(0);
        let mut vcm1 = VirtualContextManager::new(1);

        let factory0 = vcm0.register_factory::<Counter, _>(|args| Counter(i64::from_le_bytes(args.try_into().unwrap())));
        let factory1 = vcm1.register_factory::<Counter, _>(|args| Counter(i64::from_le_bytes(args.try_into().unwrap())));
        assert_eq!(factory0, factory1, "factories must register in the same collective order on every rank");

        let resolved = StdArc::new(std::sync::Mutex::new(None));
        let slot = resolved.clone();
        vcm0.request_remote_virtual(&cluster[0], &mut loc0, 1, factory0, 7i64.to_le_bytes().to_vec(), move |proxy| {
            *slot.lock().unwrap() = Some(proxy);
        });
        assert!(resolved.lock().unwrap().is_none(), "remote construction hasn't replied yet");

        assert!(vcm1.poll_construct(&cluster[1], &mut loc1), "rank 1 should see the construct request");
        assert!(vcm0.poll_construct(&cluster[0], &mut loc0), "rank 0 should see the construct reply");

        let proxy = resolved.lock().unwrap().expect("continuation should have fired");
        assert_eq!(proxy.home_node(), 1);
        assert!(loc1.is_local(proxy.entity_id()));
    }
}
