//! The message envelope: a fixed-size header prefixed to every active
//! message. This is the only contract between the
//! transport and dispatch — concentrating all polymorphism in a bit
//! field avoids per-message virtual calls and keeps the header a fixed
//! size so receivers can probe a single length.

use bitflags::bitflags;
use thiserror::Error;

use crate::types::{RankId, Tag, UNINITIALIZED_RANK};

bitflags! {
    /// `type_flags`: set of message-kind bits. Multiple may be set
    /// simultaneously, subject to invariant I1 (Put ⇒ not
    /// Broadcast).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvelopeFlags: u16 {
        const NORMAL     = 0b0000_0000_0001;
        const PIPE       = 0b0000_0000_0010;
        const PUT        = 0b0000_0000_0100;
        const TERM       = 0b0000_0000_1000;
        const BROADCAST  = 0b0000_0001_0000;
        const HAS_EPOCH  = 0b0000_0010_0000;
        const HAS_TAG    = 0b0000_0100_0000;
        const CALLBACK   = 0b0000_1000_0000;
        const PACKED_PUT = 0b0001_0000_0000;
    }
}

/// Sentinel handler id meaning "uninitialized".
pub const UNINITIALIZED_HANDLER: u64 = u64::MAX;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("attempted to mutate a locked envelope (dest={dest}, handler={handler})")]
    Locked { dest: RankId, handler: u64 },

    #[error("accessed extended field `{field}` on an envelope without the corresponding type flag set")]
    MissingExtendedFlag { field: &'static str },

    #[error("invariant I1 violated: PutMsg cannot also be BroadcastMsg")]
    PutAndBroadcast,
}

/// Raw payload handle for a Put message:
/// populated on the receive side once the payload has arrived via
/// `recvDataMsg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPayload {
    pub tag: Tag,
    pub size: usize,
    /// `None` until the payload bytes have actually been received.
    pub bytes: Option<Vec<u8>>,
}

/// The fixed-size per-message header. Extended fields (`epoch`, `tag`,
/// `put`) are only meaningful when the corresponding flag is set;
/// getters assert this (invariant I3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    type_flags: EnvelopeFlags,
    dest: RankId,
    handler_id: u64,
    ref_count: u32,
    group_or_pipe_id: u64,
    #[cfg(feature = "priorities")]
    priority: Option<crate::types::Priority>,
    is_locked: bool,
    has_been_serialized: bool,
    epoch: Option<crate::epoch::EpochId>,
    tag: Option<Tag>,
    put: Option<PutPayload>,
    /// When false, a broadcast is not delivered back to its originator.
    deliver_bcast_to_sender: bool,
}

impl Envelope {
    /// `init(env)`: type=Normal, dest/handler uninitialized, ref=0,
    /// group=default, priority=min, unlocked.
    pub fn init() -> Self {
        Self {
            type_flags: EnvelopeFlags::NORMAL,
            dest: UNINITIALIZED_RANK,
            handler_id: UNINITIALIZED_HANDLER,
            ref_count: 0,
            group_or_pipe_id: 0,
            #[cfg(feature = "priorities")]
            priority: None,
            is_locked: false,
            has_been_serialized: false,
            epoch: None,
            tag: None,
            put: None,
            deliver_bcast_to_sender: true,
        }
    }

    fn assert_unlocked(&self) -> Result<(), EnvelopeError> {
        if self.is_locked {
            return Err(EnvelopeError::Locked {
                dest: self.dest,
                handler: self.handler_id,
            });
        }
        Ok(())
    }

    pub fn setup(&mut self, dest: RankId, handler: u64) -> Result<(), EnvelopeError> {
        self.set_dest(dest)?;
        self.set_handler(handler)
    }

    pub fn set_dest(&mut self, dest: RankId) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.dest = dest;
        Ok(())
    }

    pub fn set_handler(&mut self, handler: u64) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.handler_id = handler;
        Ok(())
    }

    pub fn set_type_bit(&mut self, bit: EnvelopeFlags) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        if bit.contains(EnvelopeFlags::PUT) && self.type_flags.contains(EnvelopeFlags::BROADCAST)
        {
            return Err(EnvelopeError::PutAndBroadcast);
        }
        if bit.contains(EnvelopeFlags::BROADCAST) && self.type_flags.contains(EnvelopeFlags::PUT) {
            return Err(EnvelopeError::PutAndBroadcast);
        }
        self.type_flags.insert(bit);
        Ok(())
    }

    pub fn clear_type_bit(&mut self, bit: EnvelopeFlags) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.type_flags.remove(bit);
        Ok(())
    }

    pub fn set_group(&mut self, group: u64) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.group_or_pipe_id = group;
        Ok(())
    }

    #[cfg(feature = "priorities")]
    pub fn set_priority(&mut self, priority: crate::types::Priority) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.priority = Some(priority);
        Ok(())
    }

    pub fn set_epoch(&mut self, epoch: crate::epoch::EpochId) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.type_flags.insert(EnvelopeFlags::HAS_EPOCH);
        self.epoch = Some(epoch);
        Ok(())
    }

    pub fn set_tag(&mut self, tag: Tag) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.type_flags.insert(EnvelopeFlags::HAS_TAG);
        self.tag = Some(tag);
        Ok(())
    }

    pub fn set_put(&mut self, put: PutPayload) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        if self.type_flags.contains(EnvelopeFlags::BROADCAST) {
            return Err(EnvelopeError::PutAndBroadcast);
        }
        self.type_flags.insert(EnvelopeFlags::PUT);
        self.put = Some(put);
        Ok(())
    }

    pub fn set_deliver_bcast_to_sender(&mut self, deliver: bool) -> Result<(), EnvelopeError> {
        self.assert_unlocked()?;
        self.deliver_bcast_to_sender = deliver;
        Ok(())
    }

    /// Locks the envelope; called by the messenger immediately before
    /// handing it to the transport. All setters fail after this point.
    pub fn lock(&mut self) {
        self.is_locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    /// `ref(env)`: increments the shared ref count.
    pub fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    /// `deref(env)`: decrements the shared ref count, returning the new
    /// value. Per invariant I2, a message observed with `ref_count==0`
    /// after this call is eligible for deallocation.
    pub fn deref(&mut self) -> u32 {
        debug_assert!(self.ref_count > 0, "deref on an unshared/already-zero envelope");
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// `envelopeInitRecv(env)`: resets the local ref to 0 and asserts
    /// the message arrived locked (it was sent, hence locked, by the
    /// remote stamping path).
    pub fn init_recv(&mut self) {
        debug_assert!(self.is_locked, "message arrived unlocked");
        self.ref_count = 0;
    }

    pub fn dest(&self) -> RankId {
        self.dest
    }

    pub fn handler_id(&self) -> u64 {
        self.handler_id
    }

    pub fn group_or_pipe_id(&self) -> u64 {
        self.group_or_pipe_id
    }

    pub fn is_pipe(&self) -> bool {
        self.type_flags.contains(EnvelopeFlags::PIPE)
    }

    pub fn type_flags(&self) -> EnvelopeFlags {
        self.type_flags
    }

    pub fn is_broadcast(&self) -> bool {
        self.type_flags.contains(EnvelopeFlags::BROADCAST)
    }

    pub fn is_put(&self) -> bool {
        self.type_flags.contains(EnvelopeFlags::PUT)
    }

    pub fn is_term(&self) -> bool {
        self.type_flags.contains(EnvelopeFlags::TERM)
    }

    pub fn deliver_bcast_to_sender(&self) -> bool {
        self.deliver_bcast_to_sender
    }

    pub fn epoch(&self) -> Result<Option<crate::epoch::EpochId>, EnvelopeError> {
        if !self.type_flags.contains(EnvelopeFlags::HAS_EPOCH) {
            return Err(EnvelopeError::MissingExtendedFlag { field: "epoch" });
        }
        Ok(self.epoch)
    }

    pub fn tag(&self) -> Result<Option<Tag>, EnvelopeError> {
        if !self.type_flags.contains(EnvelopeFlags::HAS_TAG) {
            return Err(EnvelopeError::MissingExtendedFlag { field: "tag" });
        }
        Ok(self.tag)
    }

    pub fn put(&self) -> Result<Option<&PutPayload>, EnvelopeError> {
        if !self.type_flags.contains(EnvelopeFlags::PUT) {
            return Err(EnvelopeError::MissingExtendedFlag { field: "put" });
        }
        Ok(self.put.as_ref())
    }

    pub fn put_mut(&mut self) -> Result<Option<&mut PutPayload>, EnvelopeError> {
        if !self.type_flags.contains(EnvelopeFlags::PUT) {
            return Err(EnvelopeError::MissingExtendedFlag { field: "put" });
        }
        Ok(self.put.as_mut())
    }

    /// Encodes the header as the first bytes of a wire message, with
    /// `payload` appended untouched. `ref_count`/`is_locked`/`has_been_serialized` are
    /// local bookkeeping only and never travel on the wire — the
    /// receiver re-derives them via [`Envelope::init_recv`].
    ///
    /// Layout (little-endian): `flags:u16, dest:u32, handler_id:u64,
    /// group_or_pipe_id:u64`, followed by `epoch:u64` iff `HAS_EPOCH`,
    /// `tag:u32` iff `HAS_TAG`, `put_tag:u32, put_size:u64` iff `PUT`.
    pub fn to_wire(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(self.is_locked, "only a locked (sent) envelope should be put on the wire");
        let mut out = Vec::with_capacity(22 + payload.len());
        out.extend_from_slice(&self.type_flags.bits().to_le_bytes());
        out.extend_from_slice(&self.dest.to_le_bytes());
        out.extend_from_slice(&self.handler_id.to_le_bytes());
        out.extend_from_slice(&self.group_or_pipe_id.to_le_bytes());
        if self.type_flags.contains(EnvelopeFlags::HAS_EPOCH) {
            let epoch = self.epoch.expect("HAS_EPOCH set implies epoch is populated");
            out.extend_from_slice(&epoch.as_u64().to_le_bytes());
        }
        if self.type_flags.contains(EnvelopeFlags::HAS_TAG) {
            let tag = self.tag.expect("HAS_TAG set implies tag is populated");
            out.extend_from_slice(&tag.to_le_bytes());
        }
        if self.type_flags.contains(EnvelopeFlags::PUT) {
            let put = self.put.as_ref().expect("PUT set implies put is populated");
            out.extend_from_slice(&put.tag.to_le_bytes());
            out.extend_from_slice(&(put.size as u64).to_le_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    /// Decodes a header previously written by [`Envelope::to_wire`],
    /// returning the reconstructed envelope (already locked and with a
    /// zeroed local ref count, per `envelopeInitRecv`) plus the
    /// remaining payload bytes.
    pub fn from_wire(bytes: &[u8]) -> (Envelope, &[u8]) {
        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize| -> &[u8] {
            let slice = &bytes[*cursor..*cursor + n];
            *cursor += n;
            slice
        };
        let flags_bits = u16::from_le_bytes(take(&mut cursor, 2).try_into().unwrap());
        let type_flags = EnvelopeFlags::from_bits_truncate(flags_bits);
        let dest = RankId::from_le_bytes(take(&mut cursor, 4).try_into().unwrap());
        let handler_id = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
        let group_or_pipe_id = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());

        let mut epoch = None;
        if type_flags.contains(EnvelopeFlags::HAS_EPOCH) {
            let bits = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
            epoch = Some(crate::epoch::EpochId::from_u64(bits));
        }
        let mut tag = None;
        if type_flags.contains(EnvelopeFlags::HAS_TAG) {
            tag = Some(Tag::from_le_bytes(take(&mut cursor, 4).try_into().unwrap()));
        }
        let mut put = None;
        if type_flags.contains(EnvelopeFlags::PUT) {
            let put_tag = Tag::from_le_bytes(take(&mut cursor, 4).try_into().unwrap());
            let put_size = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap()) as usize;
            put = Some(PutPayload { tag: put_tag, size: put_size, bytes: None });
        }

        let env = Envelope {
            type_flags,
            dest,
            handler_id,
            ref_count: 0,
            group_or_pipe_id,
            #[cfg(feature = "priorities")]
            priority: None,
            is_locked: true,
            has_been_serialized: true,
            epoch,
            tag,
            put,
            deliver_bcast_to_sender: true,
        };
        (env, &bytes[cursor..])
    }

    /// Idempotence guard for the base-serializer path: returns `true` the first time it is
    /// called on a given envelope, `false` thereafter.
    pub fn mark_serialized_once(&mut self) -> bool {
        if self.has_been_serialized {
            return false;
        }
        self.has_been_serialized = true;
        true
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_fail_once_locked() {
        let mut env = Envelope::init();
        env.setup(1, 7).unwrap();
        env.lock();
        assert_eq!(
            env.set_dest(2),
            Err(EnvelopeError::Locked { dest: 1, handler: 7 })
        );
        assert_eq!(env.set_handler(9), Err(EnvelopeError::Locked { dest: 1, handler: 7 }));
    }

    #[test]
    fn put_and_broadcast_are_mutually_exclusive() {
        let mut env = Envelope::init();
        env.set_type_bit(EnvelopeFlags::BROADCAST).unwrap();
        assert_eq!(
            env.set_put(PutPayload { tag: 1, size: 0, bytes: None }),
            Err(EnvelopeError::PutAndBroadcast)
        );

        let mut env2 = Envelope::init();
        env2.set_put(PutPayload { tag: 1, size: 0, bytes: None }).unwrap();
        assert_eq!(
            env2.set_type_bit(EnvelopeFlags::BROADCAST),
            Err(EnvelopeError::PutAndBroadcast)
        );
    }

    #[test]
    fn extended_getters_assert_flag() {
        let env = Envelope::init();
        assert_eq!(
            env.epoch(),
            Err(EnvelopeError::MissingExtendedFlag { field: "epoch" })
        );
    }

    #[test]
    fn ref_count_round_trips_to_zero() {
        let mut env = Envelope::init();
        env.add_ref();
        env.add_ref();
        assert_eq!(env.deref(), 1);
        assert_eq!(env.deref(), 0);
    }

    #[test]
    fn mark_serialized_once_is_idempotent() {
        let mut env = Envelope::init();
        assert!(env.mark_serialized_once());
        assert!(!env.mark_serialized_once());
    }

    #[test]
    fn wire_round_trip_preserves_extended_fields() {
        let mut env = Envelope::init();
        env.setup(3, 42).unwrap();
        env.set_tag(99).unwrap();
        env.lock();
        let bytes = env.to_wire(b"payload");
        let (decoded, payload) = Envelope::from_wire(&bytes);
        assert_eq!(decoded.dest(), 3);
        assert_eq!(decoded.handler_id(), 42);
        assert_eq!(decoded.tag(), Ok(Some(99)));
        assert_eq!(decoded.epoch(), Err(EnvelopeError::MissingExtendedFlag { field: "epoch" }));
        assert_eq!(payload, b"payload");
        assert_eq!(decoded.ref_count(), 0);
        assert!(decoded.is_locked());
    }
}
