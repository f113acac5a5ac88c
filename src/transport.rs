//! The `Transport` trait: the only thing the core needs
//! from the outside world — a reliable, ordered, point-to-point
//! byte-sending primitive and a barrier. No transport is prescribed;
//! [`MemoryTransport`] is an in-process loopback used by every
//! integration test in `tests/`, driving message delivery over an
//! in-memory harness instead of a real socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use thiserror::Error;

use crate::types::{RankId, Tag};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("destination rank {0} is out of range for a cluster of size {1}")]
    NoSuchRank(RankId, u32),
    #[error("request handle {0:?} does not belong to this transport")]
    UnknownRequest(RequestHandle),
}

/// An opaque handle to an outstanding non-blocking send returned by
/// [`Transport::send_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

/// The transport primitives the core substrate needs.
/// Reliable reductions are synthesized on top of these by
/// [`crate::epoch::wave`] and [`crate::collection`] rather than
/// provided here, so every implementation only has to supply
/// point-to-point send/recv and a barrier.
pub trait Transport {
    fn rank(&self) -> RankId;
    fn size(&self) -> u32;

    /// Posts a non-blocking send; returns immediately with a handle
    /// whose completion is observed via [`Transport::test`].
    fn send_bytes(&self, dest: RankId, tag: Tag, bytes: Vec<u8>) -> Result<RequestHandle, TransportError>;

    /// Non-blocking probe: `src` narrows to a specific sender, `None`
    /// means "any source".
    /// Returns the matching sender and payload length without
    /// consuming the message.
    fn probe(&self, src: Option<RankId>, tag: Tag) -> Option<(RankId, usize)>;

    /// Consumes the first buffered message matching `(src, tag)`, if
    /// any has arrived.
    fn recv_bytes(&self, src: RankId, tag: Tag) -> Option<Vec<u8>>;

    /// Whether a previously posted send has completed.
    fn test(&self, handle: RequestHandle) -> bool;

    /// Marks this rank as arrived at the current barrier generation.
    /// Non-blocking; callers must drive the scheduler until
    /// [`Transport::barrier_is_complete`] returns true.
    fn barrier_arrive(&self);

    /// Whether every rank in the cluster has arrived at the current
    /// barrier generation. Once true, the generation advances so the
    /// barrier can be reused (startup barrier, then teardown barrier).
    fn barrier_is_complete(&mut self) -> bool;
}

struct BarrierState {
    size: u32,
    /// Number of barrier rounds that have fully completed so far.
    completed_generation: u64,
    arrived: std::collections::HashSet<RankId>,
}

impl BarrierState {
    fn new(size: u32) -> Self {
        Self { size, completed_generation: 0, arrived: std::collections::HashSet::new() }
    }
}

type Packet = (RankId, Tag, Vec<u8>);

/// In-process loopback transport sharing a `std::sync::mpsc` channel
/// per destination rank. All sends complete
/// instantly from the test's point of view — there is no simulated
/// latency — so [`Transport::test`] always reports completion and the
/// interesting behavior under test is ordering and routing, not
/// timing.
pub struct MemoryTransport {
    rank: RankId,
    size: u32,
    receiver: Receiver<Packet>,
    senders: Vec<Sender<Packet>>,
    /// Messages pulled out of `receiver` by a probe but not yet
    /// consumed by `recv_bytes`, preserving per-(src,tag) FIFO order.
    buffered: RefCell<VecDeque<Packet>>,
    next_request: RefCell<u64>,
    barrier: Rc<RefCell<BarrierState>>,
    /// The last barrier generation this rank has observed complete;
    /// advances independently per rank so every rank, not just the one
    /// that happens to push the count over the threshold, reports the
    /// round as done exactly once.
    last_seen_generation: u64,
}

impl MemoryTransport {
    /// Builds a cluster of `size` mutually-connected loopback
    /// transports, one per simulated rank.
    pub fn cluster(size: u32) -> Vec<MemoryTransport> {
        assert!(size > 0, "a cluster needs at least one rank");
        let mut senders = Vec::with_capacity(size as usize);
        let mut receivers = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Rc::new(RefCell::new(BarrierState::new(size)));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| MemoryTransport {
                rank: rank as RankId,
                size,
                receiver,
                senders: senders.clone(),
                buffered: RefCell::new(VecDeque::new()),
                next_request: RefCell::new(0),
                barrier: barrier.clone(),
                last_seen_generation: 0,
            })
            .collect()
    }

    /// Drains every message the channel has ready into the local
    /// buffer, so `probe`/`recv_bytes` can search without consuming
    /// the underlying `mpsc::Receiver` out of order.
    fn drain_channel(&self) {
        let mut buffered = self.buffered.borrow_mut();
        while let Ok(packet) = self.receiver.try_recv() {
            buffered.push_back(packet);
        }
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> RankId {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send_bytes(&self, dest: RankId, tag: Tag, bytes: Vec<u8>) -> Result<RequestHandle, TransportError> {
        let target = self
            .senders
            .get(dest as usize)
            .ok_or(TransportError::NoSuchRank(dest, self.size))?;
        log::trace!("rank {} -> rank {dest} ({} bytes, tag {tag})", self.rank, bytes.len());
        target
            .send((self.rank, tag, bytes))
            .expect("peer rank's receiver dropped while the cluster is still alive");
        let mut next = self.next_request.borrow_mut();
        let handle = RequestHandle(*next);
        *next += 1;
        Ok(handle)
    }

    fn probe(&self, src: Option<RankId>, tag: Tag) -> Option<(RankId, usize)> {
        self.drain_channel();
        self.buffered
            .borrow()
            .iter()
            .find(|(from, t, _)| *t == tag && src.map_or(true, |s| s == *from))
            .map(|(from, _, bytes)| (*from, bytes.len()))
    }

    fn recv_bytes(&self, src: RankId, tag: Tag) -> Option<Vec<u8>> {
        self.drain_channel();
        let mut buffered = self.buffered.borrow_mut();
        let pos = buffered.iter().position(|(from, t, _)| *from == src && *t == tag)?;
        buffered.remove(pos).map(|(_, _, bytes)| bytes)
    }

    fn test(&self, _handle: RequestHandle) -> bool {
        // The loopback channel delivers synchronously; every posted
        // send is already complete by the time a caller can ask.
        true
    }

    fn barrier_arrive(&self) {
        let mut state = self.barrier.borrow_mut();
        state.arrived.insert(self.rank);
        if state.arrived.len() as u32 >= state.size {
            state.arrived.clear();
            state.completed_generation += 1;
        }
    }

    fn barrier_is_complete(&mut self) -> bool {
        let state = self.barrier.borrow();
        if state.completed_generation > self.last_seen_generation {
            self.last_seen_generation = state.completed_generation;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_to_point_is_fifo_per_source() {
        let mut cluster = MemoryTransport::cluster(2);
        let (r0, r1) = (cluster.remove(0), cluster.remove(0));
        r0.send_bytes(1, 7, vec![1]).unwrap();
        r0.send_bytes(1, 7, vec![2]).unwrap();
        assert_eq!(r1.recv_bytes(0, 7), Some(vec![1]));
        assert_eq!(r1.recv_bytes(0, 7), Some(vec![2]));
    }

    #[test]
    fn probe_reports_size_without_consuming() {
        let mut cluster = MemoryTransport::cluster(2);
        let (r0, r1) = (cluster.remove(0), cluster.remove(0));
        r0.send_bytes(1, 3, vec![9, 9, 9]).unwrap();
        assert_eq!(r1.probe(None, 3), Some((0, 3)));
        assert_eq!(r1.probe(None, 3), Some((0, 3)));
        assert_eq!(r1.recv_bytes(0, 3), Some(vec![9, 9, 9]));
        assert_eq!(r1.probe(None, 3), None);
    }

    #[test]
    fn barrier_completes_once_every_rank_arrives() {
        let mut cluster = MemoryTransport::cluster(3);
        assert!(!cluster[0].barrier_is_complete());
        for t in &cluster {
            t.barrier_arrive();
        }
        assert!(cluster[0].barrier_is_complete());
        assert!(cluster[1].barrier_is_complete());
        assert!(cluster[2].barrier_is_complete());
    }
}
