//! Per-rank Dijkstra-Scholten state for a single rooted epoch.
//!
//! A rank becomes *engaged* in the epoch the first time it processes a
//! message sent within it; the sender of that first message becomes
//! its DS parent. The rank disengages (acknowledging its parent) once
//! every message it has sent has been acknowledged in turn and every
//! message sent *to* it has been accounted for. The root rank seeds
//! its own outstanding list with a self-referencing entry at creation,
//! so that when its own engagement empties, `try_last` reports global
//! termination instead of an acknowledgement to a parent.

use std::collections::VecDeque;

use crate::types::RankId;

/// Outbound protocol messages produced while stepping the DS state
/// machine. There is only one wire message: an acknowledgement,
/// sent either to an arbitrary predecessor once `tryAck` has covered
/// its count, or to our own DS parent once `tryLast` closes out our
/// engagement. The receiver applies both the same way, against `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsMessage {
    Acknowledge { to: RankId, count: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsOutcome {
    RootTerminated,
    Acknowledged { parent: RankId, count: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct DsEpochState {
    pub parent: Option<RankId>,
    pub c: u64,
    pub d: u64,
    pub acked_parent: u64,
    pub acked_arbitrary: u64,
    pub reqed_parent: u64,
    pub engagement_msg_count: u64,
    pub processed_sum: u64,
    pub l_c: u64,
    pub l_d: u64,
    pub outstanding: VecDeque<(RankId, u64)>,
}

impl DsEpochState {
    /// Fresh, unengaged state (no rank has sent this rank anything in
    /// the epoch yet).
    pub fn fresh() -> Self {
        Self::default()
    }

    /// State for the rank that creates the rooted epoch: seeded with a
    /// self-referencing outstanding entry so that full disengagement
    /// is recognized as global termination rather than an
    /// acknowledgement to some external parent.
    pub fn fresh_root(self_rank: RankId) -> Self {
        let mut s = Self::default();
        s.outstanding.push_front((self_rank, 0));
        s
    }

    /// Invariant DS-I: must hold after every operation.
    pub fn invariant_holds(&self) -> bool {
        self.c == self.processed_sum.saturating_sub(self.acked_arbitrary + self.acked_parent)
    }

    /// `msgSent(successor, count)`.
    pub fn msg_sent(&mut self, successor: RankId, count: u64, self_rank: RankId) {
        if successor == self_rank {
            self.l_d += count;
        } else {
            self.d += count;
        }
    }

    /// `msgProcessed(pred, count)`: the first message from a given
    /// predecessor establishes (or extends) its outstanding entry; the
    /// very first predecessor this rank ever hears from becomes its DS
    /// parent, occupying the reserved head of `outstanding`. Further
    /// traffic from the parent accumulates into `reqedParent` directly
    /// here, rather than through any request/reply round trip — this
    /// rank only ever acknowledges *to* its parent, in `try_last`.
    pub fn msg_processed(&mut self, pred: RankId, count: u64, self_rank: RankId) {
        if pred == self_rank {
            self.l_c += count;
            return;
        }
        self.c += count;
        self.processed_sum += count;
        if self.outstanding.is_empty() {
            self.parent = Some(pred);
            self.engagement_msg_count = count;
            self.outstanding.push_front((pred, count));
        } else {
            let mut tail = self.outstanding.iter_mut();
            tail.next(); // the head entry is reserved, never matched here
            if let Some(entry) = tail.find(|(p, _)| *p == pred) {
                entry.1 += count;
            } else {
                self.outstanding.push_back((pred, count));
            }
        }
        if Some(pred) == self.parent {
            self.reqed_parent += count;
        }
        debug_assert!(self.invariant_holds());
    }

    /// `gotAck(count)`.
    pub fn got_ack(&mut self, count: u64) {
        self.d = self.d.saturating_sub(count);
    }

    /// `tryAck()`: acknowledges every outstanding entry (other than the
    /// head, reserved for the parent/root-self entry) whose count has
    /// been fully accounted for in `C`.
    pub fn try_ack(&mut self) -> Vec<DsMessage> {
        let mut out = Vec::new();
        while self.outstanding.len() > 1 {
            let (pred, count) = *self.outstanding.back().unwrap();
            if count <= self.c {
                self.c -= count;
                if Some(pred) == self.parent {
                    self.acked_parent += count;
                } else {
                    self.acked_arbitrary += count;
                }
                self.outstanding.pop_back();
                out.push(DsMessage::Acknowledge { to: pred, count });
            } else {
                break;
            }
        }
        debug_assert!(self.invariant_holds());
        out
    }

    /// `tryLast()`: once only the head entry remains, our own send/recv
    /// ledger is balanced, and every message the parent ever routed
    /// through us has been accounted for (`reqedParent - ackedParent ==
    /// engagementMessageCount`), this rank is done. The root's
    /// self-referencing head entry resolves to global termination;
    /// anyone else's resolves to an acknowledgement owed to its parent.
    pub fn try_last(&mut self, self_rank: RankId) -> Option<DsOutcome> {
        if self.outstanding.len() == 1
            && self.l_c == self.l_d
            && self.d == 0
            && self.c == self.engagement_msg_count
            && self.reqed_parent.saturating_sub(self.acked_parent) == self.engagement_msg_count
        {
            let (pred, count) = self.outstanding.pop_front().unwrap();
            let outcome = if pred == self_rank {
                DsOutcome::RootTerminated
            } else {
                DsOutcome::Acknowledged { parent: pred, count }
            };
            *self = Self::fresh();
            Some(outcome)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_holds_through_a_chain() {
        // rank 0 is root; rank 1 processes one message from 0 then
        // immediately has nothing left outstanding.
        let mut root = DsEpochState::fresh_root(0);
        root.msg_sent(1, 1, 0);
        assert!(root.invariant_holds());

        let mut r1 = DsEpochState::fresh();
        r1.msg_processed(0, 1, 1);
        assert!(r1.invariant_holds());
        assert_eq!(r1.parent, Some(0));
        assert_eq!(r1.engagement_msg_count, 1);

        // r1 sends nothing further; its own ledger is already balanced
        // and its one message from its parent is already fully
        // accounted for, so it can ack its parent immediately.
        assert!(r1.try_ack().is_empty());
        let outcome = r1.try_last(1);
        assert_eq!(outcome, Some(DsOutcome::Acknowledged { parent: 0, count: 1 }));
    }

    #[test]
    fn root_terminates_on_self_entry() {
        let mut root = DsEpochState::fresh_root(5);
        // nobody ever engages the root; it is immediately quiescent.
        let outcome = root.try_last(5);
        assert_eq!(outcome, Some(DsOutcome::RootTerminated));
    }

    #[test]
    fn try_ack_drains_non_parent_entries_first() {
        let mut s = DsEpochState::fresh();
        s.msg_processed(1, 5, 0); // parent = 1
        s.msg_processed(2, 3, 0); // arbitrary predecessor
        assert_eq!(s.c, 8);
        let acks = s.try_ack();
        assert_eq!(acks, vec![DsMessage::Acknowledge { to: 2, count: 3 }]);
        assert_eq!(s.c, 5);
        assert_eq!(s.acked_arbitrary, 3);
        assert!(s.invariant_holds());
    }

    #[test]
    fn try_last_waits_until_a_forwarded_message_is_acked() {
        // r1 becomes engaged from parent 0, then forwards to rank 2
        // before it can ack its own parent.
        let mut s = DsEpochState::fresh();
        s.msg_processed(0, 1, 1);
        s.msg_sent(2, 1, 1);
        assert!(s.try_last(1).is_none(), "D != 0 while the forward is outstanding");
        s.got_ack(1);
        assert_eq!(s.try_last(1), Some(DsOutcome::Acknowledged { parent: 0, count: 1 }));
    }
}
