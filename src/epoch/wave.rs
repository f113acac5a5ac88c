//! Four-counter wave termination for collective epochs.
//!
//! Each rank keeps `(produced, consumed)` for the epoch. The
//! spanning-tree root (rank 0 of the epoch's default group, reusing
//! the same broadcast binomial tree) runs two
//! reduction waves; termination is declared only when two successive
//! waves observe the same global totals, which catches in-flight
//! messages that would otherwise close a partially-quiescent epoch.
//!
//! The down-direction (starting a wave, broadcasting the termination
//! verdict) reuses [`crate::topology`]'s binomial tree. The up-direction
//! (gathering each rank's counters) is a direct report to the
//! coordinator rather than a multi-hop tree-reduce: at the cluster
//! sizes this runtime targets the two are operationally equivalent,
//! and a star gather keeps the protocol's message accounting (needed
//! for property tests P7/P8) easy to reason about.

use std::collections::HashSet;

use crate::types::RankId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveWireMsg {
    StartWave { wave_no: u64 },
    Report { wave_no: u64, produced: u64, consumed: u64 },
    Terminated,
}

/// Per-rank produce/consume counters for one collective epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveCounters {
    pub produced: u64,
    pub consumed: u64,
}

impl WaveCounters {
    pub fn produce(&mut self, n: u64) {
        self.produced += n;
    }

    pub fn consume(&mut self, n: u64) {
        self.consumed += n;
    }
}

/// Coordinator-only state (meaningful only on the epoch's designated
/// root rank, fixed at rank 0 of the default group).
#[derive(Debug, Clone)]
pub struct WaveCoordinator {
    size: u32,
    wave_no: u64,
    pending: HashSet<RankId>,
    accum: (u64, u64),
    last_totals: Option<(u64, u64)>,
    terminated: bool,
}

impl WaveCoordinator {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            wave_no: 0,
            pending: HashSet::new(),
            accum: (0, 0),
            last_totals: None,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Starts (or restarts) a wave, returning the `StartWave` messages
    /// to send to every other rank.
    pub fn start_wave(&mut self, self_counters: WaveCounters) -> Vec<(RankId, WaveWireMsg)> {
        self.wave_no += 1;
        self.pending = (0..self.size).filter(|&r| r != 0).collect();
        self.accum = (self_counters.produced, self_counters.consumed);
        let msg = WaveWireMsg::StartWave { wave_no: self.wave_no };
        (1..self.size).map(|r| (r, msg)).collect()
    }

    /// Folds in a report from a non-coordinator rank. Returns
    /// `Some(true)` if this wave's totals matched the previous wave
    /// *and* the matched total is itself balanced (global
    /// termination), `Some(false)` if the wave completed but either
    /// condition failed (caller should start another wave), or `None`
    /// if the wave is still gathering reports. A steady but unbalanced
    /// total (e.g. a permanently stuck in-flight message) must never
    /// satisfy termination on its own.
    pub fn receive_report(
        &mut self,
        from: RankId,
        wave_no: u64,
        produced: u64,
        consumed: u64,
    ) -> Option<bool> {
        if wave_no != self.wave_no {
            return None;
        }
        self.pending.remove(&from);
        self.accum.0 += produced;
        self.accum.1 += consumed;
        if !self.pending.is_empty() {
            return None;
        }
        let matched = self.last_totals == Some(self.accum) && self.accum.0 == self.accum.1;
        if matched {
            self.terminated = true;
        }
        self.last_totals = Some(self.accum);
        Some(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_matching_waves_terminate() {
        let mut coord = WaveCoordinator::new(3);
        let counters = WaveCounters { produced: 2, consumed: 2 };

        coord.start_wave(counters);
        assert_eq!(coord.receive_report(1, 1, 1, 1), None);
        assert_eq!(coord.receive_report(2, 1, 0, 0), Some(false));
        assert!(!coord.is_terminated());

        coord.start_wave(counters);
        assert_eq!(coord.receive_report(1, 2, 1, 1), None);
        assert_eq!(coord.receive_report(2, 2, 0, 0), Some(true));
        assert!(coord.is_terminated());
    }

    #[test]
    fn changed_totals_between_waves_restart() {
        let mut coord = WaveCoordinator::new(2);
        coord.start_wave(WaveCounters { produced: 1, consumed: 0 });
        assert_eq!(coord.receive_report(1, 1, 0, 0), Some(false));

        // rank 1 produced another message in the meantime, so this
        // wave's totals don't match the last one yet.
        coord.start_wave(WaveCounters { produced: 1, consumed: 0 });
        assert_eq!(coord.receive_report(1, 2, 1, 0), Some(false));
        assert!(!coord.is_terminated());

        // the outstanding message gets consumed; totals are now
        // balanced but this is the first wave to see it, so still no
        // termination yet.
        coord.start_wave(WaveCounters { produced: 1, consumed: 1 });
        assert_eq!(coord.receive_report(1, 3, 1, 1), Some(false));
        assert!(!coord.is_terminated());

        // a second consecutive wave observes the same balanced totals.
        coord.start_wave(WaveCounters { produced: 1, consumed: 1 });
        assert_eq!(coord.receive_report(1, 4, 1, 1), Some(true));
        assert!(coord.is_terminated());
    }

    #[test]
    fn stable_but_unbalanced_totals_never_terminate() {
        // a message permanently stuck in flight: produced stays ahead
        // of consumed across any number of stable waves.
        let mut coord = WaveCoordinator::new(2);
        coord.start_wave(WaveCounters { produced: 1, consumed: 0 });
        assert_eq!(coord.receive_report(1, 1, 0, 0), Some(false));

        coord.start_wave(WaveCounters { produced: 1, consumed: 0 });
        assert_eq!(coord.receive_report(1, 2, 0, 0), Some(false));
        assert!(!coord.is_terminated());

        coord.start_wave(WaveCounters { produced: 1, consumed: 0 });
        assert_eq!(coord.receive_report(1, 3, 0, 0), Some(false));
        assert!(!coord.is_terminated());
    }
}
