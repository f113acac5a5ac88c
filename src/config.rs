//! Configuration builders for the three components left as tunables
//! rather than fixed constants: the runtime's component set,
//! the scheduler's suspension/priority behavior, and the messenger's
//! eager-send threshold and cache bound.
//!
//! Each is a plain struct with `Default` and chained `with_*` setters
//! rather than a separate builder type, since none of these have
//! required fields.

/// Tunables for [`crate::runtime::Runtime`] startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads that enqueue comm work but never touch
    /// `ActiveMessenger`/`LocationManager`/`TerminationDetector`
    /// directly.
    pub worker_count: usize,
    /// Whether the optional JSON phase-trace writer runs.
    pub trace_enabled: bool,
    /// Which rank performs the fatal-abort diagnostic write.
    pub abort_writer_rank: crate::types::RankId,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_count: 0, trace_enabled: false, abort_writer_rank: 0 }
    }
}

impl RuntimeConfig {
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_trace_enabled(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }

    pub fn with_abort_writer_rank(mut self, rank: crate::types::RankId) -> Self {
        self.abort_writer_rank = rank;
        self
    }
}

/// Tunables for [`crate::scheduler::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Reserves capacity in the ready queue up front; purely a sizing
    /// hint, never a hard cap.
    pub queue_capacity_hint: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { queue_capacity_hint: 64 }
    }
}

impl SchedulerConfig {
    pub fn with_queue_capacity_hint(mut self, n: usize) -> Self {
        self.queue_capacity_hint = n;
        self
    }
}

/// Tunables for [`crate::messenger::ActiveMessenger`] and
/// [`crate::location::LocationManager`].
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Payloads at or under this size use the eager put path instead
    /// of the pull-based RDMA-style get.
    pub eager_threshold_bytes: usize,
    /// `LocationManager`'s LRU cache bound.
    pub location_cache_capacity: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self { eager_threshold_bytes: 4096, location_cache_capacity: 4096 }
    }
}

impl MessengerConfig {
    pub fn with_eager_threshold_bytes(mut self, n: usize) -> Self {
        self.eager_threshold_bytes = n;
        self
    }

    pub fn with_location_cache_capacity(mut self, n: usize) -> Self {
        self.location_cache_capacity = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_chain_over_defaults() {
        let cfg = RuntimeConfig::default().with_worker_count(4).with_trace_enabled(true);
        assert_eq!(cfg.worker_count, 4);
        assert!(cfg.trace_enabled);
        assert_eq!(cfg.abort_writer_rank, 0);

        let sched = SchedulerConfig::default().with_queue_capacity_hint(128);
        assert_eq!(sched.queue_capacity_hint, 128);

        let msg = MessengerConfig::default().with_eager_threshold_bytes(1024);
        assert_eq!(msg.eager_threshold_bytes, 1024);
        assert_eq!(msg.location_cache_capacity, 4096);
    }
}
