//! Small shared types used across the runtime: rank/tag/priority
//! identifiers and the recyclable-id generator used by several
//! components (handler ids, event ids, waitlist handles).

use std::collections::VecDeque;

/// A rank (process) identifier in the fixed set of ranks connected by
/// the transport. Ranks are dense: `0..size`.
pub type RankId = u32;

/// Sentinel meaning "no rank" / "uninitialized destination".
pub const UNINITIALIZED_RANK: RankId = RankId::MAX;

/// An active-message tag, used both for user-level message
/// classification and for raw `sendData`/
/// `recvDataMsg` payload matching.
pub type Tag = u32;

cfg_if::cfg_if! {
    if #[cfg(feature = "priorities")] {
        /// Priority level, present only when the `priorities` feature is
        /// compiled in.
        pub type Priority = u8;
        pub const MIN_PRIORITY: Priority = Priority::MIN;
    }
}

/// Identifies a suspended user-level-thread-style handler. Modeled as a plain
/// counter rather than an OS thread id, since fcontext/ucontext
/// assembly is explicitly out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

/// Generates small recyclable integer-backed keys, recycling released
/// ids before minting new ones. Used wherever an opaque handle is
/// allocated and later released (event ids, waitlist handles, local
/// virtual-entity ids).
pub struct KeyGenerator<T> {
    next: u64,
    free: VecDeque<u64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> KeyGenerator<T>
where
    T: From<u64> + Into<u64> + Copy,
{
    pub fn new() -> Self {
        Self {
            next: 0,
            free: VecDeque::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Mints a fresh key, preferring a recycled one if available.
    pub fn generate(&mut self) -> T {
        if let Some(recycled) = self.free.pop_front() {
            return T::from(recycled);
        }
        let id = self.next;
        self.next += 1;
        T::from(id)
    }

    /// Releases a key for future reuse. The caller must not use `key`
    /// again until it is re-issued by `generate`.
    pub fn recycle_key(&mut self, key: &T) {
        self.free.push_back((*key).into());
    }
}

impl<T> Default for KeyGenerator<T>
where
    T: From<u64> + Into<u64> + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Id(u64);
    impl From<u64> for Id {
        fn from(v: u64) -> Self {
            Id(v)
        }
    }
    impl From<Id> for u64 {
        fn from(v: Id) -> Self {
            v.0
        }
    }

    #[test]
    fn generates_monotonic_ids_then_recycles() {
        let mut gen = KeyGenerator::<Id>::new();
        let a = gen.generate();
        let b = gen.generate();
        assert_eq!(a, Id(0));
        assert_eq!(b, Id(1));
        gen.recycle_key(&a);
        let c = gen.generate();
        assert_eq!(c, Id(0));
    }
}
