//! Nested-epoch parent/child dependency graph. A child epoch's termination implies a `genCons`
//! against its parent (removing the artificial produce the parent held
//! for it); a parent holds one produce per live child (`genProd`) so it
//! cannot itself terminate while any child is outstanding.

use std::collections::{HashMap, HashSet};

use super::EpochId;

#[derive(Debug, Default)]
pub struct NestedGraph {
    parent_of: HashMap<EpochId, EpochId>,
    children_of: HashMap<EpochId, HashSet<EpochId>>,
}

impl NestedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `child` as a child of `parent` (`ParentEpochCapture`).
    pub fn add_child(&mut self, parent: EpochId, child: EpochId) {
        self.parent_of.insert(child, parent);
        self.children_of.entry(parent).or_default().insert(child);
    }

    /// Removes `child` from the graph (called once the child
    /// terminates), returning its parent if it had one.
    pub fn remove_child(&mut self, child: EpochId) -> Option<EpochId> {
        let parent = self.parent_of.remove(&child)?;
        if let Some(set) = self.children_of.get_mut(&parent) {
            set.remove(&child);
            if set.is_empty() {
                self.children_of.remove(&parent);
            }
        }
        Some(parent)
    }

    pub fn has_live_children(&self, epoch: EpochId) -> bool {
        self.children_of.get(&epoch).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn parent_of(&self, epoch: EpochId) -> Option<EpochId> {
        self.parent_of.get(&epoch).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::layout;

    fn eid(seq: u64) -> EpochId {
        EpochId::from_u64(layout::pack_collective(seq))
    }

    #[test]
    fn child_removal_clears_parent_liveness() {
        let mut g = NestedGraph::new();
        let p = eid(0);
        let c = eid(1);
        g.add_child(p, c);
        assert!(g.has_live_children(p));
        assert_eq!(g.remove_child(c), Some(p));
        assert!(!g.has_live_children(p));
    }
}
