//! Search memoization.
//!
//! Two tables: one over the canonical global state a plan produces (plus its
//! achieved-landmark set), discarding refinements that reach an already seen
//! situation; one over `(base plan, action)` pairs, so no expansion is ever
//! enumerated twice.

use concord_planning::{ActionId, PlanId, ValId, VarId};
use hashbrown::HashSet;

/// Canonical key of a plan: the value of every known variable after the
/// plan's linearization, plus the achieved landmarks.
#[derive(Hash, PartialEq, Eq, Debug)]
pub struct StateKey {
    /// Sorted by variable.
    pub state: Vec<(VarId, ValId)>,
    /// Sorted global landmark ids.
    pub achieved: Vec<u32>,
}

#[derive(Default)]
pub struct StateMemo {
    seen: HashSet<StateKey>,
}

impl StateMemo {
    pub fn new() -> StateMemo {
        Default::default()
    }

    /// Records the key; false means an equivalent plan was seen before and
    /// the new one should be discarded. Solution plans must never be passed
    /// here.
    pub fn insert_fresh(&mut self, key: StateKey) -> bool {
        self.seen.insert(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Default)]
pub struct ExpansionMemo {
    seen: HashSet<(PlanId, ActionId)>,
}

impl ExpansionMemo {
    pub fn new() -> ExpansionMemo {
        Default::default()
    }

    /// Records the pair; false when this base plan was already expanded with
    /// this action.
    pub fn insert_fresh(&mut self, base: PlanId, action: ActionId) -> bool {
        self.seen.insert((base, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_states_collide() {
        let mut memo = StateMemo::new();
        let key = |a: u32| StateKey {
            state: vec![(VarId::from_u32(0), ValId::from_u32(1))],
            achieved: vec![a],
        };
        assert!(memo.insert_fresh(key(0)));
        assert!(!memo.insert_fresh(key(0)));
        // Same state but different achieved landmarks is a fresh situation.
        assert!(memo.insert_fresh(key(1)));
    }
}
