//! The two-queue open list of the outer search.
//!
//! Every plan enters the `dtg` queue, keyed by `2·h_dtg + g`; plans whose
//! landmark count strictly improved over their parent's additionally enter
//! the preferred queue, keyed by `h_land`. Extraction alternates between the
//! queues and withdraws the chosen plan from both. Priorities carry the
//! deterministic insertion sequence number as tie-breaker, so identical
//! insertion histories extract identically on every agent.

use concord_collections::heap::IdxHeap;
use concord_planning::PlanId;

#[derive(Default)]
pub struct OpenList {
    dtg: IdxHeap<PlanId, (u32, u32)>,
    pref: IdxHeap<PlanId, (u32, u32)>,
}

impl OpenList {
    pub fn new() -> OpenList {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.dtg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dtg.is_empty() && self.pref.is_empty()
    }

    pub fn insert(&mut self, plan: PlanId, f_dtg: u32, h_land: u32, seq: u32, improved: bool) {
        self.dtg.insert(plan, (f_dtg, seq));
        if improved {
            self.pref.insert(plan, (h_land, seq));
        }
    }

    /// Pops the head of the queue whose turn it is, falling back to the other
    /// one when empty. The plan is withdrawn from both queues.
    pub fn extract(&mut self, prefer_landmarks: bool) -> Option<PlanId> {
        let head = if prefer_landmarks && !self.pref.is_empty() {
            self.pref.peek().map(|&(id, _)| id)
        } else if !self.dtg.is_empty() {
            self.dtg.peek().map(|&(id, _)| id)
        } else {
            self.pref.peek().map(|&(id, _)| id)
        };
        let id = head?;
        self.remove(id);
        Some(id)
    }

    /// Withdraws a plan selected elsewhere (e.g. announced by the baton).
    pub fn remove(&mut self, plan: PlanId) {
        self.dtg.remove(plan);
        self.pref.remove(plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(i: u32) -> PlanId {
        PlanId::from_u32(i)
    }

    #[test]
    fn alternation_and_cross_removal() {
        let mut open = OpenList::new();
        // p0: poor dtg, good landmarks (admitted to pref); p1: the opposite.
        open.insert(p(0), 10, 1, 0, true);
        open.insert(p(1), 2, 5, 1, false);
        assert_eq!(open.extract(true), Some(p(0)));
        // p0 must be gone from the dtg queue as well.
        assert_eq!(open.extract(false), Some(p(1)));
        assert!(open.is_empty());
    }

    #[test]
    fn ties_break_on_insertion_sequence() {
        let mut open = OpenList::new();
        open.insert(p(3), 4, 0, 7, false);
        open.insert(p(4), 4, 0, 8, false);
        assert_eq!(open.extract(false), Some(p(3)));
        assert_eq!(open.extract(false), Some(p(4)));
    }

    #[test]
    fn falls_back_to_the_other_queue() {
        let mut open = OpenList::new();
        open.insert(p(9), 1, 1, 0, false);
        // Landmark turn, but the preferred queue is empty.
        assert_eq!(open.extract(true), Some(p(9)));
        assert_eq!(open.extract(true), None);
    }
}
