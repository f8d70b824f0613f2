//! Accessibility matrix: memoized transitive closure of the ordering
//! relation of the plan under refinement.
//!
//! A dense N×N cell array holds two per-generation tokens: a cell equal to
//! `token_true` means the ordering is known to hold, `token_false` known not
//! to, anything else unknown. Bumping both tokens by 2 invalidates every
//! memoized entry without touching memory; the matrix is only reallocated
//! when the step count outgrows it (capacity doubles).

use concord_planning::StepId;
use std::collections::VecDeque;

pub struct OrderingMatrix {
    cap: usize,
    n: usize,
    cells: Vec<u32>,
    token_true: u32,
    token_false: u32,
    /// Forward adjacency: direct orderings only, closure is computed lazily.
    succ: Vec<Vec<u32>>,
}

impl Default for OrderingMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingMatrix {
    pub fn new() -> OrderingMatrix {
        OrderingMatrix {
            cap: 0,
            n: 0,
            cells: Vec::new(),
            token_true: 1,
            token_false: 2,
            succ: Vec::new(),
        }
    }

    /// Reinitializes the matrix for a plan with `n` steps and the given
    /// direct orderings. All memoized entries are invalidated.
    pub fn reset(&mut self, n: usize, edges: impl Iterator<Item = (StepId, StepId)>) {
        if n > self.cap {
            self.cap = (self.cap * 2).max(n).max(8);
            self.cells = vec![0; self.cap * self.cap];
            self.token_true = 1;
            self.token_false = 2;
        }
        self.n = n;
        self.bump();
        if self.succ.len() < n {
            self.succ.resize(n, Vec::new());
        }
        for list in self.succ.iter_mut().take(n) {
            list.clear();
        }
        for (before, after) in edges {
            self.succ[usize::from(before)].push(usize::from(after) as u32);
        }
    }

    /// Adds a direct ordering and invalidates the memoized closure.
    pub fn add(&mut self, before: StepId, after: StepId) {
        self.succ[usize::from(before)].push(usize::from(after) as u32);
        self.bump();
    }

    fn bump(&mut self) {
        if self.token_true > u32::MAX - 4 {
            self.cells.fill(0);
            self.token_true = 1;
            self.token_false = 2;
        } else {
            self.token_true += 2;
            self.token_false += 2;
        }
    }

    /// Is `before ≺ after` entailed by the current orderings?
    ///
    /// On a cache miss the whole row of `before` is resolved by a breadth
    /// first search over the forward adjacency lists, so later queries from
    /// the same step are O(1) until the next invalidation.
    pub fn precedes(&mut self, before: StepId, after: StepId) -> bool {
        let (i, j) = (usize::from(before), usize::from(after));
        debug_assert!(i < self.n && j < self.n);
        if i == j {
            return false;
        }
        let cell = self.cells[i * self.cap + j];
        if cell == self.token_true {
            return true;
        }
        if cell == self.token_false {
            return false;
        }
        for k in 0..self.n {
            self.cells[i * self.cap + k] = self.token_false;
        }
        let mut queue: VecDeque<usize> = self.succ[i].iter().map(|&x| x as usize).collect();
        while let Some(k) = queue.pop_front() {
            if self.cells[i * self.cap + k] == self.token_true {
                continue;
            }
            self.cells[i * self.cap + k] = self.token_true;
            queue.extend(self.succ[k].iter().map(|&x| x as usize));
        }
        self.cells[i * self.cap + j] == self.token_true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(i: u32) -> StepId {
        StepId::from_u32(i)
    }

    #[test]
    fn transitive_closure_through_bfs() {
        let mut m = OrderingMatrix::new();
        m.reset(5, [(s(0), s(2)), (s(2), s(3)), (s(3), s(4))].into_iter());
        assert!(m.precedes(s(2), s(4)));
        assert!(!m.precedes(s(4), s(2)));
        assert!(m.precedes(s(0), s(4)));
        assert!(!m.precedes(s(4), s(0)));
    }

    #[test]
    fn add_invalidates_memoized_entries() {
        let mut m = OrderingMatrix::new();
        m.reset(4, [(s(2), s(3))].into_iter());
        assert!(!m.precedes(s(3), s(2)));
        assert!(!m.precedes(s(2), s(2)));
        m.add(s(3), s(2));
        // The memoized "false" for 3 ≺ 2 must not survive the addition.
        assert!(m.precedes(s(3), s(2)));
    }

    #[test]
    fn reset_reuses_the_allocation() {
        let mut m = OrderingMatrix::new();
        m.reset(3, [(s(2), s(0))].into_iter().filter(|_| false));
        assert!(!m.precedes(s(2), s(0)));
        m.reset(3, [(s(1), s(2))].into_iter());
        assert!(m.precedes(s(1), s(2)));
    }
}
