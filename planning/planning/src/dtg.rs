//! Domain transition graphs.
//!
//! One graph per state variable: nodes are the domain values, edges the value
//! changes some action can perform. Unit-cost all-pairs distances feed the
//! distance-to-goal heuristic. Graphs of shareable variables are merged
//! across agents once at start-up: each agent contributes the edges its own
//! actions induce and absorbs everyone else's.

use crate::task::{Action, CondKind, GroundedTask, ValId, VarId};
use concord_collections::ref_store::RefMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

pub const UNREACHABLE: u32 = u32::MAX;

/// A transition edge of a single variable, in wire form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct DtgEdge {
    pub var: VarId,
    pub from: ValId,
    pub to: ValId,
}

/// Transition graph of one variable with memoized distances.
pub struct Dtg {
    var: VarId,
    domain: Vec<ValId>,
    /// Edges as (from, to) positions in `domain`. A BTreeSet keeps iteration
    /// deterministic across agents.
    edges: BTreeSet<(usize, usize)>,
    /// dist[from][to] in number of transitions; `UNREACHABLE` when none.
    dist: Vec<Vec<u32>>,
}

impl Dtg {
    fn new(var: VarId, domain: Vec<ValId>) -> Dtg {
        let n = domain.len();
        Dtg {
            var,
            domain,
            edges: BTreeSet::new(),
            dist: vec![vec![UNREACHABLE; n]; n],
        }
    }

    fn pos(&self, val: ValId) -> Option<usize> {
        self.domain.iter().position(|&v| v == val)
    }

    /// Registers the transitions `action` induces on this variable.
    ///
    /// An action writing `var := v` transitions from the value named by its
    /// own precondition on `var`; with a disequality or no precondition at
    /// all, it can fire from any other compatible value.
    fn add_action(&mut self, action: &Action) {
        for eff in action.eff.iter().filter(|e| e.var == self.var) {
            let Some(to) = self.pos(eff.val) else { continue };
            match action.pre_on(self.var) {
                Some(c) if c.kind == CondKind::Equal => {
                    if let Some(from) = self.pos(c.val) {
                        self.edges.insert((from, to));
                    }
                }
                Some(c) => {
                    // Disequality: any origin except the excluded value.
                    for from in 0..self.domain.len() {
                        if self.domain[from] != c.val {
                            self.edges.insert((from, to));
                        }
                    }
                    debug_assert_eq!(c.kind, CondKind::Distinct);
                }
                None => {
                    for from in 0..self.domain.len() {
                        self.edges.insert((from, to));
                    }
                }
            }
        }
    }

    fn add_edge(&mut self, from: ValId, to: ValId) {
        if let (Some(f), Some(t)) = (self.pos(from), self.pos(to)) {
            self.edges.insert((f, t));
        }
    }

    /// Recomputes all-pairs distances by BFS from every value.
    fn recompute(&mut self) {
        let n = self.domain.len();
        let mut adj = vec![Vec::new(); n];
        for &(f, t) in &self.edges {
            adj[f].push(t);
        }
        for (source, row) in self.dist.iter_mut().enumerate() {
            row.iter_mut().for_each(|d| *d = UNREACHABLE);
            row[source] = 0;
            let mut queue = VecDeque::from([source]);
            while let Some(v) = queue.pop_front() {
                for &next in &adj[v] {
                    if row[next] == UNREACHABLE {
                        row[next] = row[v] + 1;
                        queue.push_back(next);
                    }
                }
            }
        }
    }

    /// Minimum number of transitions from `from` to `to`.
    pub fn distance(&self, from: ValId, to: ValId) -> Option<u32> {
        let (f, t) = (self.pos(from)?, self.pos(to)?);
        match self.dist[f][t] {
            UNREACHABLE => None,
            d => Some(d),
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = DtgEdge> + '_ {
        self.edges.iter().map(|&(f, t)| DtgEdge {
            var: self.var,
            from: self.domain[f],
            to: self.domain[t],
        })
    }
}

/// All transition graphs an agent holds: one per observed variable.
pub struct DtgSet {
    graphs: RefMap<VarId, Dtg>,
}

impl DtgSet {
    /// Builds the graphs of every variable the agent observes from its own
    /// actions. Distances are not valid until [`DtgSet::recompute`] runs
    /// (after the start-up merge).
    pub fn build(task: &GroundedTask) -> DtgSet {
        let world = task.world();
        let mut graphs: RefMap<VarId, Dtg> = Default::default();
        for var in world.variables().filter(|&v| task.knows(v)) {
            graphs.insert(var, Dtg::new(var, world.var(var).domain.clone()));
        }
        for (_, action) in task.actions() {
            for eff in &action.eff {
                if let Some(g) = graphs.get_mut(eff.var) {
                    g.add_action(action);
                }
            }
        }
        let mut set = DtgSet { graphs };
        set.recompute();
        set
    }

    /// Edges of shareable variables, for the start-up broadcast.
    pub fn shareable_edges(&self, task: &GroundedTask) -> Vec<DtgEdge> {
        self.graphs
            .entries()
            .filter(|(var, _)| task.world().var(*var).shareable())
            .flat_map(|(_, g)| g.edges().collect::<Vec<_>>())
            .collect()
    }

    /// Merges edges received from a peer. Unknown variables are skipped: a
    /// peer never sends edges of variables this agent does not share, but the
    /// transport contract does not enforce it.
    pub fn absorb(&mut self, edges: &[DtgEdge]) {
        for e in edges {
            if let Some(g) = self.graphs.get_mut(e.var) {
                g.add_edge(e.from, e.to);
            }
        }
    }

    pub fn recompute(&mut self) {
        for var in self.graphs.keys().collect::<Vec<_>>() {
            self.graphs[var].recompute();
        }
    }

    pub fn distance(&self, var: VarId, from: ValId, to: ValId) -> Option<u32> {
        self.graphs.get(var)?.distance(from, to)
    }
}
