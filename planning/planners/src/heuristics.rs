//! Plan evaluation: distance-to-goal over the domain transition graphs and
//! the global landmark count.
//!
//! Evaluation is pure with respect to the plan store (it reads the arena and
//! writes nothing), so a bounded per-agent worker pool can fan plans out and
//! each task only fills in the heuristic fields of its own plan.

use crate::landmarks::LandmarkGraph;
use crate::search::memo::StateKey;
use concord_planning::dtg::DtgSet;
use concord_planning::plan::FINAL_STEP;
use concord_planning::{CondKind, Condition, Fact, GroundedTask, PlanView, StepId, ValId, VarId};
use fixedbitset::FixedBitSet;
use std::collections::HashMap;

/// Cost assigned to a goal no transition path can reach. Large enough to
/// push the plan to the back of every queue, small enough not to overflow
/// the `2·h + g` key.
const FAR: u32 = 1 << 20;

/// What a linearization asserts: every `(var, value)` pair along the way and
/// the last writer of each variable.
pub struct StateTrace {
    pub last: HashMap<VarId, ValId>,
    pub asserted: Vec<Fact>,
}

impl StateTrace {
    pub fn asserts(&self, fact: Fact) -> bool {
        self.asserted.contains(&fact)
    }

    /// Canonical memoization key of the traced state.
    pub fn state_key(&self, achieved: &FixedBitSet) -> StateKey {
        let mut state: Vec<(VarId, ValId)> = self.last.iter().map(|(&v, &x)| (v, x)).collect();
        state.sort();
        StateKey {
            state,
            achieved: achieved.ones().map(|i| i as u32).collect(),
        }
    }
}

pub struct Evaluator<'a> {
    pub task: &'a GroundedTask,
    pub dtgs: &'a DtgSet,
    pub graph: &'a LandmarkGraph,
}

/// Everything the outer search needs to know about one freshly built plan.
pub struct Evaluation {
    pub order: Vec<StepId>,
    pub h_dtg: u32,
    pub h_land: u32,
    pub achieved: FixedBitSet,
    pub key: StateKey,
}

impl<'a> Evaluator<'a> {
    /// Replays the linearization, recording asserted pairs and last writers.
    /// Effects on variables this agent cannot observe are skipped.
    pub fn trace(&self, view: &PlanView, order: &[StepId]) -> StateTrace {
        let mut trace = StateTrace {
            last: HashMap::new(),
            asserted: Vec::new(),
        };
        for &s in order {
            for &eff in &view.step(s).eff {
                if self.task.knows(eff.var) {
                    trace.last.insert(eff.var, eff.val);
                    if !trace.asserted.contains(&eff) {
                        trace.asserted.push(eff);
                    }
                }
            }
        }
        trace
    }

    /// Distance-to-goal: for every goal of the final step not yet supported
    /// by a causal link, the minimum transition distance from the last
    /// asserted value of its variable to the required one.
    pub fn h_dtg(&self, view: &PlanView, trace: &StateTrace) -> u32 {
        let supported: Vec<Condition> = view.links_to(FINAL_STEP).map(|l| l.cond).collect();
        view.step(FINAL_STEP)
            .pre
            .iter()
            .filter(|c| !supported.contains(c))
            .map(|&c| self.cond_cost(c, trace))
            .fold(0u32, u32::saturating_add)
    }

    fn cond_cost(&self, cond: Condition, trace: &StateTrace) -> u32 {
        let Some(&current) = trace.last.get(&cond.var) else {
            return FAR;
        };
        if cond.satisfied_by(current) {
            return 0;
        }
        match cond.kind {
            CondKind::Equal => self.dtgs.distance(cond.var, current, cond.val).unwrap_or(FAR),
            CondKind::Distinct => {
                let world = self.task.world();
                world
                    .var(cond.var)
                    .domain
                    .iter()
                    .filter(|&&v| v != cond.val)
                    .filter_map(|&v| self.dtgs.distance(cond.var, current, v))
                    .min()
                    .unwrap_or(FAR)
            }
        }
    }

    pub fn h_land(&self, achieved: &FixedBitSet) -> u32 {
        (self.graph.total_global() - achieved.count_ones(..)) as u32
    }

    /// Full evaluation of a plan already present in the arena.
    ///
    /// The achievement vector builds on `seed` (the parent's vector, with
    /// every cross-agent adjustment it has accumulated) and only the delta's
    /// `new_effects` are marked on top. Re-deriving it from scratch would
    /// silently drop achievements this agent cannot recognize itself.
    pub fn evaluate(&self, view: &PlanView, seed: FixedBitSet, new_effects: &[Fact]) -> Evaluation {
        let order = view.linearize();
        let trace = self.trace(view, &order);
        let h_dtg = self.h_dtg(view, &trace);
        let mut achieved = seed;
        achieved.grow(self.graph.total_global());
        self.graph.mark_achieved(self.task.world(), new_effects, &mut achieved);
        let h_land = self.h_land(&achieved);
        let key = trace.state_key(&achieved);
        Evaluation {
            order,
            h_dtg,
            h_land,
            achieved,
            key,
        }
    }
}
