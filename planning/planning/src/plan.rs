//! Partial-order plans and their incremental representation.
//!
//! The open list of the outer search holds *incremental* plans: a parent
//! pointer plus the delta (one new step, new causal links, new orderings)
//! introduced by the last refinement. Plans live in a [`PlanSpace`] arena
//! keyed by [`PlanId`] and are only freed when the whole search terminates,
//! since any of them may be the ancestor of a live plan. The full plan is
//! reconstructed on demand by walking the parent chain.

use crate::task::{Condition, Fact};
use concord_collections::ref_store::RefStore;
use concord_comm::AgentId;
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

concord_collections::ref_type!(StepId);
concord_collections::ref_type!(PlanId);

/// Synthetic step holding the initial state as effects.
pub const INITIAL_STEP: StepId = StepId::from_u32(0);
/// Synthetic step holding the global goals as preconditions.
pub const FINAL_STEP: StepId = StepId::from_u32(1);

/// An action instantiated inside a plan. Preconditions and effects are
/// inlined so that steps received from other agents are self-describing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub agent: AgentId,
    pub name: String,
    pub pre: Vec<Condition>,
    pub eff: Vec<Fact>,
}

impl Step {
    pub fn initial(agent: AgentId, state: &[Fact]) -> Step {
        Step {
            agent,
            name: "<initial>".to_string(),
            pre: Vec::new(),
            eff: state.to_vec(),
        }
    }

    pub fn goals(agent: AgentId, goals: &[Condition]) -> Step {
        Step {
            agent,
            name: "<goals>".to_string(),
            pre: goals.to_vec(),
            eff: Vec::new(),
        }
    }
}

/// `producer` supports condition `cond` of `consumer`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalLink {
    pub producer: StepId,
    pub cond: Condition,
    pub consumer: StepId,
}

/// One node of the plan arena: parent + refinement delta + bookkeeping.
pub struct PlanNode {
    pub parent: Option<PlanId>,
    pub name: String,
    /// The step added by this refinement, if any (the Final-step closure and
    /// the root add none).
    pub new_step: Option<Step>,
    pub new_step_id: Option<StepId>,
    pub new_links: Vec<CausalLink>,
    pub new_orderings: Vec<(StepId, StepId)>,
    /// Total number of steps, synthetic ones included.
    pub num_steps: usize,
    /// Number of user-level steps.
    pub g: u32,
    pub h_dtg: u32,
    pub h_land: u32,
    pub is_solution: bool,
    /// Globally indexed landmarks achieved by some step of this plan.
    pub achieved: FixedBitSet,
    /// Cached topological order, computed at insertion.
    pub linearization: Vec<StepId>,
    pub proposer: AgentId,
}

/// Arena of incremental plans plus the two synthetic steps shared by all of
/// them.
pub struct PlanSpace {
    nodes: RefStore<PlanId, PlanNode>,
    by_name: HashMap<String, PlanId>,
    initial: Step,
    goals: Step,
}

impl PlanSpace {
    pub fn new(initial: Step, goals: Step) -> PlanSpace {
        PlanSpace {
            nodes: RefStore::new(),
            by_name: HashMap::new(),
            initial,
            goals,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: PlanId) -> &PlanNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: PlanId) -> &mut PlanNode {
        &mut self.nodes[id]
    }

    pub fn by_name(&self, name: &str) -> Option<PlanId> {
        self.by_name.get(name).copied()
    }

    pub fn insert(&mut self, node: PlanNode) -> PlanId {
        let name = node.name.clone();
        let id = self.nodes.push(node);
        self.by_name.insert(name, id);
        id
    }

    pub fn initial_step(&self) -> &Step {
        &self.initial
    }

    pub fn goal_step(&self) -> &Step {
        &self.goals
    }

    /// Resolves a step of `plan`, walking the parent chain for added steps.
    pub fn step(&self, plan: PlanId, step: StepId) -> &Step {
        if step == INITIAL_STEP {
            return &self.initial;
        }
        if step == FINAL_STEP {
            return &self.goals;
        }
        let mut at = Some(plan);
        while let Some(id) = at {
            let node = &self.nodes[id];
            if node.new_step_id == Some(step) {
                return node.new_step.as_ref().expect("step id without step");
            }
            at = node.parent;
        }
        panic!("step {step:?} does not belong to plan {plan:?}");
    }

    /// Reconstructs the full plan: all steps, causal links and orderings,
    /// accumulated root-first so the result is identical on every agent
    /// holding the same refinement chain.
    pub fn view(&self, plan: PlanId) -> PlanView<'_> {
        let mut chain = Vec::new();
        let mut at = Some(plan);
        while let Some(id) = at {
            chain.push(id);
            at = self.nodes[id].parent;
        }
        let mut links = Vec::new();
        let mut orderings = Vec::new();
        for &id in chain.iter().rev() {
            links.extend_from_slice(&self.nodes[id].new_links);
            orderings.extend_from_slice(&self.nodes[id].new_orderings);
        }
        PlanView {
            space: self,
            plan,
            num_steps: self.nodes[plan].num_steps,
            links,
            orderings,
        }
    }

    /// Exports a plan object with user-level steps scheduled at their
    /// earliest start times.
    pub fn export(&self, plan: PlanId, world: &crate::task::World) -> Plan {
        let view = self.view(plan);
        let order = view.linearize();
        let (times, makespan) = view.schedule(&order);
        let steps = order
            .iter()
            .filter(|&&s| s != INITIAL_STEP && s != FINAL_STEP)
            .map(|&s| {
                let step = view.step(s);
                PlanStep {
                    index: s,
                    agent: world.agent_name(step.agent).to_string(),
                    name: step.name.clone(),
                    time: times[usize::from(s)],
                }
            })
            .collect();
        Plan {
            name: self.nodes[plan].name.clone(),
            steps,
            causal_links: view.links.clone(),
            orderings: view.orderings.clone(),
            makespan,
        }
    }
}

/// A fully reconstructed plan, borrowed from the arena.
pub struct PlanView<'a> {
    space: &'a PlanSpace,
    pub plan: PlanId,
    pub num_steps: usize,
    pub links: Vec<CausalLink>,
    pub orderings: Vec<(StepId, StepId)>,
}

impl<'a> PlanView<'a> {
    pub fn step(&self, id: StepId) -> &'a Step {
        self.space.step(self.plan, id)
    }

    pub fn steps(&self) -> impl Iterator<Item = StepId> {
        (0..self.num_steps).map(StepId::from)
    }

    /// Supports of each step's preconditions, by consumer.
    pub fn links_to(&self, consumer: StepId) -> impl Iterator<Item = &CausalLink> {
        self.links.iter().filter(move |l| l.consumer == consumer)
    }

    /// Topological order of the steps: post-order depth-first search visiting
    /// causal-link predecessors before ordering predecessors, ties broken by
    /// step index. The initial step comes first and the final step last.
    pub fn linearize(&self) -> Vec<StepId> {
        let mut order = Vec::with_capacity(self.num_steps);
        let mut visited = FixedBitSet::with_capacity(self.num_steps);

        // Predecessor lists, link-implied first, each sorted by step index.
        let mut preds: Vec<Vec<StepId>> = vec![Vec::new(); self.num_steps];
        let mut by_links: Vec<Vec<StepId>> = vec![Vec::new(); self.num_steps];
        for l in &self.links {
            by_links[usize::from(l.consumer)].push(l.producer);
        }
        for l in &mut by_links {
            l.sort();
        }
        let mut by_orderings: Vec<Vec<StepId>> = vec![Vec::new(); self.num_steps];
        for &(before, after) in &self.orderings {
            by_orderings[usize::from(after)].push(before);
        }
        for l in &mut by_orderings {
            l.sort();
        }
        for i in 0..self.num_steps {
            preds[i].extend_from_slice(&by_links[i]);
            preds[i].extend_from_slice(&by_orderings[i]);
        }

        fn visit(s: StepId, preds: &[Vec<StepId>], visited: &mut FixedBitSet, order: &mut Vec<StepId>) {
            if visited.contains(usize::from(s)) {
                return;
            }
            visited.insert(usize::from(s));
            for &p in &preds[usize::from(s)] {
                visit(p, preds, visited, order);
            }
            order.push(s);
        }

        visit(INITIAL_STEP, &preds, &mut visited, &mut order);
        for s in self.steps().filter(|&s| s != FINAL_STEP) {
            visit(s, &preds, &mut visited, &mut order);
        }
        visit(FINAL_STEP, &preds, &mut visited, &mut order);
        order
    }

    /// Earliest start times over links ∪ orderings and the resulting
    /// makespan. Synthetic steps take no time, user steps one unit.
    pub fn schedule(&self, order: &[StepId]) -> (Vec<u32>, u32) {
        let dur = |s: StepId| u32::from(s != INITIAL_STEP && s != FINAL_STEP);
        let mut time = vec![0u32; self.num_steps];
        for &s in order {
            let t = self
                .links
                .iter()
                .filter(|l| l.consumer == s)
                .map(|l| l.producer)
                .chain(self.orderings.iter().filter(|&&(_, a)| a == s).map(|&(b, _)| b))
                .map(|p| time[usize::from(p)] + dur(p))
                .max()
                .unwrap_or(0);
            time[usize::from(s)] = t;
        }
        let makespan = self
            .steps()
            .map(|s| time[usize::from(s)] + dur(s))
            .max()
            .unwrap_or(0);
        (time, makespan)
    }
}

/// The plan object returned on success.
#[derive(Clone, Debug)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<PlanStep>,
    pub causal_links: Vec<CausalLink>,
    pub orderings: Vec<(StepId, StepId)>,
    pub makespan: u32,
}

#[derive(Clone, Debug)]
pub struct PlanStep {
    pub index: StepId,
    pub agent: String,
    pub name: String,
    pub time: u32,
}

impl Plan {
    /// Steps in execution order: by start time, ties by step index.
    pub fn linearize(&self) -> Vec<&PlanStep> {
        let mut steps: Vec<&PlanStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| (s.time, s.index));
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CondKind, ValId, VarId};

    fn cond(var: u32, val: u32) -> Condition {
        Condition {
            var: VarId::from_u32(var),
            val: ValId::from_u32(val),
            kind: CondKind::Equal,
        }
    }

    fn fact(var: u32, val: u32) -> Fact {
        Fact {
            var: VarId::from_u32(var),
            val: ValId::from_u32(val),
        }
    }

    fn space() -> PlanSpace {
        let agent = concord_comm::AgentId::from_u32(0);
        PlanSpace::new(
            Step::initial(agent, &[fact(0, 0)]),
            Step::goals(agent, &[cond(0, 1)]),
        )
    }

    fn root(space: &mut PlanSpace) -> PlanId {
        space.insert(PlanNode {
            parent: None,
            name: "0".to_string(),
            new_step: None,
            new_step_id: None,
            new_links: Vec::new(),
            new_orderings: Vec::new(),
            num_steps: 2,
            g: 0,
            h_dtg: 1,
            h_land: 0,
            is_solution: false,
            achieved: FixedBitSet::new(),
            linearization: vec![INITIAL_STEP, FINAL_STEP],
            proposer: concord_comm::AgentId::from_u32(0),
        })
    }

    #[test]
    fn chain_reconstruction() {
        let mut sp = space();
        let base = root(&mut sp);
        let step = Step {
            agent: concord_comm::AgentId::from_u32(0),
            name: "flip".to_string(),
            pre: vec![cond(0, 0)],
            eff: vec![fact(0, 1)],
        };
        let s2 = StepId::from_u32(2);
        let child = sp.insert(PlanNode {
            parent: Some(base),
            name: "0-0.0".to_string(),
            new_step: Some(step),
            new_step_id: Some(s2),
            new_links: vec![CausalLink {
                producer: INITIAL_STEP,
                cond: cond(0, 0),
                consumer: s2,
            }],
            new_orderings: vec![(INITIAL_STEP, s2)],
            num_steps: 3,
            g: 1,
            h_dtg: 0,
            h_land: 0,
            is_solution: false,
            achieved: FixedBitSet::new(),
            linearization: Vec::new(),
            proposer: concord_comm::AgentId::from_u32(0),
        });
        let view = sp.view(child);
        assert_eq!(view.num_steps, 3);
        assert_eq!(view.links.len(), 1);
        assert_eq!(sp.step(child, s2).name, "flip");
        let order = view.linearize();
        assert_eq!(order, vec![INITIAL_STEP, s2, FINAL_STEP]);
        // Idempotent re-linearization.
        assert_eq!(view.linearize(), order);
        let (_, makespan) = view.schedule(&order);
        assert_eq!(makespan, 1);
    }

    #[test]
    fn empty_plan_has_zero_makespan() {
        let mut sp = space();
        let base = root(&mut sp);
        let view = sp.view(base);
        let order = view.linearize();
        assert_eq!(order, vec![INITIAL_STEP, FINAL_STEP]);
        assert_eq!(view.schedule(&order).1, 0);
    }
}
