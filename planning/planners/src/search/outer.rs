//! The distributed outer search.
//!
//! Per agent: a best-first loop over incremental plans, synchronized with
//! the other agents once per iteration. The baton holder merges the
//! heuristic adjustments of the previous round, selects the next base plan
//! from its open list and announces it; every agent then expands the same
//! base plan with its own actions, exchanges the resulting refinements, and
//! reports the landmark achievements it recognized in foreign proposals to
//! the next baton. Every terminal outcome travels inside the base-plan
//! announcement, so no agent is ever left blocking.

use crate::heuristics::{Evaluator, StateTrace};
use crate::landmarks::LandmarkGraph;
use crate::messages::{
    recv_kind, AdjustmentMsg, BaseControl, NewBasePlanMsg, Payload, PayloadKind, PlanAdjustment,
    ProposalWire, ProposalsMsg,
};
use crate::search::matrix::OrderingMatrix;
use crate::search::memo::{ExpansionMemo, StateMemo};
use crate::search::open::OpenList;
use crate::search::pop;
use crate::solver::{Config, NegotiationMode, PlanningError, SearchListener, SearchMethod};
use concord_comm::{AgentId, Transport};
use concord_planning::dtg::DtgSet;
use concord_planning::plan::{PlanNode, PlanSpace};
use concord_planning::{Action, CondKind, Fact, GroundedTask, Plan, PlanId, Step, StepId};
use fixedbitset::FixedBitSet;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// A plan kept outside the queues because its `f` exceeds the current
/// iterative-deepening bound.
struct Deferred {
    f: u32,
    h_land: u32,
    seq: u32,
    improved: bool,
    plan: PlanId,
}

pub struct OuterSearch<'a, T> {
    task: &'a GroundedTask,
    dtgs: &'a DtgSet,
    graph: &'a LandmarkGraph,
    transport: &'a mut T,
    config: &'a Config,
    space: PlanSpace,
    open: OpenList,
    matrix: OrderingMatrix,
    memo: StateMemo,
    expansions: ExpansionMemo,
    /// Proposals of the running iteration, in global agent order, awaiting
    /// adjustment and insertion at the next synchronization point.
    pending: Vec<PlanId>,
    /// Adjustments and votes to hand to the next baton holder.
    my_changes: Vec<PlanAdjustment>,
    my_votes: Vec<(String, bool)>,
    /// Own adjustment message when this agent is the next baton itself.
    stash: Option<AdjustmentMsg>,
    deferred: Vec<Deferred>,
    bound: Option<u32>,
    seq: u32,
    iteration: u64,
    discarded: u64,
    start: Instant,
    pool: Option<rayon::ThreadPool>,
}

impl<'a, T: Transport<Payload>> OuterSearch<'a, T> {
    pub fn new(
        task: &'a GroundedTask,
        dtgs: &'a DtgSet,
        graph: &'a LandmarkGraph,
        transport: &'a mut T,
        config: &'a Config,
    ) -> Self {
        let me = transport.this_agent();
        let space = PlanSpace::new(
            Step::initial(me, task.initial_state()),
            Step::goals(me, task.global_goals()),
        );
        let workers = (num_cpus::get() / transport.num_agents()).max(1);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build().ok();
        OuterSearch {
            task,
            dtgs,
            graph,
            transport,
            config,
            space,
            open: OpenList::new(),
            matrix: OrderingMatrix::new(),
            memo: StateMemo::new(),
            expansions: ExpansionMemo::new(),
            pending: Vec::new(),
            my_changes: Vec::new(),
            my_votes: Vec::new(),
            stash: None,
            deferred: Vec::new(),
            bound: None,
            seq: 0,
            iteration: 0,
            discarded: 0,
            start: Instant::now(),
            pool,
        }
    }

    pub fn run(mut self, listener: &mut dyn SearchListener) -> Result<Plan, PlanningError> {
        self.insert_root();
        loop {
            let control = self.agree_on_base(listener)?;
            match control {
                BaseControl::Expand { plan } => {
                    listener.on_base_plan(self.iteration, &plan);
                    let base = self
                        .space
                        .by_name(&plan)
                        .ok_or_else(|| PlanningError::Internal(format!("unknown base plan {plan}")))?;
                    self.expand(base, listener)?;
                    self.finish_iteration()?;
                }
                BaseControl::RaiseBound { bound } => {
                    tracing::debug!(bound, "deepening bound raised");
                    self.finish_iteration()?;
                }
                BaseControl::Solution { plan } => {
                    listener.on_solution(&plan);
                    tracing::info!(
                        %plan,
                        iterations = self.iteration,
                        expanded = self.space.len(),
                        discarded = self.discarded,
                        "solution agreed"
                    );
                    let id = self
                        .space
                        .by_name(&plan)
                        .ok_or_else(|| PlanningError::Internal(format!("unknown solution {plan}")))?;
                    return Ok(self.space.export(id, self.task.world()));
                }
                BaseControl::Exhausted => return Err(PlanningError::UnsolvableProven),
                BaseControl::Timeout => return Err(PlanningError::Timeout),
            }
        }
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator {
            task: self.task,
            dtgs: self.dtgs,
            graph: self.graph,
        }
    }

    fn insert_root(&mut self) {
        let root = PlanNode {
            parent: None,
            name: "0".to_string(),
            new_step: None,
            new_step_id: None,
            new_links: Vec::new(),
            new_orderings: Vec::new(),
            num_steps: 2,
            g: 0,
            h_dtg: 0,
            h_land: 0,
            is_solution: false,
            achieved: FixedBitSet::with_capacity(self.graph.total_global()),
            linearization: Vec::new(),
            proposer: self.transport.this_agent(),
        };
        let id = self.space.insert(root);
        self.evaluate_plans(&[id]);
        let key = self.state_key_of(id);
        self.memo.insert_fresh(key);
        let node = self.space.node(id);
        let f = 2 * node.h_dtg + node.g;
        let h_land = node.h_land;
        if matches!(self.config.search, SearchMethod::IdaStar) {
            self.bound = Some(f);
        }
        self.seq += 1;
        let seq = self.seq;
        self.open.insert(id, f, h_land, seq, false);
    }

    /// The synchronization point opening every iteration: merge adjustments,
    /// insert the previous round's proposals, agree on what to do next.
    fn agree_on_base(&mut self, listener: &mut dyn SearchListener) -> Result<BaseControl, PlanningError> {
        if self.transport.is_baton() {
            let mut merged: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
            let mut approvals: HashMap<String, usize> = HashMap::new();
            let mut peer_min_f: Option<u32> = None;
            if self.iteration > 0 {
                let mut msgs = vec![self.stash.take().unwrap_or_else(|| AdjustmentMsg {
                    changes: Vec::new(),
                    votes: Vec::new(),
                    min_deferred_f: None,
                })];
                for peer in self.transport.others() {
                    match recv_kind(self.transport, peer, PayloadKind::Adjustments)? {
                        Payload::Adjustments(msg) => msgs.push(msg),
                        _ => unreachable!(),
                    }
                }
                for msg in msgs {
                    for change in msg.changes {
                        merged.entry(change.plan).or_default().extend(change.new_landmarks);
                    }
                    for (plan, approve) in msg.votes {
                        *approvals.entry(plan).or_insert(0) += usize::from(approve);
                    }
                    peer_min_f = [peer_min_f, msg.min_deferred_f].into_iter().flatten().min();
                }
            }
            let adjustments: Vec<PlanAdjustment> = merged
                .into_iter()
                .map(|(plan, ids)| PlanAdjustment {
                    plan,
                    new_landmarks: ids.into_iter().collect(),
                })
                .collect();
            self.apply_adjustments(&adjustments, listener);
            let solution = self.insert_pending(Some(&approvals));

            let control = if let Some(plan) = solution {
                BaseControl::Solution { plan }
            } else if self.deadline_exceeded() {
                BaseControl::Timeout
            } else {
                match self.open.extract(self.iteration % 2 == 1) {
                    Some(id) => BaseControl::Expand {
                        plan: self.space.node(id).name.clone(),
                    },
                    None => {
                        let min_f = [peer_min_f, self.min_deferred()].into_iter().flatten().min();
                        match min_f {
                            Some(bound) if matches!(self.config.search, SearchMethod::IdaStar) => {
                                BaseControl::RaiseBound { bound }
                            }
                            _ => BaseControl::Exhausted,
                        }
                    }
                }
            };
            self.transport.broadcast(Payload::NewBasePlan(NewBasePlanMsg {
                control: control.clone(),
                adjustments,
            }))?;
            self.apply_control(&control, true)?;
            Ok(control)
        } else {
            let baton = self.transport.baton_agent();
            let msg = match recv_kind(self.transport, baton, PayloadKind::NewBasePlan)? {
                Payload::NewBasePlan(msg) => msg,
                _ => unreachable!(),
            };
            self.apply_adjustments(&msg.adjustments, listener);
            let _ = self.insert_pending(None);
            self.apply_control(&msg.control, false)?;
            Ok(msg.control)
        }
    }

    fn apply_control(&mut self, control: &BaseControl, am_baton: bool) -> Result<(), PlanningError> {
        match control {
            BaseControl::Expand { plan } => {
                let id = self
                    .space
                    .by_name(plan)
                    .ok_or_else(|| PlanningError::Internal(format!("unknown base plan {plan}")))?;
                if !am_baton {
                    self.open.remove(id);
                }
            }
            BaseControl::RaiseBound { bound } => {
                self.bound = Some(*bound);
                let mut kept = Vec::new();
                let mut back: Vec<Deferred> = Vec::new();
                for d in std::mem::take(&mut self.deferred) {
                    if d.f <= *bound {
                        back.push(d);
                    } else {
                        kept.push(d);
                    }
                }
                back.sort_by_key(|d| (d.f, d.seq));
                for d in back {
                    self.open.insert(d.plan, d.f, d.h_land, d.seq, d.improved);
                }
                self.deferred = kept;
            }
            _ => {}
        }
        Ok(())
    }

    /// Unions the baton-merged landmark achievements into the referenced
    /// plans and re-derives their landmark heuristic, so that every agent
    /// ends up with identical `(h_dtg, h_land)` per plan.
    fn apply_adjustments(&mut self, adjustments: &[PlanAdjustment], listener: &mut dyn SearchListener) {
        let total = self.graph.total_global();
        for adj in adjustments {
            if let Some(id) = self.space.by_name(&adj.plan) {
                let node = self.space.node_mut(id);
                let before = node.achieved.count_ones(..);
                for &g in &adj.new_landmarks {
                    node.achieved.insert(g as usize);
                }
                let added = node.achieved.count_ones(..) - before;
                node.h_land = (total - node.achieved.count_ones(..)) as u32;
                listener.on_adjustment(&adj.plan, added, node.h_land);
            }
        }
    }

    /// Inserts the pending proposals into the queues in the deterministic
    /// global order. Solutions are never queued: the first acceptable one is
    /// returned for the baton to announce.
    fn insert_pending(&mut self, approvals: Option<&HashMap<String, usize>>) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        let mut accepted = None;
        for id in pending {
            if self.space.node(id).is_solution {
                if accepted.is_none() {
                    let name = self.space.node(id).name.clone();
                    let ok = match (self.config.negotiation, approvals) {
                        (NegotiationMode::Cooperative, _) => true,
                        // Strict majority; an exact tie rejects.
                        (NegotiationMode::Borda, Some(votes)) => {
                            2 * votes.get(&name).copied().unwrap_or(0) > self.transport.num_agents()
                        }
                        // Non-baton agents follow the announced verdict.
                        (NegotiationMode::Borda, None) => false,
                    };
                    if ok {
                        accepted = Some(name);
                    }
                }
                continue;
            }
            let key = self.state_key_of(id);
            if !self.memo.insert_fresh(key) {
                self.discarded += 1;
                continue;
            }
            let node = self.space.node(id);
            let f = 2 * node.h_dtg + node.g;
            let h_land = node.h_land;
            let improved = node
                .parent
                .map(|p| h_land < self.space.node(p).h_land)
                .unwrap_or(false);
            self.seq += 1;
            let seq = self.seq;
            if let Some(bound) = self.bound {
                if f > bound {
                    self.deferred.push(Deferred {
                        f,
                        h_land,
                        seq,
                        improved,
                        plan: id,
                    });
                    continue;
                }
            }
            self.open.insert(id, f, h_land, seq, improved);
        }
        accepted
    }

    fn state_key_of(&self, id: PlanId) -> crate::search::memo::StateKey {
        let view = self.space.view(id);
        let node = self.space.node(id);
        let trace = self.evaluator().trace(&view, &node.linearization);
        trace.state_key(&node.achieved)
    }

    /// Expansion of the agreed base plan with this agent's actions, followed
    /// by the proposal exchange.
    fn expand(&mut self, base: PlanId, listener: &mut dyn SearchListener) -> Result<(), PlanningError> {
        let me = self.transport.this_agent();
        let my_idx = usize::from(me);
        let base_name = self.space.node(base).name.clone();

        let (applicable, closure_ready) = {
            let view = self.space.view(base);
            let order = self.space.node(base).linearization.clone();
            let trace = self.evaluator().trace(&view, &order);
            let applicable: Vec<_> = self
                .task
                .actions()
                .filter(|&(_, action)| supportable(action, &trace))
                .map(|(id, _)| id)
                .collect();
            let closure_ready = self
                .task
                .global_goals()
                .iter()
                .all(|&g| trace.last.get(&g.var).is_some_and(|&v| g.satisfied_by(v)));
            (applicable, closure_ready)
        };

        let mut own = Vec::new();
        let mut child = 0u32;
        for action_id in applicable {
            if !self.expansions.insert_fresh(base, action_id) {
                continue;
            }
            let action = self.task.action(action_id);
            let candidate = Step {
                agent: me,
                name: action.name.clone(),
                pre: action.pre.clone(),
                eff: action.eff.clone(),
            };
            let refinements = {
                let view = self.space.view(base);
                pop::refine(&view, Some(&candidate), &mut self.matrix)
            };
            for r in refinements {
                own.push(self.materialize(base, &base_name, my_idx, &mut child, r));
            }
        }
        if closure_ready {
            let refinements = {
                let view = self.space.view(base);
                pop::refine(&view, None, &mut self.matrix)
            };
            for r in refinements {
                own.push(self.materialize(base, &base_name, my_idx, &mut child, r));
            }
        }
        self.evaluate_plans(&own);

        let wires: Vec<ProposalWire> = own.iter().map(|&id| self.to_wire(id)).collect();
        self.transport
            .broadcast(Payload::Proposals(ProposalsMsg { proposals: wires }))?;

        let mut per_agent: Vec<Vec<PlanId>> = vec![Vec::new(); self.transport.num_agents()];
        let own_count = own.len();
        per_agent[my_idx] = own;
        let mut changes: Vec<PlanAdjustment> = Vec::new();
        let mut received = 0usize;
        for peer in self.transport.others() {
            let msg = match recv_kind(self.transport, peer, PayloadKind::Proposals)? {
                Payload::Proposals(msg) => msg,
                _ => unreachable!(),
            };
            for wire in msg.proposals {
                received += 1;
                let name = wire.name.clone();
                let (id, newly) = self.integrate(wire, peer)?;
                per_agent[usize::from(peer)].push(id);
                if !newly.is_empty() {
                    changes.push(PlanAdjustment {
                        plan: name,
                        new_landmarks: newly,
                    });
                }
            }
        }
        self.pending = per_agent.into_iter().flatten().collect();
        listener.on_proposals(self.iteration, own_count, received);
        tracing::debug!(
            iteration = self.iteration,
            base = %base_name,
            own = own_count,
            received,
            open = self.open.len(),
            "iteration expanded"
        );

        if matches!(self.config.negotiation, NegotiationMode::Borda) {
            self.my_votes = self
                .pending
                .iter()
                .filter(|&&id| self.space.node(id).is_solution)
                .map(|&id| (self.space.node(id).name.clone(), self.vote(id)))
                .collect();
        }
        self.my_changes = changes;
        Ok(())
    }

    /// Stores one refinement in the arena under its deterministic name.
    fn materialize(
        &mut self,
        base: PlanId,
        base_name: &str,
        agent_idx: usize,
        child: &mut u32,
        refinement: pop::Refinement,
    ) -> PlanId {
        let name = format!("{base_name}-{agent_idx}.{child}");
        *child += 1;
        let parent = self.space.node(base);
        let has_step = refinement.new_step.is_some();
        let node = PlanNode {
            parent: Some(base),
            name,
            new_step_id: has_step.then(|| StepId::from(parent.num_steps)),
            new_step: refinement.new_step,
            new_links: refinement.links,
            new_orderings: refinement.orderings,
            num_steps: parent.num_steps + usize::from(has_step),
            g: parent.g + u32::from(has_step),
            h_dtg: 0,
            h_land: 0,
            is_solution: refinement.is_solution,
            achieved: FixedBitSet::with_capacity(self.graph.total_global()),
            linearization: Vec::new(),
            proposer: self.transport.this_agent(),
        };
        self.space.insert(node)
    }

    /// Heuristic evaluation, fanned out on the bounded worker pool when one
    /// is available. Workers only read the arena and produce the values that
    /// are written back sequentially.
    fn evaluate_plans(&mut self, ids: &[PlanId]) {
        let space = &self.space;
        let evaluator = self.evaluator();
        let total = self.graph.total_global();
        let eval = |id: &PlanId| {
            let node = space.node(*id);
            let seed = match node.parent {
                Some(p) => space.node(p).achieved.clone(),
                None => FixedBitSet::with_capacity(total),
            };
            let new_effects: &[Fact] = match (&node.new_step, node.parent) {
                (Some(step), _) => &step.eff,
                // The root marks whatever the initial state establishes.
                (None, None) => &space.initial_step().eff,
                // A final-step closure adds no step and achieves nothing new.
                (None, Some(_)) => &[],
            };
            let view = space.view(*id);
            (*id, evaluator.evaluate(&view, seed, new_effects))
        };
        let results: Vec<_> = match &self.pool {
            Some(pool) if ids.len() > 1 => pool.install(|| ids.par_iter().map(eval).collect()),
            _ => ids.iter().map(eval).collect(),
        };
        for (id, e) in results {
            let node = self.space.node_mut(id);
            node.linearization = e.order;
            node.h_dtg = e.h_dtg;
            node.h_land = e.h_land;
            node.achieved = e.achieved;
        }
    }

    fn to_wire(&self, id: PlanId) -> ProposalWire {
        let node = self.space.node(id);
        let parent = node.parent.expect("proposals always have a parent");
        ProposalWire {
            parent: self.space.node(parent).name.clone(),
            name: node.name.clone(),
            step: node.new_step.clone(),
            links: node.new_links.clone(),
            orderings: node.new_orderings.clone(),
            is_solution: node.is_solution,
            g: node.g,
            h_dtg: node.h_dtg,
            h_land: node.h_land,
            achieved: node.achieved.ones().map(|i| i as u32).collect(),
        }
    }

    /// Enters a foreign proposal into the arena, keeping the proposer's
    /// heuristic values, and returns the landmarks this agent recognized
    /// that the proposer could not see.
    fn integrate(&mut self, wire: ProposalWire, peer: AgentId) -> Result<(PlanId, Vec<u32>), PlanningError> {
        let parent = self.space.by_name(&wire.parent).ok_or_else(|| {
            PlanningError::BatonDesync(format!("proposal {} references unknown parent {}", wire.name, wire.parent))
        })?;
        let parent_steps = self.space.node(parent).num_steps;
        let has_step = wire.step.is_some();
        let mut achieved = FixedBitSet::with_capacity(self.graph.total_global());
        for &g in &wire.achieved {
            achieved.insert(g as usize);
        }
        let newly = wire
            .step
            .as_ref()
            .map(|s| self.graph.newly_achieved(self.task.world(), &s.eff, &achieved))
            .unwrap_or_default();

        let node = PlanNode {
            parent: Some(parent),
            name: wire.name,
            new_step_id: has_step.then(|| StepId::from(parent_steps)),
            new_step: wire.step,
            new_links: wire.links,
            new_orderings: wire.orderings,
            num_steps: parent_steps + usize::from(has_step),
            g: wire.g,
            h_dtg: wire.h_dtg,
            h_land: wire.h_land,
            is_solution: wire.is_solution,
            achieved,
            linearization: Vec::new(),
            proposer: peer,
        };
        let id = self.space.insert(node);
        let order = self.space.view(id).linearize();
        self.space.node_mut(id).linearization = order;
        Ok((id, newly))
    }

    /// Metric verdict on a solution candidate: approve unless this agent's
    /// metric evaluation of the plan's final state exceeds its threshold.
    fn vote(&self, id: PlanId) -> bool {
        match self.task.metric() {
            None => true,
            Some(metric) => {
                let view = self.space.view(id);
                let trace = self.evaluator().trace(&view, &self.space.node(id).linearization);
                metric.evaluate(&trace.last) <= metric.threshold
            }
        }
    }

    /// Hands the collected adjustments, votes and deferred minimum to the
    /// next baton holder and rotates the baton.
    fn finish_iteration(&mut self) -> Result<(), PlanningError> {
        let msg = AdjustmentMsg {
            changes: std::mem::take(&mut self.my_changes),
            votes: std::mem::take(&mut self.my_votes),
            min_deferred_f: self.min_deferred(),
        };
        let next = self.next_baton();
        if next == self.transport.this_agent() {
            self.stash = Some(msg);
        } else {
            self.transport.send(next, Payload::Adjustments(msg))?;
        }
        self.transport.pass_baton();
        self.iteration += 1;
        Ok(())
    }

    fn next_baton(&self) -> AgentId {
        let order = self.transport.agents();
        let current = self.transport.baton_agent();
        let i = order.iter().position(|&a| a == current).expect("baton holder not in agent list");
        order[(i + 1) % order.len()]
    }

    fn min_deferred(&self) -> Option<u32> {
        self.deferred.iter().map(|d| d.f).min()
    }

    fn deadline_exceeded(&self) -> bool {
        self.config.timeout.is_some_and(|t| self.start.elapsed() > t)
            || self.config.max_iterations.is_some_and(|m| self.iteration >= m)
    }
}

/// Applicability of an action against the asserted pairs and last values of
/// the base plan's linearization.
fn supportable(action: &Action, trace: &StateTrace) -> bool {
    action.pre.iter().all(|&p| match p.kind {
        CondKind::Equal => {
            if action.writes(p.var) {
                // The action rewrites this variable itself: only the latest
                // asserted value can feed it.
                match trace.last.get(&p.var) {
                    None => true,
                    Some(&v) => v == p.val,
                }
            } else {
                trace.asserts(Fact {
                    var: p.var,
                    val: p.val,
                })
            }
        }
        CondKind::Distinct => trace.asserted.iter().any(|f| f.var == p.var && f.val != p.val),
    })
}
