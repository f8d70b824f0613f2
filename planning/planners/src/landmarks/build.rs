//! Distributed landmark extraction.
//!
//! Backward sweep over the relaxed planning graph, highest level first. At
//! every step exactly one agent (the baton holder) drives a *candidate
//! round*: it broadcasts a landmark candidate, the agents sharing the
//! candidate's variable answer with the preconditions common to their local
//! producers, the baton intersects the answers, and the promotion verdicts
//! are gathered from everyone before the confirmed landmarks are broadcast
//! back. A baton holder with nothing left at the current level hands over;
//! once every agent passed in a row, the whole level is done.

use crate::landmarks::{LandmarkGraph, LmId, OrderKind};
use crate::messages::{
    recv_kind, GlobalIdMsg, LandmarkLabel, LandmarkMsg, LandmarkSharingMsg, Payload, PayloadKind,
    PostProcessingMsg,
};
use crate::solver::PlanningError;
use concord_comm::{AgentId, Transport};
use concord_planning::rpg::RelaxedPlanningGraph;
use concord_planning::{ActionId, Condition, Fact, GroundedTask, ValId, VarId};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

pub fn build_landmark_graph<T: Transport<Payload>>(
    task: &GroundedTask,
    rpg: &RelaxedPlanningGraph,
    transport: &mut T,
) -> Result<LandmarkGraph, PlanningError> {
    let mut builder = Builder {
        task,
        rpg,
        graph: LandmarkGraph::new(),
        pending: BTreeMap::new(),
        scheduled: HashSet::new(),
        processed: HashSet::new(),
    };
    let max_level = builder.seed_goals()?;
    builder.extract(transport, max_level)?;
    builder.post_process(transport)?;
    builder.assign_global_ids(transport)?;
    builder.share_private(transport)?;
    Ok(builder.graph)
}

struct Builder<'a> {
    task: &'a GroundedTask,
    rpg: &'a RelaxedPlanningGraph,
    graph: LandmarkGraph,
    /// Unexplored candidates by relaxed-graph level.
    pending: BTreeMap<u32, VecDeque<LmId>>,
    /// Labels already queued (or established) locally; prevents re-queueing.
    scheduled: HashSet<LandmarkLabel>,
    /// Labels some baton already ran a candidate round for.
    processed: HashSet<LandmarkLabel>,
}

impl<'a> Builder<'a> {
    fn seed_goals(&mut self) -> Result<u32, PlanningError> {
        let world = self.task.world().clone();
        let mut max_level = 0;
        for &goal in self.task.global_goals() {
            let fact = goal
                .fact()
                .ok_or_else(|| PlanningError::UnsupportedFeature("disequality goal".to_string()))?;
            let level = self
                .rpg
                .cond_level(self.task, goal)
                .ok_or_else(|| PlanningError::UnreachableGoal(world.display_cond(goal)))?;
            let label = LandmarkLabel::single(fact);
            let id = self.graph.add_node(&world, label.clone(), level, true);
            self.scheduled.insert(label);
            if level >= 1 {
                self.pending.entry(level).or_default().push_back(id);
                max_level = max_level.max(level);
            }
        }
        Ok(max_level)
    }

    /// The per-level baton-driven sweep.
    fn extract<T: Transport<Payload>>(
        &mut self,
        transport: &mut T,
        max_level: u32,
    ) -> Result<(), PlanningError> {
        let num_agents = transport.num_agents();
        for level in (1..=max_level).rev() {
            // Consecutive empty-handed baton transfers; the level is swept
            // once every agent passed in a row.
            let mut idle = 0usize;
            loop {
                if transport.is_baton() {
                    match self.next_candidate(level) {
                        Some(candidate) => {
                            idle = 0;
                            self.drive_candidate(transport, candidate)?;
                        }
                        None if idle >= num_agents - 1 => {
                            let msg = if level == 1 {
                                LandmarkMsg::EndProcedure
                            } else {
                                LandmarkMsg::ChangeLevel { next: level - 1 }
                            };
                            transport.broadcast(Payload::Landmark(msg))?;
                            transport.pass_baton();
                            break;
                        }
                        None => {
                            transport.broadcast(Payload::Landmark(LandmarkMsg::PassBaton))?;
                            idle += 1;
                            transport.pass_baton();
                        }
                    }
                } else {
                    let baton = transport.baton_agent();
                    match recv_landmark(transport, baton)? {
                        LandmarkMsg::Candidate { label } => {
                            idle = 0;
                            self.participate(transport, baton, label)?;
                        }
                        LandmarkMsg::PassBaton => {
                            idle += 1;
                            transport.pass_baton();
                        }
                        LandmarkMsg::ChangeLevel { .. } | LandmarkMsg::EndProcedure => {
                            transport.pass_baton();
                            break;
                        }
                        other => return Err(desync("level sweep", &other)),
                    }
                }
            }
        }
        Ok(())
    }

    /// Next local candidate at `level` no baton has run a round for yet.
    fn next_candidate(&mut self, level: u32) -> Option<LmId> {
        let queue = self.pending.get_mut(&level)?;
        while let Some(id) = queue.pop_front() {
            if !self.processed.contains(&self.graph.node(id).label) {
                return Some(id);
            }
        }
        None
    }

    /// Baton side of one candidate round.
    fn drive_candidate<T: Transport<Payload>>(
        &mut self,
        transport: &mut T,
        candidate: LmId,
    ) -> Result<(), PlanningError> {
        let label = self.graph.node(candidate).label.clone();
        self.processed.insert(label.clone());
        transport.broadcast(Payload::Landmark(LandmarkMsg::Candidate {
            label: label.clone(),
        }))?;

        let me = transport.this_agent();
        let world = self.task.world().clone();
        let mut contributions = Vec::new();
        if let Some(c) = self.contribution(&label) {
            contributions.push(c);
        }
        let participants: Vec<AgentId> = world.var(label.var).observers().filter(|&a| a != me).collect();
        for peer in participants {
            match recv_landmark(transport, peer)? {
                LandmarkMsg::CommonPrecs { common, disjunctions } => {
                    contributions.push((common, disjunctions));
                }
                LandmarkMsg::NoProducer => {}
                other => return Err(desync("producer collection", &other)),
            }
        }

        let (singles, disjunctions) = intersect(&contributions);
        transport.broadcast(Payload::Landmark(LandmarkMsg::Verification {
            singles: singles.clone(),
            disjunctions: disjunctions.clone(),
        }))?;
        self.apply_verification(&label, &singles, &disjunctions);
        Ok(())
    }

    /// Participant side of one candidate round.
    fn participate<T: Transport<Payload>>(
        &mut self,
        transport: &mut T,
        baton: AgentId,
        label: LandmarkLabel,
    ) -> Result<(), PlanningError> {
        self.processed.insert(label.clone());
        if self.task.knows(label.var) {
            let answer = match self.contribution(&label) {
                Some((common, disjunctions)) => LandmarkMsg::CommonPrecs { common, disjunctions },
                None => LandmarkMsg::NoProducer,
            };
            transport.send(baton, Payload::Landmark(answer))?;
        }

        match recv_landmark(transport, baton)? {
            LandmarkMsg::Verification { singles, disjunctions } => {
                self.apply_verification(&label, &singles, &disjunctions);
                Ok(())
            }
            other => Err(desync("verification", &other)),
        }
    }

    /// Preconditions common to all local producers of the candidate, and the
    /// some-but-not-all ones grouped by variable. `None` when no local action
    /// produces any member; such an agent takes no part in the vote.
    fn contribution(&self, label: &LandmarkLabel) -> Option<(Vec<Fact>, Vec<(VarId, Vec<ValId>)>)> {
        let mut producers: Vec<ActionId> = label
            .facts()
            .flat_map(|f| self.rpg.producers(self.task, f))
            .collect();
        producers.sort();
        producers.dedup();
        if producers.is_empty() {
            return None;
        }

        let pre_sets: Vec<BTreeSet<Fact>> = producers
            .iter()
            .map(|&a| self.task.action(a).pre.iter().filter_map(|c| c.fact()).collect())
            .collect();
        let common: Vec<Fact> = pre_sets[0]
            .iter()
            .filter(|f| pre_sets[1..].iter().all(|s| s.contains(f)))
            .copied()
            .collect();
        let mut uncommon: BTreeMap<VarId, BTreeSet<ValId>> = BTreeMap::new();
        for set in &pre_sets {
            for fact in set {
                if !common.contains(fact) {
                    uncommon.entry(fact.var).or_default().insert(fact.val);
                }
            }
        }
        let disjunctions = uncommon
            .into_iter()
            .map(|(var, vals)| (var, vals.into_iter().collect()))
            .collect();
        Some((common, disjunctions))
    }

    /// The verification stage, run locally by every agent on the broadcast
    /// intersection: a confirmed fact is promoted when it holds initially, is
    /// a global goal, or removing its producers blocks some goal in this
    /// agent's relaxed graph. Agents therefore end up with different (but
    /// individually sound) subgraphs; the global indexing reconciles them.
    fn apply_verification(
        &mut self,
        candidate: &LandmarkLabel,
        singles: &[Fact],
        disjunctions: &[(VarId, Vec<ValId>)],
    ) {
        let world = self.task.world().clone();
        let promoted: Vec<Fact> = singles
            .iter()
            .filter(|f| self.task.knows(f.var))
            .filter(|&&f| match self.rpg.fact_level(world.fact_id(f)) {
                Some(0) => true,
                Some(_) => self.is_goal(f) || self.rpg.verify_single_landmark(self.task, f),
                None => false,
            })
            .copied()
            .collect();
        self.apply_promotion(candidate, &promoted, disjunctions);
    }

    fn is_goal(&self, fact: Fact) -> bool {
        self.task
            .global_goals()
            .iter()
            .any(|&g| g == Condition::equal(fact.var, fact.val))
    }

    /// Enters the promoted landmarks this agent can observe into its graph,
    /// with their necessary orderings toward the candidate, and queues the
    /// new nodes for exploration at their own level.
    fn apply_promotion(
        &mut self,
        candidate: &LandmarkLabel,
        singles: &[Fact],
        disjunctions: &[(VarId, Vec<ValId>)],
    ) {
        let world = self.task.world().clone();
        let consumer = self.graph.lookup(candidate);
        for &fact in singles.iter().filter(|f| self.task.knows(f.var)) {
            let Some(level) = self.rpg.fact_level(world.fact_id(fact)) else {
                continue;
            };
            let label = LandmarkLabel::single(fact);
            let id = self.graph.add_node(&world, label.clone(), level, self.is_goal(fact));
            if let Some(c) = consumer {
                self.graph.add_edge(id, c, OrderKind::Necessary);
            }
            self.schedule(label, id, level);
        }
        for (var, vals) in disjunctions.iter().filter(|(v, _)| self.task.knows(*v)) {
            let label = LandmarkLabel::disjunction(*var, vals.clone());
            let level = label
                .facts()
                .filter_map(|f| self.rpg.fact_level(world.fact_id(f)))
                .min();
            let Some(level) = level else { continue };
            let id = self.graph.add_node(&world, label.clone(), level, false);
            if let Some(c) = consumer {
                self.graph.add_edge(id, c, OrderKind::Necessary);
            }
            self.schedule(label, id, level);
        }
    }

    fn schedule(&mut self, label: LandmarkLabel, id: LmId, level: u32) {
        if level >= 1 && !self.scheduled.contains(&label) && !self.processed.contains(&label) {
            self.pending.entry(level).or_default().push_back(id);
        }
        self.scheduled.insert(label);
    }

    /// Necessary-ordering post-processing: an edge `a → b` between single
    /// landmarks survives only if no agent can still reach `b` after removing
    /// its own producers of `a`.
    fn post_process<T: Transport<Payload>>(&mut self, transport: &mut T) -> Result<(), PlanningError> {
        let world = self.task.world().clone();
        let mut removable: Vec<(LandmarkLabel, LandmarkLabel)> = Vec::new();
        for (from, to, kind) in self.graph.edges().collect::<Vec<_>>() {
            if kind != OrderKind::Necessary {
                continue;
            }
            let a = self.graph.node(from);
            let b = self.graph.node(to);
            if !a.is_single() || !b.is_single() {
                continue;
            }
            // An agent that cannot produce the source at all has no say:
            // removing none of its actions proves nothing about the edge.
            let producers = self.task.achievers(world.fact_id(a.facts[0]));
            if producers.is_empty() {
                continue;
            }
            if !self.rpg.verify_edge(self.task, producers, &b.facts) {
                removable.push((a.label.clone(), b.label.clone()));
            }
        }

        let to_remove = if transport.is_baton() {
            let mut all = removable;
            for peer in transport.others() {
                match recv_kind(transport, peer, PayloadKind::PostProcessing)? {
                    Payload::PostProcessing(PostProcessingMsg::Verdicts { removable }) => {
                        all.extend(removable);
                    }
                    Payload::PostProcessing(other) => return Err(desync_pp(&other)),
                    _ => unreachable!(),
                }
            }
            all.sort();
            all.dedup();
            transport.broadcast(Payload::PostProcessing(PostProcessingMsg::Remove {
                edges: all.clone(),
            }))?;
            all
        } else {
            let baton = transport.baton_agent();
            transport.send(
                baton,
                Payload::PostProcessing(PostProcessingMsg::Verdicts { removable }),
            )?;
            match recv_kind(transport, baton, PayloadKind::PostProcessing)? {
                Payload::PostProcessing(PostProcessingMsg::Remove { edges }) => edges,
                Payload::PostProcessing(other) => return Err(desync_pp(&other)),
                _ => unreachable!(),
            }
        };

        for (la, lb) in &to_remove {
            if let (Some(a), Some(b)) = (self.graph.lookup(la), self.graph.lookup(lb)) {
                self.graph.remove_edge(a, b);
            }
        }
        transport.pass_baton();
        Ok(())
    }

    /// Round-robin assignment of consecutive global ids, the counter
    /// travelling with the baton.
    fn assign_global_ids<T: Transport<Payload>>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), PlanningError> {
        let mut counter: u32 = 0;
        for _ in 0..transport.num_agents() {
            if transport.is_baton() {
                let mine = self.graph.unindexed();
                let mut assignments = Vec::with_capacity(mine.len());
                for id in mine {
                    self.graph.set_global(id, counter);
                    assignments.push((self.graph.node(id).label.clone(), counter));
                    counter += 1;
                }
                transport.broadcast(Payload::GlobalIds(GlobalIdMsg { assignments, counter }))?;
            } else {
                let baton = transport.baton_agent();
                match recv_kind(transport, baton, PayloadKind::GlobalIds)? {
                    Payload::GlobalIds(msg) => {
                        for (label, gid) in msg.assignments {
                            if let Some(id) = self.graph.lookup(&label) {
                                self.graph.set_global(id, gid);
                            }
                        }
                        counter = msg.counter;
                    }
                    _ => unreachable!(),
                }
            }
            transport.pass_baton();
        }
        self.graph.set_total_global(counter as usize);
        Ok(())
    }

    /// Broadcast of each agent's single non-initial non-goal landmark ids, so
    /// everyone knows which part of the achievement vector it will never be
    /// able to recognize on its own.
    fn share_private<T: Transport<Payload>>(&mut self, transport: &mut T) -> Result<(), PlanningError> {
        let ids: Vec<u32> = self
            .graph
            .nodes()
            .filter(|(_, n)| n.is_single() && !n.is_goal && n.level > 0)
            .filter_map(|(_, n)| n.global)
            .collect();
        transport.broadcast(Payload::LandmarkSharing(LandmarkSharingMsg { ids }))?;
        let mut foreign = 0usize;
        for peer in transport.others() {
            match recv_kind(transport, peer, PayloadKind::LandmarkSharing)? {
                Payload::LandmarkSharing(msg) => {
                    foreign += msg
                        .ids
                        .iter()
                        .filter(|&&g| !self.graph.nodes().any(|(_, n)| n.global == Some(g)))
                        .count();
                }
                _ => unreachable!(),
            }
        }
        tracing::debug!(
            own = self.graph.num_nodes(),
            foreign_private = foreign,
            total = self.graph.total_global(),
            "landmark indexing complete"
        );
        Ok(())
    }
}

fn recv_landmark<T: Transport<Payload>>(
    transport: &mut T,
    from: AgentId,
) -> Result<LandmarkMsg, PlanningError> {
    match recv_kind(transport, from, PayloadKind::Landmark)? {
        Payload::Landmark(msg) => Ok(msg),
        _ => unreachable!(),
    }
}

fn desync(phase: &str, msg: &LandmarkMsg) -> PlanningError {
    PlanningError::BatonDesync(format!("unexpected landmark message in {phase}: {msg:?}"))
}

fn desync_pp(msg: &PostProcessingMsg) -> PlanningError {
    PlanningError::BatonDesync(format!("unexpected post-processing message: {msg:?}"))
}

/// Baton-side consolidation: a fact is confirmed only when every
/// participating agent lists it as common; a variable yields a disjunction
/// only when every participating agent contributed at least one value for it.
fn intersect(
    contributions: &[(Vec<Fact>, Vec<(VarId, Vec<ValId>)>)],
) -> (Vec<Fact>, Vec<(VarId, Vec<ValId>)>) {
    if contributions.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let mut singles: Vec<Fact> = contributions[0]
        .0
        .iter()
        .filter(|f| contributions[1..].iter().all(|(c, _)| c.contains(f)))
        .copied()
        .collect();
    singles.sort();

    let mut disjunctions = Vec::new();
    let vars: BTreeSet<VarId> = contributions
        .iter()
        .flat_map(|(_, d)| d.iter().map(|(v, _)| *v))
        .collect();
    for var in vars {
        if singles.iter().any(|f| f.var == var) {
            continue;
        }
        // An agent's stake in `var` is its grouped uncommon values plus any
        // value it listed as common for that variable.
        let per_agent: Vec<BTreeSet<ValId>> = contributions
            .iter()
            .map(|(common, disj)| {
                let mut vals: BTreeSet<ValId> = disj
                    .iter()
                    .filter(|(v, _)| *v == var)
                    .flat_map(|(_, vs)| vs.iter().copied())
                    .collect();
                vals.extend(common.iter().filter(|f| f.var == var).map(|f| f.val));
                vals
            })
            .collect();
        if per_agent.iter().any(|s| s.is_empty()) {
            continue;
        }
        let union: Vec<ValId> = per_agent.iter().flatten().copied().sorted().dedup().collect();
        if union.len() >= 2 {
            disjunctions.push((var, union));
        }
    }
    (singles, disjunctions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(var: u32, val: u32) -> Fact {
        Fact {
            var: VarId::from_u32(var),
            val: ValId::from_u32(val),
        }
    }

    #[test]
    fn intersection_keeps_facts_common_to_every_participant() {
        let a = (vec![fact(0, 0), fact(1, 1)], vec![]);
        let b = (vec![fact(0, 0)], vec![]);
        let (singles, disj) = intersect(&[a, b]);
        assert_eq!(singles, vec![fact(0, 0)]);
        assert!(disj.is_empty());
    }

    #[test]
    fn disjunction_needs_a_stake_from_everyone() {
        let v = VarId::from_u32(2);
        let a = (vec![], vec![(v, vec![ValId::from_u32(0)])]);
        let b = (vec![], vec![(v, vec![ValId::from_u32(1)])]);
        let c_empty = (vec![fact(0, 0)], vec![]);

        let (_, with_stakes) = intersect(&[a.clone(), b.clone()]);
        assert_eq!(with_stakes.len(), 1);
        assert_eq!(with_stakes[0].1.len(), 2);

        // An agent contributing nothing for the variable vetoes the disjunction.
        let (_, vetoed) = intersect(&[a, b, c_empty]);
        assert!(vetoed.is_empty());
    }

    #[test]
    fn common_value_counts_toward_the_disjunction_stake() {
        let v = VarId::from_u32(2);
        // One agent found v=0 common to all its producers, the other saw v=0/v=1 split.
        let a = (vec![fact(2, 0)], vec![]);
        let b = (vec![], vec![(v, vec![ValId::from_u32(0), ValId::from_u32(1)])]);
        let (singles, disj) = intersect(&[a, b]);
        // Not common to both, so no single; but both have a stake in v.
        assert!(singles.is_empty());
        assert_eq!(disj, vec![(v, vec![ValId::from_u32(0), ValId::from_u32(1)])]);
    }
}
