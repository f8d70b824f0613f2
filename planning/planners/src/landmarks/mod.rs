//! Landmark graphs.
//!
//! A landmark is a fact (or a disjunction of facts over one variable) that
//! must be established at some point in every solution plan. Each agent
//! holds the subgraph it can observe; a globally agreed integer id makes the
//! landmark count and achievement bit-vectors comparable across agents.

pub mod build;

use crate::messages::LandmarkLabel;
use concord_collections::ref_store::RefStore;
use concord_planning::{Fact, FactId, World};
use std::collections::HashMap;

concord_collections::ref_type!(LmId);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OrderKind {
    /// Removing the producers of the source provably blocks the target in
    /// the relaxed graph.
    Necessary,
    /// Heuristic ordering; never used to prune, only to inform.
    Reasonable,
}

pub struct LandmarkNode {
    pub label: LandmarkLabel,
    pub facts: Vec<Fact>,
    /// Layer of the relaxed graph the backward extraction reached it at.
    pub level: u32,
    pub is_goal: bool,
    pub global: Option<u32>,
}

impl LandmarkNode {
    pub fn is_single(&self) -> bool {
        self.facts.len() == 1
    }
}

pub struct LandmarkGraph {
    nodes: RefStore<LmId, LandmarkNode>,
    by_label: HashMap<LandmarkLabel, LmId>,
    edges: Vec<(LmId, LmId, OrderKind)>,
    /// Landmarks containing each fact, for achievement marking.
    by_fact: HashMap<FactId, Vec<LmId>>,
    /// Number of globally indexed landmarks across all agents, i.e. the
    /// width of every achievement bit-vector.
    total_global: usize,
}

impl Default for LandmarkGraph {
    fn default() -> Self {
        LandmarkGraph {
            nodes: RefStore::new(),
            by_label: HashMap::new(),
            edges: Vec::new(),
            by_fact: HashMap::new(),
            total_global: 0,
        }
    }
}

impl LandmarkGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a landmark, deduplicating by label. Returns the node id either way.
    pub fn add_node(&mut self, world: &World, label: LandmarkLabel, level: u32, is_goal: bool) -> LmId {
        if let Some(&id) = self.by_label.get(&label) {
            return id;
        }
        let facts: Vec<Fact> = label.facts().collect();
        let id = self.nodes.push(LandmarkNode {
            label: label.clone(),
            facts,
            level,
            is_goal,
            global: None,
        });
        for fact in label.facts() {
            self.by_fact.entry(world.fact_id(fact)).or_default().push(id);
        }
        self.by_label.insert(label, id);
        id
    }

    pub fn lookup(&self, label: &LandmarkLabel) -> Option<LmId> {
        self.by_label.get(label).copied()
    }

    pub fn node(&self, id: LmId) -> &LandmarkNode {
        &self.nodes[id]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (LmId, &LandmarkNode)> {
        self.nodes.entries()
    }

    pub fn add_edge(&mut self, from: LmId, to: LmId, kind: OrderKind) {
        if from != to && !self.edges.iter().any(|&(f, t, k)| (f, t, k) == (from, to, kind)) {
            self.edges.push((from, to, kind));
        }
    }

    pub fn remove_edge(&mut self, from: LmId, to: LmId) {
        self.edges.retain(|&(f, t, _)| (f, t) != (from, to));
    }

    pub fn edges(&self) -> impl Iterator<Item = (LmId, LmId, OrderKind)> + '_ {
        self.edges.iter().copied()
    }

    pub fn set_global(&mut self, id: LmId, global: u32) {
        self.nodes[id].global = Some(global);
    }

    /// Nodes of this agent still lacking a global id, in insertion order.
    pub fn unindexed(&self) -> Vec<LmId> {
        self.nodes
            .entries()
            .filter(|(_, n)| n.global.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn set_total_global(&mut self, total: usize) {
        self.total_global = total;
    }

    pub fn total_global(&self) -> usize {
        self.total_global
    }

    /// Marks, in `achieved`, every globally indexed landmark some member of
    /// which is asserted by `effects`.
    pub fn mark_achieved(&self, world: &World, effects: &[Fact], achieved: &mut fixedbitset::FixedBitSet) {
        for &eff in effects {
            if let Some(nodes) = self.by_fact.get(&world.fact_id(eff)) {
                for &id in nodes {
                    if let Some(g) = self.nodes[id].global {
                        achieved.insert(g as usize);
                    }
                }
            }
        }
    }

    /// Global ids newly achieved by `effects` with respect to `already`.
    pub fn newly_achieved(
        &self,
        world: &World,
        effects: &[Fact],
        already: &fixedbitset::FixedBitSet,
    ) -> Vec<u32> {
        let mut out = Vec::new();
        for &eff in effects {
            if let Some(nodes) = self.by_fact.get(&world.fact_id(eff)) {
                for &id in nodes {
                    if let Some(g) = self.nodes[id].global {
                        if !already.contains(g as usize) && !out.contains(&g) {
                            out.push(g);
                        }
                    }
                }
            }
        }
        out
    }
}
