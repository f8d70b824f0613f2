//! Delete-relaxed planning graph.
//!
//! Built forward from the initial state in lockstep rounds: one literal
//! layer per round, so that facts learned from other agents between rounds
//! slot in at a level every participant agrees on. Facts first reached by a
//! peer are marked *external*: they stay given under any removal of local
//! actions, which keeps the landmark verifiers purely agent-local.

use crate::task::{ActionId, CondKind, Condition, Fact, FactId, GroundedTask};
use concord_collections::ref_store::RefMap;
use fixedbitset::FixedBitSet;

pub struct RelaxedPlanningGraph {
    /// First literal layer where each fact appears; `None` = unreachable.
    fact_level: Vec<Option<u32>>,
    /// Facts first reached through another agent's broadcast.
    external: FixedBitSet,
    /// First action layer where each own action fires.
    action_level: RefMap<ActionId, u32>,
    applied: FixedBitSet,
    /// Last completed literal layer.
    level: u32,
}

impl RelaxedPlanningGraph {
    /// Layer 0: the agent's view of the initial state.
    pub fn seed(task: &GroundedTask) -> RelaxedPlanningGraph {
        let world = task.world();
        let mut rpg = RelaxedPlanningGraph {
            fact_level: vec![None; world.num_facts()],
            external: FixedBitSet::with_capacity(world.num_facts()),
            action_level: Default::default(),
            applied: FixedBitSet::with_capacity(task.num_actions()),
            level: 0,
        };
        for &f in task.initial_state() {
            rpg.fact_level[usize::from(world.fact_id(f))] = Some(0);
        }
        rpg
    }

    pub fn current_level(&self) -> u32 {
        self.level
    }

    pub fn fact_level(&self, fact: FactId) -> Option<u32> {
        self.fact_level[usize::from(fact)]
    }

    /// Level at which a condition first becomes satisfiable.
    pub fn cond_level(&self, task: &GroundedTask, cond: Condition) -> Option<u32> {
        let world = task.world();
        match cond.kind {
            CondKind::Equal => self.fact_level(world.fact_id(Fact {
                var: cond.var,
                val: cond.val,
            })),
            CondKind::Distinct => world
                .facts_of(cond.var)
                .filter(|&f| world.fact(f).val != cond.val)
                .filter_map(|f| self.fact_level(f))
                .min(),
        }
    }

    pub fn action_level(&self, action: ActionId) -> Option<u32> {
        self.action_level.get(action).copied()
    }

    /// Expands one layer: every own action whose preconditions are satisfiable
    /// at the current level fires; effects not yet reached land on the next
    /// literal layer. Returns the newly reached facts.
    pub fn advance(&mut self, task: &GroundedTask) -> Vec<Fact> {
        let world = task.world();
        let next = self.level + 1;
        let mut new = Vec::new();
        for (id, action) in task.actions() {
            if self.applied.contains(usize::from(id)) {
                continue;
            }
            let applicable = action
                .pre
                .iter()
                .all(|&c| self.cond_level(task, c).is_some_and(|l| l <= self.level));
            if !applicable {
                continue;
            }
            self.applied.insert(usize::from(id));
            self.action_level.insert(id, self.level);
            for &eff in &action.eff {
                let fact = world.fact_id(eff);
                if self.fact_level[usize::from(fact)].is_none() {
                    self.fact_level[usize::from(fact)] = Some(next);
                    new.push(eff);
                }
            }
        }
        self.level = next;
        new
    }

    /// Records a fact reached by a peer during the current round.
    pub fn inject(&mut self, task: &GroundedTask, fact: Fact) {
        let id = usize::from(task.world().fact_id(fact));
        if self.fact_level[id].is_none() {
            self.fact_level[id] = Some(self.level);
            self.external.insert(id);
        }
    }

    /// Earliest layer at which `var` can take `val`; `None` when unreachable.
    pub fn min_time(
        &self,
        task: &GroundedTask,
        var: crate::task::VarId,
        val: crate::task::ValId,
    ) -> Option<u32> {
        self.fact_level(task.world().fact_id(Fact { var, val }))
    }

    /// Values of `var` with a level, i.e. reachable under delete relaxation.
    pub fn reachable_values<'a>(
        &'a self,
        task: &'a GroundedTask,
        var: crate::task::VarId,
    ) -> impl Iterator<Item = Fact> + 'a {
        let world = task.world();
        world
            .facts_of(var)
            .filter(|&f| self.fact_level(f).is_some())
            .map(|f| world.fact(f))
    }

    /// Own actions producing `fact` at the layer right below it. These are
    /// the producers the landmark extraction walks backward through.
    pub fn producers(&self, task: &GroundedTask, fact: Fact) -> Vec<ActionId> {
        let id = task.world().fact_id(fact);
        let Some(level) = self.fact_level(id) else {
            return Vec::new();
        };
        task.achievers(id)
            .iter()
            .copied()
            .filter(|&a| self.action_level(a).is_some_and(|l| l < level))
            .collect()
    }

    /// Relaxed fixpoint with `excluded` own actions removed. Initial facts
    /// remain given; so do external facts, except the `suppressed` ones:
    /// verification of a fact must also withdraw its provision by peers, or a
    /// non-producing agent could never prove anything about it.
    pub fn reached_without(
        &self,
        task: &GroundedTask,
        excluded: &[ActionId],
        suppressed: &[FactId],
    ) -> FixedBitSet {
        let world = task.world();
        let mut reached = FixedBitSet::with_capacity(world.num_facts());
        for (i, level) in self.fact_level.iter().enumerate() {
            let suppressed = suppressed.iter().any(|&f| usize::from(f) == i);
            if *level == Some(0) || (self.external.contains(i) && !suppressed) {
                reached.insert(i);
            }
        }
        let mut banned = FixedBitSet::with_capacity(task.num_actions());
        for &a in excluded {
            banned.insert(usize::from(a));
        }
        let mut fired = banned.clone();
        let mut again = true;
        while again {
            again = false;
            for (id, action) in task.actions() {
                if fired.contains(usize::from(id)) {
                    continue;
                }
                if action.pre.iter().all(|&c| satisfied_in(world, &reached, c)) {
                    fired.insert(usize::from(id));
                    for &eff in &action.eff {
                        let f = usize::from(world.fact_id(eff));
                        if !reached.contains(f) {
                            reached.insert(f);
                            again = true;
                        }
                    }
                }
            }
        }
        reached
    }

    /// True iff removing every own producer of `fact` (and its provision by
    /// peers) makes some goal unreachable in the relaxed graph.
    pub fn verify_single_landmark(&self, task: &GroundedTask, fact: Fact) -> bool {
        let id = task.world().fact_id(fact);
        let reached = self.reached_without(task, task.achievers(id), &[id]);
        task.global_goals()
            .iter()
            .any(|&g| !satisfied_in(task.world(), &reached, g))
    }

    /// True iff removing `excluded` makes every member of the consumer
    /// landmark unreachable.
    pub fn verify_edge(&self, task: &GroundedTask, excluded: &[ActionId], members: &[Fact]) -> bool {
        let world = task.world();
        let suppressed: Vec<FactId> = members.iter().map(|&m| world.fact_id(m)).collect();
        let reached = self.reached_without(task, excluded, &suppressed);
        members
            .iter()
            .all(|&m| !reached.contains(usize::from(world.fact_id(m))))
    }
}

fn satisfied_in(world: &crate::task::World, reached: &FixedBitSet, cond: Condition) -> bool {
    match cond.kind {
        CondKind::Equal => reached.contains(usize::from(world.fact_id(Fact {
            var: cond.var,
            val: cond.val,
        }))),
        CondKind::Distinct => world
            .facts_of(cond.var)
            .any(|f| world.fact(f).val != cond.val && reached.contains(usize::from(f))),
    }
}
