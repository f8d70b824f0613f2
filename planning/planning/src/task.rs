//! Grounded multi-agent planning tasks.
//!
//! All names are resolved to global integer codes at construction time; the
//! search core never manipulates strings. Variables carry a *shareability*
//! set: the agents allowed to observe (and therefore support or threaten)
//! assignments of that variable.

use concord_collections::ref_store::{RefMap, RefPool, RefStore};
use concord_comm::AgentId;
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

concord_collections::ref_type!(VarId);
concord_collections::ref_type!(ValId);
concord_collections::ref_type!(ActionId);

/// Dense index of a `(variable, value)` pair, usable in bitsets.
concord_collections::ref_type!(FactId);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum CondKind {
    Equal,
    Distinct,
}

/// An assignment `var := val`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct Fact {
    pub var: VarId,
    pub val: ValId,
}

/// A test on a state variable: equality or disequality with a value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub var: VarId,
    pub val: ValId,
    pub kind: CondKind,
}

impl Condition {
    pub fn equal(var: VarId, val: ValId) -> Condition {
        Condition {
            var,
            val,
            kind: CondKind::Equal,
        }
    }

    pub fn distinct(var: VarId, val: ValId) -> Condition {
        Condition {
            var,
            val,
            kind: CondKind::Distinct,
        }
    }

    /// The fact asserted by this condition, for equality conditions.
    pub fn fact(self) -> Option<Fact> {
        match self.kind {
            CondKind::Equal => Some(Fact {
                var: self.var,
                val: self.val,
            }),
            CondKind::Distinct => None,
        }
    }

    pub fn satisfied_by(self, actual: ValId) -> bool {
        match self.kind {
            CondKind::Equal => actual == self.val,
            CondKind::Distinct => actual != self.val,
        }
    }
}

/// A finite-domain state variable and the agents that may observe it.
pub struct Variable {
    pub name: String,
    pub domain: Vec<ValId>,
    observers: FixedBitSet,
}

impl Variable {
    pub fn observed_by(&self, agent: AgentId) -> bool {
        self.observers.contains(usize::from(agent))
    }

    pub fn observers(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.observers.ones().map(AgentId::from)
    }

    /// A variable is shareable when more than one agent can observe it.
    pub fn shareable(&self) -> bool {
        self.observers.count_ones(..) > 1
    }
}

/// The global tables agreed between agents before search: agent order,
/// variable and value codes, per-variable domains and fact indexing.
/// Immutable once built.
pub struct World {
    agent_names: Vec<String>,
    vars: RefStore<VarId, Variable>,
    vals: RefPool<ValId, String>,
    /// First `FactId` of each variable's domain, indexed by variable.
    fact_base: Vec<u32>,
    fact_count: usize,
}

impl World {
    pub fn num_agents(&self) -> usize {
        self.agent_names.len()
    }

    pub fn agents(&self) -> impl Iterator<Item = AgentId> {
        (0..self.num_agents()).map(AgentId::from)
    }

    pub fn agent_name(&self, agent: AgentId) -> &str {
        &self.agent_names[usize::from(agent)]
    }

    pub fn variables(&self) -> impl Iterator<Item = VarId> {
        self.vars.keys()
    }

    pub fn var(&self, var: VarId) -> &Variable {
        &self.vars[var]
    }

    pub fn value_name(&self, val: ValId) -> &str {
        &self.vals[val]
    }

    pub fn num_facts(&self) -> usize {
        self.fact_count
    }

    /// Dense index of `fact`; the value must belong to the variable's domain.
    pub fn fact_id(&self, fact: Fact) -> FactId {
        let var = &self.vars[fact.var];
        let pos = var
            .domain
            .iter()
            .position(|&v| v == fact.val)
            .expect("value outside of the variable's domain");
        FactId::from_u32(self.fact_base[usize::from(fact.var)] + pos as u32)
    }

    pub fn fact(&self, id: FactId) -> Fact {
        let raw = id.to_u32();
        // fact_base is sorted by construction
        let var_idx = match self.fact_base.binary_search(&raw) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let var = VarId::from(var_idx);
        let pos = (raw - self.fact_base[var_idx]) as usize;
        Fact {
            var,
            val: self.vars[var].domain[pos],
        }
    }

    /// Facts of a single variable, in domain order.
    pub fn facts_of(&self, var: VarId) -> impl Iterator<Item = FactId> + '_ {
        let base = self.fact_base[usize::from(var)];
        (0..self.vars[var].domain.len() as u32).map(move |i| FactId::from_u32(base + i))
    }

    pub fn display_fact(&self, fact: Fact) -> String {
        format!("{}={}", self.vars[fact.var].name, self.vals[fact.val])
    }

    pub fn display_cond(&self, c: Condition) -> String {
        let op = match c.kind {
            CondKind::Equal => "=",
            CondKind::Distinct => "!=",
        };
        format!("{}{}{}", self.vars[c.var].name, op, self.vals[c.val])
    }
}

/// A grounded action: preconditions to test, effects to assert.
/// Effects are total assignments of variables writable by the owning agent.
pub struct Action {
    pub name: String,
    pub pre: Vec<Condition>,
    pub eff: Vec<Fact>,
}

impl Action {
    /// The precondition bearing on `var`, if any.
    pub fn pre_on(&self, var: VarId) -> Option<Condition> {
        self.pre.iter().copied().find(|c| c.var == var)
    }

    pub fn writes(&self, var: VarId) -> bool {
        self.eff.iter().any(|e| e.var == var)
    }
}

/// Optional plan-acceptance metric: a weighted sum over conditions satisfied
/// in the final state, compared against a per-agent threshold.
pub struct Metric {
    pub threshold: f64,
    pub terms: Vec<(Condition, f64)>,
}

impl Metric {
    pub fn evaluate(&self, state: &HashMap<VarId, ValId>) -> f64 {
        self.terms
            .iter()
            .filter(|(c, _)| state.get(&c.var).is_some_and(|&v| c.satisfied_by(v)))
            .map(|(_, w)| w)
            .sum()
    }
}

/// One agent's private projection of the planning problem. Read-only for the
/// whole search.
pub struct GroundedTask {
    world: Arc<World>,
    agent: AgentId,
    actions: RefStore<ActionId, Action>,
    /// Own actions indexed by asserted fact.
    achievers: RefMap<FactId, Vec<ActionId>>,
    /// This agent's view of the initial state: one fact per observed variable.
    initial: Vec<Fact>,
    goals: Vec<Condition>,
    metric: Option<Metric>,
}

impl GroundedTask {
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn agent_name(&self) -> &str {
        self.world.agent_name(self.agent)
    }

    pub fn actions(&self) -> impl Iterator<Item = (ActionId, &Action)> {
        self.actions.entries()
    }

    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id]
    }

    /// Own actions whose effects assert the given fact.
    pub fn achievers(&self, fact: FactId) -> &[ActionId] {
        self.achievers.get(fact).map_or(&[], |v| v.as_slice())
    }

    pub fn initial_state(&self) -> &[Fact] {
        &self.initial
    }

    pub fn global_goals(&self) -> &[Condition] {
        &self.goals
    }

    pub fn knows(&self, var: VarId) -> bool {
        self.world.var(var).observed_by(self.agent)
    }

    /// Agents allowed to observe the variable of `cond`.
    pub fn shareable(&self, cond: Condition) -> impl Iterator<Item = AgentId> + '_ {
        self.world.var(cond.var).observers()
    }

    pub fn metric(&self) -> Option<&Metric> {
        self.metric.as_ref()
    }

    pub fn metric_threshold(&self) -> Option<f64> {
        self.metric.as_ref().map(|m| m.threshold)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("value `{val}` does not belong to the domain of variable `{var}`")]
    UnknownValue { var: String, val: String },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("action `{action}` of agent `{agent}` writes variable `{var}` it cannot observe")]
    UnwritableVariable {
        action: String,
        agent: String,
        var: String,
    },
    #[error("goal variable `{0}` must be observable by every agent")]
    GoalNotGlobal(String),
    #[error("variable `{0}` has no initial value")]
    MissingInitialValue(String),
    #[error("variable `{0}` declared with an empty domain")]
    EmptyDomain(String),
}

struct ActionSpec {
    agent: AgentId,
    name: String,
    pre: Vec<Condition>,
    eff: Vec<Fact>,
}

/// Programmatic construction of a multi-agent problem and its per-agent
/// projections. This plays the role of the (out-of-scope) parser+grounder:
/// it is the only component that ever sees names instead of codes.
#[derive(Default)]
pub struct TaskBuilder {
    agents: Vec<String>,
    vars: RefStore<VarId, Variable>,
    vals: RefPool<ValId, String>,
    var_by_name: HashMap<String, VarId>,
    initial: HashMap<VarId, ValId>,
    goals: Vec<Condition>,
    actions: Vec<ActionSpec>,
    metrics: HashMap<AgentId, Metric>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn agent(&mut self, name: &str) -> AgentId {
        self.agents.push(name.to_string());
        AgentId::from(self.agents.len() - 1)
    }

    /// Declares a variable with the given domain, observable by `observers`.
    pub fn variable(
        &mut self,
        name: &str,
        domain: &[&str],
        observers: &[AgentId],
    ) -> Result<VarId, TaskError> {
        if domain.is_empty() {
            return Err(TaskError::EmptyDomain(name.to_string()));
        }
        let domain: Vec<ValId> = domain.iter().map(|v| self.vals.intern(v.to_string())).collect();
        let mut mask = FixedBitSet::with_capacity(self.agents.len());
        for &a in observers {
            mask.insert(usize::from(a));
        }
        let var = self.vars.push(Variable {
            name: name.to_string(),
            domain,
            observers: mask,
        });
        self.var_by_name.insert(name.to_string(), var);
        Ok(var)
    }

    pub fn var(&self, name: &str) -> Result<VarId, TaskError> {
        self.var_by_name
            .get(name)
            .copied()
            .ok_or_else(|| TaskError::UnknownVariable(name.to_string()))
    }

    fn value(&self, var: VarId, val: &str) -> Result<ValId, TaskError> {
        let id = self.vals.key_of(val).filter(|&v| self.vars[var].domain.contains(&v));
        id.ok_or_else(|| TaskError::UnknownValue {
            var: self.vars[var].name.clone(),
            val: val.to_string(),
        })
    }

    /// Resolves an equality condition by value name, e.g. for metric terms.
    pub fn condition(&self, var: VarId, val: &str) -> Result<Condition, TaskError> {
        Ok(Condition::equal(var, self.value(var, val)?))
    }

    pub fn initial(&mut self, var: VarId, val: &str) -> Result<(), TaskError> {
        let val = self.value(var, val)?;
        self.initial.insert(var, val);
        Ok(())
    }

    pub fn goal(&mut self, var: VarId, val: &str) -> Result<(), TaskError> {
        let val = self.value(var, val)?;
        self.goals.push(Condition::equal(var, val));
        Ok(())
    }

    /// Declares an action owned by `agent` with equality preconditions.
    pub fn action(
        &mut self,
        agent: AgentId,
        name: &str,
        pre: &[(VarId, &str)],
        eff: &[(VarId, &str)],
    ) -> Result<(), TaskError> {
        let pre = pre
            .iter()
            .map(|&(var, val)| Ok(Condition::equal(var, self.value(var, val)?)))
            .collect::<Result<Vec<_>, TaskError>>()?;
        self.action_with_conditions(agent, name, pre, eff)
    }

    /// General form: arbitrary precondition kinds.
    pub fn action_with_conditions(
        &mut self,
        agent: AgentId,
        name: &str,
        pre: Vec<Condition>,
        eff: &[(VarId, &str)],
    ) -> Result<(), TaskError> {
        let eff = eff
            .iter()
            .map(|&(var, val)| {
                Ok(Fact {
                    var,
                    val: self.value(var, val)?,
                })
            })
            .collect::<Result<Vec<_>, TaskError>>()?;
        for e in &eff {
            if !self.vars[e.var].observed_by(agent) {
                return Err(TaskError::UnwritableVariable {
                    action: name.to_string(),
                    agent: self.agents[usize::from(agent)].clone(),
                    var: self.vars[e.var].name.clone(),
                });
            }
        }
        self.actions.push(ActionSpec {
            agent,
            name: name.to_string(),
            pre,
            eff,
        });
        Ok(())
    }

    pub fn metric(&mut self, agent: AgentId, threshold: f64, terms: Vec<(Condition, f64)>) {
        self.metrics.insert(agent, Metric { threshold, terms });
    }

    /// Finalizes the world tables and produces one task per agent.
    pub fn build(mut self) -> Result<Vec<GroundedTask>, TaskError> {
        // Observer masks were sized as agents were declared; normalize them.
        let num_agents = self.agents.len();
        for var in self.vars.keys().collect::<Vec<_>>() {
            self.vars[var].observers.grow(num_agents);
        }

        let mut fact_base = Vec::with_capacity(self.vars.len());
        let mut count: u32 = 0;
        for var in self.vars.keys() {
            fact_base.push(count);
            count += self.vars[var].domain.len() as u32;
        }

        for g in &self.goals {
            if self.vars[g.var].observers.count_ones(..) != num_agents {
                return Err(TaskError::GoalNotGlobal(self.vars[g.var].name.clone()));
            }
        }
        for var in self.vars.keys() {
            if !self.initial.contains_key(&var) {
                return Err(TaskError::MissingInitialValue(self.vars[var].name.clone()));
            }
        }

        let world = Arc::new(World {
            agent_names: self.agents,
            vars: self.vars,
            vals: self.vals,
            fact_base,
            fact_count: count as usize,
        });

        let mut tasks: Vec<GroundedTask> = world
            .agents()
            .map(|agent| {
                let initial: Vec<Fact> = self
                    .initial
                    .iter()
                    .map(|(&var, &val)| Fact { var, val })
                    .filter(|f| world.var(f.var).observed_by(agent))
                    .collect();
                let mut initial = initial;
                initial.sort();
                GroundedTask {
                    world: world.clone(),
                    agent,
                    actions: RefStore::new(),
                    achievers: Default::default(),
                    initial,
                    goals: self.goals.clone(),
                    metric: self.metrics.remove(&agent),
                }
            })
            .collect();

        for spec in self.actions {
            let task = &mut tasks[usize::from(spec.agent)];
            let id = task.actions.push(Action {
                name: spec.name,
                pre: spec.pre,
                eff: spec.eff,
            });
            for &e in &task.actions[id].eff {
                let fact = world.fact_id(e);
                task.achievers.get_or_insert_with(fact, Vec::new).push(id);
            }
        }
        Ok(tasks)
    }
}

impl fmt::Debug for GroundedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroundedTask")
            .field("agent", &self.agent_name())
            .field("actions", &self.actions.len())
            .field("goals", &self.goals.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One truck, one package, two locations. The smallest task exercising
    /// loading, moving and unloading.
    pub(crate) fn logistics_single() -> Vec<GroundedTask> {
        let mut b = TaskBuilder::new();
        let ag = b.agent("carrier");
        let truck = b.variable("at-truck", &["l1", "l2"], &[ag]).unwrap();
        let pkg = b.variable("loc-pkg", &["l1", "l2", "truck"], &[ag]).unwrap();
        b.initial(truck, "l1").unwrap();
        b.initial(pkg, "l1").unwrap();
        b.goal(pkg, "l2").unwrap();
        b.action(ag, "load", &[(truck, "l1"), (pkg, "l1")], &[(pkg, "truck")])
            .unwrap();
        b.action(ag, "move", &[(truck, "l1")], &[(truck, "l2")]).unwrap();
        b.action(ag, "unload", &[(truck, "l2"), (pkg, "truck")], &[(pkg, "l2")])
            .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn fact_ids_roundtrip() {
        let tasks = logistics_single();
        let world = tasks[0].world();
        for var in world.variables() {
            for &val in &world.var(var).domain {
                let fact = Fact { var, val };
                assert_eq!(world.fact(world.fact_id(fact)), fact);
            }
        }
        assert_eq!(world.num_facts(), 5);
    }

    #[test]
    fn effects_must_be_writable() {
        let mut b = TaskBuilder::new();
        let a1 = b.agent("a1");
        let a2 = b.agent("a2");
        let v = b.variable("v", &["x", "y"], &[a1]).unwrap();
        b.initial(v, "x").unwrap();
        let r = b.action(a2, "poke", &[], &[(v, "y")]);
        assert!(matches!(r, Err(TaskError::UnwritableVariable { .. })));
    }

    #[test]
    fn projections_restrict_initial_state() {
        let mut b = TaskBuilder::new();
        let a1 = b.agent("a1");
        let a2 = b.agent("a2");
        let shared = b.variable("shared", &["x", "y"], &[a1, a2]).unwrap();
        let private = b.variable("private", &["p", "q"], &[a1]).unwrap();
        b.initial(shared, "x").unwrap();
        b.initial(private, "p").unwrap();
        b.goal(shared, "y").unwrap();
        b.action(a1, "flip", &[(shared, "x")], &[(shared, "y")]).unwrap();
        let tasks = b.build().unwrap();
        assert_eq!(tasks[0].initial_state().len(), 2);
        assert_eq!(tasks[1].initial_state().len(), 1);
        assert!(tasks[1].knows(shared));
        assert!(!tasks[1].knows(private));
    }
}
