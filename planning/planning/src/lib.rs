//! Task model and plan representation of the multi-agent partial-order planner.
//!
//! A planning problem is a set of finite-domain state variables, a set of
//! grounded actions partitioned among agents, an initial assignment and a
//! conjunction of global goals. Each agent owns a [`task::GroundedTask`]:
//! its private projection of the problem, restricted to the variables it may
//! observe. On top of the task sit the per-variable domain transition graphs
//! ([`dtg`]), the delete-relaxed planning graph ([`rpg`]) and the
//! partial-order plan model ([`plan`]) shared by the search engines.

pub mod dtg;
pub mod plan;
pub mod rpg;
pub mod task;

pub use plan::{CausalLink, Plan, PlanId, PlanNode, PlanSpace, PlanStep, PlanView, Step, StepId};
pub use task::{Action, ActionId, CondKind, Condition, Fact, FactId, GroundedTask, TaskBuilder, ValId, VarId, World};
