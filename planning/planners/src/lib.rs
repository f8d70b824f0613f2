//! Cooperative multi-agent partial-order planning.
//!
//! A set of agents, each owning a private projection of a grounded task,
//! jointly builds a partial-order plan: they take turns proposing
//! refinements of a common base plan, exchange the proposals, reconcile
//! their landmark heuristics, and stop when a refinement supports every
//! global goal. Every distributed phase, from relaxed-graph construction to
//! base-plan agreement, is driven by a baton rotating over a fixed agent
//! permutation.
//!
//! The planner is invoked per agent as a library call:
//!
//! ```no_run
//! # fn demo(task: concord_planning::GroundedTask,
//! #         mut transport: concord_comm::channel::ChannelTransport<concord_planners::messages::Payload>) {
//! use concord_planners::solver::{run_planner, Config};
//! let plan = run_planner(&task, &mut transport, Config::default());
//! # let _ = plan;
//! # }
//! ```

pub mod fmt;
pub mod heuristics;
pub mod landmarks;
pub mod messages;
pub mod search;
pub mod solver;
pub mod startup;

pub use solver::{run_planner, Config, NegotiationMode, Planner, PlanningError, SearchMethod};
