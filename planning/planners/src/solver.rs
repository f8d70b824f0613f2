//! Planner entry point: configuration, result sentinels and the phase
//! sequence every agent runs (start-up exchanges, landmark extraction,
//! distributed search).

use crate::landmarks;
use crate::messages::Payload;
use crate::search::outer::OuterSearch;
use crate::startup;
use concord_comm::{CommError, Transport};
use concord_planning::dtg::DtgSet;
use concord_planning::rpg::RelaxedPlanningGraph;
use concord_planning::{GroundedTask, Plan};
use std::time::Duration;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum NegotiationMode {
    /// Any flaw-free plan closing the goals is a solution.
    #[default]
    Cooperative,
    /// Solutions additionally pass a metric vote: the baton accepts iff
    /// strictly more than half of the agents approve.
    Borda,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum SearchMethod {
    #[default]
    AStar,
    /// A* with an insertion bound on `2·h_dtg + g`, raised cooperatively
    /// when every agent's queues drain.
    IdaStar,
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub negotiation: NegotiationMode,
    pub search: SearchMethod,
    /// Cooperative wall-clock limit, polled at the top of each outer iteration.
    pub timeout: Option<Duration>,
    pub max_iterations: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum PlanningError {
    #[error("goal `{0}` is unreachable in the relaxed planning graph")]
    UnreachableGoal(String),
    #[error("unsupported task feature: {0}")]
    UnsupportedFeature(String),
    /// Every open list drained without an accepted solution.
    #[error("the task was proven unsolvable")]
    UnsolvableProven,
    #[error("search timed out")]
    Timeout,
    /// A message arrived under the wrong protocol phase. Not recoverable.
    #[error("baton protocol violated: {0}")]
    BatonDesync(String),
    /// Transport failures surface to the caller as internal errors.
    #[error("transport failure: {0}")]
    Transport(#[from] CommError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Observer port for trace events. All hooks default to no-ops; the core
/// never depends on a listener being present.
pub trait SearchListener {
    fn on_landmarks(&mut self, _total: usize) {}
    fn on_base_plan(&mut self, _iteration: u64, _name: &str) {}
    fn on_proposals(&mut self, _iteration: u64, _own: usize, _received: usize) {}
    /// A baton-merged heuristic adjustment landed on a plan.
    fn on_adjustment(&mut self, _plan: &str, _added: usize, _h_land: u32) {}
    fn on_solution(&mut self, _name: &str) {}
}

/// Listener used when no observer is attached.
pub struct NullListener;

impl SearchListener for NullListener {}

/// One agent's planner, parameterized by its task, transport and
/// configuration. No process-wide state: everything the search touches
/// hangs off this value.
pub struct Planner<'a, T> {
    task: &'a GroundedTask,
    transport: &'a mut T,
    config: Config,
    listener: Box<dyn SearchListener + Send + 'a>,
}

impl<'a, T: Transport<Payload>> Planner<'a, T> {
    pub fn new(task: &'a GroundedTask, transport: &'a mut T, config: Config) -> Self {
        Planner {
            task,
            transport,
            config,
            listener: Box::new(NullListener),
        }
    }

    pub fn with_listener(mut self, listener: impl SearchListener + Send + 'a) -> Self {
        self.listener = Box::new(listener);
        self
    }

    /// Runs the agent to completion. Blocks until a solution is agreed on,
    /// the task is proven unsolvable, or a terminal condition fires.
    pub fn run(mut self) -> Result<Plan, PlanningError> {
        let span = tracing::info_span!("agent", name = self.task.agent_name());
        let _enter = span.enter();

        // Receives hang slightly longer than the cooperative deadline so the
        // baton's termination broadcast can still arrive.
        let recv_limit = self.config.timeout.map(|t| t + Duration::from_secs(30));
        self.transport.set_recv_timeout(recv_limit);

        let mut dtgs = DtgSet::build(self.task);
        startup::share_dtgs(self.task, &mut dtgs, self.transport)?;
        let rpg = startup::build_rpg(self.task, self.transport)?;

        for &goal in self.task.global_goals() {
            if rpg.cond_level(self.task, goal).is_none() {
                return Err(PlanningError::UnreachableGoal(
                    self.task.world().display_cond(goal),
                ));
            }
        }

        let graph = landmarks::build::build_landmark_graph(self.task, &rpg, self.transport)?;
        self.listener.on_landmarks(graph.total_global());
        tracing::debug!(
            landmarks = graph.total_global(),
            orderings = graph.num_edges(),
            "landmark graph ready"
        );

        OuterSearch::new(self.task, &dtgs, &graph, self.transport, &self.config)
            .run(self.listener.as_mut())
    }
}

/// Library-call form of the planner, as adapters are expected to use it.
pub fn run_planner<T: Transport<Payload>>(
    task: &GroundedTask,
    transport: &mut T,
    config: Config,
) -> Result<Plan, PlanningError> {
    Planner::new(task, transport, config).run()
}

/// Saturates a local relaxed graph without peer exchange. Exposed for tests
/// and single-process tooling.
pub fn local_rpg(task: &GroundedTask) -> RelaxedPlanningGraph {
    let mut rpg = RelaxedPlanningGraph::seed(task);
    while !rpg.advance(task).is_empty() {}
    rpg
}
