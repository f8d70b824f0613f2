//! End-to-end scenarios: every agent runs on its own thread against the
//! in-process transport, exactly as the demo binary drives the planner.

use concord_comm::channel::Network;
use concord_planners::messages::Payload;
use concord_planners::solver::{
    run_planner, Config, NegotiationMode, Planner, PlanningError, SearchListener, SearchMethod,
};
use concord_planning::plan::{FINAL_STEP, INITIAL_STEP};
use concord_planning::{GroundedTask, Plan, StepId, TaskBuilder, World};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn run_all(tasks: &[GroundedTask], config: &Config) -> Vec<Result<Plan, PlanningError>> {
    let world = tasks[0].world();
    let names: Vec<String> = world.agents().map(|a| world.agent_name(a).to_string()).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let transports = Network::in_process::<Payload>(&refs);
    std::thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .iter()
            .zip(transports)
            .map(|(task, mut transport)| {
                let config = config.clone();
                scope.spawn(move || run_planner(task, &mut transport, config))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("agent thread panicked")).collect()
    })
}

/// Observer capturing base-plan announcements and heuristic adjustments.
#[derive(Clone, Default)]
struct Recorder {
    bases: Arc<Mutex<Vec<(u64, String)>>>,
    adjustments: Arc<Mutex<Vec<(String, usize, u32)>>>,
}

impl SearchListener for Recorder {
    fn on_base_plan(&mut self, iteration: u64, name: &str) {
        self.bases.lock().unwrap().push((iteration, name.to_string()));
    }
    fn on_adjustment(&mut self, plan: &str, added: usize, h_land: u32) {
        self.adjustments.lock().unwrap().push((plan.to_string(), added, h_land));
    }
}

fn run_all_recorded(
    tasks: &[GroundedTask],
    config: &Config,
) -> (Vec<Result<Plan, PlanningError>>, Vec<Recorder>) {
    let world = tasks[0].world();
    let names: Vec<String> = world.agents().map(|a| world.agent_name(a).to_string()).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let transports = Network::in_process::<Payload>(&refs);
    let recorders: Vec<Recorder> = tasks.iter().map(|_| Recorder::default()).collect();
    let outcomes = std::thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .iter()
            .zip(transports)
            .zip(recorders.iter())
            .map(|((task, mut transport), recorder)| {
                let config = config.clone();
                let recorder = recorder.clone();
                scope.spawn(move || {
                    Planner::new(task, &mut transport, config)
                        .with_listener(recorder)
                        .run()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("agent thread panicked"))
            .collect::<Vec<_>>()
    });
    (outcomes, recorders)
}

/// One carrier, one truck, one package, two locations.
fn logistics(pkg_initial: &str) -> Vec<GroundedTask> {
    let mut b = TaskBuilder::new();
    let carrier = b.agent("carrier");
    let truck = b.variable("at-truck", &["l1", "l2"], &[carrier]).unwrap();
    let pkg = b.variable("loc-pkg", &["l1", "l2", "truck"], &[carrier]).unwrap();
    b.initial(truck, "l1").unwrap();
    b.initial(pkg, pkg_initial).unwrap();
    b.goal(pkg, "l2").unwrap();
    b.action(carrier, "load", &[(truck, "l1"), (pkg, "l1")], &[(pkg, "truck")])
        .unwrap();
    b.action(carrier, "move", &[(truck, "l1")], &[(truck, "l2")]).unwrap();
    b.action(carrier, "unload", &[(truck, "l2"), (pkg, "truck")], &[(pkg, "l2")])
        .unwrap();
    b.build().unwrap()
}

fn step_names(plan: &Plan) -> Vec<String> {
    plan.linearize().iter().map(|s| s.name.clone()).collect()
}

/// Every causal link on a non-shareable variable must stay within one agent
/// (synthetic steps belong to everyone).
fn assert_links_respect_shareability(plan: &Plan, world: &World) {
    let agent_of: HashMap<StepId, &str> =
        plan.steps.iter().map(|s| (s.index, s.agent.as_str())).collect();
    for link in &plan.causal_links {
        if world.var(link.cond.var).shareable() {
            continue;
        }
        if let (Some(p), Some(c)) = (agent_of.get(&link.producer), agent_of.get(&link.consumer)) {
            assert_eq!(p, c, "private-variable link crosses agents in {}", plan.name);
        }
    }
}

#[test]
fn s1_single_agent_logistics() {
    let tasks = logistics("l1");
    let results = run_all(&tasks, &Config::default());
    let plan = results[0].as_ref().expect("solvable task");
    assert_eq!(step_names(plan), vec!["load", "move", "unload"]);
    assert_eq!(plan.steps.len(), 3);
    assert!(plan.makespan <= 3);
}

#[test]
fn s2_already_solved_task_closes_from_the_initial_state() {
    let tasks = logistics("l2");
    let results = run_all(&tasks, &Config::default());
    let plan = results[0].as_ref().expect("trivially solvable task");
    assert_eq!(plan.steps.len(), 0);
    assert_eq!(plan.makespan, 0);
    // The goal is supported straight from the initial step.
    assert!(plan
        .causal_links
        .iter()
        .any(|l| l.producer == INITIAL_STEP && l.consumer == FINAL_STEP));
}

#[test]
fn s3_unreachable_goal_is_reported_before_search() {
    let mut b = TaskBuilder::new();
    let carrier = b.agent("carrier");
    let truck = b.variable("at-truck", &["l1", "l2"], &[carrier]).unwrap();
    let pkg = b.variable("loc-pkg", &["l1", "l2", "truck"], &[carrier]).unwrap();
    b.initial(truck, "l2").unwrap();
    b.initial(pkg, "l1").unwrap();
    b.goal(pkg, "l2").unwrap();
    // No way to drive back to l1: loading can never happen.
    b.action(carrier, "load", &[(truck, "l1"), (pkg, "l1")], &[(pkg, "truck")])
        .unwrap();
    b.action(carrier, "unload", &[(truck, "l2"), (pkg, "truck")], &[(pkg, "l2")])
        .unwrap();
    let tasks = b.build().unwrap();
    let results = run_all(&tasks, &Config::default());
    assert!(matches!(results[0], Err(PlanningError::UnreachableGoal(_))));
}

/// Both goals are reachable under delete relaxation but mutually exclusive
/// in reality; the plan space drains without a solution.
#[test]
fn interfering_goals_drain_the_open_list() {
    let mut b = TaskBuilder::new();
    let solo = b.agent("solo");
    let v = b.variable("v", &["x", "y"], &[solo]).unwrap();
    let w = b.variable("w", &["n", "m"], &[solo]).unwrap();
    b.initial(v, "x").unwrap();
    b.initial(w, "n").unwrap();
    b.goal(v, "y").unwrap();
    b.goal(w, "m").unwrap();
    b.action(solo, "f", &[(v, "x"), (w, "n")], &[(v, "y")]).unwrap();
    b.action(solo, "g", &[(v, "x"), (w, "n")], &[(w, "m")]).unwrap();
    let tasks = b.build().unwrap();
    let results = run_all(&tasks, &Config::default());
    assert!(matches!(results[0], Err(PlanningError::UnsolvableProven)));
}

/// Two-agent logistics: a driver moving the truck, a loader moving packages.
fn city() -> Vec<GroundedTask> {
    let mut b = TaskBuilder::new();
    let driver = b.agent("driver");
    let loader = b.agent("loader");
    let both = [driver, loader];
    let truck = b.variable("at-truck", &["depot", "airport"], &both).unwrap();
    let p1 = b.variable("loc-pkg1", &["depot", "airport", "truck"], &both).unwrap();
    let p2 = b.variable("loc-pkg2", &["depot", "airport", "truck"], &both).unwrap();
    // Private to the driver; exercises the shareability boundary.
    let fuel = b.variable("fuel", &["full", "spent"], &[driver]).unwrap();
    b.initial(truck, "depot").unwrap();
    b.initial(p1, "depot").unwrap();
    b.initial(p2, "depot").unwrap();
    b.initial(fuel, "full").unwrap();
    b.goal(p1, "airport").unwrap();
    b.goal(p2, "airport").unwrap();
    b.action(
        driver,
        "drive-to-airport",
        &[(truck, "depot"), (fuel, "full")],
        &[(truck, "airport")],
    )
    .unwrap();
    b.action(driver, "drive-to-depot", &[(truck, "airport")], &[(truck, "depot")])
        .unwrap();
    for (pkg, tag) in [(p1, "pkg1"), (p2, "pkg2")] {
        b.action(
            loader,
            &format!("load-{tag}"),
            &[(truck, "depot"), (pkg, "depot")],
            &[(pkg, "truck")],
        )
        .unwrap();
        b.action(
            loader,
            &format!("unload-{tag}"),
            &[(truck, "airport"), (pkg, "truck")],
            &[(pkg, "airport")],
        )
        .unwrap();
    }
    b.build().unwrap()
}

#[test]
fn s4_two_agents_agree_on_one_plan() {
    let tasks = city();
    let (results, recorders) = run_all_recorded(&tasks, &Config::default());
    let plans: Vec<&Plan> = results
        .iter()
        .map(|r| r.as_ref().expect("solvable two-agent task"))
        .collect();

    // Same plan, by name and by content, on both agents.
    assert_eq!(plans[0].name, plans[1].name);
    assert_eq!(step_names(plans[0]), step_names(plans[1]));
    assert_eq!(plans[0].makespan, plans[1].makespan);

    // The solution mixes both agents' actions.
    let names = step_names(plans[0]);
    for expected in ["load-pkg1", "load-pkg2", "drive-to-airport", "unload-pkg1", "unload-pkg2"] {
        assert!(names.contains(&expected.to_string()), "missing {expected}");
    }
    assert_eq!(plans[0].steps.len(), 5);

    let world = tasks[0].world();
    assert_links_respect_shareability(plans[0], world);

    // Every iteration selected the same base plan on both agents.
    let b0 = recorders[0].bases.lock().unwrap().clone();
    let b1 = recorders[1].bases.lock().unwrap().clone();
    assert_eq!(b0, b1);
}

/// A landmark only the consumer side verified: the producer proposes the
/// achieving step without noticing, and the baton-merged adjustment lowers
/// the proposal's landmark count by exactly one on every agent.
#[test]
fn s6_cross_agent_landmark_adjustment() {
    let mut b = TaskBuilder::new();
    let user = b.agent("user");
    let maker = b.agent("maker");
    let both = [user, maker];
    let s = b.variable("prepared", &["no", "yes"], &both).unwrap();
    let g = b.variable("done", &["no", "yes"], &both).unwrap();
    b.initial(s, "no").unwrap();
    b.initial(g, "no").unwrap();
    b.goal(g, "yes").unwrap();
    b.action(maker, "prepare", &[(s, "no")], &[(s, "yes")]).unwrap();
    b.action(user, "finish", &[(s, "yes")], &[(g, "yes")]).unwrap();
    let tasks = b.build().unwrap();

    let (results, recorders) = run_all_recorded(&tasks, &Config::default());
    for r in &results {
        assert!(r.is_ok(), "task should be solvable: {r:?}");
    }

    let a0 = recorders[0].adjustments.lock().unwrap().clone();
    let a1 = recorders[1].adjustments.lock().unwrap().clone();
    // The merged adjustment is applied identically everywhere.
    assert_eq!(a0, a1);
    assert!(
        a0.iter().any(|(_, added, _)| *added == 1),
        "expected a one-landmark adjustment, got {a0:?}"
    );
}

#[test]
fn replaying_the_same_task_yields_the_same_plan() {
    let first = run_all(&logistics("l1"), &Config::default());
    let second = run_all(&logistics("l1"), &Config::default());
    let p1 = first[0].as_ref().unwrap();
    let p2 = second[0].as_ref().unwrap();
    assert_eq!(p1.name, p2.name);
    assert_eq!(step_names(p1), step_names(p2));
}

#[test]
fn solution_linearization_is_stable_and_respects_orderings() {
    let tasks = city();
    let results = run_all(&tasks, &Config::default());
    let plan = results[0].as_ref().unwrap();
    assert_eq!(step_names(plan), step_names(plan));
    let time_of: HashMap<StepId, u32> = plan.steps.iter().map(|s| (s.index, s.time)).collect();
    for &(before, after) in &plan.orderings {
        if let (Some(&tb), Some(&ta)) = (time_of.get(&before), time_of.get(&after)) {
            assert!(tb < ta, "ordering {before:?} < {after:?} violated: {tb} vs {ta}");
        }
    }
}

fn flip_task(threshold: f64) -> Vec<GroundedTask> {
    let mut b = TaskBuilder::new();
    let solo = b.agent("solo");
    let v = b.variable("v", &["x", "y"], &[solo]).unwrap();
    b.initial(v, "x").unwrap();
    b.goal(v, "y").unwrap();
    b.action(solo, "flip", &[(v, "x")], &[(v, "y")]).unwrap();
    let cost = b.condition(v, "y").unwrap();
    b.metric(solo, threshold, vec![(cost, 1.0)]);
    b.build().unwrap()
}

#[test]
fn borda_accepts_with_a_satisfied_metric() {
    let config = Config {
        negotiation: NegotiationMode::Borda,
        ..Config::default()
    };
    let results = run_all(&flip_task(1.0), &config);
    let plan = results[0].as_ref().expect("metric within threshold");
    assert_eq!(step_names(plan), vec!["flip"]);
}

#[test]
fn borda_rejects_every_solution_when_the_metric_is_exceeded() {
    // Reaching the goal costs 1.0, which exceeds the threshold: the single
    // agent vetoes every candidate and the plan space drains.
    let config = Config {
        negotiation: NegotiationMode::Borda,
        ..Config::default()
    };
    let results = run_all(&flip_task(0.5), &config);
    assert!(matches!(results[0], Err(PlanningError::UnsolvableProven)));
}

#[test]
fn iterative_deepening_finds_the_same_logistics_plan() {
    let config = Config {
        search: SearchMethod::IdaStar,
        ..Config::default()
    };
    let results = run_all(&logistics("l1"), &config);
    let plan = results[0].as_ref().expect("solvable task");
    assert_eq!(step_names(plan), vec!["load", "move", "unload"]);
}

#[test]
fn zero_timeout_terminates_cooperatively() {
    let config = Config {
        timeout: Some(Duration::ZERO),
        ..Config::default()
    };
    let results = run_all(&logistics("l1"), &config);
    assert!(matches!(results[0], Err(PlanningError::Timeout)));
}
