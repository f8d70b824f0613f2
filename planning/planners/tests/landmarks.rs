//! Landmark-graph construction, exercised through the public phase
//! functions the planner itself runs.

use concord_comm::channel::Network;
use concord_planners::landmarks::build::build_landmark_graph;
use concord_planners::landmarks::LandmarkGraph;
use concord_planners::messages::{LandmarkLabel, Payload};
use concord_planners::startup::build_rpg;
use concord_planning::{Fact, GroundedTask, TaskBuilder, ValId, VarId};

fn build_graphs(tasks: &[GroundedTask]) -> Vec<LandmarkGraph> {
    let world = tasks[0].world();
    let names: Vec<String> = world.agents().map(|a| world.agent_name(a).to_string()).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let transports = Network::in_process::<Payload>(&refs);
    std::thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .iter()
            .zip(transports)
            .map(|(task, mut transport)| {
                scope.spawn(move || {
                    let rpg = build_rpg(task, &mut transport).unwrap();
                    build_landmark_graph(task, &rpg, &mut transport).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn label(world: &concord_planning::World, var: VarId, pos: usize) -> LandmarkLabel {
    let val: ValId = world.var(var).domain[pos];
    LandmarkLabel::single(Fact { var, val })
}

#[test]
fn single_agent_logistics_landmarks() {
    let mut b = TaskBuilder::new();
    let carrier = b.agent("carrier");
    let truck = b.variable("at-truck", &["l1", "l2"], &[carrier]).unwrap();
    let pkg = b.variable("loc-pkg", &["l1", "l2", "truck"], &[carrier]).unwrap();
    b.initial(truck, "l1").unwrap();
    b.initial(pkg, "l1").unwrap();
    b.goal(pkg, "l2").unwrap();
    b.action(carrier, "load", &[(truck, "l1"), (pkg, "l1")], &[(pkg, "truck")])
        .unwrap();
    b.action(carrier, "move", &[(truck, "l1")], &[(truck, "l2")]).unwrap();
    b.action(carrier, "unload", &[(truck, "l2"), (pkg, "truck")], &[(pkg, "l2")])
        .unwrap();
    let tasks = b.build().unwrap();
    let world = tasks[0].world().clone();

    let graphs = build_graphs(&tasks);
    let g = &graphs[0];

    // Goal, the two unload preconditions, and the two initial facts.
    assert_eq!(g.num_nodes(), 5);
    assert_eq!(g.total_global(), 5);
    let in_truck = g.lookup(&label(&world, pkg, 2)).expect("loc-pkg=truck is a landmark");
    let at_l2 = g.lookup(&label(&world, truck, 1)).expect("at-truck=l2 is a landmark");
    let goal = g.lookup(&label(&world, pkg, 1)).expect("the goal is a landmark");
    assert!(g.edges().any(|(a, b, _)| a == in_truck && b == goal));
    assert!(g.edges().any(|(a, b, _)| a == at_l2 && b == goal));
    // Every node got a global id.
    assert!(g.nodes().all(|(_, n)| n.global.is_some()));
}

/// The producing agent can reach the goal facts through its peer, so its own
/// relaxed graph never proves the intermediate fact necessary: the landmark
/// exists only on the consumer side, while the counter and global indexing
/// stay aligned.
#[test]
fn verification_is_local_and_graphs_diverge() {
    let mut b = TaskBuilder::new();
    let user = b.agent("user");
    let maker = b.agent("maker");
    let both = [user, maker];
    let s = b.variable("prepared", &["no", "yes"], &both).unwrap();
    let done = b.variable("done", &["no", "yes"], &both).unwrap();
    b.initial(s, "no").unwrap();
    b.initial(done, "no").unwrap();
    b.goal(done, "yes").unwrap();
    b.action(maker, "prepare", &[(s, "no")], &[(s, "yes")]).unwrap();
    b.action(user, "finish", &[(s, "yes")], &[(done, "yes")]).unwrap();
    let tasks = b.build().unwrap();
    let world = tasks[0].world().clone();

    let graphs = build_graphs(&tasks);
    let prepared_yes = label(&world, s, 1);

    let user_node = graphs[0].lookup(&prepared_yes);
    assert!(user_node.is_some(), "consumer must verify prepared=yes");
    assert!(
        graphs[1].lookup(&prepared_yes).is_none(),
        "producer reaches the goal through its peer and must not promote"
    );
    // The travelling counter keeps the landmark universe identical.
    assert_eq!(graphs[0].total_global(), graphs[1].total_global());
}
