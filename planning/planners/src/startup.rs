//! Start-up synchronization: shared-DTG merge and distributed relaxed-graph
//! construction.
//!
//! Both phases are deterministic all-to-all rounds: every agent sends
//! exactly one message per round, so nobody needs the baton to know when a
//! round is complete.

use crate::messages::{recv_kind, Payload, PayloadKind, RpgLayerMsg};
use crate::solver::PlanningError;
use concord_comm::Transport;
use concord_planning::dtg::DtgSet;
use concord_planning::rpg::RelaxedPlanningGraph;
use concord_planning::{Fact, GroundedTask};

/// Exchanges the transition edges of shareable variables and recomputes the
/// merged distances.
pub fn share_dtgs<T: Transport<Payload>>(
    task: &GroundedTask,
    dtgs: &mut DtgSet,
    transport: &mut T,
) -> Result<(), PlanningError> {
    let edges = dtgs.shareable_edges(task);
    transport.broadcast(Payload::DtgEdges(edges))?;
    for peer in transport.others() {
        match recv_kind(transport, peer, PayloadKind::DtgEdges)? {
            Payload::DtgEdges(edges) => dtgs.absorb(&edges),
            _ => unreachable!(),
        }
    }
    dtgs.recompute();
    Ok(())
}

/// Builds the relaxed planning graph in lockstep layers: after each layer,
/// every agent broadcasts the shareable facts it just reached and absorbs
/// everyone else's. The build ends on the first layer where no agent (local
/// or remote) contributed anything new.
pub fn build_rpg<T: Transport<Payload>>(
    task: &GroundedTask,
    transport: &mut T,
) -> Result<RelaxedPlanningGraph, PlanningError> {
    let world = task.world();
    let mut rpg = RelaxedPlanningGraph::seed(task);
    loop {
        let new = rpg.advance(task);
        let shareable: Vec<Fact> = new
            .iter()
            .copied()
            .filter(|f| world.var(f.var).shareable())
            .collect();
        transport.broadcast(Payload::RpgLayer(RpgLayerMsg { facts: shareable }))?;

        let mut progress = !new.is_empty();
        for peer in transport.others() {
            match recv_kind(transport, peer, PayloadKind::RpgLayer)? {
                Payload::RpgLayer(msg) => {
                    progress |= !msg.facts.is_empty();
                    for fact in msg.facts {
                        if task.knows(fact.var) {
                            rpg.inject(task, fact);
                        }
                    }
                }
                _ => unreachable!(),
            }
        }
        if !progress {
            return Ok(rpg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_comm::channel::Network;
    use concord_planning::{Condition, TaskBuilder};

    #[test]
    fn two_agents_close_the_relaxed_graph_together() {
        let mut b = TaskBuilder::new();
        let a1 = b.agent("maker");
        let a2 = b.agent("user");
        let v = b.variable("v", &["x", "y"], &[a1, a2]).unwrap();
        let w = b.variable("w", &["n", "m"], &[a1, a2]).unwrap();
        b.initial(v, "x").unwrap();
        b.initial(w, "n").unwrap();
        b.goal(w, "m").unwrap();
        b.action(a1, "mk-y", &[(v, "x")], &[(v, "y")]).unwrap();
        b.action(a2, "use-y", &[(v, "y")], &[(w, "m")]).unwrap();
        let tasks = b.build().unwrap();

        let mut net = Network::in_process::<Payload>(&["maker", "user"]);
        let mut t2 = net.pop().unwrap();
        let mut t1 = net.pop().unwrap();
        let goal = tasks[0].global_goals()[0];
        let handles = std::thread::scope(|s| {
            let task1 = &tasks[0];
            let task2 = &tasks[1];
            let h1 = s.spawn(move || build_rpg(task1, &mut t1).unwrap());
            let h2 = s.spawn(move || build_rpg(task2, &mut t2).unwrap());
            (h1.join().unwrap(), h2.join().unwrap())
        });
        let (r1, r2) = handles;
        let l1 = r1.cond_level(&tasks[0], goal);
        let l2 = r2.cond_level(&tasks[1], goal);
        assert_eq!(l1, Some(2));
        assert_eq!(l2, l1);
    }

    #[test]
    fn unreachable_goal_has_no_level() {
        let mut b = TaskBuilder::new();
        let a1 = b.agent("solo");
        let v = b.variable("v", &["x", "y"], &[a1]).unwrap();
        b.initial(v, "x").unwrap();
        b.goal(v, "y").unwrap();
        let tasks = b.build().unwrap();
        let mut net = Network::in_process::<Payload>(&["solo"]);
        let mut t = net.pop().unwrap();
        let rpg = build_rpg(&tasks[0], &mut t).unwrap();
        let goal: Condition = tasks[0].global_goals()[0];
        assert_eq!(rpg.cond_level(&tasks[0], goal), None);
    }
}
