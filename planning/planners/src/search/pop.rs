//! Plan-space refinement: the internal depth-first search.
//!
//! Given a base plan and a candidate action, produce every threat-free way
//! of adding the action as a new step with all of its preconditions causally
//! supported. Called with no candidate, the same search instead closes the
//! final step: it supports every still-open goal, and its results are
//! solution plans.
//!
//! The search never fails upward: a scratch plan whose flaws cannot be
//! resolved is silently discarded.

use crate::search::matrix::OrderingMatrix;
use concord_planning::plan::{FINAL_STEP, INITIAL_STEP};
use concord_planning::{CausalLink, Condition, Fact, PlanView, Step, StepId};
use smallvec::SmallVec;

/// A threat-free extension of the base plan.
#[derive(Clone, Debug)]
pub struct Refinement {
    pub new_step: Option<Step>,
    pub links: Vec<CausalLink>,
    pub orderings: Vec<(StepId, StepId)>,
    /// Set when this refinement closes the final step.
    pub is_solution: bool,
}

/// `step` has an effect clobbering the condition protected by `link`, and is
/// not yet ordered outside the link's span.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Threat {
    step: StepId,
    link: CausalLink,
}

/// Scratch plan of the internal stack: the delta over the base plan plus the
/// outstanding flaws.
#[derive(Clone, Debug, Default)]
struct Scratch {
    links: Vec<CausalLink>,
    orderings: Vec<(StepId, StepId)>,
    open: SmallVec<[(StepId, Condition); 4]>,
    threats: SmallVec<[Threat; 4]>,
}

fn supports(eff: Fact, cond: Condition) -> bool {
    eff.var == cond.var && cond.satisfied_by(eff.val)
}

fn clobbers(eff: Fact, cond: Condition) -> bool {
    eff.var == cond.var && !cond.satisfied_by(eff.val)
}

/// Runs the refinement search. With `candidate = Some(step)`, the step is
/// inserted and its preconditions become the open conditions; with `None`,
/// the open conditions are the unsupported goals of the final step.
fn effects_of<'v>(
    view: &'v PlanView,
    candidate: Option<&'v Step>,
    new_id: StepId,
    id: StepId,
) -> &'v [Fact] {
    match candidate {
        Some(step) if id == new_id => &step.eff,
        _ => &view.step(id).eff,
    }
}

pub fn refine<'v>(
    view: &'v PlanView,
    candidate: Option<&'v Step>,
    matrix: &mut OrderingMatrix,
) -> Vec<Refinement> {
    let total = view.num_steps + usize::from(candidate.is_some());
    let new_id = StepId::from(view.num_steps);
    let effects = |id: StepId| effects_of(view, candidate, new_id, id);
    let reset = |matrix: &mut OrderingMatrix, scratch: &Scratch| {
        let edges = view
            .orderings
            .iter()
            .copied()
            .chain(view.links.iter().map(|l| (l.producer, l.consumer)))
            .chain(scratch.orderings.iter().copied())
            .chain(scratch.links.iter().map(|l| (l.producer, l.consumer)));
        matrix.reset(total, edges);
    };

    // Root scratch plan: the candidate's preconditions are open (LIFO, so
    // they are solved back to front), and its effects are checked against
    // every causal link already in the plan.
    let mut root = Scratch::default();
    match candidate {
        Some(step) => {
            root.open = step.pre.iter().map(|&c| (new_id, c)).collect();
            reset(matrix, &root);
            for &link in &view.links {
                if step.eff.iter().any(|&e| clobbers(e, link.cond))
                    && !matrix.precedes(new_id, link.producer)
                    && !matrix.precedes(link.consumer, new_id)
                {
                    root.threats.push(Threat { step: new_id, link });
                }
            }
        }
        None => {
            let supported: Vec<Condition> = view.links_to(FINAL_STEP).map(|l| l.cond).collect();
            root.open = view
                .step(FINAL_STEP)
                .pre
                .iter()
                .filter(|c| !supported.contains(c))
                .map(|&c| (FINAL_STEP, c))
                .collect();
        }
    }

    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(scratch) = stack.pop() {
        reset(matrix, &scratch);

        if let Some(&Threat { step, link }) = scratch.threats.last() {
            let mut rest = scratch.clone();
            rest.threats.pop();
            if matrix.precedes(step, link.producer) || matrix.precedes(link.consumer, step) {
                // Resolved by orderings added meanwhile.
                stack.push(rest);
                continue;
            }
            // Promotion: the threat goes after the link's consumer. Ordering
            // anything after the final step is never meaningful.
            if link.consumer != FINAL_STEP && !matrix.precedes(step, link.consumer) {
                let mut succ = rest.clone();
                succ.orderings.push((link.consumer, step));
                stack.push(succ);
            }
            // Demotion: the threat goes before the link's producer. Nothing
            // can be ordered before the initial step.
            if link.producer != INITIAL_STEP && !matrix.precedes(link.producer, step) {
                let mut succ = rest;
                succ.orderings.push((step, link.producer));
                stack.push(succ);
            }
            continue;
        }

        if let Some(&(consumer, cond)) = scratch.open.last() {
            let mut rest = scratch.clone();
            rest.open.pop();
            for producer in (0..total).map(StepId::from) {
                if producer == consumer || !effects(producer).iter().any(|&e| supports(e, cond)) {
                    continue;
                }
                reset(matrix, &scratch);
                if matrix.precedes(consumer, producer) {
                    continue;
                }
                let link = CausalLink {
                    producer,
                    cond,
                    consumer,
                };
                let mut succ = rest.clone();
                succ.links.push(link);
                if !matrix.precedes(producer, consumer) {
                    succ.orderings.push((producer, consumer));
                }
                // New link against every other step's effects.
                reset(matrix, &succ);
                for step in (0..total).map(StepId::from) {
                    if step == producer || step == consumer {
                        continue;
                    }
                    if effects(step).iter().any(|&e| clobbers(e, cond))
                        && !matrix.precedes(step, producer)
                        && !matrix.precedes(consumer, step)
                    {
                        succ.threats.push(Threat { step, link });
                    }
                }
                stack.push(succ);
            }
            continue;
        }

        out.push(Refinement {
            new_step: candidate.cloned(),
            links: scratch.links,
            orderings: scratch.orderings,
            is_solution: candidate.is_none(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_comm::AgentId;
    use concord_planning::plan::{PlanNode, PlanSpace};
    use concord_planning::{CondKind, PlanId, ValId, VarId};
    use fixedbitset::FixedBitSet;

    fn cond(var: u32, val: u32) -> Condition {
        Condition {
            var: VarId::from_u32(var),
            val: ValId::from_u32(val),
            kind: CondKind::Equal,
        }
    }

    fn fact(var: u32, val: u32) -> Fact {
        Fact {
            var: VarId::from_u32(var),
            val: ValId::from_u32(val),
        }
    }

    fn agent() -> AgentId {
        AgentId::from_u32(0)
    }

    fn step(name: &str, pre: Vec<Condition>, eff: Vec<Fact>) -> Step {
        Step {
            agent: agent(),
            name: name.to_string(),
            pre,
            eff,
        }
    }

    fn empty_node(name: &str, parent: Option<PlanId>, num_steps: usize) -> PlanNode {
        PlanNode {
            parent,
            name: name.to_string(),
            new_step: None,
            new_step_id: None,
            new_links: Vec::new(),
            new_orderings: Vec::new(),
            num_steps,
            g: 0,
            h_dtg: 0,
            h_land: 0,
            is_solution: false,
            achieved: FixedBitSet::new(),
            linearization: Vec::new(),
            proposer: agent(),
        }
    }

    /// var 0 starts at value 0; the goal is value 1; one action flips it.
    #[test]
    fn supports_action_preconditions_from_initial() {
        let space = {
            let mut s = PlanSpace::new(
                Step::initial(agent(), &[fact(0, 0)]),
                Step::goals(agent(), &[cond(0, 1)]),
            );
            s.insert(empty_node("0", None, 2));
            s
        };
        let root = space.by_name("0").unwrap();
        let view = space.view(root);
        let flip = step("flip", vec![cond(0, 0)], vec![fact(0, 1)]);
        let mut matrix = OrderingMatrix::new();
        let refs = refine(&view, Some(&flip), &mut matrix);
        assert_eq!(refs.len(), 1);
        let r = &refs[0];
        assert_eq!(r.links.len(), 1);
        assert_eq!(r.links[0].producer, INITIAL_STEP);
        assert!(!r.is_solution);
        // The implied ordering is explicit.
        assert_eq!(r.orderings, vec![(INITIAL_STEP, StepId::from_u32(2))]);
    }

    #[test]
    fn final_closure_emits_a_solution() {
        let space = {
            let mut s = PlanSpace::new(
                Step::initial(agent(), &[fact(0, 1)]),
                Step::goals(agent(), &[cond(0, 1)]),
            );
            s.insert(empty_node("0", None, 2));
            s
        };
        let root = space.by_name("0").unwrap();
        let view = space.view(root);
        let mut matrix = OrderingMatrix::new();
        let refs = refine(&view, None, &mut matrix);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].is_solution);
        assert_eq!(refs[0].links[0].producer, INITIAL_STEP);
        assert_eq!(refs[0].links[0].consumer, FINAL_STEP);
    }

    /// Threat scenario: a1 establishes p (var0=1) consumed by a2; the
    /// candidate a3 clobbers p (var0=2) and needs an unrelated precondition
    /// (var2=0). Exactly two refinements must come out, one promoting a3
    /// past a2, one demoting it before a1.
    #[test]
    fn threats_resolve_by_promotion_and_demotion() {
        let mut space = PlanSpace::new(
            Step::initial(agent(), &[fact(0, 0), fact(1, 0), fact(2, 0)]),
            Step::goals(agent(), &[cond(1, 1)]),
        );
        let base = space.insert(empty_node("0", None, 2));
        let a1 = StepId::from_u32(2);
        let a2 = StepId::from_u32(3);
        // a1: establishes var0=1 unconditionally.
        let mut n1 = empty_node("0-0.0", Some(base), 3);
        n1.new_step = Some(step("a1", vec![], vec![fact(0, 1)]));
        n1.new_step_id = Some(a1);
        let p1 = space.insert(n1);
        // a2: consumes var0=1, produces the goal var1=1.
        let mut n2 = empty_node("0-0.0-0.0", Some(p1), 4);
        n2.new_step = Some(step("a2", vec![cond(0, 1)], vec![fact(1, 1)]));
        n2.new_step_id = Some(a2);
        n2.new_links = vec![CausalLink {
            producer: a1,
            cond: cond(0, 1),
            consumer: a2,
        }];
        n2.new_orderings = vec![(a1, a2)];
        let p2 = space.insert(n2);

        let view = space.view(p2);
        // a3: needs var2=0 and resets var0 to 2, clobbering the a1 → a2 link.
        let a3 = step("a3", vec![cond(2, 0)], vec![fact(0, 2)]);
        let mut matrix = OrderingMatrix::new();
        let refs = refine(&view, Some(&a3), &mut matrix);
        assert_eq!(refs.len(), 2);
        let new_id = StepId::from_u32(4);
        let promoted = refs
            .iter()
            .filter(|r| r.orderings.contains(&(a2, new_id)))
            .count();
        let demoted = refs
            .iter()
            .filter(|r| r.orderings.contains(&(new_id, a1)))
            .count();
        assert_eq!((promoted, demoted), (1, 1));
    }
}
