//! Human-readable plan rendering.

use concord_planning::Plan;
use std::fmt::{Display, Formatter};

pub struct PlanFormatter<'a>(&'a Plan);

/// Wraps a plan for display: one line per user step, ordered by start time.
pub fn format_plan(plan: &Plan) -> PlanFormatter<'_> {
    PlanFormatter(plan)
}

impl Display for PlanFormatter<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "plan {} ({} steps, makespan {})", self.0.name, self.0.steps.len(), self.0.makespan)?;
        for step in self.0.linearize() {
            writeln!(f, "  {:>3}: {} [{}]", step.time, step.name, step.agent)?;
        }
        Ok(())
    }
}
