//! Demo driver: runs the distributed planner on built-in scenarios with an
//! in-process transport, one thread per agent. Problem parsing lives outside
//! this crate, so the scenarios are constructed programmatically.

use anyhow::{bail, Result};
use clap::Parser;
use concord_comm::channel::Network;
use concord_planners::fmt::format_plan;
use concord_planners::messages::Payload;
use concord_planners::solver::{run_planner, Config, NegotiationMode, PlanningError, SearchMethod};
use concord_planning::{GroundedTask, Plan, TaskBuilder};
use std::fmt::Formatter;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "concord", about = "Cooperative multi-agent partial-order planner")]
struct Opt {
    /// Built-in scenario: "logistics" (one agent) or "city" (two agents).
    #[arg(default_value = "logistics")]
    scenario: String,

    /// Wall-clock limit in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Accept solutions by metric vote instead of unconditionally.
    #[arg(long)]
    borda: bool,

    /// Use the iterative-deepening variant of the search.
    #[arg(long)]
    ida: bool,

    /// Return failure with code 1 if no plan is found.
    #[arg(long)]
    expect_sat: bool,

    /// Return failure with code 1 if the problem is not proven unsolvable.
    #[arg(long)]
    expect_unsat: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();
    let start = std::time::Instant::now();

    let tasks = match opt.scenario.as_str() {
        "logistics" => logistics()?,
        "city" => city()?,
        other => bail!("unknown scenario `{other}` (expected `logistics` or `city`)"),
    };
    let config = Config {
        negotiation: if opt.borda {
            NegotiationMode::Borda
        } else {
            NegotiationMode::Cooperative
        },
        search: if opt.ida { SearchMethod::IdaStar } else { SearchMethod::AStar },
        timeout: opt.timeout_ms.map(Duration::from_millis),
        max_iterations: None,
    };

    let names: Vec<String> = {
        let world = tasks[0].world();
        world.agents().map(|a| world.agent_name(a).to_string()).collect()
    };
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let transports = Network::in_process::<Payload>(&name_refs);

    let outcomes: Vec<Result<Plan, PlanningError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .iter()
            .zip(transports)
            .map(|(task, mut transport)| {
                let config = config.clone();
                scope.spawn(move || run_planner(task, &mut transport, config))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("agent thread panicked")).collect()
    });

    let runtime = start.elapsed();
    let first = outcomes.into_iter().next().expect("at least one agent");
    let result = match first {
        Ok(plan) => {
            println!("{}", format_plan(&plan));
            SolverResult {
                solution: Solution::Sat,
                cost: Some(plan.steps.len() as f64),
                runtime,
            }
        }
        Err(PlanningError::UnsolvableProven) => SolverResult {
            solution: Solution::Unsat,
            cost: None,
            runtime,
        },
        Err(e) => return Err(e.into()),
    };

    println!("{result}");
    if opt.expect_sat && result.solution != Solution::Sat {
        std::process::exit(1);
    }
    if opt.expect_unsat && result.solution != Solution::Unsat {
        std::process::exit(1);
    }
    Ok(())
}

/// One carrier, one package, two locations.
fn logistics() -> Result<Vec<GroundedTask>> {
    let mut b = TaskBuilder::new();
    let carrier = b.agent("carrier");
    let truck = b.variable("at-truck", &["l1", "l2"], &[carrier])?;
    let pkg = b.variable("loc-pkg", &["l1", "l2", "truck"], &[carrier])?;
    b.initial(truck, "l1")?;
    b.initial(pkg, "l1")?;
    b.goal(pkg, "l2")?;
    b.action(carrier, "load", &[(truck, "l1"), (pkg, "l1")], &[(pkg, "truck")])?;
    b.action(carrier, "move-l1-l2", &[(truck, "l1")], &[(truck, "l2")])?;
    b.action(carrier, "unload", &[(truck, "l2"), (pkg, "truck")], &[(pkg, "l2")])?;
    Ok(b.build()?)
}

/// Two agents: a loader that can only move packages in and out of the truck,
/// and a driver that moves the truck between the depot and the airport.
fn city() -> Result<Vec<GroundedTask>> {
    let mut b = TaskBuilder::new();
    let driver = b.agent("driver");
    let loader = b.agent("loader");
    let both = [driver, loader];
    let truck = b.variable("at-truck", &["depot", "airport"], &both)?;
    let p1 = b.variable("loc-pkg1", &["depot", "airport", "truck"], &both)?;
    let p2 = b.variable("loc-pkg2", &["depot", "airport", "truck"], &both)?;
    b.initial(truck, "depot")?;
    b.initial(p1, "depot")?;
    b.initial(p2, "depot")?;
    b.goal(p1, "airport")?;
    b.goal(p2, "airport")?;
    b.action(driver, "drive-to-airport", &[(truck, "depot")], &[(truck, "airport")])?;
    b.action(driver, "drive-to-depot", &[(truck, "airport")], &[(truck, "depot")])?;
    for (pkg, tag) in [(p1, "pkg1"), (p2, "pkg2")] {
        b.action(
            loader,
            &format!("load-{tag}-depot"),
            &[(truck, "depot"), (pkg, "depot")],
            &[(pkg, "truck")],
        )?;
        b.action(
            loader,
            &format!("unload-{tag}-airport"),
            &[(truck, "airport"), (pkg, "truck")],
            &[(pkg, "airport")],
        )?;
    }
    Ok(b.build()?)
}

struct SolverResult {
    solution: Solution,
    cost: Option<f64>,
    runtime: Duration,
}

impl std::fmt::Display for SolverResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[summary] solution:{} cost:{} runtime:{}ms",
            match self.solution {
                Solution::Sat => "SAT",
                Solution::Unsat => "UNSAT",
            },
            self.cost.map_or_else(|| "_".to_string(), |c| format!("{c}")),
            self.runtime.as_millis()
        )
    }
}

#[derive(Eq, PartialEq)]
enum Solution {
    Unsat,
    Sat,
}
